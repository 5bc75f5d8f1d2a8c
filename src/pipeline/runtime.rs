use rayon::prelude::*;

use crate::config::{ChainLossConfig, NumericalFailurePolicy};
use crate::error::ChainLossError;
use crate::graph::DenominatorGraph;
use crate::loss::{sequence_loss, SequenceInput, SequenceLoss};
use crate::pipeline::traits::AuxiliaryKind;
use crate::types::{ChainBatch, ChainLossOutput, ScoreTensor, SequenceStats};

/// Chain loss over a shared denominator graph.
///
/// Holds no per-call state: every [`ChainLoss::compute`] is a pure function
/// of its batch, and sequences are processed in parallel on the rayon pool.
pub struct ChainLoss {
    config: ChainLossConfig,
    denominator: DenominatorGraph,
    pool: Option<rayon::ThreadPool>,
}

pub(crate) struct ChainLossParts {
    pub config: ChainLossConfig,
    pub denominator: DenominatorGraph,
    pub pool: Option<rayon::ThreadPool>,
}

impl ChainLoss {
    pub(crate) fn from_parts(parts: ChainLossParts) -> Self {
        Self {
            config: parts.config,
            denominator: parts.denominator,
            pool: parts.pool,
        }
    }

    pub fn config(&self) -> &ChainLossConfig {
        &self.config
    }

    pub fn denominator(&self) -> &DenominatorGraph {
        &self.denominator
    }

    pub fn compute(&self, batch: &ChainBatch<'_>) -> Result<ChainLossOutput, ChainLossError> {
        self.validate(batch)?;
        let auxiliary = self.resolve_auxiliary(batch)?;

        let run = || {
            (0..batch.num_sequences)
                .into_par_iter()
                .map(|sequence| self.sequence(batch, auxiliary, sequence))
                .collect::<Vec<_>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        self.assemble(batch, auxiliary.is_some(), results)
    }

    fn validate(&self, batch: &ChainBatch<'_>) -> Result<(), ChainLossError> {
        let scores = &batch.scores;
        let batch_size = scores.batch_size();
        if batch.num_sequences != batch_size {
            return Err(ChainLossError::shape(format!(
                "num_sequences {} does not match batch size {batch_size}",
                batch.num_sequences
            )));
        }
        if batch.frames_per_sequence == 0 || batch.frames_per_sequence > scores.max_time() {
            return Err(ChainLossError::shape(format!(
                "frames_per_sequence {} outside 1..={}",
                batch.frames_per_sequence,
                scores.max_time()
            )));
        }
        if batch.sequence_weights.len() != batch_size {
            return Err(ChainLossError::shape(format!(
                "{} sequence weights for batch size {batch_size}",
                batch.sequence_weights.len()
            )));
        }
        if batch.numerators.len() != batch_size {
            return Err(ChainLossError::shape(format!(
                "{} numerator graphs for batch size {batch_size}",
                batch.numerators.len()
            )));
        }
        if let Some(lengths) = batch.sequence_lengths {
            if lengths.len() != batch_size {
                return Err(ChainLossError::shape(format!(
                    "{} sequence lengths for batch size {batch_size}",
                    lengths.len()
                )));
            }
            if let Some((sequence, &len)) = lengths
                .iter()
                .enumerate()
                .find(|(_, &len)| len == 0 || len > batch.frames_per_sequence)
            {
                return Err(ChainLossError::shape(format!(
                    "sequence {sequence} has length {len} outside 1..={}",
                    batch.frames_per_sequence
                )));
            }
        }
        if self.denominator.num_classes() > scores.num_classes() {
            return Err(ChainLossError::shape(format!(
                "denominator graph uses {} classes but scores have {}",
                self.denominator.num_classes(),
                scores.num_classes()
            )));
        }
        Ok(())
    }

    fn resolve_auxiliary<'a>(
        &self,
        batch: &ChainBatch<'a>,
    ) -> Result<Option<(ScoreTensor<'a>, AuxiliaryKind)>, ChainLossError> {
        if self.config.xent_regularize <= 0.0 {
            return Ok(None);
        }
        let Some(output) = batch.auxiliary.and_then(|p| p.auxiliary_output()) else {
            tracing::warn!(
                xent_regularize = self.config.xent_regularize,
                "xent regularization requested without an auxiliary output; skipping it"
            );
            return Ok(None);
        };
        let scores = &batch.scores;
        if output.values.len() != scores.data().len() {
            return Err(ChainLossError::shape(format!(
                "auxiliary output holds {} values, scores hold {}",
                output.values.len(),
                scores.data().len()
            )));
        }
        let tensor = ScoreTensor::new(
            output.values,
            scores.max_time(),
            scores.batch_size(),
            scores.num_classes(),
        )?;
        Ok(Some((tensor, output.kind)))
    }

    fn sequence(
        &self,
        batch: &ChainBatch<'_>,
        auxiliary: Option<(ScoreTensor<'_>, AuxiliaryKind)>,
        sequence: usize,
    ) -> Result<SequenceLoss, ChainLossError> {
        let num_frames = batch.sequence_length(sequence);
        sequence_loss(&SequenceInput {
            denominator: &self.denominator,
            numerator: &batch.numerators[sequence],
            scores: batch.scores.sequence(sequence, num_frames),
            auxiliary: auxiliary.map(|(aux, kind)| (aux.sequence(sequence, num_frames), kind)),
            weight: batch.sequence_weights[sequence],
            frames_per_sequence: batch.frames_per_sequence,
            config: &self.config,
        })
    }

    fn assemble(
        &self,
        batch: &ChainBatch<'_>,
        with_xent: bool,
        results: Vec<Result<SequenceLoss, ChainLossError>>,
    ) -> Result<ChainLossOutput, ChainLossError> {
        let scores = &batch.scores;
        let (max_time, batch_size, num_classes) =
            (scores.max_time(), scores.batch_size(), scores.num_classes());

        let mut output = ChainLossOutput {
            objective: vec![0.0; batch_size],
            gradient: vec![0.0; scores.data().len()],
            xent_gradient: with_xent.then(|| vec![0.0; scores.data().len()]),
            stats: Vec::with_capacity(batch_size),
            failed_sequences: Vec::new(),
            max_time,
            batch_size,
            num_classes,
        };

        for (sequence, result) in results.into_iter().enumerate() {
            let loss = match result {
                Ok(loss) => loss,
                Err(err @ ChainLossError::NumericalFailure { .. })
                    if self.config.numerical_failure == NumericalFailurePolicy::ZeroSequence =>
                {
                    tracing::warn!(sequence, error = %err, "chain loss: zeroing failed sequence");
                    output.failed_sequences.push(sequence);
                    output.stats.push(SequenceStats {
                        weight: batch.sequence_weights[sequence],
                        num_frames: batch.sequence_length(sequence),
                        ..SequenceStats::default()
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };

            output.objective[sequence] = loss.objective as f32;
            scatter_rows(&mut output.gradient, &loss.gradient, sequence, batch_size, num_classes);
            if let (Some(dst), Some(src)) =
                (output.xent_gradient.as_mut(), loss.xent_gradient.as_ref())
            {
                scatter_rows(dst, src, sequence, batch_size, num_classes);
            }
            output.stats.push(loss.stats);
        }

        tracing::info!(
            sequences = batch_size,
            frames_per_sequence = batch.frames_per_sequence,
            mean_objective = output.total_objective() / batch_size as f64,
            failed = output.failed_sequences.len(),
            "chain loss: batch done"
        );

        Ok(output)
    }
}

/// Copy `[len][C]` rows of one sequence into a `[T][B][C]` buffer.
fn scatter_rows(
    dst: &mut [f32],
    rows: &[f32],
    sequence: usize,
    batch_size: usize,
    num_classes: usize,
) {
    for (t, row) in rows.chunks_exact(num_classes).enumerate() {
        let start = (t * batch_size + sequence) * num_classes;
        dst[start..start + num_classes].copy_from_slice(row);
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::config::InitialDistribution;
    use crate::graph::{Graph, Transition};
    use crate::pipeline::builder::ChainLossBuilder;
    use crate::pipeline::traits::AuxiliaryOutput;

    fn denominator() -> Graph {
        Graph::from_transitions(
            2,
            2,
            vec![Transition::new(0, 1, 0, 0.0), Transition::new(1, 1, 1, 0.0)],
        )
        .expect("valid graph")
    }

    /// `0 -c0-> 1 -c1-> 2`.
    fn forced_numerator() -> Graph {
        Graph::from_transitions(
            3,
            2,
            vec![Transition::new(0, 1, 0, 0.0), Transition::new(1, 2, 1, 0.0)],
        )
        .expect("valid graph")
    }

    /// Needs three frames to reach its final state.
    fn long_numerator() -> Graph {
        Graph::from_transitions(
            4,
            2,
            vec![
                Transition::new(0, 1, 0, 0.0),
                Transition::new(1, 2, 1, 0.0),
                Transition::new(2, 3, 1, 0.0),
            ],
        )
        .expect("valid graph")
    }

    fn chain_loss(config: ChainLossConfig) -> ChainLoss {
        ChainLossBuilder::new(config)
            .with_denominator(denominator())
            .build()
            .expect("build")
    }

    #[test]
    fn two_frame_scenario_has_closed_form_gradient() {
        let loss = chain_loss(ChainLossConfig::default());
        let scores = vec![0.0f32; 4];
        let numerators = vec![forced_numerator()];
        let weights = [1.0f32];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 1, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let out = loss.compute(&batch).expect("chain loss");

        assert_relative_eq!(out.objective[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.stats[0].den_log_likelihood, 0.0, epsilon = 1e-9);
        assert_relative_eq!(out.stats[0].num_log_likelihood, 0.0, epsilon = 1e-9);
        assert_relative_eq!(out.gradient_at(0, 0, 0), 0.25, epsilon = 1e-6);
        assert_relative_eq!(out.gradient_at(0, 0, 1), -0.25, epsilon = 1e-6);
        assert_relative_eq!(out.gradient_at(1, 0, 0), 0.0, epsilon = 1e-6);
        assert_relative_eq!(out.gradient_at(1, 0, 1), 0.0, epsilon = 1e-6);
        assert!(out.failed_sequences.is_empty());
    }

    #[test]
    fn gradient_is_zero_past_sequence_length() {
        let loss = chain_loss(ChainLossConfig::default());
        let scores = (0..12).map(|i| (i as f32 * 0.37).sin()).collect::<Vec<_>>();
        let numerators = vec![forced_numerator(), long_numerator()];
        let weights = [1.0f32, 1.0];
        let lengths = [2usize, 3];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 3, 2, 2).expect("tensor"),
            &numerators,
            &weights,
            3,
        )
        .with_sequence_lengths(&lengths);
        let out = loss.compute(&batch).expect("chain loss");

        assert_eq!(out.gradient_at(2, 0, 0), 0.0);
        assert_eq!(out.gradient_at(2, 0, 1), 0.0);
        assert_eq!(out.stats[0].num_frames, 2);
        assert_eq!(out.stats[1].num_frames, 3);
        assert!(out.objective.iter().all(|o| o.is_finite()));
    }

    #[test]
    fn repeated_calls_are_bit_identical() {
        let loss = chain_loss(ChainLossConfig {
            leaky_hmm_coefficient: 0.1,
            l2_regularize: 0.01,
            ..ChainLossConfig::default()
        });
        let scores = (0..8).map(|i| (i as f32 * 0.91).cos()).collect::<Vec<_>>();
        let numerators = vec![forced_numerator(), forced_numerator()];
        let weights = [1.0f32, 0.5];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 2, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let first = loss.compute(&batch).expect("chain loss");
        let second = loss.compute(&batch).expect("chain loss");
        assert_eq!(first, second);
    }

    #[test]
    fn dedicated_pool_matches_global_pool() {
        let scores = (0..8).map(|i| i as f32 * 0.1 - 0.3).collect::<Vec<_>>();
        let numerators = vec![forced_numerator(), forced_numerator()];
        let weights = [1.0f32, 2.0];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 2, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let global = chain_loss(ChainLossConfig::default())
            .compute(&batch)
            .expect("chain loss");
        let pooled = chain_loss(ChainLossConfig {
            num_threads: Some(3),
            ..ChainLossConfig::default()
        })
        .compute(&batch)
        .expect("chain loss");
        assert_eq!(global, pooled);
    }

    #[test]
    fn l2_regularization_adds_scaled_score_derivative() {
        let scores = vec![0.5f32, -1.0, 2.0, 0.25];
        let numerators = vec![forced_numerator()];
        let weights = [2.0f32];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 1, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let plain = chain_loss(ChainLossConfig::default())
            .compute(&batch)
            .expect("chain loss");
        let l2 = 0.2f32;
        let regularized = chain_loss(ChainLossConfig {
            l2_regularize: l2,
            ..ChainLossConfig::default()
        })
        .compute(&batch)
        .expect("chain loss");

        let scale = 2.0 / 2.0;
        for (i, &x) in scores.iter().enumerate() {
            let expected = plain.gradient[i] - scale * l2 * x;
            assert_relative_eq!(regularized.gradient[i], expected, epsilon = 1e-6);
        }
        let sum_sq: f32 = scores.iter().map(|x| x * x).sum();
        assert_relative_eq!(
            regularized.objective[0],
            plain.objective[0] - scale * 0.5 * l2 * sum_sq,
            epsilon = 1e-5
        );
    }

    #[test]
    fn cross_entropy_term_is_additive() {
        let scores = vec![0.3f32, -0.2, 0.1, 0.4];
        let aux_values = vec![0.6f32, 0.4, 0.3, 0.7];
        let aux = AuxiliaryOutput {
            values: &aux_values,
            kind: AuxiliaryKind::Probabilities,
        };
        let numerators = vec![forced_numerator()];
        let weights = [1.0f32];
        let base = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 1, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let with_aux = base.with_auxiliary(&aux);

        let plain = chain_loss(ChainLossConfig::default())
            .compute(&base)
            .expect("chain loss");
        let ignored = chain_loss(ChainLossConfig::default())
            .compute(&with_aux)
            .expect("chain loss");
        assert_eq!(plain, ignored);

        let xent = 0.1f32;
        let regularized = chain_loss(ChainLossConfig {
            xent_regularize: xent,
            ..ChainLossConfig::default()
        })
        .compute(&with_aux)
        .expect("chain loss");

        // Forced numerator: class 0 at frame 0, class 1 at frame 1.
        let scale = 1.0 / 2.0;
        let xent_term = xent as f64 * (0.6f64.ln() + 0.7f64.ln());
        assert_relative_eq!(regularized.stats[0].xent_term, xent_term, epsilon = 1e-6);
        assert_relative_eq!(
            regularized.objective[0] as f64,
            plain.objective[0] as f64 + scale * xent_term,
            epsilon = 1e-6
        );
        assert_eq!(regularized.gradient, plain.gradient);

        let xent_grad = regularized.xent_gradient.expect("xent gradient");
        assert_relative_eq!(xent_grad[0], (scale * 0.1 / 0.6) as f32, epsilon = 1e-6);
        assert_eq!(xent_grad[1], 0.0);
        assert_eq!(xent_grad[2], 0.0);
        assert_relative_eq!(xent_grad[3], (scale * 0.1 / 0.7) as f32, epsilon = 1e-6);
    }

    #[test]
    fn missing_auxiliary_output_skips_cross_entropy() {
        let scores = vec![0.0f32; 4];
        let numerators = vec![forced_numerator()];
        let weights = [1.0f32];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 1, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let out = chain_loss(ChainLossConfig {
            xent_regularize: 0.5,
            ..ChainLossConfig::default()
        })
        .compute(&batch)
        .expect("chain loss");
        assert!(out.xent_gradient.is_none());
        assert_eq!(out.stats[0].xent_term, 0.0);
    }

    #[test]
    fn unreachable_numerator_fails_with_lowest_sequence_index() {
        let loss = chain_loss(ChainLossConfig::default());
        let scores = vec![0.0f32; 12];
        let numerators = vec![forced_numerator(), long_numerator(), long_numerator()];
        let weights = [1.0f32; 3];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 3, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let err = loss.compute(&batch).expect_err("numerator cannot finish in two frames");
        assert!(matches!(
            err,
            ChainLossError::NumericalFailure {
                sequence: 1,
                ..
            }
        ));
    }

    #[test]
    fn zero_sequence_policy_keeps_the_rest_of_the_batch() {
        let scores = vec![0.0f32; 8];
        let numerators = vec![long_numerator(), forced_numerator()];
        let weights = [1.0f32, 1.0];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 2, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let out = chain_loss(ChainLossConfig {
            numerical_failure: NumericalFailurePolicy::ZeroSequence,
            ..ChainLossConfig::default()
        })
        .compute(&batch)
        .expect("failed sequence is zeroed");

        assert_eq!(out.failed_sequences, vec![0]);
        assert_eq!(out.objective[0], 0.0);
        for t in 0..2 {
            for c in 0..2 {
                assert_eq!(out.gradient_at(t, 0, c), 0.0);
            }
        }
        assert_eq!(out.stats[0].num_frames, 2);
        assert_relative_eq!(out.gradient_at(0, 1, 0), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn shape_mismatches_are_rejected() {
        let loss = chain_loss(ChainLossConfig::default());
        let scores = vec![0.0f32; 8];
        let tensor = ScoreTensor::new(&scores, 2, 2, 2).expect("tensor");
        let numerators = vec![forced_numerator(), forced_numerator()];
        let weights = [1.0f32, 1.0];

        let too_few_weights = ChainBatch::new(tensor, &numerators, &weights[..1], 2);
        assert!(matches!(
            loss.compute(&too_few_weights),
            Err(ChainLossError::ShapeMismatch { .. })
        ));

        let frames_too_long = ChainBatch::new(tensor, &numerators, &weights, 3);
        assert!(matches!(
            loss.compute(&frames_too_long),
            Err(ChainLossError::ShapeMismatch { .. })
        ));

        let mut wrong_count = ChainBatch::new(tensor, &numerators, &weights, 2);
        wrong_count.num_sequences = 3;
        assert!(matches!(
            loss.compute(&wrong_count),
            Err(ChainLossError::ShapeMismatch { .. })
        ));

        let lengths = [2usize, 0];
        let zero_length =
            ChainBatch::new(tensor, &numerators, &weights, 2).with_sequence_lengths(&lengths);
        assert!(matches!(
            loss.compute(&zero_length),
            Err(ChainLossError::ShapeMismatch { .. })
        ));

        let narrow = vec![0.0f32; 2];
        let one_class = ChainBatch::new(
            ScoreTensor::new(&narrow, 2, 1, 1).expect("tensor"),
            &numerators[..1],
            &weights[..1],
            2,
        );
        assert!(matches!(
            loss.compute(&one_class),
            Err(ChainLossError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn stationary_start_changes_only_the_denominator() {
        let scores = vec![0.0f32; 4];
        let numerators = vec![forced_numerator()];
        let weights = [1.0f32];
        let batch = ChainBatch::new(
            ScoreTensor::new(&scores, 2, 1, 2).expect("tensor"),
            &numerators,
            &weights,
            2,
        );
        let out = chain_loss(ChainLossConfig {
            denominator_initial: InitialDistribution::stationary(),
            ..ChainLossConfig::default()
        })
        .compute(&batch)
        .expect("chain loss");

        // All stationary mass sits in the self-looping state 1, which cannot
        // emit class 0 at frame 0.
        assert_relative_eq!(out.stats[0].num_log_likelihood, 0.0, epsilon = 1e-9);
        assert_relative_eq!(out.gradient_at(0, 0, 0), 0.5, epsilon = 1e-6);
        assert_relative_eq!(out.gradient_at(0, 0, 1), -0.5, epsilon = 1e-6);
    }
}
