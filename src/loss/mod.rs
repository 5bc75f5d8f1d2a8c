//! Objective and gradient of a single sequence.

use crate::config::ChainLossConfig;
use crate::error::{ChainLossError, Pass};
use crate::forward_backward::{ForwardBackward, Posteriors};
use crate::graph::{DenominatorGraph, Graph};
use crate::pipeline::traits::AuxiliaryKind;
use crate::types::{SequenceScores, SequenceStats};

mod regularization;

pub(crate) struct SequenceInput<'a> {
    pub denominator: &'a DenominatorGraph,
    pub numerator: &'a Graph,
    pub scores: SequenceScores<'a>,
    pub auxiliary: Option<(SequenceScores<'a>, AuxiliaryKind)>,
    pub weight: f32,
    pub frames_per_sequence: usize,
    pub config: &'a ChainLossConfig,
}

pub(crate) struct SequenceLoss {
    /// Weighted and per-frame normalized.
    pub objective: f64,
    /// `[len][C]` rows for this sequence.
    pub gradient: Vec<f32>,
    pub xent_gradient: Option<Vec<f32>>,
    pub stats: SequenceStats,
}

pub(crate) fn sequence_loss(input: &SequenceInput<'_>) -> Result<SequenceLoss, ChainLossError> {
    let scores = input.scores;
    let config = input.config;

    let (den, num) = rayon::join(
        || {
            ForwardBackward::denominator(input.denominator, config.leaky_hmm_coefficient)
                .run(scores)
        },
        || ForwardBackward::numerator(input.numerator).run(scores),
    );
    let den = den?;
    let num = num?;

    let den_post = checked_posteriors(&den, scores.sequence(), Pass::Denominator)?;
    let num_post = checked_posteriors(&num, scores.sequence(), Pass::Numerator)?;

    let mut grad = num_post
        .iter()
        .zip(&den_post)
        .map(|(n, d)| n - d)
        .collect::<Vec<f64>>();
    let l2_term = regularization::l2_term(&scores, config.l2_regularize as f64, &mut grad);

    let xent = match input.auxiliary {
        Some((aux, kind)) if config.xent_regularize > 0.0 => Some(
            regularization::cross_entropy_term(&num_post, &aux, kind, config.xent_regularize as f64),
        ),
        _ => None,
    };
    let xent_term = xent.as_ref().map(|x| x.objective).unwrap_or(0.0);

    let scale = input.weight as f64 / input.frames_per_sequence as f64;
    let mmi = num.log_likelihood() - den.log_likelihood();
    let objective = scale * (mmi + l2_term + xent_term);

    tracing::debug!(
        sequence = scores.sequence(),
        frames = scores.num_frames(),
        num_log_likelihood = num.log_likelihood(),
        den_log_likelihood = den.log_likelihood(),
        l2_term,
        xent_term,
        objective,
        "chain loss: sequence done"
    );

    Ok(SequenceLoss {
        objective,
        gradient: grad.iter().map(|&g| (scale * g) as f32).collect(),
        xent_gradient: xent.map(|x| x.gradient.iter().map(|&g| (scale * g) as f32).collect()),
        stats: SequenceStats {
            num_log_likelihood: num.log_likelihood(),
            den_log_likelihood: den.log_likelihood(),
            l2_term,
            xent_term,
            weight: input.weight,
            num_frames: scores.num_frames(),
        },
    })
}

fn checked_posteriors(
    posteriors: &Posteriors<'_, '_>,
    sequence: usize,
    pass: Pass,
) -> Result<Vec<f64>, ChainLossError> {
    let post = posteriors.class_posteriors();
    if post.iter().any(|p| !p.is_finite()) {
        return Err(ChainLossError::numerical(
            sequence,
            pass,
            posteriors.log_likelihood(),
        ));
    }
    Ok(post)
}
