//! `candle_core::Tensor` front end.
//!
//! Validates ranks and batch dimensions, pulls graph arrays and scores out
//! of tensors, and wraps the objective and gradients back into tensors on
//! the scores' device.

use candle_core::{DType, Tensor};

use crate::error::ChainLossError;
use crate::graph::{FlatGraph, Graph};
use crate::pipeline::runtime::ChainLoss;
use crate::pipeline::traits::{AuxiliaryKind, AuxiliaryOutput};
use crate::types::{ChainBatch, ScoreTensor, SequenceStats};

/// Denominator arrays: transitions `[A, 3]`, weights `[A]`,
/// state offsets `[N, 2]`.
pub struct DenominatorTensors<'a> {
    pub transitions: &'a Tensor,
    pub weights: &'a Tensor,
    pub state_offsets: &'a Tensor,
    pub num_states: usize,
}

/// Batched numerator arrays, padded per sequence: transitions
/// `[B, max_arcs, 3]`, weights `[B, max_arcs]`, state offsets
/// `[B, max_states, 2]`, state counts `[B]`.
pub struct NumeratorTensors<'a> {
    pub transitions: &'a Tensor,
    pub weights: &'a Tensor,
    pub state_offsets: &'a Tensor,
    pub num_states: &'a Tensor,
}

pub struct ChainLossInputs<'a> {
    /// `[max_time, batch_size, num_classes]`.
    pub scores: &'a Tensor,
    pub numerators: NumeratorTensors<'a>,
    /// `[batch_size]`.
    pub sequence_weights: &'a Tensor,
    pub num_sequences: usize,
    pub frames_per_sequence: usize,
    /// `[batch_size]`, optional.
    pub sequence_lengths: Option<&'a Tensor>,
    /// `[max_time, batch_size, num_classes]`, optional.
    pub auxiliary: Option<(&'a Tensor, AuxiliaryKind)>,
}

pub struct ChainLossTensors {
    /// `[batch_size]`, f32.
    pub objective: Tensor,
    /// Same shape as the scores, f32.
    pub gradient: Tensor,
    pub xent_gradient: Option<Tensor>,
    pub stats: Vec<SequenceStats>,
    pub failed_sequences: Vec<usize>,
}

pub fn denominator_graph_from_tensors(
    tensors: &DenominatorTensors<'_>,
    num_classes: usize,
) -> Result<Graph, ChainLossError> {
    let [num_arcs, arc_width] = expect_rank::<2>(tensors.transitions, "denominator transitions")?;
    let [num_weights] = expect_rank::<1>(tensors.weights, "denominator weights")?;
    let [num_rows, offset_width] =
        expect_rank::<2>(tensors.state_offsets, "denominator state offsets")?;
    if arc_width != 3 || offset_width != 2 {
        return Err(ChainLossError::shape(format!(
            "denominator transitions must be [*, 3] and offsets [*, 2], got [{num_arcs}, {arc_width}] and [{num_rows}, {offset_width}]"
        )));
    }
    if num_weights != num_arcs {
        return Err(ChainLossError::shape(format!(
            "{num_weights} denominator weights for {num_arcs} transitions"
        )));
    }

    let transitions = triples(&int_vec(tensors.transitions, "read denominator transitions")?);
    let state_offsets = pairs(&int_vec(tensors.state_offsets, "read denominator state offsets")?);
    let weights = float_vec(tensors.weights, "read denominator weights")?;
    Graph::from_flat(
        FlatGraph {
            num_states: tensors.num_states,
            state_offsets: &state_offsets,
            transitions: &transitions,
            weights: &weights,
        },
        num_classes,
    )
}

pub fn numerator_graphs_from_tensors(
    tensors: &NumeratorTensors<'_>,
    num_classes: usize,
) -> Result<Vec<Graph>, ChainLossError> {
    let [batch, max_arcs, arc_width] =
        expect_rank::<3>(tensors.transitions, "numerator transitions")?;
    let [weight_batch, weight_arcs] = expect_rank::<2>(tensors.weights, "numerator weights")?;
    let [offset_batch, max_states, offset_width] =
        expect_rank::<3>(tensors.state_offsets, "numerator state offsets")?;
    let [count_batch] = expect_rank::<1>(tensors.num_states, "numerator state counts")?;
    if arc_width != 3 || offset_width != 2 {
        return Err(ChainLossError::shape(format!(
            "numerator transitions must be [B, *, 3] and offsets [B, *, 2], got last dims {arc_width} and {offset_width}"
        )));
    }
    if weight_batch != batch || offset_batch != batch || count_batch != batch {
        return Err(ChainLossError::shape(format!(
            "numerator batch dims disagree: transitions {batch}, weights {weight_batch}, offsets {offset_batch}, state counts {count_batch}"
        )));
    }
    if weight_arcs != max_arcs {
        return Err(ChainLossError::shape(format!(
            "numerator weights pad to {weight_arcs} arcs, transitions to {max_arcs}"
        )));
    }

    let transitions = triples(&int_vec(tensors.transitions, "read numerator transitions")?);
    let state_offsets = pairs(&int_vec(tensors.state_offsets, "read numerator state offsets")?);
    let weights = float_vec(tensors.weights, "read numerator weights")?;
    let state_counts = int_vec(tensors.num_states, "read numerator state counts")?;

    let mut graphs = Vec::with_capacity(batch);
    for (sequence, &count) in state_counts.iter().enumerate() {
        if count < 1 || count as usize > max_states {
            return Err(ChainLossError::shape(format!(
                "numerator {sequence} declares {count} states, expected 1..={max_states}"
            )));
        }
        let num_states = count as usize;
        let offsets = &state_offsets[sequence * max_states..][..num_states];
        let num_arcs = offsets
            .iter()
            .map(|&[first, len]| first.max(0) as usize + len.max(0) as usize)
            .max()
            .unwrap_or(0);
        if num_arcs > max_arcs {
            return Err(ChainLossError::shape(format!(
                "numerator {sequence} references {num_arcs} arcs, padded size is {max_arcs}"
            )));
        }
        let arcs = &transitions[sequence * max_arcs..][..num_arcs];
        let arc_weights = &weights[sequence * max_arcs..][..num_arcs];

        let graph = Graph::from_flat(
            FlatGraph {
                num_states,
                state_offsets: offsets,
                transitions: arcs,
                weights: arc_weights,
            },
            num_classes,
        )
        .map_err(|err| match err {
            ChainLossError::MalformedGraph {
                message,
                state,
                arc,
            } => ChainLossError::MalformedGraph {
                message: format!("numerator {sequence}: {message}"),
                state,
                arc,
            },
            other => other,
        })?;
        graphs.push(graph);
    }
    Ok(graphs)
}

impl ChainLoss {
    pub fn compute_tensors(
        &self,
        inputs: &ChainLossInputs<'_>,
    ) -> Result<ChainLossTensors, ChainLossError> {
        let [max_time, batch_size, num_classes] = expect_rank::<3>(inputs.scores, "scores")?;
        let [num_weights] = expect_rank::<1>(inputs.sequence_weights, "sequence weights")?;
        if num_weights != batch_size {
            return Err(ChainLossError::shape(format!(
                "{num_weights} sequence weights for batch size {batch_size}"
            )));
        }

        let scores = float_vec(inputs.scores, "read scores")?;
        let sequence_weights = float_vec(inputs.sequence_weights, "read sequence weights")?;
        let numerators = numerator_graphs_from_tensors(&inputs.numerators, num_classes)?;

        let sequence_lengths = inputs
            .sequence_lengths
            .map(|lengths| {
                expect_rank::<1>(lengths, "sequence lengths")?;
                int_vec(lengths, "read sequence lengths")?
                    .into_iter()
                    .map(|len| {
                        usize::try_from(len).map_err(|_| {
                            ChainLossError::shape(format!("negative sequence length {len}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let auxiliary_values = inputs
            .auxiliary
            .map(|(tensor, kind)| {
                if tensor.dims() != inputs.scores.dims() {
                    return Err(ChainLossError::shape(format!(
                        "auxiliary output dims {:?} differ from scores dims {:?}",
                        tensor.dims(),
                        inputs.scores.dims()
                    )));
                }
                Ok((float_vec(tensor, "read auxiliary output")?, kind))
            })
            .transpose()?;
        let auxiliary = auxiliary_values
            .as_ref()
            .map(|(values, kind)| AuxiliaryOutput {
                values,
                kind: *kind,
            });

        let mut batch = ChainBatch::new(
            ScoreTensor::new(&scores, max_time, batch_size, num_classes)?,
            &numerators,
            &sequence_weights,
            inputs.frames_per_sequence,
        );
        batch.num_sequences = inputs.num_sequences;
        if let Some(lengths) = sequence_lengths.as_deref() {
            batch = batch.with_sequence_lengths(lengths);
        }
        if let Some(aux) = auxiliary.as_ref() {
            batch = batch.with_auxiliary(aux);
        }

        let output = self.compute(&batch)?;
        let device = inputs.scores.device();
        let shape = (max_time, batch_size, num_classes);
        let objective = Tensor::from_vec(output.objective, batch_size, device)
            .map_err(|e| ChainLossError::runtime("objective tensor", e))?;
        let gradient = Tensor::from_vec(output.gradient, shape, device)
            .map_err(|e| ChainLossError::runtime("gradient tensor", e))?;
        let xent_gradient = output
            .xent_gradient
            .map(|values| Tensor::from_vec(values, shape, device))
            .transpose()
            .map_err(|e| ChainLossError::runtime("xent gradient tensor", e))?;

        Ok(ChainLossTensors {
            objective,
            gradient,
            xent_gradient,
            stats: output.stats,
            failed_sequences: output.failed_sequences,
        })
    }
}

fn expect_rank<const N: usize>(
    tensor: &Tensor,
    name: &str,
) -> Result<[usize; N], ChainLossError> {
    <[usize; N]>::try_from(tensor.dims()).map_err(|_| {
        ChainLossError::shape(format!(
            "{name} must have rank {N}, got dims {:?}",
            tensor.dims()
        ))
    })
}

fn float_vec(tensor: &Tensor, context: &'static str) -> Result<Vec<f32>, ChainLossError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| ChainLossError::runtime(context, e))
}

fn int_vec(tensor: &Tensor, context: &'static str) -> Result<Vec<i32>, ChainLossError> {
    let values = tensor
        .to_dtype(DType::I64)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<i64>())
        .map_err(|e| ChainLossError::runtime(context, e))?;
    values
        .into_iter()
        .map(|v| {
            i32::try_from(v).map_err(|_| {
                ChainLossError::malformed(format!("{context}: value {v} exceeds int32 range"))
            })
        })
        .collect()
}

fn triples(values: &[i32]) -> Vec<[i32; 3]> {
    values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

fn pairs(values: &[i32]) -> Vec<[i32; 2]> {
    values.chunks_exact(2).map(|c| [c[0], c[1]]).collect()
}
