use crate::error::ChainLossError;
use crate::graph::Graph;
use crate::pipeline::traits::AuxiliaryOutputProvider;

/// Borrowed `[max_time, batch_size, num_classes]` tensor in row-major order.
#[derive(Debug, Clone, Copy)]
pub struct ScoreTensor<'a> {
    data: &'a [f32],
    max_time: usize,
    batch_size: usize,
    num_classes: usize,
}

impl<'a> ScoreTensor<'a> {
    pub fn new(
        data: &'a [f32],
        max_time: usize,
        batch_size: usize,
        num_classes: usize,
    ) -> Result<Self, ChainLossError> {
        if max_time == 0 || batch_size == 0 || num_classes == 0 {
            return Err(ChainLossError::shape(format!(
                "scores dims must be non-zero, got [{max_time}, {batch_size}, {num_classes}]"
            )));
        }
        let expected = max_time * batch_size * num_classes;
        if data.len() != expected {
            return Err(ChainLossError::shape(format!(
                "scores hold {} values, expected {expected} for [{max_time}, {batch_size}, {num_classes}]",
                data.len()
            )));
        }
        Ok(Self {
            data,
            max_time,
            batch_size,
            num_classes,
        })
    }

    pub fn max_time(&self) -> usize {
        self.max_time
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn data(&self) -> &'a [f32] {
        self.data
    }

    /// The first `num_frames` frames of one sequence.
    pub fn sequence(&self, sequence: usize, num_frames: usize) -> SequenceScores<'a> {
        debug_assert!(sequence < self.batch_size);
        debug_assert!(num_frames <= self.max_time);
        SequenceScores {
            data: self.data,
            sequence,
            num_frames,
            batch_size: self.batch_size,
            num_classes: self.num_classes,
        }
    }
}

/// Strided view of one sequence inside a [`ScoreTensor`].
#[derive(Debug, Clone, Copy)]
pub struct SequenceScores<'a> {
    data: &'a [f32],
    sequence: usize,
    num_frames: usize,
    batch_size: usize,
    num_classes: usize,
}

impl<'a> SequenceScores<'a> {
    /// Class scores of frame `t`.
    #[inline]
    pub fn frame(&self, t: usize) -> &'a [f32] {
        let start = (t * self.batch_size + self.sequence) * self.num_classes;
        &self.data[start..start + self.num_classes]
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// One call's worth of inputs.
#[derive(Clone, Copy)]
pub struct ChainBatch<'a> {
    pub scores: ScoreTensor<'a>,
    /// One numerator graph per sequence.
    pub numerators: &'a [Graph],
    pub sequence_weights: &'a [f32],
    pub num_sequences: usize,
    pub frames_per_sequence: usize,
    /// Actual frame count per sequence for padded batches; `None` means
    /// every sequence is `frames_per_sequence` long.
    pub sequence_lengths: Option<&'a [usize]>,
    pub auxiliary: Option<&'a dyn AuxiliaryOutputProvider>,
}

impl<'a> ChainBatch<'a> {
    pub fn new(
        scores: ScoreTensor<'a>,
        numerators: &'a [Graph],
        sequence_weights: &'a [f32],
        frames_per_sequence: usize,
    ) -> Self {
        Self {
            scores,
            numerators,
            sequence_weights,
            num_sequences: scores.batch_size(),
            frames_per_sequence,
            sequence_lengths: None,
            auxiliary: None,
        }
    }

    pub fn with_sequence_lengths(mut self, lengths: &'a [usize]) -> Self {
        self.sequence_lengths = Some(lengths);
        self
    }

    pub fn with_auxiliary(mut self, auxiliary: &'a dyn AuxiliaryOutputProvider) -> Self {
        self.auxiliary = Some(auxiliary);
        self
    }

    pub fn sequence_length(&self, sequence: usize) -> usize {
        self.sequence_lengths
            .map(|lengths| lengths[sequence])
            .unwrap_or(self.frames_per_sequence)
    }
}

/// Per-sequence breakdown of the objective, before weighting and
/// per-frame normalization.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SequenceStats {
    pub num_log_likelihood: f64,
    pub den_log_likelihood: f64,
    /// `-0.5 * l2_regularize * ||scores||^2` over the sequence's frames.
    pub l2_term: f64,
    /// `xent_regularize * sum(num_post * log aux)`, zero when disabled.
    pub xent_term: f64,
    pub weight: f32,
    pub num_frames: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainLossOutput {
    /// One value per sequence; reduction across the batch is left to the
    /// caller.
    pub objective: Vec<f32>,
    /// Same layout as the scores.
    pub gradient: Vec<f32>,
    /// Gradient with respect to the auxiliary output, when one was used.
    pub xent_gradient: Option<Vec<f32>>,
    pub stats: Vec<SequenceStats>,
    /// Sequences zeroed after a numerical failure.
    pub failed_sequences: Vec<usize>,
    pub max_time: usize,
    pub batch_size: usize,
    pub num_classes: usize,
}

impl ChainLossOutput {
    #[inline]
    pub fn index(&self, t: usize, sequence: usize, class_id: usize) -> usize {
        (t * self.batch_size + sequence) * self.num_classes + class_id
    }

    pub fn gradient_at(&self, t: usize, sequence: usize, class_id: usize) -> f32 {
        self.gradient[self.index(t, sequence, class_id)]
    }

    pub fn total_objective(&self) -> f64 {
        self.objective.iter().map(|&o| o as f64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_tensor_rejects_wrong_length_and_empty_dims() {
        let data = vec![0.0f32; 12];
        assert!(ScoreTensor::new(&data, 2, 2, 3).is_ok());
        assert!(matches!(
            ScoreTensor::new(&data, 2, 2, 4),
            Err(ChainLossError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            ScoreTensor::new(&[], 0, 2, 3),
            Err(ChainLossError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn sequence_view_strides_over_batch() {
        // value = 100 * t + 10 * b + c
        let (t_len, batch, classes) = (3, 2, 4);
        let data = (0..t_len)
            .flat_map(|t| {
                (0..batch).flat_map(move |b| (0..classes).map(move |c| (100 * t + 10 * b + c) as f32))
            })
            .collect::<Vec<_>>();
        let tensor = ScoreTensor::new(&data, t_len, batch, classes).expect("valid tensor");
        let seq = tensor.sequence(1, 2);
        assert_eq!(seq.num_frames(), 2);
        assert_eq!(seq.frame(0), &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(seq.frame(2), &[210.0, 211.0, 212.0, 213.0]);
    }
}
