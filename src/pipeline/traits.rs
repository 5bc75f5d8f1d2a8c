/// How the values of an auxiliary output are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxiliaryKind {
    /// Softmax probabilities.
    Probabilities,
    /// Log-softmax values.
    LogProbabilities,
}

/// An auxiliary network output laid out like the scores,
/// `[max_time, batch_size, num_classes]`.
#[derive(Debug, Clone, Copy)]
pub struct AuxiliaryOutput<'a> {
    pub values: &'a [f32],
    pub kind: AuxiliaryKind,
}

/// Capability interface for the cross-entropy regularizer's auxiliary
/// output. Callers without such an output can pass [`NoAuxiliaryOutput`]
/// or leave the batch's provider unset.
pub trait AuxiliaryOutputProvider: Send + Sync {
    fn auxiliary_output(&self) -> Option<AuxiliaryOutput<'_>>;
}

impl AuxiliaryOutputProvider for AuxiliaryOutput<'_> {
    fn auxiliary_output(&self) -> Option<AuxiliaryOutput<'_>> {
        Some(*self)
    }
}

pub struct NoAuxiliaryOutput;

impl AuxiliaryOutputProvider for NoAuxiliaryOutput {
    fn auxiliary_output(&self) -> Option<AuxiliaryOutput<'_>> {
        None
    }
}
