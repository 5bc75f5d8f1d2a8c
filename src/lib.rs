pub mod config;
pub mod error;
pub mod forward_backward;
pub mod graph;
mod loss;
pub mod pipeline;
pub mod types;

pub use config::{ChainLossConfig, InitialDistribution, NumericalFailurePolicy};
pub use error::{ChainLossError, Pass};
pub use forward_backward::{ForwardBackward, Posteriors};
pub use graph::{DenominatorGraph, FlatGraph, Graph, Transition};
pub use pipeline::binding::{
    denominator_graph_from_tensors, numerator_graphs_from_tensors, ChainLossInputs,
    ChainLossTensors, DenominatorTensors, NumeratorTensors,
};
pub use pipeline::builder::ChainLossBuilder;
pub use pipeline::runtime::ChainLoss;
pub use pipeline::traits::{
    AuxiliaryKind, AuxiliaryOutput, AuxiliaryOutputProvider, NoAuxiliaryOutput,
};
pub use types::{ChainBatch, ChainLossOutput, ScoreTensor, SequenceScores, SequenceStats};
