use crate::config::ChainLossConfig;
use crate::error::ChainLossError;
use crate::graph::{DenominatorGraph, FlatGraph, Graph};
use crate::pipeline::runtime::{ChainLoss, ChainLossParts};

pub struct ChainLossBuilder {
    config: ChainLossConfig,
    denominator: Option<Graph>,
}

impl ChainLossBuilder {
    pub fn new(config: ChainLossConfig) -> Self {
        Self {
            config,
            denominator: None,
        }
    }

    pub fn with_denominator(mut self, graph: Graph) -> Self {
        self.denominator = Some(graph);
        self
    }

    /// Same as [`Self::with_denominator`], validating flattened arrays first.
    pub fn with_denominator_flat(
        self,
        flat: FlatGraph<'_>,
        num_classes: usize,
    ) -> Result<Self, ChainLossError> {
        Ok(self.with_denominator(Graph::from_flat(flat, num_classes)?))
    }

    pub fn build(self) -> Result<ChainLoss, ChainLossError> {
        self.config.validate()?;
        let graph = self
            .denominator
            .ok_or_else(|| ChainLossError::invalid_config("no denominator graph supplied"))?;
        let denominator = DenominatorGraph::new(graph, self.config.denominator_initial)?;

        let pool = self
            .config
            .num_threads
            .map(|num_threads| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .thread_name(|i| format!("chain-loss-{i}"))
                    .build()
            })
            .transpose()
            .map_err(|e| ChainLossError::runtime("build chain loss thread pool", e))?;

        tracing::info!(
            den_states = denominator.graph().num_states(),
            den_transitions = denominator.graph().num_transitions(),
            num_classes = denominator.num_classes(),
            l2_regularize = self.config.l2_regularize,
            leaky_hmm_coefficient = self.config.leaky_hmm_coefficient,
            xent_regularize = self.config.xent_regularize,
            num_threads = ?self.config.num_threads,
            "chain loss ready"
        );

        Ok(ChainLoss::from_parts(ChainLossParts {
            config: self.config,
            denominator,
            pool,
        }))
    }
}
