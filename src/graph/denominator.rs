use super::Graph;
use crate::config::InitialDistribution;
use crate::error::ChainLossError;

/// The shared normalization graph. Every state is final; the start
/// distribution is normalized and also drives leaky-HMM re-entry.
#[derive(Debug, Clone)]
pub struct DenominatorGraph {
    graph: Graph,
    initial_probs: Vec<f64>,
}

impl DenominatorGraph {
    pub fn new(mut graph: Graph, initial: InitialDistribution) -> Result<Self, ChainLossError> {
        let num_states = graph.num_states();
        if graph.num_transitions() == 0 {
            return Err(ChainLossError::malformed(
                "denominator graph has no transitions",
            ));
        }
        let initial_probs = match initial {
            InitialDistribution::Uniform => uniform(num_states),
            InitialDistribution::Stationary { iterations } => {
                stationary(&graph, iterations).unwrap_or_else(|| {
                    tracing::warn!(
                        num_states,
                        iterations,
                        "denominator graph leaks all probability mass; using uniform start"
                    );
                    uniform(num_states)
                })
            }
        };

        let log_initial = initial_probs
            .iter()
            .map(|&p| if p > 0.0 { p.ln() } else { f64::NEG_INFINITY })
            .collect();
        graph.set_endpoints(log_initial, vec![0.0; num_states]);

        tracing::debug!(
            num_states,
            num_transitions = graph.num_transitions(),
            num_classes = graph.num_classes(),
            ?initial,
            "denominator graph ready"
        );

        Ok(Self {
            graph,
            initial_probs,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Normalized start probabilities, one per state.
    pub fn initial_probs(&self) -> &[f64] {
        &self.initial_probs
    }

    pub fn num_classes(&self) -> usize {
        self.graph.num_classes()
    }
}

fn uniform(num_states: usize) -> Vec<f64> {
    vec![1.0 / num_states as f64; num_states]
}

/// Average of the distributions visited over `iterations` steps of the
/// per-state normalized transition probabilities, starting from uniform.
/// Returns `None` when every step loses all mass.
fn stationary(graph: &Graph, iterations: usize) -> Option<Vec<f64>> {
    let num_states = graph.num_states();
    let arc_probs = normalized_arc_probs(graph);

    let mut cur = uniform(num_states);
    let mut next = vec![0.0f64; num_states];
    let mut avg = vec![0.0f64; num_states];
    for _ in 0..iterations {
        next.iter_mut().for_each(|p| *p = 0.0);
        for (arc, t) in graph.transitions().iter().enumerate() {
            next[t.to] += cur[t.from] * arc_probs[arc];
        }
        let total: f64 = next.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            break;
        }
        for (a, p) in avg.iter_mut().zip(next.iter_mut()) {
            *p /= total;
            *a += *p;
        }
        std::mem::swap(&mut cur, &mut next);
    }

    let total: f64 = avg.iter().sum();
    if total <= 0.0 {
        return None;
    }
    avg.iter_mut().for_each(|p| *p /= total);
    Some(avg)
}

fn normalized_arc_probs(graph: &Graph) -> Vec<f64> {
    let mut probs = vec![0.0f64; graph.num_transitions()];
    for state in 0..graph.num_states() {
        let arcs = graph.outgoing_arcs(state);
        let out = graph.outgoing(state);
        let max = out
            .iter()
            .map(|t| t.weight as f64)
            .fold(f64::NEG_INFINITY, f64::max);
        if max == f64::NEG_INFINITY {
            continue;
        }
        let total: f64 = out.iter().map(|t| (t.weight as f64 - max).exp()).sum();
        for (arc, t) in arcs.zip(out) {
            probs[arc] = (t.weight as f64 - max).exp() / total;
        }
    }
    probs
}
