//! Log-domain forward-backward over a [`Graph`].
//!
//! A sequence of `T` frames consumes `T` transitions, so alphas and betas
//! live on the `T + 1` frame boundaries. Frame `t` takes an arc
//! `(s, s', c, w)` with log score `w + scores[t][c]`.
//!
//! The leaky-HMM option models an auxiliary state reached from every state
//! with probability one and left towards state `s` with probability
//! `coefficient * initial[s]`. It is applied as the operator
//! `L(v) = v + coefficient * sum(v) * initial` at every frame boundary:
//! alphas are stored after `L`, betas after its transpose, which keeps the
//! per-frame arc posteriors summing to one.

use crate::error::{ChainLossError, Pass};
use crate::graph::{DenominatorGraph, Graph};
use crate::types::SequenceScores;

mod log_space;

pub(crate) use log_space::{log_add, LogSumExp};

/// Relative tolerance on forward vs backward total log-likelihood.
const FORWARD_BACKWARD_TOLERANCE: f64 = 1e-3;

pub struct ForwardBackward<'g> {
    graph: &'g Graph,
    pass: Pass,
    log_leak: Option<f64>,
}

impl<'g> ForwardBackward<'g> {
    pub fn new(graph: &'g Graph, pass: Pass) -> Self {
        Self {
            graph,
            pass,
            log_leak: None,
        }
    }

    pub fn numerator(graph: &'g Graph) -> Self {
        Self::new(graph, Pass::Numerator)
    }

    pub fn denominator(den: &'g DenominatorGraph, leaky_hmm_coefficient: f32) -> Self {
        Self::new(den.graph(), Pass::Denominator).with_leaky_hmm(leaky_hmm_coefficient as f64)
    }

    /// Enable leaky-HMM smoothing; a coefficient of zero leaves plain
    /// forward-backward.
    pub fn with_leaky_hmm(mut self, coefficient: f64) -> Self {
        self.log_leak = (coefficient > 0.0).then(|| coefficient.ln());
        self
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Run both recursions for one sequence.
    ///
    /// # Errors
    ///
    /// `NumericalFailure` when the total log-likelihood is `-inf` or NaN,
    /// `ShapeMismatch` when the graph uses more classes than the scores hold.
    pub fn run<'s>(
        &self,
        scores: SequenceScores<'s>,
    ) -> Result<Posteriors<'g, 's>, ChainLossError> {
        if self.graph.num_classes() > scores.num_classes() {
            return Err(ChainLossError::shape(format!(
                "{} graph of sequence {} uses {} classes but scores have {}",
                self.pass,
                scores.sequence(),
                self.graph.num_classes(),
                scores.num_classes()
            )));
        }

        let (alpha, beta) = rayon::join(|| self.forward(&scores), || self.backward(&scores));

        let num_states = self.graph.num_states();
        let last = scores.num_frames() * num_states;
        let log_likelihood = alpha[last..last + num_states]
            .iter()
            .zip(self.graph.log_final())
            .map(|(&a, &f)| a + f)
            .collect::<LogSumExp>()
            .value();
        if !log_likelihood.is_finite() {
            return Err(ChainLossError::numerical(
                scores.sequence(),
                self.pass,
                log_likelihood,
            ));
        }

        let backward_log_likelihood = beta[..num_states]
            .iter()
            .zip(self.graph.log_initial())
            .map(|(&b, &i)| b + i)
            .collect::<LogSumExp>()
            .value();
        let diff = (log_likelihood - backward_log_likelihood).abs();
        if diff.is_nan() || diff > FORWARD_BACKWARD_TOLERANCE * log_likelihood.abs().max(1.0) {
            tracing::warn!(
                sequence = scores.sequence(),
                pass = self.pass.as_str(),
                forward = log_likelihood,
                backward = backward_log_likelihood,
                "forward and backward log-likelihoods disagree"
            );
        }

        Ok(Posteriors {
            graph: self.graph,
            scores,
            alpha,
            beta,
            log_likelihood,
        })
    }

    fn forward(&self, scores: &SequenceScores<'_>) -> Vec<f64> {
        let graph = self.graph;
        let transitions = graph.transitions();
        let n = graph.num_states();
        let t_len = scores.num_frames();

        let mut alpha = vec![f64::NEG_INFINITY; (t_len + 1) * n];
        alpha[..n].copy_from_slice(graph.log_initial());
        self.leak_forward(&mut alpha[..n]);

        for t in 0..t_len {
            let frame = scores.frame(t);
            let (done, rest) = alpha.split_at_mut((t + 1) * n);
            let prev = &done[t * n..];
            let cur = &mut rest[..n];
            for (s, slot) in cur.iter_mut().enumerate() {
                let mut acc = LogSumExp::new();
                for &arc in graph.incoming_arcs(s) {
                    let tr = &transitions[arc];
                    let a = prev[tr.from];
                    if a == f64::NEG_INFINITY {
                        continue;
                    }
                    acc.add(a + tr.weight as f64 + frame[tr.class_id] as f64);
                }
                *slot = acc.value();
            }
            self.leak_forward(cur);
        }
        alpha
    }

    fn backward(&self, scores: &SequenceScores<'_>) -> Vec<f64> {
        let graph = self.graph;
        let n = graph.num_states();
        let t_len = scores.num_frames();

        let mut beta = vec![f64::NEG_INFINITY; (t_len + 1) * n];
        beta[t_len * n..].copy_from_slice(graph.log_final());
        self.leak_backward(&mut beta[t_len * n..]);

        for t in (0..t_len).rev() {
            let frame = scores.frame(t);
            let (head, tail) = beta.split_at_mut((t + 1) * n);
            let next = &tail[..n];
            let cur = &mut head[t * n..];
            for (s, slot) in cur.iter_mut().enumerate() {
                let mut acc = LogSumExp::new();
                for tr in graph.outgoing(s) {
                    let b = next[tr.to];
                    if b == f64::NEG_INFINITY {
                        continue;
                    }
                    acc.add(tr.weight as f64 + frame[tr.class_id] as f64 + b);
                }
                *slot = acc.value();
            }
            self.leak_backward(cur);
        }
        beta
    }

    /// `v[s] += leak * sum(v) * initial[s]`, in log domain.
    fn leak_forward(&self, v: &mut [f64]) {
        let Some(log_leak) = self.log_leak else {
            return;
        };
        let total = v.iter().copied().collect::<LogSumExp>().value();
        if total == f64::NEG_INFINITY {
            return;
        }
        let base = log_leak + total;
        for (x, &init) in v.iter_mut().zip(self.graph.log_initial()) {
            *x = log_add(*x, base + init);
        }
    }

    /// `v[s] += leak * (initial . v)`, in log domain.
    fn leak_backward(&self, v: &mut [f64]) {
        let Some(log_leak) = self.log_leak else {
            return;
        };
        let reentry = v
            .iter()
            .zip(self.graph.log_initial())
            .map(|(&x, &init)| x + init)
            .collect::<LogSumExp>()
            .value();
        if reentry == f64::NEG_INFINITY {
            return;
        }
        let base = log_leak + reentry;
        for x in v.iter_mut() {
            *x = log_add(*x, base);
        }
    }
}

/// Alphas, betas and total log-likelihood of one pass over one sequence.
pub struct Posteriors<'g, 's> {
    graph: &'g Graph,
    scores: SequenceScores<'s>,
    alpha: Vec<f64>,
    beta: Vec<f64>,
    log_likelihood: f64,
}

impl Posteriors<'_, '_> {
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    pub fn num_frames(&self) -> usize {
        self.scores.num_frames()
    }

    /// Log forward score at frame boundary `t` (`0..=T`).
    pub fn alpha(&self, t: usize, state: usize) -> f64 {
        self.alpha[t * self.graph.num_states() + state]
    }

    /// Log backward score at frame boundary `t` (`0..=T`).
    pub fn beta(&self, t: usize, state: usize) -> f64 {
        self.beta[t * self.graph.num_states() + state]
    }

    /// Expected occupation of `arc` at frame `t`.
    pub fn transition_posterior(&self, t: usize, arc: usize) -> f64 {
        let tr = &self.graph.transitions()[arc];
        let score = self.scores.frame(t)[tr.class_id] as f64;
        self.arc_posterior(t, tr.from, tr.to, tr.weight as f64 + score)
    }

    #[inline]
    fn arc_posterior(&self, t: usize, from: usize, to: usize, arc_score: f64) -> f64 {
        let a = self.alpha(t, from);
        let b = self.beta(t + 1, to);
        if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
            return 0.0;
        }
        (a + arc_score + b - self.log_likelihood).exp()
    }

    /// Arc posteriors summed per class: `[T][num_classes]` of the scores.
    pub fn class_posteriors(&self) -> Vec<f64> {
        let num_classes = self.scores.num_classes();
        let mut out = vec![0.0f64; self.num_frames() * num_classes];
        for (t, row) in out.chunks_exact_mut(num_classes).enumerate() {
            let frame = self.scores.frame(t);
            for tr in self.graph.transitions() {
                let arc_score = tr.weight as f64 + frame[tr.class_id] as f64;
                row[tr.class_id] += self.arc_posterior(t, tr.from, tr.to, arc_score);
            }
        }
        out
    }
}
