use crate::pipeline::traits::AuxiliaryKind;
use crate::types::SequenceScores;

/// Floor applied to auxiliary probabilities before taking their log.
const PROBABILITY_FLOOR: f32 = 1e-20;

/// Adds the derivative of `-0.5 * l2 * ||scores||^2` into `grad`
/// (`[T][C]`) and returns the objective term.
pub(crate) fn l2_term(scores: &SequenceScores<'_>, l2_regularize: f64, grad: &mut [f64]) -> f64 {
    if l2_regularize == 0.0 {
        return 0.0;
    }
    let num_classes = scores.num_classes();
    let mut sum_sq = 0.0f64;
    for (t, row) in grad.chunks_exact_mut(num_classes).enumerate() {
        for (g, &x) in row.iter_mut().zip(scores.frame(t)) {
            let x = x as f64;
            sum_sq += x * x;
            *g -= l2_regularize * x;
        }
    }
    -0.5 * l2_regularize * sum_sq
}

pub(crate) struct CrossEntropyTerm {
    pub objective: f64,
    /// Derivative with respect to the auxiliary output values, `[T][C]`.
    pub gradient: Vec<f64>,
}

/// `xent_regularize * sum(num_post * log aux)`. Numerator posteriors are
/// held constant, so only the auxiliary output receives a gradient.
pub(crate) fn cross_entropy_term(
    num_post: &[f64],
    auxiliary: &SequenceScores<'_>,
    kind: AuxiliaryKind,
    xent_regularize: f64,
) -> CrossEntropyTerm {
    let num_classes = auxiliary.num_classes();
    let mut objective = 0.0f64;
    let mut gradient = vec![0.0f64; num_post.len()];
    for (t, (post_row, grad_row)) in num_post
        .chunks_exact(num_classes)
        .zip(gradient.chunks_exact_mut(num_classes))
        .enumerate()
    {
        let aux_row = auxiliary.frame(t);
        for ((&post, g), &value) in post_row.iter().zip(grad_row.iter_mut()).zip(aux_row) {
            if post == 0.0 {
                continue;
            }
            let (log_p, d_log_p) = match kind {
                AuxiliaryKind::LogProbabilities => (value as f64, 1.0),
                AuxiliaryKind::Probabilities => {
                    let p = value.max(PROBABILITY_FLOOR) as f64;
                    (p.ln(), 1.0 / p)
                }
            };
            objective += post * log_p;
            *g = xent_regularize * post * d_log_p;
        }
    }
    CrossEntropyTerm {
        objective: xent_regularize * objective,
        gradient,
    }
}
