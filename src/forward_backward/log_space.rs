/// Streaming `log(sum(exp(x)))` with running-max rescaling.
///
/// `-inf` terms are skipped, so an accumulator that only ever sees `-inf`
/// (an unreachable state) reports `-inf` instead of NaN.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogSumExp {
    max: f64,
    sum: f64,
}

impl LogSumExp {
    pub(crate) fn new() -> Self {
        Self {
            max: f64::NEG_INFINITY,
            sum: 0.0,
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, x: f64) {
        if x == f64::NEG_INFINITY {
            return;
        }
        if x.is_nan() {
            self.max = f64::NAN;
            self.sum = f64::NAN;
            return;
        }
        if x <= self.max {
            self.sum += (x - self.max).exp();
        } else {
            self.sum = self.sum * (self.max - x).exp() + 1.0;
            self.max = x;
        }
    }

    #[inline]
    pub(crate) fn value(&self) -> f64 {
        if self.max == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        self.max + self.sum.ln()
    }
}

impl FromIterator<f64> for LogSumExp {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Self::new();
        for x in iter {
            acc.add(x);
        }
        acc
    }
}

/// `log(exp(a) + exp(b))`.
#[inline]
pub(crate) fn log_add(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn matches_direct_sum_for_moderate_values() {
        let xs = [-1.0, 0.5, 2.0, -3.0];
        let direct = xs.iter().map(|x: &f64| x.exp()).sum::<f64>().ln();
        let acc: LogSumExp = xs.iter().copied().collect();
        assert_relative_eq!(acc.value(), direct, epsilon = 1e-12);
    }

    #[test]
    fn survives_values_that_overflow_exp() {
        let acc: LogSumExp = [1000.0, 1000.0].into_iter().collect();
        assert_relative_eq!(acc.value(), 1000.0 + 2f64.ln(), epsilon = 1e-9);

        let acc: LogSumExp = [-1000.0, -1000.0 + 3f64.ln()].into_iter().collect();
        assert_relative_eq!(acc.value(), -1000.0 + 4f64.ln(), epsilon = 1e-9);
    }

    #[test]
    fn all_negative_infinity_stays_negative_infinity() {
        let acc: LogSumExp = [f64::NEG_INFINITY, f64::NEG_INFINITY].into_iter().collect();
        assert_eq!(acc.value(), f64::NEG_INFINITY);
        assert_eq!(LogSumExp::new().value(), f64::NEG_INFINITY);
    }

    #[test]
    fn negative_infinity_terms_are_ignored() {
        let acc: LogSumExp = [f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY].into_iter().collect();
        assert_eq!(acc.value(), 0.0);
    }

    #[test]
    fn nan_poisons_the_result() {
        let acc: LogSumExp = [0.0, f64::NAN, 1.0].into_iter().collect();
        assert!(acc.value().is_nan());
    }

    #[test]
    fn log_add_handles_infinities() {
        assert_eq!(log_add(f64::NEG_INFINITY, 1.5), 1.5);
        assert_eq!(log_add(1.5, f64::NEG_INFINITY), 1.5);
        assert_eq!(log_add(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert_relative_eq!(log_add(0.0, 0.0), 2f64.ln(), epsilon = 1e-12);
    }
}
