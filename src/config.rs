use std::path::Path;

use serde::Deserialize;

use crate::error::ChainLossError;

/// How the denominator graph's start distribution is derived.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialDistribution {
    /// `1 / num_states` for every state.
    #[default]
    Uniform,
    /// Average of the distributions visited while running the graph's
    /// normalized transition probabilities from the uniform distribution.
    Stationary { iterations: usize },
}

impl InitialDistribution {
    pub const DEFAULT_STATIONARY_ITERATIONS: usize = 100;

    pub fn stationary() -> Self {
        Self::Stationary {
            iterations: Self::DEFAULT_STATIONARY_ITERATIONS,
        }
    }
}

/// What to do with a sequence whose total log-likelihood is not finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericalFailurePolicy {
    /// Abort the whole call with `NumericalFailure`.
    #[default]
    Fail,
    /// Zero the sequence's objective and gradient and keep going.
    ZeroSequence,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChainLossConfig {
    /// The term added to the objective is `-0.5 * l2_regularize * ||scores||^2`.
    pub l2_regularize: f32,
    /// Probability mass leaked through the auxiliary epsilon state at every
    /// frame of the denominator pass, e.g. 0.1.
    pub leaky_hmm_coefficient: f32,
    /// Cross-entropy regularization constant, e.g. 0.1. Only effective when
    /// the caller supplies an auxiliary output.
    pub xent_regularize: f32,
    pub denominator_initial: InitialDistribution,
    pub numerical_failure: NumericalFailurePolicy,
    /// Size of a dedicated worker pool; `None` uses the global rayon pool.
    pub num_threads: Option<usize>,
}

impl ChainLossConfig {
    pub fn load(path: &Path) -> Result<Self, ChainLossError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ChainLossError::io("read chain loss config", e))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| ChainLossError::json("parse chain loss config", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ChainLossError> {
        check_coefficient("l2_regularize", self.l2_regularize)?;
        check_coefficient("leaky_hmm_coefficient", self.leaky_hmm_coefficient)?;
        check_coefficient("xent_regularize", self.xent_regularize)?;
        if self.leaky_hmm_coefficient >= 1.0 {
            return Err(ChainLossError::invalid_config(format!(
                "leaky_hmm_coefficient must be < 1, got {}",
                self.leaky_hmm_coefficient
            )));
        }
        if let InitialDistribution::Stationary { iterations: 0 } = self.denominator_initial {
            return Err(ChainLossError::invalid_config(
                "stationary initial distribution needs at least one iteration",
            ));
        }
        if self.num_threads == Some(0) {
            return Err(ChainLossError::invalid_config("num_threads must be > 0"));
        }
        Ok(())
    }
}

impl Default for ChainLossConfig {
    fn default() -> Self {
        Self {
            l2_regularize: 0.0,
            leaky_hmm_coefficient: 0.0,
            xent_regularize: 0.0,
            denominator_initial: InitialDistribution::Uniform,
            numerical_failure: NumericalFailurePolicy::Fail,
            num_threads: None,
        }
    }
}

fn check_coefficient(name: &str, value: f32) -> Result<(), ChainLossError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ChainLossError::invalid_config(format!(
            "{name} must be finite and non-negative, got {value}"
        )));
    }
    Ok(())
}
