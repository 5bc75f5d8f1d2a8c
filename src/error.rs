use std::fmt;

use thiserror::Error;

/// Which forward-backward pass a numerical failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Numerator,
    Denominator,
}

impl Pass {
    pub fn as_str(self) -> &'static str {
        match self {
            Pass::Numerator => "numerator",
            Pass::Denominator => "denominator",
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ChainLossError {
    #[error("malformed graph: {message}")]
    MalformedGraph {
        message: String,
        state: Option<usize>,
        arc: Option<usize>,
    },
    #[error("shape mismatch: {message}")]
    ShapeMismatch { message: String },
    #[error(
        "numerical failure in {pass} pass of sequence {sequence}: total log-likelihood {log_likelihood}"
    )]
    NumericalFailure {
        sequence: usize,
        pass: Pass,
        log_likelihood: f64,
    },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error while {context}: {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{context}: {message}")]
    Runtime {
        context: &'static str,
        message: String,
    },
}

impl ChainLossError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedGraph {
            message: message.into(),
            state: None,
            arc: None,
        }
    }

    pub(crate) fn malformed_state(state: usize, message: impl Into<String>) -> Self {
        Self::MalformedGraph {
            message: format!("state {state}: {}", message.into()),
            state: Some(state),
            arc: None,
        }
    }

    pub(crate) fn malformed_arc(arc: usize, message: impl Into<String>) -> Self {
        Self::MalformedGraph {
            message: format!("arc {arc}: {}", message.into()),
            state: None,
            arc: Some(arc),
        }
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            message: message.into(),
        }
    }

    pub(crate) fn numerical(sequence: usize, pass: Pass, log_likelihood: f64) -> Self {
        Self::NumericalFailure {
            sequence,
            pass,
            log_likelihood,
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn json(context: &'static str, source: serde_json::Error) -> Self {
        Self::Json { context, source }
    }

    pub(crate) fn runtime(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Runtime {
            context,
            message: err.to_string(),
        }
    }

    /// Sequence index this error refers to, when it refers to one.
    pub fn sequence(&self) -> Option<usize> {
        match self {
            Self::NumericalFailure { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }
}
