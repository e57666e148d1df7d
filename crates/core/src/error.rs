//! Tagged error hierarchy for the expert-iteration loop.
//!
//! Errors are classified once, where they enter the training code, so the
//! orchestrator can dispatch on the variant instead of inspecting messages.

use thiserror::Error;

pub type TrainResult<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    /// Device memory exhausted; recoverable by shrinking the minibatch.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A reward model returned output of an unexpected shape or flavour.
    #[error("malformed scoring output: {0}")]
    MalformedScoringOutput(String),

    #[error("completion filter called on an empty group")]
    EmptyGroup,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor or device failure that is not memory exhaustion.
    #[error("runtime error: {0}")]
    Runtime(candle_core::Error),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        let message = err.to_string();
        if is_out_of_memory_message(&message) {
            TrainError::ResourceExhausted(message)
        } else {
            TrainError::Runtime(err)
        }
    }
}

fn is_out_of_memory_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("out of memory") || lower.contains("cuda_error_out_of_memory")
}

impl TrainError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, TrainError::ResourceExhausted(_))
    }

    /// Errors after which the adaptive minibatch sizes are reset.
    pub fn is_resource_class(&self) -> bool {
        matches!(
            self,
            TrainError::ResourceExhausted(_) | TrainError::Runtime(_)
        )
    }

    pub fn is_malformed_output(&self) -> bool {
        matches!(self, TrainError::MalformedScoringOutput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_oom_is_resource_exhausted() {
        let err: TrainError = candle_core::Error::Msg("CUDA out of memory".into()).into();
        assert!(err.is_resource_exhausted());
        assert!(err.is_resource_class());
    }

    #[test]
    fn other_candle_errors_are_runtime() {
        let err: TrainError = candle_core::Error::Msg("shape mismatch".into()).into();
        assert!(matches!(err, TrainError::Runtime(_)));
        assert!(err.is_resource_class());
        assert!(!err.is_resource_exhausted());
    }

    #[test]
    fn anyhow_is_fatal_and_not_resource_class() {
        let err: TrainError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, TrainError::Fatal(_)));
        assert!(!err.is_resource_class());
        assert_eq!(err.to_string(), "disk full");
    }
}
