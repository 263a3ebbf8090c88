use std::path::PathBuf;

use thiserror::Error;

use crate::reasoning::ReasoningFailure;

/// Terminal error for a research request.
///
/// Only these surface to the caller; per-source and per-call problems that the
/// pipeline can work around are reported as [`crate::Degradation`] instead.
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("no usable sources: {acquired} of {attempted} sources acquired, none survived ranking")]
    NoUsableSources { attempted: usize, acquired: usize },
    #[error(transparent)]
    Reasoning(#[from] ReasoningFailure),
    #[error("research request timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResearchError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    /// Stable failure-kind code for callers that branch on the error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoUsableSources { .. } => "NO_USABLE_SOURCES",
            Self::Reasoning(_) => "REASONING_FAILURE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidConfiguration(_) => "INVALID_CONFIGURATION",
            Self::MissingSecret(_) => "MISSING_SECRET",
            Self::ConfigIo { .. } => "CONFIG_IO",
            Self::Other(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;
    use crate::reasoning::EvidenceTrace;

    #[test]
    fn codes_are_stable() {
        let err = ResearchError::NoUsableSources {
            attempted: 2,
            acquired: 0,
        };
        assert_eq!(err.code(), "NO_USABLE_SOURCES");
        assert!(err.to_string().contains("0 of 2"));

        let failure = ReasoningFailure::new(
            "compose_answer",
            CapabilityError::RateLimited("slow down".into()),
            EvidenceTrace::empty_linear(),
        );
        let err = ResearchError::from(failure);
        assert_eq!(err.code(), "REASONING_FAILURE");
        assert!(err.to_string().contains("compose_answer"));

        assert_eq!(ResearchError::Timeout { after_ms: 5 }.code(), "TIMEOUT");
    }
}
