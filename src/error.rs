//! Pipeline error classification

use thiserror::Error;

/// Classified pipeline failures.
///
/// Surfaced wrapped in `anyhow::Error`; callers that care about the class
/// use `downcast_ref::<PipelineError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A filter graph or encoder could not be opened from its configuration
    #[error("{stage} failed to open: {reason}")]
    StageOpen { stage: &'static str, reason: String },

    /// A single sample could not be converted between representations
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// A push/pull call on an open stage returned a hard error
    #[error("{stage} error: {reason}")]
    Stage { stage: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl PipelineError {
    pub fn stage_open(stage: &'static str, reason: impl std::fmt::Display) -> Self {
        PipelineError::StageOpen {
            stage,
            reason: reason.to_string(),
        }
    }

    pub fn stage(stage: &'static str, reason: impl std::fmt::Display) -> Self {
        PipelineError::Stage {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Find the pipeline classification of an error, if any
pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_through_context() {
        let err = Err::<(), _>(PipelineError::stage_open("FilterStage", "bad graph"))
            .context("track 1");
        let err = err.unwrap_err();
        assert_eq!(
            classify(&err),
            Some(&PipelineError::StageOpen {
                stage: "FilterStage",
                reason: "bad graph".into()
            })
        );
        assert!(err.to_string().contains("track 1"));
        assert!(classify(&anyhow::anyhow!("plain")).is_none());
    }
}
