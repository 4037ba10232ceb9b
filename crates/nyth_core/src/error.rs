//! Engine Error Types

use thiserror::Error;

/// Errors that can occur in the pipeline and engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("DSP error: {0}")]
    DspError(#[from] nyth_dsp::DspError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to spawn {name} thread: {reason}")]
    ThreadSpawnError { name: &'static str, reason: String },

    #[error("Spectrum analysis is not configured")]
    AnalysisNotConfigured,

    #[error("Analysis worker already running")]
    AlreadyRunning,

    #[error("Analysis worker not running")]
    NotRunning,

    #[error("No {0} in the pipeline")]
    MissingStage(&'static str),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ConfigError("block size 7".into());
        assert!(err.to_string().contains("block size 7"));

        let err = EngineError::MissingStage("compressor");
        assert_eq!(err.to_string(), "No compressor in the pipeline");
    }

    #[test]
    fn test_error_from_dsp() {
        let dsp_err = nyth_dsp::DspError::InvalidBandIndex(10);
        let engine_err: EngineError = dsp_err.into();
        assert!(matches!(engine_err, EngineError::DspError(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let engine_err: EngineError = json_err.into();
        assert!(matches!(engine_err, EngineError::SerializationError(_)));
    }
}
