use thiserror::Error;

/// Configuration validation failure.
///
/// Every variant carries a stable code (`E0xx`) that host bridges key on;
/// the code never changes even if the message wording does.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("E001: sample rate must be in [1, 10000] Hz (got {0})")]
    InvalidSampleRate(f64),

    #[error("E011: bandpass requires 0 <= low < high <= fs/2 (low={low}, high={high}, nyquist={nyquist})")]
    InvalidBandpass { low: f64, high: f64, nyquist: f64 },

    #[error("E012: nfft must be in [64, 16384] (got {0})")]
    InvalidNfft(usize),

    #[error("E013: BPM range must satisfy 30 <= min < max <= 240 (min={min}, max={max})")]
    InvalidBpmRange { min: f64, max: f64 },

    #[error("E014: refractory must be in [50, 2000] ms (got {0})")]
    InvalidRefractory(f64),

    #[error("E015: non-finite value in option `{0}`")]
    NonFinite(&'static str),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::InvalidSampleRate(_) => "E001",
            ConfigError::InvalidBandpass { .. } => "E011",
            ConfigError::InvalidNfft(_) => "E012",
            ConfigError::InvalidBpmRange { .. } => "E013",
            ConfigError::InvalidRefractory(_) => "E014",
            ConfigError::NonFinite(_) => "E015",
        }
    }
}

/// Usage errors surfaced by the handle registry and the batch entry points.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("E101: invalid or destroyed handle on push ({0})")]
    InvalidHandlePush(u64),

    #[error("E111: invalid or destroyed handle on poll ({0})")]
    InvalidHandlePoll(u64),

    #[error("E121: invalid or destroyed handle on destroy ({0})")]
    InvalidHandleDestroy(u64),

    #[error("E102: {0}")]
    InvalidBuffer(&'static str),

    #[error("E201: invalid setWindow argument ({0})")]
    InvalidWindowArg(f64),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::InvalidHandlePush(_) => "E101",
            StreamError::InvalidHandlePoll(_) => "E111",
            StreamError::InvalidHandleDestroy(_) => "E121",
            StreamError::InvalidBuffer(_) => "E102",
            StreamError::InvalidWindowArg(_) => "E201",
            StreamError::Config(e) => e.code(),
        }
    }
}

/// Errors from the batch analysis entry points.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("E102: signal is empty")]
    EmptySignal,

    #[error("E001: sample rate must be > 0 (got {0})")]
    InvalidSampleRate(f64),
}

impl AnalysisError {
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::EmptySignal => "E102",
            AnalysisError::InvalidSampleRate(_) => "E001",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ConfigError::InvalidSampleRate(0.0).code(), "E001");
        assert_eq!(
            ConfigError::InvalidBandpass { low: 1.0, high: 0.5, nyquist: 25.0 }.code(),
            "E011"
        );
        assert_eq!(ConfigError::InvalidNfft(5).code(), "E012");
        assert_eq!(ConfigError::InvalidBpmRange { min: 10.0, max: 5.0 }.code(), "E013");
        assert_eq!(ConfigError::InvalidRefractory(10.0).code(), "E014");
        assert_eq!(ConfigError::NonFinite("overlap").code(), "E015");
        assert_eq!(StreamError::InvalidHandlePush(3).code(), "E101");
        assert_eq!(StreamError::InvalidHandlePoll(3).code(), "E111");
        assert_eq!(StreamError::InvalidHandleDestroy(3).code(), "E121");
        assert_eq!(StreamError::InvalidBuffer("empty buffer").code(), "E102");
        assert_eq!(StreamError::InvalidWindowArg(-1.0).code(), "E201");
    }

    #[test]
    fn messages_embed_codes() {
        let msg = ConfigError::InvalidNfft(4).to_string();
        assert!(msg.starts_with("E012"));
    }
}
