use std::error::Error;
use std::fmt;
use std::io;

#[derive(Debug)]
pub enum SspfmError {
    Io(io::Error),
    Parse(String),
    Config {
        option: String,
        value: String,
        allowed: Vec<String>,
    },
    Ingest(String),
    Fit(String),
    Logic(String),
}

impl SspfmError {
    /// Builds a configuration error naming the option and its allowed values.
    pub fn config(option: &str, value: &str, allowed: &[&str]) -> Self {
        SspfmError::Config {
            option: option.to_string(),
            value: value.to_string(),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, SspfmError::Config { .. })
    }
}

impl fmt::Display for SspfmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SspfmError::Io(err) => write!(f, "I/O Error: {}", err),
            SspfmError::Parse(msg) => write!(f, "Parse Error: {}", msg),
            SspfmError::Config { option, value, allowed } => {
                if allowed.is_empty() {
                    write!(f, "Configuration Error: '{}' is invalid for {}", value, option)
                } else {
                    write!(
                        f,
                        "Configuration Error: '{}' is invalid for {} (allowed: {})",
                        value,
                        option,
                        allowed.join(", ")
                    )
                }
            }
            SspfmError::Ingest(msg) => write!(f, "Ingestion Error: {}", msg),
            SspfmError::Fit(msg) => write!(f, "Fitting Error: {}", msg),
            SspfmError::Logic(msg) => write!(f, "Logic Error: {}", msg),
        }
    }
}

impl Error for SspfmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SspfmError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SspfmError {
    fn from(err: io::Error) -> Self {
        SspfmError::Io(err)
    }
}

impl From<std::num::ParseFloatError> for SspfmError {
    fn from(err: std::num::ParseFloatError) -> Self {
        SspfmError::Parse(err.to_string())
    }
}

impl From<std::num::ParseIntError> for SspfmError {
    fn from(err: std::num::ParseIntError) -> Self {
        SspfmError::Parse(err.to_string())
    }
}

impl From<csv::Error> for SspfmError {
    fn from(err: csv::Error) -> Self {
        SspfmError::Ingest(err.to_string())
    }
}

impl From<toml::de::Error> for SspfmError {
    fn from(err: toml::de::Error) -> Self {
        SspfmError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for SspfmError {
    fn from(err: serde_json::Error) -> Self {
        SspfmError::Parse(err.to_string())
    }
}

pub type SspfmResult<T> = Result<T, SspfmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_option_and_allowed_set() {
        let err = SspfmError::config("mode", "peak", &["max", "fit", "single_freq", "dfrt"]);
        let msg = err.to_string();
        assert!(msg.contains("mode"));
        assert!(msg.contains("peak"));
        assert!(msg.contains("single_freq"));
        assert!(err.is_config());
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err: SspfmError = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert!(err.source().is_some());
        assert!(!err.is_config());
    }
}
