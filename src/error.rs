use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealError {
    #[error("Provider probe failed for '{0}': {1}")]
    Probe(String, String),

    #[error("Effector error: {0}")]
    Effector(String),

    #[error("Metrics source error: {0}")]
    Metrics(String),

    #[error("History store error: {0}")]
    History(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Learning update computed against table v{0} but current is v{1}")]
    StaleUpdate(u64, u64),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type HealResult<T> = Result<T, HealError>;

impl serde::Serialize for HealError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = HealError::Probe("openai".to_string(), "connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "Provider probe failed for 'openai': connection refused"
        );

        let err = HealError::Effector("scale-out rejected".to_string());
        assert_eq!(err.to_string(), "Effector error: scale-out rejected");

        let err = HealError::Config("max_backups must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_backups must be at least 1"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.toml");
        let err: HealError = io_err.into();
        assert!(matches!(err, HealError::IoError(_)));
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn test_error_serializes_as_message() {
        let err = HealError::History("store closed".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"History store error: store closed\"");
    }
}
