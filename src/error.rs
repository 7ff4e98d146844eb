use strum::Display;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Which side of the target went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TerminatedKind {
    #[strum(serialize = "application")]
    App,
    #[strum(serialize = "virtual machine")]
    Vm,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Target {0} terminated or not responding")]
    Terminated(TerminatedKind),

    #[error("Instrumentation failed: {0}")]
    Instrumentation(String),

    #[error("Target failed to start: {0}")]
    FailedToStart(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl SessionError {
    pub fn vm_terminated() -> Self {
        SessionError::Terminated(TerminatedKind::Vm)
    }

    pub fn app_terminated() -> Self {
        SessionError::Terminated(TerminatedKind::App)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionError::Terminated(_))
    }

    pub fn is_vm_terminated(&self) -> bool {
        matches!(self, SessionError::Terminated(TerminatedKind::Vm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_messages() {
        assert_eq!(
            SessionError::vm_terminated().to_string(),
            "Target virtual machine terminated or not responding"
        );
        assert_eq!(
            SessionError::app_terminated().to_string(),
            "Target application terminated or not responding"
        );
        assert!(SessionError::vm_terminated().is_vm_terminated());
        assert!(!SessionError::app_terminated().is_vm_terminated());
    }
}
