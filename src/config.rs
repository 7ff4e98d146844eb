use crate::error::{Result, SessionError};
use crate::protocol::{ChangeableParams, ProfilingPoint, UnchangeableParams};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuProfilingType {
    #[default]
    Full,
    Sampled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Set for remote profiling; the agent ships buffers inline instead of
    /// through a shared file.
    #[serde(default)]
    pub remote_host: Option<String>,

    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_warmup_poll_ms")]
    pub warmup_poll_ms: u64,

    #[serde(default = "default_warmup_attempts")]
    pub warmup_attempts: u32,

    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    #[serde(default = "default_close_settle_ms")]
    pub close_settle_ms: u64,

    #[serde(default)]
    pub main_class: Option<String>,

    #[serde(default)]
    pub cpu_profiling_type: CpuProfilingType,

    #[serde(default)]
    pub instrument_spawned_threads: bool,

    #[serde(default)]
    pub instrument_method_invoke: bool,

    #[serde(default)]
    pub start_profiling_points_active: bool,

    #[serde(default)]
    pub changeable_params: ChangeableParams,

    #[serde(default)]
    pub unchangeable_params: UnchangeableParams,

    #[serde(default)]
    pub profiling_points: Vec<ProfilingPoint>,

    #[serde(default)]
    pub calibration_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            remote_host: None,
            connect_retry_ms: default_connect_retry_ms(),
            connect_attempts: default_connect_attempts(),
            warmup_poll_ms: default_warmup_poll_ms(),
            warmup_attempts: default_warmup_attempts(),
            liveness_interval_ms: default_liveness_interval_ms(),
            close_settle_ms: default_close_settle_ms(),
            main_class: None,
            cpu_profiling_type: CpuProfilingType::default(),
            instrument_spawned_threads: false,
            instrument_method_invoke: false,
            start_profiling_points_active: false,
            changeable_params: ChangeableParams::default(),
            unchangeable_params: UnchangeableParams::default(),
            profiling_points: Vec::new(),
            calibration_dir: None,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_retry_ms() -> u64 {
    250
}

fn default_connect_attempts() -> u32 {
    600
}

fn default_warmup_poll_ms() -> u64 {
    100
}

fn default_warmup_attempts() -> u32 {
    20
}

fn default_liveness_interval_ms() -> u64 {
    60_000
}

fn default_close_settle_ms() -> u64 {
    400
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string());
        let text = std::fs::read_to_string(&path).map_err(|e| {
            SessionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(SessionError::Config("port must not be 0".to_string()));
        }
        if self.connect_attempts == 0 {
            return Err(SessionError::Config(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if self.liveness_interval_ms == 0 {
            return Err(SessionError::Config(
                "liveness_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_remote(&self) -> bool {
        self.remote_host.is_some()
    }

    /// Host the socket is opened against.
    pub fn target_host(&self) -> &str {
        self.remote_host.as_deref().unwrap_or(&self.host)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    pub fn warmup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.warmup_poll_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn close_settle_delay(&self) -> Duration {
        Duration::from_millis(self.close_settle_ms)
    }

    pub fn calibration_dir(&self) -> PathBuf {
        if let Some(custom_dir) = &self.calibration_dir {
            PathBuf::from(shellexpand::tilde(custom_dir).to_string())
        } else {
            directories::ProjectDirs::from("com", "jvmprofiler", "JVM-Profiler")
                .map(|dirs| dirs.data_dir().join("calibration"))
                .unwrap_or_else(|| PathBuf::from("calibration"))
        }
    }

    /// Unchangeable parameters with the remote flag derived from the target.
    pub fn effective_unchangeable_params(&self) -> UnchangeableParams {
        UnchangeableParams {
            remote_profiling: self.is_remote(),
            ..self.unchangeable_params.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.target_host(), "127.0.0.1");
        assert_eq!(config.port, 5140);
        assert_eq!(config.connect_retry_interval(), Duration::from_millis(250));
        assert_eq!(config.connect_attempts, 600);
        assert_eq!(config.warmup_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.warmup_attempts, 20);
        assert_eq!(config.liveness_interval(), Duration::from_secs(60));
        assert_eq!(config.close_settle_delay(), Duration::from_millis(400));
        assert!(!config.is_remote());
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port = 6000
remote_host = "10.0.0.7"
cpu_profiling_type = "sampled"
main_class = "app.Main"

[[profiling_points]]
id = 3
handler_class = "points.Reset"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.target_host(), "10.0.0.7");
        assert!(config.is_remote());
        assert!(config.effective_unchangeable_params().remote_profiling);
        assert_eq!(config.cpu_profiling_type, CpuProfilingType::Sampled);
        assert_eq!(config.profiling_points.len(), 1);
        assert_eq!(config.connect_attempts, 600);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connect_attempts = 0").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(Config::load(&missing), Err(SessionError::Config(_))));
    }
}
