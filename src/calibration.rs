use crate::error::{Result, SessionError};
use crate::hooks::CalibrationStore;
use crate::protocol::CalibrationData;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

static LEGACY_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^1\.(\d+)(?:[._\-]|$)").unwrap());

static MODERN_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)(?:[.+\-]|$)").unwrap());

/// Maps a `java.version` string to the name calibration data is keyed by:
/// `1.8.0_292` is `jdk18`, `17.0.2` is `jdk17`. `None` for unsupported JDKs.
pub fn jdk_version_name(java_version: &str) -> Option<String> {
    let java_version = java_version.trim();

    if let Some(caps) = LEGACY_VERSION.captures(java_version) {
        let minor: u32 = caps[1].parse().ok()?;
        return (minor >= 5).then(|| format!("jdk1{}", minor));
    }

    if let Some(caps) = MODERN_VERSION.captures(java_version) {
        let feature: u32 = caps[1].parse().ok()?;
        return (feature >= 9).then(|| format!("jdk{}", feature));
    }

    None
}

/// Calibration data persisted as one JSON file per JDK version name.
pub struct FileCalibrationStore {
    dir: PathBuf,
}

impl FileCalibrationStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, jdk_version: &str) -> PathBuf {
        self.dir.join(format!("calibration-{}.json", jdk_version))
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn load(&self, jdk_version: &str) -> Result<Option<CalibrationData>> {
        let path = self.path_for(jdk_version);
        if !path.exists() {
            debug!(path = %path.display(), "no saved calibration data");
            return Ok(None);
        }

        let text = fs::read_to_string(&path)?;
        let data: CalibrationData = serde_json::from_str(&text)?;
        if data.is_empty() {
            return Err(SessionError::Calibration(format!(
                "calibration file {} holds no timer data",
                path.display()
            )));
        }
        Ok(Some(data))
    }

    fn save(&self, jdk_version: &str, data: &CalibrationData) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(jdk_version);
        fs::write(&path, serde_json::to_string_pretty(data)?)?;
        debug!(path = %path.display(), "calibration data saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::N_TIMER_CONSTANTS;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_jdk_version_names() {
        assert_eq!(jdk_version_name("1.5.0_22").as_deref(), Some("jdk15"));
        assert_eq!(jdk_version_name("1.8.0_292").as_deref(), Some("jdk18"));
        assert_eq!(jdk_version_name("9").as_deref(), Some("jdk9"));
        assert_eq!(jdk_version_name("11.0.2").as_deref(), Some("jdk11"));
        assert_eq!(jdk_version_name("21-ea").as_deref(), Some("jdk21"));
        assert_eq!(jdk_version_name("17+35").as_deref(), Some("jdk17"));
        assert_eq!(jdk_version_name("1.4.2"), None);
        assert_eq!(jdk_version_name("CVM"), None);
        assert_eq!(jdk_version_name("8"), None);
    }

    #[test]
    fn test_store_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCalibrationStore::new(dir.path().join("nested"));
        assert_eq!(store.load("jdk17").unwrap(), None);

        let data = CalibrationData {
            method_entry_exit_call_time: vec![1.5; N_TIMER_CONSTANTS],
            method_entry_exit_inner_time: vec![0.5; N_TIMER_CONSTANTS],
            method_entry_exit_outer_time: vec![0.75; N_TIMER_CONSTANTS],
            timer_counts_in_second: vec![1_000_000_000, 1_000_000],
        };
        store.save("jdk17", &data).unwrap();
        assert_eq!(store.load("jdk17").unwrap(), Some(data));
        assert_eq!(store.load("jdk11").unwrap(), None);
    }

    #[test]
    fn test_store_rejects_empty_timer_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCalibrationStore::new(dir.path().to_path_buf());
        store.save("jdk18", &CalibrationData::default()).unwrap();
        assert!(matches!(
            store.load("jdk18"),
            Err(SessionError::Calibration(_))
        ));
    }
}
