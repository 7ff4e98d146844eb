//! Collaborators the session calls out to. The session owns the protocol; these
//! own presentation, bytecode instrumentation, result decoding and storage.

use crate::calibration::FileCalibrationStore;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::protocol::{
    CalibrationData, CodeSelection, EventBufferDumped, InstrumentationMode, MethodGroup,
};
use crate::session::ProfilerClient;
use parking_lot::Mutex;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub trait StatusHandler: Send + Sync {
    fn display_error(&self, message: &str);

    fn display_warning(&self, message: &str);

    fn display_notification(&self, message: &str) {
        info!("{}", message);
    }

    /// Asked when a response is overdue and nothing has arrived from the
    /// target meanwhile. Returning `false` gives up on the target.
    fn confirm_keep_waiting(&self) -> bool {
        false
    }

    fn results_available(&self) {}

    fn take_snapshot(&self) {}

    fn target_message(&self, positive: bool, text: &str) {
        if positive {
            info!(target: "agent", "{}", text);
        } else {
            warn!(target: "agent", "{}", text);
        }
    }
}

/// Computes the bytecode the agent hot-swaps in. Each hook runs on the command
/// executor thread and may issue nested requests through `client`.
pub trait Instrumentor: Send + Sync {
    /// Drops all local bookkeeping of instrumented methods.
    fn clear(&self);

    /// Prepares local state for a new instrumentation mode.
    fn begin(&self, _mode: InstrumentationMode, _selections: &[CodeSelection]) -> Result<()> {
        Ok(())
    }

    fn root_class_loaded(
        &self,
        _client: &ProfilerClient,
        _class_names: &[String],
        _loader_ids: &[i32],
        _parent_loader_ids: &[i32],
    ) -> Result<MethodGroup> {
        Ok(MethodGroup::default())
    }

    fn class_loaded(
        &self,
        _client: &ProfilerClient,
        _class_name: &str,
        _loader_id: i32,
        _class_bytes: &[u8],
    ) -> Result<MethodGroup> {
        Ok(MethodGroup::default())
    }

    fn method_invoked_first_time(
        &self,
        _client: &ProfilerClient,
        _method_id: i32,
    ) -> Result<MethodGroup> {
        Ok(MethodGroup::default())
    }

    fn method_loaded(
        &self,
        _client: &ProfilerClient,
        _class_name: &str,
        _loader_id: i32,
        _method_name: &str,
        _method_signature: &str,
    ) -> Result<MethodGroup> {
        Ok(MethodGroup::default())
    }

    /// Command that removes every method instrumented so far.
    fn clear_all_command(&self) -> MethodGroup {
        MethodGroup::default()
    }

    /// Answers GET_CLASSID pushes; `-1` when the class is unknown.
    fn class_id(&self, _class_name: &str, _loader_id: i32) -> i32 {
        -1
    }

    /// Command that stops allocation tracking for the classes flagged in
    /// `unprofiled`, if any such classes are currently instrumented.
    fn unprofile_classes(&self, _unprofiled: &[bool]) -> Option<MethodGroup> {
        None
    }

    fn instrumented_methods_count(&self) -> usize {
        0
    }
}

pub trait ResultsProcessor: Send + Sync {
    fn start(&self) {}

    /// Decodes one event buffer. Called on the listener thread for remote or
    /// forced dumps, on the executor thread otherwise.
    fn data_ready(&self, buffer: &[u8], mode: InstrumentationMode);

    fn class_loader_unloading(&self) {}

    fn reset(&self) {}

    fn shutdown(&self) {}
}

pub trait EventBufferSource: Send + Sync {
    /// Returns the `buffer_size` bytes the agent reported.
    fn read(&self, dump: &EventBufferDumped) -> Result<Vec<u8>>;

    /// Removes any staged buffer files.
    fn discard(&self);
}

pub trait CalibrationStore: Send + Sync {
    fn load(&self, jdk_version: &str) -> Result<Option<CalibrationData>>;

    fn save(&self, jdk_version: &str, data: &CalibrationData) -> Result<()>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub status: Arc<dyn StatusHandler>,
    pub instrumentor: Arc<dyn Instrumentor>,
    pub results: Arc<dyn ResultsProcessor>,
    pub buffers: Arc<dyn EventBufferSource>,
    pub calibration: Arc<dyn CalibrationStore>,
}

impl Collaborators {
    pub fn defaults(config: &Config) -> Self {
        Self {
            status: Arc::new(LogStatusHandler),
            instrumentor: Arc::new(NoopInstrumentor),
            results: Arc::new(CountingResultsProcessor::default()),
            buffers: Arc::new(FileEventBuffer::default()),
            calibration: Arc::new(FileCalibrationStore::new(config.calibration_dir())),
        }
    }
}

pub struct LogStatusHandler;

impl StatusHandler for LogStatusHandler {
    fn display_error(&self, message: &str) {
        error!("{}", message);
    }

    fn display_warning(&self, message: &str) {
        warn!("{}", message);
    }
}

pub struct NoopInstrumentor;

impl Instrumentor for NoopInstrumentor {
    fn clear(&self) {}
}

#[derive(Default)]
pub struct CountingResultsProcessor {
    buffers: AtomicU64,
    bytes: AtomicU64,
}

impl CountingResultsProcessor {
    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl ResultsProcessor for CountingResultsProcessor {
    fn data_ready(&self, buffer: &[u8], mode: InstrumentationMode) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(buffer.len() as u64, Ordering::Relaxed);
        debug!(bytes = buffer.len(), %mode, "event buffer processed");
    }

    fn reset(&self) {
        self.buffers.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Reads buffers either inline from the command (remote agents) or from the
/// file the local agent staged them in.
#[derive(Default)]
pub struct FileEventBuffer {
    staged: Mutex<Option<PathBuf>>,
}

impl EventBufferSource for FileEventBuffer {
    fn read(&self, dump: &EventBufferDumped) -> Result<Vec<u8>> {
        let size = dump.buffer_size as usize;

        if dump.buffer_name.is_empty() {
            if dump.data.len() < size {
                return Err(SessionError::Protocol(format!(
                    "buffer reported {} bytes but carried {}",
                    size,
                    dump.data.len()
                )));
            }
            return Ok(dump.data[..size].to_vec());
        }

        let path = PathBuf::from(&dump.buffer_name);
        *self.staged.lock() = Some(path.clone());

        let mut buf = vec![0u8; size];
        File::open(&path)?.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn discard(&self) {
        if let Some(path) = self.staged.lock().take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "staged buffer not removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_inline_buffer_is_truncated_to_reported_size() {
        let source = FileEventBuffer::default();
        let dump = EventBufferDumped {
            buffer_size: 2,
            buffer_name: String::new(),
            data: vec![1, 2, 3],
        };
        assert_eq!(source.read(&dump).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_short_inline_buffer_is_rejected() {
        let source = FileEventBuffer::default();
        let dump = EventBufferDumped {
            buffer_size: 8,
            buffer_name: String::new(),
            data: vec![1],
        };
        assert!(matches!(source.read(&dump), Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_staged_file_is_read_then_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jfluid-buffer");
        File::create(&path).unwrap().write_all(&[9, 8, 7, 6]).unwrap();

        let source = FileEventBuffer::default();
        let dump = EventBufferDumped {
            buffer_size: 3,
            buffer_name: path.to_string_lossy().to_string(),
            data: Vec::new(),
        };
        assert_eq!(source.read(&dump).unwrap(), vec![9, 8, 7]);

        source.discard();
        assert!(!path.exists());
        source.discard();
    }

    #[test]
    fn test_counting_processor() {
        let processor = CountingResultsProcessor::default();
        processor.data_ready(&[0; 16], InstrumentationMode::RecursiveFull);
        processor.data_ready(&[0; 4], InstrumentationMode::RecursiveFull);
        assert_eq!(processor.buffers(), 2);
        assert_eq!(processor.bytes(), 20);
        processor.reset();
        assert_eq!(processor.buffers(), 0);
    }
}
