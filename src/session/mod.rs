//! Client side of one profiling session: the connection to the agent, the
//! threads that serve it and the state they share.
//!
//! Lock order, outermost first: instrumentation lock, session lock, dump lock,
//! then the mailbox and executor hand-off. The listener thread takes none of
//! the first three.

mod client;
mod dump;
mod executor;
mod instrumentation;
mod listener;
mod locks;
mod mailbox;
#[cfg(test)]
pub(crate) mod mock_target;

pub use client::{AttachMode, ProfilerClient};
pub use executor::EXECUTOR_THREAD_NAME;
pub use listener::LISTENER_THREAD_NAME;

use crate::config::CpuProfilingType;
use crate::protocol::{
    CalibrationData, InitiateProfiling, InstrumentationMode, InternalStats, VmProperties,
};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

/// Flags read from every thread without taking a lock.
#[derive(Default)]
pub(crate) struct SessionFlags {
    pub target_alive: AtomicBool,
    pub target_running: AtomicBool,
    pub terminate_or_detach_issued: AtomicBool,
    pub handling_event_buffer_dump: AtomicBool,
    pub force_dump_called: AtomicBool,
    pub server_classes_initialized: AtomicBool,
    pub listener_running: AtomicBool,
}

impl SessionFlags {
    pub fn get(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }
}

/// Session data that is not part of the instrumentation state machine.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub remote: bool,
    /// Starts from the configured type; may change between runs.
    pub cpu_profiling_type: CpuProfilingType,
    pub instr_processing_time: Duration,
    pub results_start: Option<DateTime<Local>>,
    pub calibration: Option<CalibrationData>,
    pub vm_properties: Option<VmProperties>,
    pub jdk_version: Option<String>,
    pub saved_internal_stats: Option<InternalStats>,
    pub saved_alloc_counts: Option<Vec<i32>>,
    pub dump_abs_timestamp: i64,
    pub instr_limit_reported: bool,
}

/// The instrumentation lock together with the state it guards.
///
/// The mode is mirrored in an atomic so the listener can read it while an
/// executor job holds the lock; it is only written through an
/// [`InstrumentationGuard`].
pub(crate) struct Instrumentation {
    mode: AtomicU8,
    pending: Mutex<Option<InitiateProfiling>>,
}

pub(crate) struct InstrumentationGuard<'a> {
    mode: &'a AtomicU8,
    pending: MutexGuard<'a, Option<InitiateProfiling>>,
}

impl Instrumentation {
    pub fn new() -> Self {
        Self {
            mode: AtomicU8::new(InstrumentationMode::None.code()),
            pending: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> InstrumentationGuard<'_> {
        InstrumentationGuard {
            mode: &self.mode,
            pending: self.pending.lock(),
        }
    }

    pub fn mode(&self) -> InstrumentationMode {
        InstrumentationMode::from_repr(self.mode.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

impl InstrumentationGuard<'_> {
    pub fn mode(&self) -> InstrumentationMode {
        InstrumentationMode::from_repr(self.mode.load(Ordering::SeqCst)).unwrap_or_default()
    }

    pub fn set_mode(&mut self, mode: InstrumentationMode) {
        self.mode.store(mode.code(), Ordering::SeqCst);
    }

    pub fn pending_startup(&self) -> Option<&InitiateProfiling> {
        self.pending.as_ref()
    }

    pub fn set_pending_startup(&mut self, cmd: Option<InitiateProfiling>) {
        *self.pending = cmd;
    }

    /// Consumes the command captured for target startup.
    pub fn take_pending_startup(&mut self) -> Option<InitiateProfiling> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pending_startup_is_consumed_once() {
        let instr = Instrumentation::new();
        let mut guard = instr.lock();
        guard.set_pending_startup(Some(InitiateProfiling::bare(
            InstrumentationMode::NoneSampling,
        )));
        assert!(guard.take_pending_startup().is_some());
        assert!(guard.take_pending_startup().is_none());
    }

    #[test]
    fn test_mode_visible_without_lock() {
        let instr = Instrumentation::new();
        assert_eq!(instr.mode(), InstrumentationMode::None);
        instr.lock().set_mode(InstrumentationMode::ObjectLiveness);
        assert_eq!(instr.mode(), InstrumentationMode::ObjectLiveness);
    }
}
