//! Attach, start, suspend, detach and terminate, composed from the session
//! operations and announced to registered listeners.

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::hooks::{Collaborators, StatusHandler};
use crate::protocol::{CalibrationData, InternalStats};
use crate::session::{AttachMode, ProfilerClient};
use parking_lot::Mutex;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum::Display;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ProfilingEvent {
    Started,
    Attached,
    Suspended,
    Resumed,
    Detached,
    Terminated,
}

pub trait ProfilingEventListener: Send + Sync {
    fn on_event(&self, event: ProfilingEvent);
}

pub struct TargetRunner {
    client: ProfilerClient,
    listeners: Mutex<Vec<Arc<dyn ProfilingEventListener>>>,
    suspended: AtomicBool,
}

impl TargetRunner {
    pub fn new(config: Config, hooks: Collaborators) -> Self {
        Self {
            client: ProfilerClient::new(config, hooks),
            listeners: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &ProfilerClient {
        &self.client
    }

    pub fn add_listener(&self, listener: Arc<dyn ProfilingEventListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ProfilingEventListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn notify(&self, event: ProfilingEvent) {
        debug!(%event, "profiling event");
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Connects to the agent. A session that is already up is kept.
    pub fn attach(&self, attach: AttachMode, cancel: &AtomicBool) -> Result<()> {
        if self.client.is_target_alive() {
            return Ok(());
        }
        if !self.client.connect(attach, false, cancel) {
            return Err(SessionError::FailedToStart(format!(
                "could not establish a session with the agent at {}:{}",
                self.client.config().target_host(),
                self.client.config().port
            )));
        }
        self.notify(ProfilingEvent::Attached);
        Ok(())
    }

    /// Sends the startup instrumentation and lets the target run. A target
    /// that was running before the agent was loaded gets no start command.
    pub fn start_target_app(&self, attach: AttachMode) -> Result<bool> {
        let send_start = attach != AttachMode::Dynamic;
        let started = match self.client.start_target_app(send_start) {
            Ok(started) => started,
            Err(SessionError::FailedToStart(cause)) => {
                self.status().display_error(&format!("Target failed to start: {}", cause));
                return Ok(false);
            }
            Err(e @ SessionError::Terminated(_)) => {
                self.status()
                    .display_error(&format!("Unexpected problem starting app: {}", e));
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if started {
            self.suspended.store(false, Ordering::SeqCst);
            self.notify(ProfilingEvent::Started);
        }
        Ok(started)
    }

    fn status(&self) -> &dyn StatusHandler {
        self.client.collaborators().status.as_ref()
    }

    /// Runs a calibration-only session against a freshly launched target and
    /// returns the calibration figures that were saved.
    pub fn calibrate(&self, cancel: &AtomicBool) -> Result<CalibrationData> {
        if !self.client.connect(AttachMode::Launched, true, cancel) {
            return Err(SessionError::Calibration(
                "calibration run did not complete".to_string(),
            ));
        }
        let data = self
            .client
            .status()
            .calibration
            .ok_or_else(|| SessionError::Calibration("agent returned no data".to_string()))?;

        let mut summary = String::from("Calibration data saved.\n");
        append_calibration(&mut summary, &data);
        self.status().display_notification(summary.trim_end());
        Ok(data)
    }

    pub fn suspend_if_running(&self) -> Result<()> {
        if self.is_suspended() {
            return Ok(());
        }
        self.client.suspend_target_app_threads()?;
        self.suspended.store(true, Ordering::SeqCst);
        self.notify(ProfilingEvent::Suspended);
        Ok(())
    }

    pub fn resume_if_suspended(&self) -> Result<()> {
        if !self.is_suspended() {
            return Ok(());
        }
        self.client.resume_target_app_threads()?;
        self.suspended.store(false, Ordering::SeqCst);
        self.notify(ProfilingEvent::Resumed);
        Ok(())
    }

    fn resume_best_effort(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.client.resume_target_app_threads() {
                debug!(error = %e, "resume before release failed");
            }
        }
    }

    pub fn detach(&self) -> Result<()> {
        self.resume_best_effort();
        match self.client.detach_from_target_jvm() {
            Ok(()) => info!("detached from target"),
            Err(e) if e.is_terminated() => debug!("target already gone"),
            Err(e) => return Err(e),
        }
        self.notify(ProfilingEvent::Detached);
        Ok(())
    }

    pub fn terminate(&self) -> Result<()> {
        self.resume_best_effort();
        match self.client.terminate_target_jvm() {
            Ok(()) => info!("target terminated"),
            Err(e) if e.is_terminated() => debug!("target already gone"),
            Err(e) => return Err(e),
        }
        self.notify(ProfilingEvent::Terminated);
        Ok(())
    }

    /// Statistics saved while the target shut down, or fresh ones, as text.
    pub fn internal_stats_text(&self) -> Result<String> {
        let status = self.client.status();
        let stats = match status.saved_internal_stats {
            Some(stats) => stats,
            None => self.client.get_internal_stats()?,
        };

        let mut text = format_internal_stats(&stats, status.instr_processing_time.as_millis());
        if let Some(calibration) = &status.calibration {
            text.push('\n');
            append_calibration(&mut text, calibration);
        }
        Ok(text)
    }
}

fn format_internal_stats(r: &InternalStats, client_bytecode_ms: u128) -> String {
    let mut s = String::with_capacity(1000);
    let total = r.total_hotswapping_time + r.client_instr_time + r.client_data_proc_time;
    let pct = |part: f64| {
        if total == 0.0 {
            part * 100.0
        } else {
            part / total * 100.0
        }
    };

    let _ = writeln!(s, "Internal statistics only:");
    let _ = writeln!(s, "Instrumented methods: {}", r.n_total_instr_methods);
    let _ = writeln!(
        s,
        "Class loads: {}, first method invocations: {}",
        r.n_class_loads, r.n_first_method_invocations
    );
    let _ = writeln!(
        s,
        "Non-empty instrumentation responses: {}",
        r.n_non_empty_instr_method_group_responses
    );
    let _ = writeln!(
        s,
        "Empty instrumentation responses: {}",
        r.n_empty_instr_method_group_responses
    );
    let _ = writeln!(
        s,
        "Single-method instrumentation responses: {}",
        r.n_single_method_instr_method_group_responses
    );

    if r.n_non_empty_instr_method_group_responses > 0 {
        let _ = writeln!(
            s,
            "Hotswap time per group (ms): avg {:.2}, min {:.2}, max {:.2}",
            r.average_hotswapping_time, r.min_hotswapping_time, r.max_hotswapping_time
        );
    }

    let _ = writeln!(s);
    let _ = writeln!(s, "Total profiler time (ms): {:.2}", total);
    let _ = writeln!(
        s,
        "Instrumentation and hotswapping (ms): {:.2} ({:.2}%)",
        r.total_hotswapping_time,
        pct(r.total_hotswapping_time)
    );
    let _ = writeln!(
        s,
        "Bytecode communication (ms): {:.2} ({:.2}%)",
        r.client_instr_time,
        pct(r.client_instr_time)
    );
    let _ = writeln!(s, "Client bytecode generation (ms): {}", client_bytecode_ms);
    let _ = writeln!(
        s,
        "Client data processing (ms): {:.2} ({:.2}%)",
        r.client_data_proc_time,
        pct(r.client_data_proc_time)
    );
    s
}

/// Per-call overhead of the injected code in microseconds.
fn append_calibration(s: &mut String, data: &CalibrationData) {
    let counts = data.timer_counts_in_second.first().copied().unwrap_or(0);
    if counts == 0 {
        let _ = writeln!(s, "Calibration data unavailable");
        return;
    }
    let micros = |i: usize| {
        data.method_entry_exit_call_time
            .get(i)
            .map(|t| t * 1_000_000.0 / counts as f64)
            .unwrap_or(0.0)
    };
    let _ = writeln!(
        s,
        "Approximate time of one methodEntry()/methodExit() call pair:\n\
         \x20 with 0 timer calls: {:.4} microseconds\n\
         \x20 with 1 timer call: {:.4} microseconds\n\
         \x20 with 2 timer calls: {:.4} microseconds\n\
         \x20 with 4 timer calls: {:.4} microseconds",
        micros(0),
        micros(1),
        micros(2),
        micros(4)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, CommandKind, Response, ResponseBody};
    use crate::session::mock_target::{
        sample_calibration, test_collaborators, test_config, MockAgent, MockTarget, TestHooks,
    };
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<ProfilingEvent>>,
    }

    impl ProfilingEventListener for RecordingListener {
        fn on_event(&self, event: ProfilingEvent) {
            self.events.lock().push(event);
        }
    }

    fn runner(port: u16, hooks: &TestHooks) -> (TargetRunner, Arc<RecordingListener>) {
        let runner = TargetRunner::new(test_config(port), test_collaborators(hooks));
        let listener = Arc::new(RecordingListener::default());
        runner.add_listener(listener.clone());
        (runner, listener)
    }

    #[test]
    fn test_launch_suspend_then_terminate_resumes_first() {
        let target = MockTarget::spawn(|agent: &mut MockAgent| {
            agent.serve_handshake();
            agent.expect(CommandKind::StartTargetApp);
            agent.reply(Response::ok(true));
            agent.expect(CommandKind::SuspendTargetApp);
            agent.reply(Response::ok(true));
            agent.expect(CommandKind::ResumeTargetApp);
            agent.reply(Response::ok(true));
            agent.expect(CommandKind::TerminateTargetJvm);
            agent.reply(Response::ok(true));
            assert!(agent.next_command().is_none());
        });

        let hooks = TestHooks::default();
        let (runner, listener) = runner(target.port, &hooks);

        runner
            .attach(AttachMode::Launched, &AtomicBool::new(false))
            .unwrap();
        assert!(runner.start_target_app(AttachMode::Launched).unwrap());
        runner.suspend_if_running().unwrap();
        runner.suspend_if_running().unwrap();
        assert!(runner.is_suspended());
        runner.terminate().unwrap();

        assert!(!runner.client().is_target_alive());
        assert_eq!(
            *listener.events.lock(),
            vec![
                ProfilingEvent::Attached,
                ProfilingEvent::Started,
                ProfilingEvent::Suspended,
                ProfilingEvent::Terminated,
            ]
        );
        target.join();
    }

    #[test]
    fn test_dynamic_attach_sends_no_start_and_detaches() {
        let target = MockTarget::spawn(|agent: &mut MockAgent| {
            agent.serve_handshake();
            agent.expect(CommandKind::Detach);
            agent.reply(Response::ok(true));
        });

        let hooks = TestHooks::default();
        let (runner, listener) = runner(target.port, &hooks);

        runner
            .attach(AttachMode::Dynamic, &AtomicBool::new(false))
            .unwrap();
        assert!(runner.start_target_app(AttachMode::Dynamic).unwrap());
        runner.detach().unwrap();

        let log = target.join();
        assert!(!log.contains(&CommandKind::StartTargetApp));
        assert_eq!(
            *listener.events.lock(),
            vec![
                ProfilingEvent::Attached,
                ProfilingEvent::Started,
                ProfilingEvent::Detached,
            ]
        );
    }

    #[test]
    fn test_rejected_start_is_displayed() {
        let target = MockTarget::spawn(|agent: &mut MockAgent| {
            agent.serve_handshake();
            agent.expect(CommandKind::StartTargetApp);
            agent.reply(Response::error("main class not found"));
            agent.expect(CommandKind::TerminateTargetJvm);
            agent.reply(Response::ok(true));
        });

        let hooks = TestHooks::default();
        let (runner, listener) = runner(target.port, &hooks);
        runner
            .attach(AttachMode::Launched, &AtomicBool::new(false))
            .unwrap();

        assert!(!runner.start_target_app(AttachMode::Launched).unwrap());
        assert!(hooks
            .errors()
            .iter()
            .any(|e| e.contains("main class not found")));
        runner.terminate().unwrap();
        assert_eq!(
            *listener.events.lock(),
            vec![ProfilingEvent::Attached, ProfilingEvent::Terminated]
        );
        target.join();
    }

    #[test]
    fn test_failed_attach_reports_failed_to_start() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let hooks = TestHooks::default();
        let mut config = test_config(port);
        config.connect_attempts = 2;
        let runner = TargetRunner::new(config, test_collaborators(&hooks));

        let err = runner
            .attach(AttachMode::Launched, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, SessionError::FailedToStart(_)));
    }

    #[test]
    fn test_calibrate_reports_summary() {
        let target = MockTarget::spawn(|agent: &mut MockAgent| {
            agent.expect(CommandKind::CheckConnection);
            agent.reply(Response::ok(true));
            agent.expect(CommandKind::GetVmProperties);
            agent.reply_vm_properties();
            agent.expect(CommandKind::GetStoredCalibrationData);
            agent.reply(Response::with_body(ResponseBody::Calibration(
                sample_calibration(),
            )));
            agent.expect(CommandKind::TerminateTargetJvm);
            agent.reply(Response::ok(true));
        });

        let hooks = TestHooks::default();
        let runner = TargetRunner::new(test_config(target.port), test_collaborators(&hooks));

        let data = runner.calibrate(&AtomicBool::new(false)).unwrap();
        assert_eq!(data, sample_calibration());
        let notes = hooks.notifications();
        assert!(notes.iter().any(|n| n.contains("0.0010 microseconds")));
        target.join();
    }

    #[test]
    fn test_internal_stats_text_prefers_saved_stats() {
        let target = MockTarget::spawn(|agent: &mut MockAgent| {
            agent.serve_handshake();
            agent.push(Command::ShutdownInitiated);
            agent.expect(CommandKind::GetInternalStats);
            agent.reply(Response::with_body(ResponseBody::InternalStats(InternalStats {
                n_total_instr_methods: 7,
                n_non_empty_instr_method_group_responses: 2,
                average_hotswapping_time: 1.5,
                total_hotswapping_time: 3.0,
                ..InternalStats::default()
            })));
            agent.expect(CommandKind::ShutdownOk);
            agent.push(Command::ShutdownCompleted);
        });

        let hooks = TestHooks::default();
        let (runner, _) = runner(target.port, &hooks);
        runner
            .attach(AttachMode::Launched, &AtomicBool::new(false))
            .unwrap();
        target.join();

        let text = runner.internal_stats_text().unwrap();
        assert!(text.contains("Instrumented methods: 7"));
        assert!(text.contains("avg 1.50"));
        assert!(text.contains("Total profiler time (ms): 3.00"));
    }

    #[test]
    fn test_format_without_groups_skips_hotswap_times() {
        let text = format_internal_stats(&InternalStats::default(), 0);
        assert!(!text.contains("avg"));
        assert!(text.contains("(0.00%)"));
    }
}
