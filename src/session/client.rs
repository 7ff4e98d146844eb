use super::executor::{CommandExecutor, JobSender};
use super::listener;
use super::locks::{RequestGuard, RequestLock};
use super::mailbox::{Liveness, Mailbox};
use super::{Instrumentation, SessionFlags, SessionStatus};
use crate::calibration::jdk_version_name;
use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::hooks::Collaborators;
use crate::protocol::codec::{InboundClock, WireReceiver, WireSender};
use crate::protocol::{
    Command, CommandKind, HistogramEntry, InstrumentationMode, InternalStats, MethodName,
    MonitoredNumbers, Response, ResponseBody, VmProperties,
};
use parking_lot::Mutex;
use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub const CURRENT_AGENT_VERSION: i32 = 20;

pub(crate) const FAKE_ROOT_CLASS: &str = "*FAKE_CLASS_FOR_INTERNAL_TEST*";

const PREPARE_DETACH_INTERVAL: Duration = Duration::from_secs(2);

/// How the target came to be profiled. Decides whether a failed handshake
/// terminates the target or merely detaches from it, and whether the target
/// waits for START_TARGET_APP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Target launched by the profiler and waiting for the start command.
    Launched,
    /// Agent loaded at target startup; the target waits for the client.
    Direct,
    /// Agent loaded into an already running target.
    Dynamic,
}

type Wire = WireSender<BufWriter<TcpStream>>;

pub(crate) struct Inner {
    pub config: Config,
    pub hooks: Collaborators,
    pub flags: SessionFlags,
    pub status: Mutex<SessionStatus>,
    pub instrumentation: Instrumentation,
    pub requests: RequestLock,
    pub mailbox: Mailbox,
    pub clock: InboundClock,
    wire: Mutex<Option<Wire>>,
    socket: Mutex<Option<TcpStream>>,
    executor: Mutex<Option<CommandExecutor>>,
}

/// Handle to one profiling session. Clones share the session.
#[derive(Clone)]
pub struct ProfilerClient {
    pub(crate) inner: Arc<Inner>,
}

impl ProfilerClient {
    pub fn new(config: Config, hooks: Collaborators) -> Self {
        let mailbox = Mailbox::new(config.liveness_interval());
        let status = SessionStatus {
            remote: config.is_remote(),
            cpu_profiling_type: config.cpu_profiling_type,
            ..SessionStatus::default()
        };

        Self {
            inner: Arc::new(Inner {
                config,
                hooks,
                flags: SessionFlags::default(),
                status: Mutex::new(status),
                instrumentation: Instrumentation::new(),
                requests: RequestLock::new(),
                mailbox,
                clock: InboundClock::new(),
                wire: Mutex::new(None),
                socket: Mutex::new(None),
                executor: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.inner.hooks
    }

    pub fn is_target_alive(&self) -> bool {
        SessionFlags::get(&self.inner.flags.target_alive)
    }

    pub fn is_target_app_running(&self) -> bool {
        SessionFlags::get(&self.inner.flags.target_running)
    }

    pub fn is_remote(&self) -> bool {
        self.inner.status.lock().remote
    }

    pub fn current_mode(&self) -> InstrumentationMode {
        self.inner.instrumentation.mode()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.lock().clone()
    }

    /// Opens the connection and runs the handshake. Returns `false` on any
    /// failure, leaving the session closed.
    pub fn connect(&self, attach: AttachMode, calibration_only: bool, cancel: &AtomicBool) -> bool {
        let Some(stream) = self.open_socket(cancel) else {
            return false;
        };

        if let Err(e) = self.start_session(stream) {
            error!(error = %e, "failed to start session threads");
            self.inner.hooks.status.display_error(&e.to_string());
            self.close_connection();
            return false;
        }

        match self.handshake(attach, calibration_only) {
            Ok(true) => {
                let config = &self.inner.config;
                info!(host = config.target_host(), port = config.port, "connected to agent");
                true
            }
            Ok(false) => {
                self.abort_connection();
                false
            }
            Err(e) => {
                if !e.is_terminated() {
                    self.inner.hooks.status.display_error(&e.to_string());
                }
                warn!(error = %e, "handshake failed");
                self.abort_connection();
                false
            }
        }
    }

    fn open_socket(&self, cancel: &AtomicBool) -> Option<TcpStream> {
        let config = &self.inner.config;
        let host = config.target_host();

        for attempt in 0..config.connect_attempts {
            if cancel.load(Ordering::SeqCst) {
                info!("connection attempt cancelled");
                return None;
            }
            match TcpStream::connect((host, config.port)) {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    trace!(attempt, error = %e, "agent not reachable yet");
                    thread::sleep(config.connect_retry_interval());
                }
            }
        }

        self.inner.hooks.status.display_error(&format!(
            "Could not connect to the profiler agent at {}:{}",
            host, config.port
        ));
        None
    }

    fn start_session(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;

        *self.inner.wire.lock() = Some(WireSender::new(BufWriter::new(stream)));
        *self.inner.socket.lock() = Some(control);
        self.inner.mailbox.release();
        self.inner.clock.touch();

        let flags = &self.inner.flags;
        SessionFlags::set(&flags.target_alive, true);
        SessionFlags::set(&flags.target_running, false);
        SessionFlags::set(&flags.terminate_or_detach_issued, false);
        SessionFlags::set(&flags.handling_event_buffer_dump, false);
        SessionFlags::set(&flags.force_dump_called, false);
        SessionFlags::set(&flags.server_classes_initialized, false);
        SessionFlags::set(&flags.listener_running, true);

        let worker = self.clone();
        let executor = CommandExecutor::spawn(move |cmd| worker.execute_job(cmd))?;
        *self.inner.executor.lock() = Some(executor);

        let receiver = WireReceiver::new(BufReader::new(reader), self.inner.clock.clone());
        listener::spawn(self.clone(), receiver)
    }

    fn handshake(&self, attach: AttachMode, calibration_only: bool) -> Result<bool> {
        let resp = self.request(Command::CheckConnection)?;
        if !resp.is_ok() {
            self.inner
                .hooks
                .status
                .display_error(&format!("Agent rejected the connection: {}", resp.error_message()));
            return Ok(false);
        }

        if calibration_only {
            return self.calibrate_and_terminate();
        }

        let props = self.fetch_vm_properties()?;
        if !self.validate_vm_properties(&props, attach)? {
            return Ok(false);
        }

        self.warm_up()
    }

    fn calibrate_and_terminate(&self) -> Result<bool> {
        self.fetch_vm_properties()?;
        let obtained = self.get_calibration_data(false)?;

        if obtained {
            let status = self.status();
            if let (Some(version), Some(data)) = (status.jdk_version, status.calibration) {
                if let Err(e) = self.inner.hooks.calibration.save(&version, &data) {
                    self.inner
                        .hooks
                        .status
                        .display_error(&format!("Cannot save calibration data: {}", e));
                }
            }
        }

        if let Err(e) = self.terminate_target_jvm() {
            debug!(error = %e, "target gone before terminate");
        }
        Ok(obtained)
    }

    pub fn fetch_vm_properties(&self) -> Result<VmProperties> {
        let resp = self.request(Command::GetVmProperties)?;
        match expect_body(CommandKind::GetVmProperties, resp)? {
            ResponseBody::VmProperties(props) => {
                let mut status = self.inner.status.lock();
                status.jdk_version = jdk_version_name(&props.jdk_version);
                status.vm_properties = Some(props.clone());
                Ok(props)
            }
            other => Err(unexpected_body(CommandKind::GetVmProperties, &other)),
        }
    }

    fn validate_vm_properties(&self, props: &VmProperties, attach: AttachMode) -> Result<bool> {
        let status_handler = &self.inner.hooks.status;

        if props.agent_version != CURRENT_AGENT_VERSION {
            status_handler.display_warning(&format!(
                "Profiler agent version {} does not match client version {}",
                props.agent_version, CURRENT_AGENT_VERSION
            ));
        }

        let Some(jdk) = jdk_version_name(&props.jdk_version) else {
            status_handler.display_error(&format!(
                "Unsupported target JDK version {}",
                props.jdk_version
            ));
            self.terminate_or_detach(attach);
            return Ok(false);
        };

        if self.is_remote() {
            return Ok(true);
        }

        match self.inner.hooks.calibration.load(&jdk) {
            Ok(Some(data)) => {
                self.inner.status.lock().calibration = Some(data);
                Ok(true)
            }
            Ok(None) => {
                status_handler.display_error(&format!(
                    "No calibration data for {}; calibrate this JDK first",
                    jdk
                ));
                self.terminate_or_detach(attach);
                Ok(false)
            }
            Err(e) => {
                status_handler.display_error(&format!(
                    "Cannot read calibration data for {}: {}; calibrate this JDK first",
                    jdk, e
                ));
                self.terminate_or_detach(attach);
                Ok(false)
            }
        }
    }

    /// Makes the agent load its instrumentation classes before real work
    /// starts, by instrumenting a class that does not exist.
    fn warm_up(&self) -> Result<bool> {
        let mut cmd = crate::protocol::InitiateProfiling::with_root(
            InstrumentationMode::RecursiveFull,
            FAKE_ROOT_CLASS,
        );
        cmd.start_profiling_points_active = self.inner.config.start_profiling_points_active;

        let resp = self.request(Command::InitiateProfiling(cmd))?;
        if !resp.is_ok() {
            self.inner
                .hooks
                .status
                .display_error(&format!("Agent warm-up failed: {}", resp.error_message()));
            return Ok(false);
        }

        let poll = self.inner.config.warmup_poll_interval();
        let initialized = &self.inner.flags.server_classes_initialized;
        for _ in 0..self.inner.config.warmup_attempts {
            if SessionFlags::get(initialized) {
                break;
            }
            thread::sleep(poll);
        }

        if !SessionFlags::get(initialized) {
            self.inner
                .hooks
                .status
                .display_error("Profiler agent did not finish initializing");
            return Ok(false);
        }

        thread::sleep(poll);
        Ok(true)
    }

    fn terminate_or_detach(&self, attach: AttachMode) {
        let result = match attach {
            AttachMode::Direct => self.detach_from_target_jvm(),
            AttachMode::Launched | AttachMode::Dynamic => self.terminate_target_jvm(),
        };
        if let Err(e) = result {
            debug!(error = %e, "target gone before terminate/detach");
        }
    }

    fn abort_connection(&self) {
        SessionFlags::set(&self.inner.flags.target_alive, false);
        self.close_connection();
    }

    /// Tears the connection down. Safe to call from any thread, any number of
    /// times; only the first call after a connect does anything.
    pub fn close_connection(&self) {
        let inner = &self.inner;
        if !inner.flags.listener_running.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("closing connection");

        SessionFlags::set(&inner.flags.target_alive, false);
        SessionFlags::set(&inner.flags.target_running, false);
        inner.mailbox.release();

        if let Some(socket) = inner.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        inner.wire.lock().take();

        if let Some(executor) = inner.executor.lock().take() {
            drop(executor.shutdown());
        }

        // The agent resets a connection opened again too soon after a close.
        thread::sleep(inner.config.close_settle_delay());

        inner.hooks.results.shutdown();
        inner.hooks.buffers.discard();
    }

    pub(crate) fn executor_jobs(&self) -> Option<JobSender> {
        self.inner.executor.lock().as_ref().map(CommandExecutor::jobs)
    }

    fn write_wire<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut Wire) -> io::Result<()>,
    {
        let mut wire = self.inner.wire.lock();
        match wire.as_mut() {
            Some(sender) => f(sender),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")),
        }
    }

    fn send_failed(&self, e: io::Error) -> SessionError {
        if !SessionFlags::get(&self.inner.flags.terminate_or_detach_issued) {
            error!(error = %e, "write to agent failed");
            self.inner
                .hooks
                .status
                .display_error(&format!("Target JVM communication error: {}", e));
        }
        self.close_connection();
        SessionError::vm_terminated()
    }

    /// Writes one command without waiting for an answer.
    pub(crate) fn send_command(&self, cmd: &Command) -> Result<()> {
        if !self.is_target_alive() {
            return Err(SessionError::vm_terminated());
        }

        let kind = cmd.kind();
        let written = self.write_wire(|wire| {
            if kind.is_simple() {
                wire.send_simple_command(kind)
            } else {
                wire.send_complex_command(cmd)
            }
        });
        written.map_err(|e| self.send_failed(e))
    }

    /// Answers a command pushed by the agent.
    pub(crate) fn send_response(&self, resp: &Response) {
        if !self.is_target_alive() {
            return;
        }
        if let Err(e) = self.write_wire(|wire| wire.send_complex_response(resp)) {
            let _ = self.send_failed(e);
        }
    }

    pub(crate) fn request_locked(&self, _guard: &RequestGuard<'_>, cmd: Command) -> Result<Response> {
        self.send_command(&cmd)?;
        match self.inner.mailbox.await_response(self) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.close_connection();
                Err(e)
            }
        }
    }

    /// One command/response round trip. Callers queue on the session lock so
    /// only one command is ever in flight.
    pub fn request(&self, cmd: Command) -> Result<Response> {
        let guard = self.inner.requests.lock();
        self.request_locked(&guard, cmd)
    }

    pub fn send_instrumentation_params(&self, changeable_only: bool) -> Result<()> {
        let config = &self.inner.config;
        let guard = self.inner.requests.lock();

        let resp = self.request_locked(
            &guard,
            Command::SetChangeableInstrParams(config.changeable_params.clone()),
        )?;
        if !resp.is_ok() {
            self.inner.hooks.status.display_warning(resp.error_message());
        }

        if !changeable_only {
            let resp = self.request_locked(
                &guard,
                Command::SetUnchangeableInstrParams(config.effective_unchangeable_params()),
            )?;
            if !resp.is_ok() {
                self.inner.hooks.status.display_warning(resp.error_message());
            }
        }
        Ok(())
    }

    /// Fetches timer calibration data from the agent, running the calibration
    /// there first if asked to. Returns `false` if the agent has none.
    pub fn get_calibration_data(&self, run_calibration: bool) -> Result<bool> {
        let cmd = if run_calibration {
            Command::RunCalibrationAndGetData
        } else {
            Command::GetStoredCalibrationData
        };
        let kind = cmd.kind();
        let resp = self.request(cmd)?;

        if !resp.is_ok() {
            self.inner.hooks.status.display_error(&format!(
                "Calibration data unavailable: {}",
                resp.error_message()
            ));
            return Ok(false);
        }

        match resp.body {
            ResponseBody::Calibration(data) if !data.is_empty() => {
                self.inner.status.lock().calibration = Some(data);
                Ok(true)
            }
            ResponseBody::Calibration(_) => {
                self.inner
                    .hooks
                    .status
                    .display_error("Agent returned empty calibration data");
                Ok(false)
            }
            other => Err(unexpected_body(kind, &other)),
        }
    }

    pub fn get_internal_stats(&self) -> Result<InternalStats> {
        let resp = self.request(Command::GetInternalStats)?;
        match expect_body(CommandKind::GetInternalStats, resp)? {
            ResponseBody::InternalStats(stats) => Ok(stats),
            other => Err(unexpected_body(CommandKind::GetInternalStats, &other)),
        }
    }

    pub fn get_heap_histogram(&self) -> Result<Vec<HistogramEntry>> {
        let resp = self.request(Command::GetHeapHistogram)?;
        match expect_body(CommandKind::GetHeapHistogram, resp)? {
            ResponseBody::HeapHistogram(entries) => Ok(entries),
            other => Err(unexpected_body(CommandKind::GetHeapHistogram, &other)),
        }
    }

    /// Per-thread liveness flags, or `None` once the target is gone.
    pub fn get_thread_liveness_status(&self) -> Option<Vec<u8>> {
        if !self.is_target_alive() {
            return None;
        }
        let resp = self.request(Command::GetThreadLivenessStatus).ok()?;
        match expect_body(CommandKind::GetThreadLivenessStatus, resp).ok()? {
            ResponseBody::ThreadLiveness(status) => Some(status),
            _ => None,
        }
    }

    pub fn get_monitored_numbers(&self) -> Option<MonitoredNumbers> {
        if !self.is_target_alive() {
            return None;
        }
        let resp = self.request(Command::GetMonitoredNumbers).ok()?;
        match expect_body(CommandKind::GetMonitoredNumbers, resp).ok()? {
            ResponseBody::MonitoredNumbers(numbers) => Some(numbers),
            _ => None,
        }
    }

    /// Allocation counts per class; after the target is gone, the counts saved
    /// during its shutdown.
    pub fn get_allocated_objects_count(&self) -> Result<Vec<i32>> {
        if !self.is_target_alive() {
            return self
                .inner
                .status
                .lock()
                .saved_alloc_counts
                .clone()
                .ok_or_else(SessionError::vm_terminated);
        }

        let resp = self.request(Command::GetObjectAllocationResults)?;
        match expect_body(CommandKind::GetObjectAllocationResults, resp)? {
            ResponseBody::ObjectAllocation(counts) => Ok(counts),
            other => Err(unexpected_body(CommandKind::GetObjectAllocationResults, &other)),
        }
    }

    pub fn cpu_results_exist(&self) -> Result<bool> {
        let resp = self.request(Command::CpuResultsExist)?;
        Ok(resp.is_ok() && resp.yes)
    }

    pub fn get_code_region_results(&self) -> Result<Vec<i64>> {
        let resp = self.request(Command::GetCodeRegionCpuResults)?;
        match expect_body(CommandKind::GetCodeRegionCpuResults, resp)? {
            ResponseBody::CodeRegionCpu(results) => Ok(results),
            other => Err(unexpected_body(CommandKind::GetCodeRegionCpuResults, &other)),
        }
    }

    pub fn get_method_names_for_method_ids(&self, method_ids: &[i32]) -> Result<Vec<MethodName>> {
        let resp = self.request(Command::GetMethodNamesForMethodIds {
            method_ids: method_ids.to_vec(),
        })?;
        match expect_body(CommandKind::GetMethodNamesForMethodIds, resp)? {
            ResponseBody::MethodNames(names) => Ok(names),
            other => Err(unexpected_body(CommandKind::GetMethodNamesForMethodIds, &other)),
        }
    }

    pub fn get_defining_class_loader_id(&self, class_name: &str, loader_id: i32) -> Result<i32> {
        let resp = self.request(Command::GetDefiningClassLoader {
            class_name: class_name.to_string(),
            loader_id,
        })?;
        match expect_body(CommandKind::GetDefiningClassLoader, resp)? {
            ResponseBody::DefiningLoader { loader_id } => Ok(loader_id),
            other => Err(unexpected_body(CommandKind::GetDefiningClassLoader, &other)),
        }
    }

    pub fn take_heap_dump(&self, output_file: &str) -> Result<bool> {
        let resp = self.request(Command::TakeHeapDump {
            output_file: output_file.to_string(),
        })?;
        if !resp.is_ok() {
            self.inner
                .hooks
                .status
                .display_error(&format!("Heap dump failed: {}", resp.error_message()));
            return Ok(false);
        }
        Ok(resp.yes)
    }

    pub fn reset_profiler_collectors(&self) -> Result<()> {
        self.inner.hooks.results.reset();
        self.inner.status.lock().results_start = None;
        let resp = self.request(Command::ResetProfilerCollectors)?;
        if !resp.is_ok() {
            self.inner.hooks.status.display_warning(resp.error_message());
        }
        Ok(())
    }

    pub fn run_gc(&self) -> Result<bool> {
        let resp = self.request(Command::RunGc)?;
        Ok(resp.is_ok() && resp.yes)
    }

    pub fn suspend_target_app_threads(&self) -> Result<()> {
        let resp = self.request(Command::SuspendTargetApp)?;
        if !resp.is_ok() {
            self.inner.hooks.status.display_warning(resp.error_message());
        }
        Ok(())
    }

    pub fn resume_target_app_threads(&self) -> Result<()> {
        let resp = self.request(Command::ResumeTargetApp)?;
        if !resp.is_ok() {
            self.inner.hooks.status.display_warning(resp.error_message());
        }
        Ok(())
    }

    /// Asks the agent to get ready for detach, repeating every two seconds
    /// until it agrees. `false` if the agent answered with an error.
    pub fn prepare_detach(&self) -> Result<bool> {
        loop {
            let resp = self.request(Command::PrepareDetach)?;
            if !resp.is_ok() {
                warn!(error = resp.error_message(), "agent refused to prepare for detach");
                return Ok(false);
            }
            if resp.yes {
                return Ok(true);
            }
            thread::sleep(PREPARE_DETACH_INTERVAL);
        }
    }

    pub fn detach_from_target_jvm(&self) -> Result<()> {
        self.final_command(Command::Detach)
    }

    pub fn terminate_target_jvm(&self) -> Result<()> {
        self.final_command(Command::TerminateTargetJvm)
    }

    /// Sends DETACH or TERMINATE_TARGET_JVM and closes the connection whatever
    /// the outcome.
    fn final_command(&self, cmd: Command) -> Result<()> {
        if !self.is_target_alive() {
            return Ok(());
        }
        SessionFlags::set(&self.inner.flags.terminate_or_detach_issued, true);

        let kind = cmd.kind();
        let result = self.request(cmd);
        self.close_connection();

        match result {
            Ok(resp) if !resp.is_ok() => {
                warn!(command = %kind, error = resp.error_message(), "agent reported an error");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_terminated() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Liveness for ProfilerClient {
    fn is_alive(&self) -> bool {
        self.is_target_alive()
    }

    fn last_inbound(&self) -> Instant {
        self.inner.clock.last()
    }

    fn confirm_keep_waiting(&self) -> bool {
        self.inner.hooks.status.confirm_keep_waiting()
    }

    fn mark_dead(&self) {
        SessionFlags::set(&self.inner.flags.target_alive, false);
    }
}

pub(crate) fn expect_body(kind: CommandKind, resp: Response) -> Result<ResponseBody> {
    if !resp.is_ok() {
        return Err(SessionError::Protocol(format!(
            "{} failed: {}",
            kind,
            resp.error_message()
        )));
    }
    Ok(resp.body)
}

pub(crate) fn unexpected_body(kind: CommandKind, body: &ResponseBody) -> SessionError {
    SessionError::Protocol(format!("unexpected response to {}: {:?}", kind, body))
}
