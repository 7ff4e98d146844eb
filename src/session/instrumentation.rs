use super::client::ProfilerClient;
use super::{InstrumentationGuard, SessionFlags};
use crate::config::CpuProfilingType;
use crate::error::{Result, SessionError};
use crate::protocol::{
    CodeSelection, Command, InitiateProfiling, InstrumentationMode, MethodGroup, Response,
    ResponseBody,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Classes the agent reports while warming up in answer to the fake root
/// class sent during the handshake.
const WARMUP_CLASSES: [&str; 2] = ["*FAKE_CLASS_1*", "*FAKE_CLASS_2*"];

/// Method ids are 16 bit in the agent.
pub const INSTR_METHODS_LIMIT: usize = 65535;

const DUMP_WAIT_POLL: Duration = Duration::from_millis(20);

impl ProfilerClient {
    pub fn initiate_monitoring(&self) -> Result<()> {
        self.initiate(
            InstrumentationMode::None,
            &[],
            InitiateProfiling::bare(InstrumentationMode::None),
        )
    }

    pub fn initiate_cpu_sampling(&self) -> Result<()> {
        self.initiate(
            InstrumentationMode::NoneSampling,
            &[],
            InitiateProfiling::bare(InstrumentationMode::NoneSampling),
        )
    }

    /// Object allocation, object liveness or memory sampling. The
    /// instrumented modes start from the main class so that instrumentation
    /// is not triggered by reflection classes loaded before `main`.
    pub fn initiate_memory_instrumentation(&self, mode: InstrumentationMode) -> Result<()> {
        let cmd = match mode {
            InstrumentationMode::NoneMemorySampling => InitiateProfiling::bare(mode),
            InstrumentationMode::ObjectAllocations | InstrumentationMode::ObjectLiveness => {
                let main_class = self.inner.config.main_class.clone().ok_or_else(|| {
                    SessionError::Config("memory profiling needs main_class".to_string())
                })?;
                self.startup_command(mode, vec![main_class], false)
            }
            other => {
                return Err(SessionError::Instrumentation(format!(
                    "{} is not a memory profiling mode",
                    other
                )))
            }
        };
        self.initiate(mode, &[], cmd)
    }

    pub fn initiate_recursive_cpu(&self, selections: &[CodeSelection]) -> Result<()> {
        let mode = self.recursive_cpu_mode();
        let mut roots: Vec<String> = Vec::new();
        for selection in selections {
            if !roots.contains(&selection.class_name) {
                roots.push(selection.class_name.clone());
            }
        }
        let cmd = self.startup_command(mode, roots, self.inner.config.instrument_spawned_threads);
        self.initiate(mode, selections, cmd)
    }

    pub fn initiate_code_region(&self, selection: &CodeSelection) -> Result<()> {
        let mode = InstrumentationMode::CodeRegion;
        let mut cmd = InitiateProfiling::with_root(mode, selection.class_name.clone());
        cmd.start_profiling_points_active = self.inner.config.start_profiling_points_active;
        self.initiate(mode, std::slice::from_ref(selection), cmd)
    }

    /// Takes effect at the next [`start_target_app`](Self::start_target_app)
    /// when recursive CPU profiling is already selected.
    pub fn set_cpu_profiling_type(&self, profiling_type: CpuProfilingType) {
        self.inner.status.lock().cpu_profiling_type = profiling_type;
    }

    fn recursive_cpu_mode(&self) -> InstrumentationMode {
        let profiling_type = self.inner.status.lock().cpu_profiling_type;
        match profiling_type {
            CpuProfilingType::Full => InstrumentationMode::RecursiveFull,
            CpuProfilingType::Sampled => InstrumentationMode::RecursiveSampled,
        }
    }

    fn startup_command(
        &self,
        mode: InstrumentationMode,
        roots: Vec<String>,
        instr_spawned_threads: bool,
    ) -> InitiateProfiling {
        let config = &self.inner.config;
        InitiateProfiling::with_points(
            mode,
            roots,
            &config.profiling_points,
            instr_spawned_threads,
            config.start_profiling_points_active,
        )
    }

    /// Switches to `mode`. The startup command is kept for
    /// [`start_target_app`](Self::start_target_app) and sent right away if the
    /// target already runs.
    fn initiate(
        &self,
        mode: InstrumentationMode,
        selections: &[CodeSelection],
        cmd: InitiateProfiling,
    ) -> Result<()> {
        let mut guard = self.inner.instrumentation.lock();
        self.remove_all_locked(&mut guard)?;

        let running = self.is_target_app_running();
        if running && mode.needs_calibration() && self.is_remote() {
            self.require_remote_calibration()?;
        }

        self.inner.hooks.instrumentor.begin(mode, selections)?;
        guard.set_pending_startup(Some(cmd.clone()));
        // The agent may push class loads for the new mode before it answers.
        guard.set_mode(mode);
        info!(%mode, running, "instrumentation initiated");

        if running {
            self.send_instrumentation_params(false)?;
            let resp = self.request(Command::InitiateProfiling(cmd))?;
            if !resp.is_ok() {
                return Err(SessionError::Instrumentation(
                    resp.error_message().to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fetches fresh calibration data from a remote agent; terminates the
    /// target if there is none.
    fn require_remote_calibration(&self) -> Result<()> {
        if self.get_calibration_data(true)? {
            return Ok(());
        }
        if let Err(e) = self.terminate_target_jvm() {
            debug!(error = %e, "target gone before terminate");
        }
        Err(SessionError::Calibration(
            "remote target returned no calibration data".to_string(),
        ))
    }

    pub fn remove_all_instrumentation(&self) -> Result<()> {
        let mut guard = self.inner.instrumentation.lock();
        self.remove_all_locked(&mut guard)
    }

    fn remove_all_locked(&self, guard: &mut InstrumentationGuard<'_>) -> Result<()> {
        if guard.mode() == InstrumentationMode::None {
            return Ok(());
        }
        guard.set_pending_startup(None);

        match self.clear_instrumentation_in_target() {
            Err(e) if e.is_terminated() => debug!("target not running, nothing to deactivate"),
            other => other?,
        }

        self.inner.hooks.instrumentor.clear();
        guard.set_mode(InstrumentationMode::None);
        Ok(())
    }

    fn clear_instrumentation_in_target(&self) -> Result<()> {
        if !self.is_target_app_running() {
            return Err(SessionError::app_terminated());
        }

        // Deactivating while a buffer is being processed upsets the agent.
        let handling = &self.inner.flags.handling_event_buffer_dump;
        while SessionFlags::get(handling) && self.is_target_alive() {
            thread::sleep(DUMP_WAIT_POLL);
        }

        let guard = self.inner.requests.lock();
        let resp = self.request_locked(&guard, Command::DeactivateInjectedCode)?;
        if !resp.is_ok() {
            return Err(SessionError::Instrumentation(
                resp.error_message().to_string(),
            ));
        }

        let started = Instant::now();
        let clear_all = self.inner.hooks.instrumentor.clear_all_command();
        let resp = self.request_locked(&guard, Command::InstrumentMethodGroup(clear_all))?;
        self.inner.status.lock().instr_processing_time += started.elapsed();

        if !resp.is_ok() {
            return Err(SessionError::Instrumentation(
                resp.error_message().to_string(),
            ));
        }
        Ok(())
    }

    /// Stops allocation tracking for the classes flagged in `unprofiled`.
    pub fn deinstrument_memory_profiled_classes(&self, unprofiled: &[bool]) -> Result<()> {
        let guard = self.inner.instrumentation.lock();
        if guard.mode().is_uninstrumented() {
            return Ok(());
        }
        if !self.is_target_app_running() {
            return Err(SessionError::app_terminated());
        }

        let started = Instant::now();
        let Some(group) = self.inner.hooks.instrumentor.unprofile_classes(unprofiled) else {
            return Ok(());
        };
        if group.is_empty() {
            return Ok(());
        }

        let resp = self.request(Command::InstrumentMethodGroup(group))?;
        self.inner.status.lock().instr_processing_time += started.elapsed();
        if !resp.is_ok() {
            return Err(SessionError::Instrumentation(
                resp.error_message().to_string(),
            ));
        }
        Ok(())
    }

    /// Answers ROOT_CLASS_LOADED. Runs on the executor thread.
    pub(crate) fn instrument_from_root(
        &self,
        class_names: &[String],
        loader_ids: &[i32],
        parent_loader_ids: &[i32],
    ) {
        let guard = self.inner.instrumentation.lock();

        let initialized = &self.inner.flags.server_classes_initialized;
        if !SessionFlags::get(initialized)
            && class_names.first().map(String::as_str) == Some(WARMUP_CLASSES[0])
        {
            self.send_method_group(warmup_group());
            SessionFlags::set(initialized, true);
            debug!("agent warm-up acknowledged");
            return;
        }

        let started = Instant::now();
        let group = match self.inner.hooks.instrumentor.root_class_loaded(
            self,
            class_names,
            loader_ids,
            parent_loader_ids,
        ) {
            Ok(group) => group,
            Err(e) => {
                if guard.mode() == InstrumentationMode::CodeRegion {
                    self.inner
                        .hooks
                        .status
                        .display_error(&format!("Cannot instrument code region: {}", e));
                } else {
                    error!(error = %e, "root class instrumentation failed");
                }
                MethodGroup::default()
            }
        };
        self.inner.status.lock().instr_processing_time += started.elapsed();
        self.send_method_group(group);
    }

    /// Answers CLASS_LOADED, METHOD_INVOKED_FIRST_TIME and METHOD_LOADED.
    /// Runs on the executor thread.
    pub(crate) fn instrument_follow_up(&self, cmd: &Command) {
        {
            let _guard = self.inner.instrumentation.lock();
            let instrumentor = &self.inner.hooks.instrumentor;

            let started = Instant::now();
            let result = match cmd {
                Command::ClassLoaded {
                    class_name,
                    loader_id,
                    class_bytes,
                } => instrumentor.class_loaded(self, class_name, *loader_id, class_bytes),
                Command::MethodInvokedFirstTime { method_id } => {
                    instrumentor.method_invoked_first_time(self, *method_id)
                }
                Command::MethodLoaded {
                    class_name,
                    loader_id,
                    method_name,
                    method_signature,
                } => instrumentor.method_loaded(
                    self,
                    class_name,
                    *loader_id,
                    method_name,
                    method_signature,
                ),
                other => {
                    warn!(command = %other.kind(), "not a follow-up instrumentation event");
                    return;
                }
            };
            let group = result.unwrap_or_else(|e| {
                error!(command = %cmd.kind(), error = %e, "follow-up instrumentation failed");
                MethodGroup::default()
            });
            self.inner.status.lock().instr_processing_time += started.elapsed();
            self.send_method_group(group);
        }

        self.check_instr_limit();
    }

    fn send_method_group(&self, group: MethodGroup) {
        self.send_response(&Response::with_body(ResponseBody::MethodGroup(group)));
    }

    /// Warns once per run when the agent cannot take more instrumented methods.
    fn check_instr_limit(&self) {
        if !self.is_target_app_running() {
            return;
        }
        let count = self.inner.hooks.instrumentor.instrumented_methods_count();
        if count < INSTR_METHODS_LIMIT {
            return;
        }

        {
            let mut status = self.inner.status.lock();
            if status.instr_limit_reported {
                return;
            }
            status.instr_limit_reported = true;
        }
        self.inner.hooks.status.display_warning(&format!(
            "Instrumented methods limit reached ({} methods); further methods will not be profiled",
            count
        ));
    }

    /// Sends the startup instrumentation and, if `send_start` is set, lets the
    /// target run. `false` if the target was terminated for lack of
    /// calibration data.
    pub fn start_target_app(&self, send_start: bool) -> Result<bool> {
        {
            let mut status = self.inner.status.lock();
            status.instr_processing_time = Duration::ZERO;
            status.instr_limit_reported = false;
        }
        if !self.is_target_alive() {
            return Err(SessionError::vm_terminated());
        }

        let mut guard = self.inner.instrumentation.lock();

        // The CPU profiling type may have changed since the mode was chosen.
        if guard.mode().is_recursive_cpu() {
            let mode = self.recursive_cpu_mode();
            guard.set_mode(mode);
            if let Some(mut cmd) = guard.take_pending_startup() {
                cmd.mode = mode;
                guard.set_pending_startup(Some(cmd));
            }
        }

        match guard.take_pending_startup() {
            Some(cmd) => {
                self.send_instrumentation_params(false)?;

                let mode = guard.mode();
                if mode.needs_calibration() && self.is_remote() && !self.get_calibration_data(true)?
                {
                    if let Err(e) = self.terminate_target_jvm() {
                        debug!(error = %e, "target gone before terminate");
                    }
                    return Ok(false);
                }

                if mode.is_recursive_cpu() && self.inner.config.instrument_method_invoke {
                    let resp = self.request(Command::InstrumentReflection)?;
                    if !resp.is_ok() {
                        return Err(SessionError::FailedToStart(
                            resp.error_message().to_string(),
                        ));
                    }
                }

                let resp = self.request(Command::InitiateProfiling(cmd))?;
                if !resp.is_ok() {
                    self.inner.hooks.status.display_warning(&format!(
                        "Profiler agent error: {}",
                        resp.error_message()
                    ));
                }
            }
            None => guard.set_mode(InstrumentationMode::None),
        }
        // The agent pushes class loads as soon as the target starts.
        drop(guard);

        if send_start {
            let resp = self.request(Command::StartTargetApp)?;
            if !resp.is_ok() {
                return Err(SessionError::FailedToStart(
                    resp.error_message().to_string(),
                ));
            }
        }

        SessionFlags::set(&self.inner.flags.target_running, true);
        self.check_instr_limit();
        self.inner.hooks.results.start();
        info!(mode = %self.current_mode(), "target application started");
        Ok(true)
    }
}

fn warmup_group() -> MethodGroup {
    MethodGroup {
        class_names: WARMUP_CLASSES.iter().map(|c| c.to_string()).collect(),
        loader_ids: vec![0, 0],
        bytecodes: vec![vec![0], vec![0]],
        base_method_id: 0,
    }
}
