use super::client::ProfilerClient;
use super::SessionFlags;
use crate::error::Result;
use crate::protocol::codec::WireReceiver;
use crate::protocol::{Command, Message, Response, ResponseBody};
use chrono::Local;
use std::io::{self, Read};
use std::thread;
use tracing::{debug, error, trace, warn};

pub const LISTENER_THREAD_NAME: &str = "profiler-listener";

const SHUTDOWN_DUMP_RETRIES: u32 = 15;

pub(crate) fn spawn<R>(client: ProfilerClient, receiver: WireReceiver<R>) -> io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(LISTENER_THREAD_NAME.to_string())
        .spawn(move || run(client, receiver))?;
    Ok(())
}

/// Sole reader of the inbound stream.
fn run<R: Read>(client: ProfilerClient, mut receiver: WireReceiver<R>) {
    let flags = &client.inner.flags;

    while SessionFlags::get(&flags.listener_running) {
        match receiver.receive_command_or_response() {
            Ok(Some(Message::Response(resp))) => {
                trace!(yes = resp.yes, ok = resp.is_ok(), "response received");
                client.inner.mailbox.deposit(resp);
            }
            Ok(Some(Message::Command(cmd))) => {
                debug!(command = %cmd.kind(), "push command received");
                client.handle_push(cmd);
                if !client.is_target_alive() {
                    break;
                }
            }
            Ok(None) => {
                debug!("agent closed the connection");
                break;
            }
            Err(e) => {
                let expected = SessionFlags::get(&flags.terminate_or_detach_issued)
                    || !SessionFlags::get(&flags.listener_running);
                if !expected {
                    error!(error = %e, "reading from the target JVM failed");
                }
                break;
            }
        }
    }

    client.close_connection();
    debug!("listener stopped");
}

impl ProfilerClient {
    fn handle_push(&self, cmd: Command) {
        match cmd {
            Command::ShutdownInitiated => {
                SessionFlags::set(&self.inner.flags.target_running, false);
                let client = self.clone();
                let spawned = thread::Builder::new()
                    .name("profiler-shutdown".to_string())
                    .spawn(move || client.handle_shutdown_initiated());
                if let Err(e) = spawned {
                    error!(error = %e, "cannot start shutdown handler");
                }
            }
            Command::ShutdownCompleted => {
                SessionFlags::set(&self.inner.flags.target_alive, false);
                SessionFlags::set(&self.inner.flags.target_running, false);
                self.inner.hooks.buffers.discard();
            }
            cmd @ (Command::RootClassLoaded { .. }
            | Command::ClassLoaded { .. }
            | Command::MethodInvokedFirstTime { .. }
            | Command::MethodLoaded { .. }
            | Command::ClassLoaderUnloading) => self.submit_job(cmd),
            Command::EventBufferDumped(dump) => self.handle_event_buffer_dumped(dump),
            Command::GetClassId {
                class_name,
                loader_id,
            } => {
                let class_id = self.inner.hooks.instrumentor.class_id(&class_name, loader_id);
                self.send_response(&Response {
                    yes: class_id != -1,
                    error: None,
                    body: ResponseBody::ClassId { class_id },
                });
            }
            Command::ResultsAvailable => {
                self.inner.status.lock().results_start = Some(Local::now());
                self.inner.hooks.status.results_available();
            }
            Command::TakeSnapshot => self.inner.hooks.status.take_snapshot(),
            Command::Message { positive, text } => {
                self.inner.hooks.status.target_message(positive, &text)
            }
            Command::StillAlive => trace!("agent heartbeat"),
            other @ (Command::CheckConnection
            | Command::StartTargetApp
            | Command::SetChangeableInstrParams(_)
            | Command::SetUnchangeableInstrParams(_)
            | Command::InitiateProfiling(_)
            | Command::InstrumentMethodGroup(_)
            | Command::InstrumentReflection
            | Command::DeactivateInjectedCode
            | Command::GetVmProperties
            | Command::GetStoredCalibrationData
            | Command::RunCalibrationAndGetData
            | Command::GetDefiningClassLoader { .. }
            | Command::GetMethodNamesForMethodIds { .. }
            | Command::DumpExistingResults
            | Command::DumpExistingResultsLive
            | Command::ResetProfilerCollectors
            | Command::SuspendTargetApp
            | Command::ResumeTargetApp
            | Command::RunGc
            | Command::PrepareDetach
            | Command::Detach
            | Command::TerminateTargetJvm
            | Command::GetInternalStats
            | Command::GetHeapHistogram
            | Command::GetThreadLivenessStatus
            | Command::GetObjectAllocationResults
            | Command::GetCodeRegionCpuResults
            | Command::CpuResultsExist
            | Command::GetMonitoredNumbers
            | Command::TakeHeapDump { .. }
            | Command::ShutdownOk) => {
                warn!(command = %other.kind(), "agent pushed a client-only command");
            }
        }
    }

    pub(crate) fn submit_job(&self, cmd: Command) {
        let jobs = self.executor_jobs();
        let kind = cmd.kind();
        match jobs {
            Some(jobs) if jobs.submit(cmd) => {}
            _ => debug!(command = %kind, "executor stopped, push dropped"),
        }
    }

    /// Runs on the executor thread.
    pub(crate) fn execute_job(&self, cmd: Command) {
        match cmd {
            Command::RootClassLoaded {
                class_names,
                loader_ids,
                parent_loader_ids,
            } => self.instrument_from_root(&class_names, &loader_ids, &parent_loader_ids),
            cmd @ (Command::ClassLoaded { .. }
            | Command::MethodInvokedFirstTime { .. }
            | Command::MethodLoaded { .. }) => self.instrument_follow_up(&cmd),
            Command::EventBufferDumped(dump) => self.process_dump_on_executor(&dump),
            Command::ClassLoaderUnloading => self.handle_class_loader_unloading(),
            other => warn!(command = %other.kind(), "not an executor job"),
        }
    }

    /// Saves what can still be fetched from a target that is going away, then
    /// lets the agent finish shutting down.
    fn handle_shutdown_initiated(&self) {
        let result: Result<()> = (|| {
            let mode = self.current_mode();

            if mode.is_recursive_cpu() || mode.is_memory() {
                self.force_obtained_results_dump(false, SHUTDOWN_DUMP_RETRIES)?;
            }

            if mode.is_memory() {
                let counts = self.get_allocated_objects_count()?;
                self.inner.status.lock().saved_alloc_counts = Some(counts);
                self.inner.hooks.results.class_loader_unloading();
            }

            let stats = self.get_internal_stats()?;
            self.inner.status.lock().saved_internal_stats = Some(stats);

            self.inner
                .hooks
                .status
                .display_notification("Target application is shutting down");
            self.send_command(&Command::ShutdownOk)
        })();

        if let Err(e) = result {
            debug!(error = %e, "target went away during shutdown handling");
        }
    }
}
