use super::client::ProfilerClient;
use super::SessionFlags;
use crate::error::Result;
use crate::protocol::{Command, EventBufferDumped, Response, ResponseBody};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

const FORCE_DUMP_PAUSE: Duration = Duration::from_millis(200);

impl ProfilerClient {
    /// Handles EVENT_BUFFER_DUMPED on the listener thread.
    ///
    /// Local buffers go to the executor so decoding overlaps with the target.
    /// Remote buffers and forced dumps are decoded right here: remote agents
    /// cannot serve a second reader on the stream, and a forced dump must be
    /// processed before the caller waiting for it resumes.
    pub(crate) fn handle_event_buffer_dumped(&self, dump: EventBufferDumped) {
        if dump.buffer_size == 0 {
            self.send_response(&Response::ok(true));
            return;
        }

        let flags = &self.inner.flags;
        SessionFlags::set(&flags.handling_event_buffer_dump, true);

        if !self.is_remote() && !SessionFlags::get(&flags.force_dump_called) {
            self.submit_job(Command::EventBufferDumped(dump));
            SessionFlags::set(&flags.handling_event_buffer_dump, false);
        } else {
            let resp = self.process_buffer(&dump);
            SessionFlags::set(&flags.handling_event_buffer_dump, false);
            self.send_response(&resp);
            SessionFlags::set(&flags.force_dump_called, false);
        }
    }

    pub(crate) fn process_dump_on_executor(&self, dump: &EventBufferDumped) {
        let resp = self.process_buffer(dump);
        self.send_response(&resp);
    }

    /// Reads the buffer and hands it to the results processor. Returns the
    /// acknowledgement for the agent.
    fn process_buffer(&self, dump: &EventBufferDumped) -> Response {
        match self.inner.hooks.buffers.read(dump) {
            Ok(buffer) => {
                self.inner
                    .hooks
                    .results
                    .data_ready(&buffer, self.current_mode());
                Response::ok(true)
            }
            Err(e) => {
                error!(error = %e, buffer = %dump.buffer_name, "cannot read event buffer");
                self.inner
                    .hooks
                    .status
                    .display_error(&format!("Cannot read profiling data: {}", e));
                Response::error(e.to_string())
            }
        }
    }

    /// Asks the agent to flush what it has collected, retrying while it
    /// reports nothing new. Returns whether a dump happened.
    pub fn force_obtained_results_dump(&self, live: bool, retries: u32) -> Result<bool> {
        let attempts = retries.max(1);

        for attempt in 1..=attempts {
            if self.force_dump_once(live)? {
                thread::sleep(FORCE_DUMP_PAUSE);
                return Ok(true);
            }
            debug!(attempt, "agent had no results to dump");
            if attempt < attempts {
                thread::sleep(FORCE_DUMP_PAUSE);
            }
        }
        Ok(false)
    }

    fn force_dump_once(&self, live: bool) -> Result<bool> {
        let guard = self.inner.requests.lock();
        let _dump = guard.lock_dump();
        let flags = &self.inner.flags;

        if SessionFlags::get(&flags.handling_event_buffer_dump) {
            return Ok(true);
        }

        SessionFlags::set(&flags.force_dump_called, true);
        let cmd = if live {
            Command::DumpExistingResultsLive
        } else {
            Command::DumpExistingResults
        };
        let result = self.request_locked(&guard, cmd);
        SessionFlags::set(&flags.force_dump_called, false);
        let resp = result?;

        if !resp.is_ok() {
            warn!(error = resp.error_message(), "forced dump failed");
            return Ok(false);
        }
        if let ResponseBody::DumpResults { dump_abs_timestamp } = resp.body {
            self.inner.status.lock().dump_abs_timestamp = dump_abs_timestamp;
        }
        Ok(resp.yes)
    }

    /// Runs on the executor thread. Holds both locks so no forced dump can be
    /// requested while the agent waits for this acknowledgement.
    pub(crate) fn handle_class_loader_unloading(&self) {
        let guard = self.inner.requests.lock();
        let _dump = guard.lock_dump();

        self.inner.hooks.results.class_loader_unloading();
        self.send_response(&Response::ok(true));
    }
}
