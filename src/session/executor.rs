use crate::protocol::Command;
use crossbeam_channel::{bounded, Sender};
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

pub const EXECUTOR_THREAD_NAME: &str = "profiler-executor";

#[derive(Clone)]
pub struct JobSender(Sender<Option<Command>>);

impl JobSender {
    /// Queues a job, blocking while the previous one is still waiting to be
    /// picked up. Returns `false` once the worker has stopped.
    pub fn submit(&self, cmd: Command) -> bool {
        self.0.send(Some(cmd)).is_ok()
    }
}

/// Worker for push commands whose handling needs nested round trips, so the
/// listener thread stays free to read their responses.
///
/// The hand-off holds one job; `None` tells the worker to stop.
pub struct CommandExecutor {
    jobs: Sender<Option<Command>>,
    handle: JoinHandle<()>,
}

impl CommandExecutor {
    pub fn spawn<F>(handler: F) -> io::Result<Self>
    where
        F: Fn(Command) + Send + 'static,
    {
        let (jobs, queue) = bounded::<Option<Command>>(1);

        let handle = thread::Builder::new()
            .name(EXECUTOR_THREAD_NAME.to_string())
            .spawn(move || {
                while let Ok(Some(cmd)) = queue.recv() {
                    trace!(command = %cmd.kind(), "executing");
                    handler(cmd);
                }
                debug!("command executor stopped");
            })?;

        Ok(Self { jobs, handle })
    }

    pub fn jobs(&self) -> JobSender {
        JobSender(self.jobs.clone())
    }

    /// Asks the worker to stop after its current job. The worker may be the
    /// calling thread, so joining is left to the caller.
    pub fn shutdown(self) -> JoinHandle<()> {
        let _ = self.jobs.try_send(None);
        drop(self.jobs);
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_order_on_named_thread() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = {
            let seen = Arc::clone(&seen);
            CommandExecutor::spawn(move |cmd| {
                let name = thread::current().name().map(str::to_string);
                seen.lock().push((cmd.kind(), name));
            })
            .unwrap()
        };

        let jobs = executor.jobs();
        assert!(jobs.submit(Command::ClassLoaderUnloading));
        assert!(jobs.submit(Command::MethodInvokedFirstTime { method_id: 4 }));
        drop(jobs);
        executor.shutdown().join().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, crate::protocol::CommandKind::ClassLoaderUnloading);
        assert_eq!(seen[1].1.as_deref(), Some(EXECUTOR_THREAD_NAME));
    }
}
