use crate::error::{Result, SessionError};
use crate::protocol::Response;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// What the waiting side needs to know about the target while it blocks.
pub trait Liveness {
    fn is_alive(&self) -> bool;

    /// Instant the last frame of any kind arrived from the target.
    fn last_inbound(&self) -> Instant;

    fn confirm_keep_waiting(&self) -> bool;

    fn mark_dead(&self);
}

/// Single-slot exchange between the listener thread and the one caller with
/// a command in flight.
pub struct Mailbox {
    slot: Mutex<Option<Response>>,
    ready: Condvar,
    check_interval: Duration,
}

impl Mailbox {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
            check_interval,
        }
    }

    pub fn deposit(&self, response: Response) {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            warn!("unclaimed response overwritten");
        }
        *slot = Some(response);
        self.ready.notify_one();
    }

    /// Empties the slot and wakes any waiter so it re-checks liveness.
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        *slot = None;
        self.ready.notify_all();
    }

    /// Blocks until a response is deposited or the target is found dead.
    ///
    /// The waiter wakes every check interval. If nothing at all has arrived
    /// from the target during that interval, the liveness hook decides
    /// whether to keep waiting.
    pub fn await_response(&self, liveness: &dyn Liveness) -> Result<Response> {
        let mut slot = self.slot.lock();

        loop {
            if let Some(response) = slot.take() {
                return Ok(response);
            }
            if !liveness.is_alive() {
                return Err(SessionError::vm_terminated());
            }

            // Each interval is judged on its own.
            let started = Instant::now();
            let timed_out = self
                .ready
                .wait_for(&mut slot, self.check_interval)
                .timed_out();

            if !timed_out || slot.is_some() {
                continue;
            }
            if !liveness.is_alive() {
                return Err(SessionError::vm_terminated());
            }
            if liveness.last_inbound() < started {
                warn!(
                    silent_ms = started.elapsed().as_millis() as u64,
                    "no reply from target"
                );
                let keep_waiting =
                    MutexGuard::unlocked(&mut slot, || liveness.confirm_keep_waiting());
                if !keep_waiting {
                    liveness.mark_dead();
                    return Err(SessionError::vm_terminated());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct FakeTarget {
        alive: AtomicBool,
        keep_waiting: bool,
        confirmations: AtomicUsize,
        last_frame: Mutex<Instant>,
    }

    impl FakeTarget {
        fn new(keep_waiting: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(true),
                keep_waiting,
                confirmations: AtomicUsize::new(0),
                last_frame: Mutex::new(Instant::now()),
            })
        }
    }

    impl Liveness for FakeTarget {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn last_inbound(&self) -> Instant {
            *self.last_frame.lock()
        }

        fn confirm_keep_waiting(&self) -> bool {
            self.confirmations.fetch_add(1, Ordering::SeqCst);
            self.keep_waiting
        }

        fn mark_dead(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_deposit_before_wait_is_returned() {
        let mailbox = Mailbox::new(Duration::from_secs(5));
        mailbox.deposit(Response::ok(true));
        let target = FakeTarget::new(true);
        assert!(mailbox.await_response(target.as_ref()).unwrap().yes);
    }

    #[test]
    fn test_deposit_from_other_thread_wakes_waiter() {
        let mailbox = Arc::new(Mailbox::new(Duration::from_secs(5)));
        let depositor = {
            let mailbox = Arc::clone(&mailbox);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                mailbox.deposit(Response::error("nope"));
            })
        };

        let target = FakeTarget::new(true);
        let response = mailbox.await_response(target.as_ref()).unwrap();
        assert_eq!(response.error_message(), "nope");
        depositor.join().unwrap();
    }

    #[test]
    fn test_dead_target_fails_within_one_interval() {
        let interval = Duration::from_millis(100);
        let mailbox = Mailbox::new(interval);
        let target = FakeTarget::new(true);

        let killer = {
            let target = Arc::clone(&target);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                target.alive.store(false, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        let err = mailbox.await_response(target.as_ref()).unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_vm_terminated());
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(150) + interval * 3);
        killer.join().unwrap();
    }

    #[test]
    fn test_declined_confirmation_marks_target_dead() {
        let mailbox = Mailbox::new(Duration::from_millis(20));
        let target = FakeTarget::new(false);

        let err = mailbox.await_response(target.as_ref()).unwrap_err();

        assert!(err.is_vm_terminated());
        assert!(!target.is_alive());
        assert_eq!(target.confirmations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_early_frame_does_not_hide_later_silence() {
        let mailbox = Mailbox::new(Duration::from_millis(50));
        let target = FakeTarget::new(false);

        let heartbeat = {
            let target = Arc::clone(&target);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                *target.last_frame.lock() = Instant::now();
            })
        };

        let started = Instant::now();
        let err = mailbox.await_response(target.as_ref()).unwrap_err();

        assert!(err.is_vm_terminated());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(target.confirmations.load(Ordering::SeqCst), 1);
        assert!(!target.is_alive());
        heartbeat.join().unwrap();
    }

    #[test]
    fn test_release_wakes_waiter_after_close() {
        let mailbox = Arc::new(Mailbox::new(Duration::from_secs(30)));
        let target = FakeTarget::new(true);

        let closer = {
            let mailbox = Arc::clone(&mailbox);
            let target = Arc::clone(&target);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                target.alive.store(false, Ordering::SeqCst);
                mailbox.release();
            })
        };

        let started = Instant::now();
        assert!(mailbox.await_response(target.as_ref()).is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        closer.join().unwrap();
    }
}
