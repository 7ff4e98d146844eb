use parking_lot::{Mutex, MutexGuard};

/// The session lock and the dump lock nested under it.
///
/// The dump lock is only reachable through a [`RequestGuard`], so it can never
/// be taken before the session lock or without it.
#[derive(Default)]
pub struct RequestLock {
    request: Mutex<()>,
    dump: Mutex<()>,
}

pub struct RequestGuard<'a> {
    lock: &'a RequestLock,
    _held: MutexGuard<'a, ()>,
}

pub struct DumpGuard<'g> {
    _held: MutexGuard<'g, ()>,
}

impl RequestLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other caller has a command in flight.
    pub fn lock(&self) -> RequestGuard<'_> {
        RequestGuard {
            lock: self,
            _held: self.request.lock(),
        }
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.request.is_locked()
    }
}

impl<'a> RequestGuard<'a> {
    pub fn lock_dump(&self) -> DumpGuard<'_> {
        DumpGuard {
            _held: self.lock.dump.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_dump_lock_released_with_request_guard_scope() {
        let lock = RequestLock::new();
        {
            let guard = lock.lock();
            let _dump = guard.lock_dump();
            assert!(lock.is_locked());
            assert!(lock.dump.is_locked());
        }
        assert!(!lock.is_locked());
        assert!(!lock.dump.is_locked());
    }

    #[test]
    fn test_request_lock_excludes_second_caller() {
        let lock = Arc::new(RequestLock::new());
        let guard = lock.lock();

        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());
        drop(guard);
        contender.join().unwrap();
    }
}
