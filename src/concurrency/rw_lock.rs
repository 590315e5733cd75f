//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Kvmail.
//
// Kvmail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Kvmail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Kvmail. If not, see <http://www.gnu.org/licenses/>.

//! A read-write lock whose every acquisition has a timeout.
//!
//! `std::sync::RwLock` can neither time out nor make any promise about
//! fairness. This lock does both: every wait is bounded by a deadline fixed
//! when the call starts, and the preference between readers and writers
//! flips on each release. Right after a writer releases, waiting readers go
//! first; right after a reader releases, a waiting writer goes first.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::support::error::Error;

#[derive(Debug, Default)]
struct State {
    readers: u32,
    writing: bool,
    prefer_to_writer: bool,
    /// Writers currently inside `write_lock()`.
    standby_writers: u32,
    /// Readers currently inside `read_lock()`.
    waiting_readers: u32,
}

impl State {
    fn reader_blocked(&self) -> bool {
        self.writing || (self.prefer_to_writer && self.standby_writers > 0)
    }

    fn writer_blocked(&self) -> bool {
        self.writing
            || self.readers > 0
            || (!self.prefer_to_writer && self.waiting_readers > 0)
    }
}

pub struct ReadWriteLock {
    name: String,
    state: Mutex<State>,
    read_cond: Condvar,
    write_cond: Condvar,
}

/// The result of `write_lock_timeout_detach()`.
#[derive(Debug)]
pub enum Detach<T> {
    /// The lock was obtained within the first timeout and the work has run.
    Completed(T),
    /// The work was handed to a background thread. The thread yields `None`
    /// if it gave up.
    Detached(thread::JoinHandle<Option<T>>),
}

impl ReadWriteLock {
    pub fn new(name: impl Into<String>) -> Self {
        ReadWriteLock {
            name: name.into(),
            state: Mutex::new(State::default()),
            read_cond: Condvar::new(),
            write_cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire a read lock, waiting at most `timeout`.
    pub fn read_lock(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        state.waiting_readers += 1;

        while state.reader_blocked() {
            let now = Instant::now();
            if now >= deadline {
                state.waiting_readers -= 1;
                drop(state);
                // A writer may have been deferring to us
                self.write_cond.notify_one();
                return Err(Error::ReadLockTimeout);
            }

            state =
                self.read_cond.wait_timeout(state, deadline - now).unwrap().0;
        }

        state.waiting_readers -= 1;
        state.readers += 1;
        Ok(())
    }

    pub fn read_unlock(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if 0 == state.readers {
            error!("{}: read_unlock() without a read lock", self.name);
            return Err(Error::IllegalLockState(
                "read_unlock() without a read lock",
            ));
        }

        state.readers -= 1;
        state.prefer_to_writer = true;
        drop(state);
        self.write_cond.notify_one();
        Ok(())
    }

    /// Acquire the write lock, waiting at most `timeout`.
    ///
    /// A zero timeout fails immediately if the lock is not free.
    pub fn write_lock(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        state.standby_writers += 1;

        while state.writer_blocked() {
            let now = Instant::now();
            if now >= deadline {
                state.standby_writers -= 1;
                drop(state);
                // Readers may have been deferring to us
                self.read_cond.notify_all();
                return Err(Error::WriteLockTimeout);
            }

            state =
                self.write_cond.wait_timeout(state, deadline - now).unwrap().0;
        }

        state.standby_writers -= 1;
        state.writing = true;
        Ok(())
    }

    pub fn write_unlock(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.writing {
            error!("{}: write_unlock() without the write lock", self.name);
            return Err(Error::IllegalLockState(
                "write_unlock() without the write lock",
            ));
        }

        state.writing = false;
        state.prefer_to_writer = false;
        drop(state);
        self.read_cond.notify_all();
        self.write_cond.notify_one();
        Ok(())
    }

    /// Run `f` under a read lock.
    ///
    /// The lock is released however `f` exits.
    pub fn read_synchronize<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, Error> {
        self.read_lock(timeout)?;
        let _unlock = Unlock {
            lock: self,
            write: false,
        };
        Ok(f())
    }

    /// Run `f` under the write lock.
    ///
    /// The lock is released however `f` exits.
    pub fn write_synchronize<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, Error> {
        self.write_lock(timeout)?;
        let _unlock = Unlock {
            lock: self,
            write: true,
        };
        Ok(f())
    }

    /// Run `work` under the write lock, waiting at most `first` in this
    /// thread.
    ///
    /// If the lock cannot be had in time, a background thread takes over and
    /// keeps trying with a timeout of `retry` per attempt, logging each
    /// failure, until it either gets the lock or hits an error other than a
    /// timeout. The caller does not wait for any of this.
    pub fn write_lock_timeout_detach<T, F>(
        self: &Arc<Self>,
        first: Duration,
        retry: Duration,
        work: F,
    ) -> Result<Detach<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        match self.write_lock(first) {
            Ok(()) => {
                let _unlock = Unlock {
                    lock: &**self,
                    write: true,
                };
                Ok(Detach::Completed(work()))
            }
            Err(e) if e.is_timeout() => {
                let this = Arc::clone(self);
                let handle = thread::Builder::new()
                    .name(format!("detach-{}", self.name))
                    .spawn(move || this.retry_detached(retry, work))?;
                Ok(Detach::Detached(handle))
            }
            Err(e) => Err(e),
        }
    }

    fn retry_detached<T>(
        &self,
        retry: Duration,
        work: impl FnOnce() -> T,
    ) -> Option<T> {
        let mut attempts = 1u32;
        loop {
            match self.write_lock(retry) {
                Ok(()) => break,
                Err(e) if e.is_timeout() => {
                    attempts += 1;
                    warn!(
                        "{}: detached work still waiting for lock \
                         (attempt {})",
                        self.name, attempts
                    );
                }
                Err(e) => {
                    error!(
                        "{}: detached work abandoned after {} attempt(s): {}",
                        self.name, attempts, e
                    );
                    return None;
                }
            }
        }

        let _unlock = Unlock {
            lock: self,
            write: true,
        };
        Some(work())
    }

    #[cfg(test)]
    fn waiting_readers(&self) -> u32 {
        self.state.lock().unwrap().waiting_readers
    }

    #[cfg(test)]
    fn standby_writers(&self) -> u32 {
        self.state.lock().unwrap().standby_writers
    }
}

struct Unlock<'a> {
    lock: &'a ReadWriteLock,
    write: bool,
}

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        // Failures are already logged by the unlock functions
        let _ = if self.write {
            self.lock.write_unlock()
        } else {
            self.lock.read_unlock()
        };
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const LONG: Duration = Duration::from_secs(10);

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + LONG;
        while !cond() {
            assert!(Instant::now() < deadline, "condition never became true");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn basic_exclusion() {
        let lock = ReadWriteLock::new("test");
        lock.read_lock(Duration::from_secs(0)).unwrap();
        lock.read_lock(Duration::from_secs(0)).unwrap();
        assert_matches!(
            Err(Error::WriteLockTimeout),
            lock.write_lock(Duration::from_millis(10))
        );
        lock.read_unlock().unwrap();
        lock.read_unlock().unwrap();

        lock.write_lock(Duration::from_secs(0)).unwrap();
        assert_matches!(
            Err(Error::ReadLockTimeout),
            lock.read_lock(Duration::from_millis(10))
        );
        lock.write_unlock().unwrap();
        lock.read_lock(Duration::from_secs(0)).unwrap();
        lock.read_unlock().unwrap();
    }

    #[test]
    fn zero_timeout_fails_immediately() {
        let lock = ReadWriteLock::new("test");
        lock.write_lock(Duration::from_secs(0)).unwrap();

        let start = Instant::now();
        assert_matches!(
            Err(Error::WriteLockTimeout),
            lock.write_lock(Duration::from_secs(0))
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(0, lock.standby_writers());
    }

    #[test]
    fn wakeups_do_not_extend_deadline() {
        let lock = Arc::new(ReadWriteLock::new("test"));
        lock.write_lock(Duration::from_secs(0)).unwrap();

        let timeout = Duration::from_millis(50);
        let finished = Arc::new(AtomicU32::new(0));
        let reader = {
            let lock = Arc::clone(&lock);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let start = Instant::now();
                let result = lock.read_lock(timeout);
                let elapsed = start.elapsed();
                finished.fetch_add(1, Ordering::SeqCst);
                (result, elapsed)
            })
        };
        let writer = {
            let lock = Arc::clone(&lock);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let start = Instant::now();
                let result = lock.write_lock(timeout);
                let elapsed = start.elapsed();
                finished.fetch_add(1, Ordering::SeqCst);
                (result, elapsed)
            })
        };

        // Keep waking both waiters without ever releasing the lock
        while finished.load(Ordering::SeqCst) < 2 {
            lock.read_cond.notify_all();
            lock.write_cond.notify_all();
            thread::sleep(Duration::from_millis(1));
        }

        let (result, elapsed) = reader.join().unwrap();
        assert_matches!(Err(Error::ReadLockTimeout), result);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));

        let (result, elapsed) = writer.join().unwrap();
        assert_matches!(Err(Error::WriteLockTimeout), result);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));

        lock.write_unlock().unwrap();
    }

    #[test]
    fn illegal_unlocks() {
        crate::init_test_log();
        let lock = ReadWriteLock::new("test");
        assert_matches!(Err(Error::IllegalLockState(_)), lock.read_unlock());
        assert_matches!(Err(Error::IllegalLockState(_)), lock.write_unlock());

        lock.write_lock(Duration::from_secs(0)).unwrap();
        lock.write_unlock().unwrap();
        assert_matches!(Err(Error::IllegalLockState(_)), lock.write_unlock());
    }

    #[test]
    fn reader_goes_first_after_writer() {
        let lock = Arc::new(ReadWriteLock::new("test"));
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        lock.write_lock(Duration::from_secs(0)).unwrap();

        let reader = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                lock.read_synchronize(LONG, || {
                    order.lock().unwrap().push("read");
                    thread::sleep(Duration::from_millis(20));
                })
                .unwrap();
            })
        };
        wait_for(|| 1 == lock.waiting_readers());

        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                lock.write_synchronize(LONG, || {
                    order.lock().unwrap().push("write");
                })
                .unwrap();
            })
        };
        wait_for(|| 1 == lock.standby_writers());

        lock.write_unlock().unwrap();
        reader.join().unwrap();
        writer.join().unwrap();

        assert_eq!(vec!["read", "write"], *order.lock().unwrap());
    }

    #[test]
    fn writer_goes_first_after_reader() {
        let lock = Arc::new(ReadWriteLock::new("test"));
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        lock.read_lock(Duration::from_secs(0)).unwrap();

        let writer = {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                lock.write_synchronize(LONG, || {
                    order.lock().unwrap().push("write");
                    thread::sleep(Duration::from_millis(20));
                })
                .unwrap();
            })
        };
        wait_for(|| 1 == lock.standby_writers());

        lock.read_unlock().unwrap();
        // The writer now has priority, so new readers queue behind it
        wait_for(|| !order.lock().unwrap().is_empty());
        lock.read_synchronize(LONG, || order.lock().unwrap().push("read"))
            .unwrap();
        writer.join().unwrap();

        assert_eq!(vec!["write", "read"], *order.lock().unwrap());
    }

    #[test]
    fn synchronize_unlocks_on_panic() {
        let lock = Arc::new(ReadWriteLock::new("test"));
        let lock2 = Arc::clone(&lock);
        let result = thread::spawn(move || {
            lock2
                .write_synchronize(LONG, || panic!("boom"))
                .unwrap()
        })
        .join();
        assert!(result.is_err());

        lock.write_lock(Duration::from_secs(0)).unwrap();
        lock.write_unlock().unwrap();
    }

    #[test]
    fn detach_runs_inline_when_free() {
        let lock = Arc::new(ReadWriteLock::new("test"));
        let outcome = lock
            .write_lock_timeout_detach(LONG, LONG, || 42)
            .unwrap();
        assert_matches!(Detach::Completed(42), outcome);
    }

    #[test]
    fn detach_retries_in_background() {
        crate::init_test_log();
        let lock = Arc::new(ReadWriteLock::new("test"));
        let ran = Arc::new(AtomicU32::new(0));

        lock.write_lock(Duration::from_secs(0)).unwrap();
        let ran2 = Arc::clone(&ran);
        let outcome = lock
            .write_lock_timeout_detach(
                Duration::from_millis(1),
                Duration::from_millis(5),
                move || ran2.fetch_add(1, Ordering::SeqCst),
            )
            .unwrap();

        let handle = match outcome {
            Detach::Detached(handle) => handle,
            Detach::Completed(_) => panic!("work ran while lock was held"),
        };

        // Let it time out a few times before releasing
        thread::sleep(Duration::from_millis(30));
        assert_eq!(0, ran.load(Ordering::SeqCst));
        lock.write_unlock().unwrap();

        assert_eq!(Some(0), handle.join().unwrap());
        assert_eq!(1, ran.load(Ordering::SeqCst));
        // The background thread released the lock
        lock.write_lock(Duration::from_secs(0)).unwrap();
    }
}
