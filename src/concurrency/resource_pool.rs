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

//! A keyed, reference-counted cache of shared resources.
//!
//! The first `get()` for a key constructs the value; later calls share it.
//! Each `put()` gives one reference back, and the last one tears the value
//! down. Everything done for one key is serialised through that key's
//! `ReadWriteLock` (always taken for writing, since every access changes the
//! reference count), so construction and teardown never overlap, while
//! different keys proceed independently.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error};

use super::rw_lock::{Detach, ReadWriteLock};
use crate::support::error::Error;

type Factory<K, V> = Box<dyn Fn(&K) -> Result<V, Error> + Send + Sync>;
type Teardown<K, V> =
    Box<dyn Fn(&K, &mut V) -> Result<(), Error> + Send + Sync>;

struct Entry<V> {
    refcount: usize,
    value: Arc<Mutex<V>>,
}

pub struct ResourcePool<K, V> {
    name: String,
    factory: Factory<K, V>,
    teardown: Teardown<K, V>,
    lock_timeout: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    key_locks: Mutex<HashMap<K, Arc<ReadWriteLock>>>,
}

/// One reference to a value in a `ResourcePool`.
///
/// Must be given back with `ResourcePool::put()`.
pub struct Pooled<K, V> {
    key: K,
    value: Arc<Mutex<V>>,
}

impl<K: fmt::Debug, V> fmt::Debug for Pooled<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pooled({:?})", self.key)
    }
}

impl<K, V> Pooled<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Lock the shared value for exclusive use.
    pub fn lock(&self) -> MutexGuard<'_, V> {
        self.value.lock().unwrap()
    }
}

impl<K, V> ResourcePool<K, V>
where
    K: Clone + Eq + Hash + fmt::Debug,
{
    pub fn new(
        name: impl Into<String>,
        lock_timeout: Duration,
        factory: impl Fn(&K) -> Result<V, Error> + Send + Sync + 'static,
        teardown: impl Fn(&K, &mut V) -> Result<(), Error>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        ResourcePool {
            name: name.into(),
            factory: Box::new(factory),
            teardown: Box::new(teardown),
            lock_timeout,
            entries: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &K) -> Arc<ReadWriteLock> {
        let mut key_locks = self.key_locks.lock().unwrap();
        if let Some(lock) = key_locks.get(key) {
            return Arc::clone(lock);
        }

        let lock = Arc::new(ReadWriteLock::new(format!(
            "{}{:?}",
            self.name, key
        )));
        key_locks.insert(key.clone(), Arc::clone(&lock));
        lock
    }

    /// Obtain a reference to the value for `key`, constructing it if there
    /// is none.
    ///
    /// Fails with `WriteLockTimeout` if another thread holds up `key` for
    /// too long, or with whatever error the factory returns.
    pub fn get(&self, key: &K) -> Result<Pooled<K, V>, Error> {
        let lock = self.key_lock(key);
        lock.write_synchronize(self.lock_timeout, || {
            if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
                entry.refcount += 1;
                return Ok(Pooled {
                    key: key.clone(),
                    value: Arc::clone(&entry.value),
                });
            }

            // Constructed without holding `entries` so that other keys are
            // not held up; the key lock keeps out anyone else after this key.
            let value = Arc::new(Mutex::new((self.factory)(key)?));
            self.entries.lock().unwrap().insert(
                key.clone(),
                Entry {
                    refcount: 1,
                    value: Arc::clone(&value),
                },
            );
            debug!("{}: opened {:?}", self.name, key);

            Ok(Pooled {
                key: key.clone(),
                value,
            })
        })?
    }

    /// Give back one reference. If it was the last, the value is removed
    /// from the pool and torn down.
    pub fn put(&self, handle: Pooled<K, V>) -> Result<(), Error> {
        let lock = self.key_lock(&handle.key);
        lock.write_synchronize(self.lock_timeout, || self.release(handle))?
    }

    /// Like `put()`, but waits at most `first` in this thread.
    ///
    /// If the key is busy for longer, the release is finished on a background
    /// thread as described in `ReadWriteLock::write_lock_timeout_detach()`.
    pub fn put_detached(
        self: &Arc<Self>,
        handle: Pooled<K, V>,
        first: Duration,
        retry: Duration,
    ) -> Result<Detach<Result<(), Error>>, Error>
    where
        K: Send + Sync + 'static,
        V: Send + 'static,
    {
        let lock = self.key_lock(&handle.key);
        let this = Arc::clone(self);
        lock.write_lock_timeout_detach(first, retry, move || {
            let key = handle.key.clone();
            let result = this.release(handle);
            if let Err(ref e) = result {
                error!("{}: failed to release {:?}: {}", this.name, key, e);
            }
            result
        })
    }

    /// Drop one reference. Must be called with the key lock held.
    fn release(&self, handle: Pooled<K, V>) -> Result<(), Error> {
        let last = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&handle.key)
                .ok_or(Error::ForeignHandle)?;
            entry.refcount -= 1;
            if 0 == entry.refcount {
                entries.remove(&handle.key)
            } else {
                None
            }
        };

        if let Some(entry) = last {
            drop(handle.value);
            let mut value = entry.value.lock().unwrap();
            (self.teardown)(&handle.key, &mut value)?;
            debug!("{}: closed {:?}", self.name, handle.key);
        }

        Ok(())
    }

    /// The number of live values.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len()
    }

    /// The number of outstanding references to `key`.
    pub fn refcount(&self, key: &K) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |e| e.refcount)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use rayon::prelude::*;

    use super::*;

    #[derive(Default)]
    struct Counts {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    fn new_pool(counts: &Arc<Counts>) -> ResourcePool<String, Vec<String>> {
        let c1 = Arc::clone(counts);
        let c2 = Arc::clone(counts);
        ResourcePool::new(
            "test",
            Duration::from_secs(10),
            move |key: &String| {
                c1.created.fetch_add(1, Ordering::SeqCst);
                if key.is_empty() {
                    Err(Error::UnsafeName)
                } else {
                    Ok(vec![key.clone()])
                }
            },
            move |_, value: &mut Vec<String>| {
                value.clear();
                c2.destroyed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
    }

    #[test]
    fn refcounting() {
        let counts = Arc::new(Counts::default());
        let pool = new_pool(&counts);

        let a1 = pool.get(&"alice".to_owned()).unwrap();
        let a2 = pool.get(&"alice".to_owned()).unwrap();
        let b = pool.get(&"bob".to_owned()).unwrap();
        assert_eq!(2, counts.created.load(Ordering::SeqCst));
        assert_eq!(2, pool.refcount(&"alice".to_owned()));
        assert_eq!(2, pool.len());

        // Both handles see the same value
        a1.lock().push("x".to_owned());
        assert_eq!(vec!["alice".to_owned(), "x".to_owned()], *a2.lock());

        pool.put(a1).unwrap();
        assert_eq!(0, counts.destroyed.load(Ordering::SeqCst));
        pool.put(a2).unwrap();
        assert_eq!(1, counts.destroyed.load(Ordering::SeqCst));
        assert_eq!(0, pool.refcount(&"alice".to_owned()));
        pool.put(b).unwrap();
        assert!(pool.is_empty());

        // A fresh get constructs again
        let a = pool.get(&"alice".to_owned()).unwrap();
        assert_eq!(vec!["alice".to_owned()], *a.lock());
        assert_eq!(3, counts.created.load(Ordering::SeqCst));
    }

    #[test]
    fn factory_failure_leaves_nothing() {
        let counts = Arc::new(Counts::default());
        let pool = new_pool(&counts);
        assert_matches!(Err(Error::UnsafeName), pool.get(&String::new()));
        assert!(pool.is_empty());
    }

    #[test]
    fn busy_key_times_out() {
        let counts = Arc::new(Counts::default());
        let mut pool = new_pool(&counts);
        pool.lock_timeout = Duration::from_millis(10);

        let key = "alice".to_owned();
        let lock = pool.key_lock(&key);
        lock.write_lock(Duration::from_secs(0)).unwrap();
        assert_matches!(Err(Error::WriteLockTimeout), pool.get(&key));

        // Other keys are unaffected
        let bob = pool.get(&"bob".to_owned()).unwrap();
        pool.put(bob).unwrap();

        lock.write_unlock().unwrap();
        let alice = pool.get(&key).unwrap();
        pool.put(alice).unwrap();
    }

    #[test]
    fn put_detached_finishes_in_background() {
        let counts = Arc::new(Counts::default());
        let pool = Arc::new(new_pool(&counts));
        let key = "alice".to_owned();

        let handle = pool.get(&key).unwrap();
        let second = Duration::from_secs(1);
        match pool.put_detached(handle, second, second).unwrap() {
            Detach::Completed(result) => result.unwrap(),
            Detach::Detached(_) => panic!("free key should release inline"),
        }
        assert_eq!(1, counts.destroyed.load(Ordering::SeqCst));

        let handle = pool.get(&key).unwrap();
        let lock = pool.key_lock(&key);
        lock.write_lock(Duration::from_secs(0)).unwrap();
        let detached = pool
            .put_detached(
                handle,
                Duration::from_millis(0),
                Duration::from_millis(20),
            )
            .unwrap();
        // Still held until the background thread gets the lock
        assert_eq!(1, pool.refcount(&key));
        thread::sleep(Duration::from_millis(50));
        lock.write_unlock().unwrap();

        match detached {
            Detach::Detached(join) => {
                join.join().unwrap().unwrap().unwrap();
            }
            Detach::Completed(_) => panic!("busy key should detach"),
        }
        assert!(pool.is_empty());
        assert_eq!(2, counts.destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn parallel_get_shares_one_value() {
        let counts = Arc::new(Counts::default());
        let pool = new_pool(&counts);
        let key = "alice".to_owned();

        let handles = (0..32)
            .into_par_iter()
            .map(|_| pool.get(&key).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(1, counts.created.load(Ordering::SeqCst));
        assert_eq!(32, pool.refcount(&key));

        handles
            .into_par_iter()
            .for_each(|handle| pool.put(handle).unwrap());
        assert_eq!(1, counts.destroyed.load(Ordering::SeqCst));
        assert!(pool.is_empty());
    }

    #[test]
    fn get_and_put_race_across_threads() {
        let counts = Arc::new(Counts::default());
        let pool = Arc::new(new_pool(&counts));

        let threads = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = pool.get(&"alice".to_owned()).unwrap();
                        assert_eq!("alice", handle.lock()[0]);
                        pool.put(handle).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }

        assert!(pool.is_empty());
        assert_eq!(
            counts.created.load(Ordering::SeqCst),
            counts.destroyed.load(Ordering::SeqCst)
        );
    }
}
