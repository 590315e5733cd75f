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

use std::sync::Arc;
use std::time::Duration;

use log::info;

use super::mail_store::MailStore;
use crate::concurrency::resource_pool::{Pooled, ResourcePool};
use crate::concurrency::rw_lock::Detach;
use crate::storage::opener_for_user;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

pub type PooledMailStore = Pooled<String, MailStore>;

/// The process-wide pool of open `MailStore`s, one per logged-in user.
///
/// All sessions of one user share the same `MailStore`. The store is opened
/// (and `INBOX` created if it does not exist) when the first session asks for
/// it, and closed when the last one gives it back.
pub struct MailStorePool {
    pool: Arc<ResourcePool<String, MailStore>>,
    detach_first: Duration,
    detach_retry: Duration,
}

impl MailStorePool {
    pub fn new(config: &SystemConfig) -> Self {
        let storage = config.storage.clone();
        MailStorePool {
            detach_first: config.concurrency.detach_first_timeout(),
            detach_retry: config.concurrency.detach_retry_timeout(),
            pool: Arc::new(ResourcePool::new(
                "mailstore",
                config.concurrency.pool_lock_timeout(),
                move |user: &String| {
                    let opener = opener_for_user(&storage, user)?;
                    let mut store = MailStore::open(
                        LogPrefix::for_user("mailstore", user),
                        opener,
                    )?;
                    if store.mailbox_id("INBOX")?.is_none() {
                        store.add_mailbox("INBOX")?;
                    }
                    info!("{} Opened", store.log_prefix());
                    Ok(store)
                },
                |_, store: &mut MailStore| {
                    store.close()?;
                    info!("{} Closed", store.log_prefix());
                    Ok(())
                },
            )),
        }
    }

    /// Obtain `user`'s store, opening it if no other session has it.
    pub fn get(&self, user: &str) -> Result<PooledMailStore, Error> {
        self.pool.get(&user.to_owned())
    }

    /// Give back a store obtained from `get()`.
    pub fn put(&self, store: PooledMailStore) -> Result<(), Error> {
        self.pool.put(store)
    }

    /// Give back a store when the session is going away and should not wait.
    ///
    /// If another session is busy with the same user, the store is released
    /// from a background thread instead.
    pub fn put_detached(
        &self,
        store: PooledMailStore,
    ) -> Result<Detach<Result<(), Error>>, Error> {
        self.pool
            .put_detached(store, self.detach_first, self.detach_retry)
    }

    /// The number of users whose stores are currently open.
    pub fn open_count(&self) -> usize {
        self.pool.len()
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::account::model::Flag;
    use crate::support::system_config::BackendKind;

    fn file_config(root: PathBuf) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.storage.root = root;
        config.storage.backend = BackendKind::File;
        config
    }

    #[test]
    fn sessions_share_one_store() {
        crate::init_test_log();
        let root = TempDir::new().unwrap();
        let pool = MailStorePool::new(&file_config(root.path().to_owned()));

        let session1 = pool.get("alice").unwrap();
        let session2 = pool.get("alice").unwrap();
        assert_eq!(1, pool.open_count());

        let inbox = session1.lock().mailbox_id("INBOX").unwrap().unwrap();
        let (_, uid) = session1
            .lock()
            .add_message(inbox, b"hello", None)
            .unwrap();
        assert_eq!(
            1,
            session2.lock().mailbox_status(inbox).unwrap().messages
        );

        pool.put(session1).unwrap();
        pool.put(session2).unwrap();
        assert_eq!(0, pool.open_count());

        // Reopening finds everything on disk
        let session = pool.get("alice").unwrap();
        assert!(session.lock().get_flag(inbox, uid, Flag::Recent).unwrap());
        assert_eq!(1, session.lock().mailbox_ids().unwrap().len());
        pool.put(session).unwrap();
    }

    #[test]
    fn logout_without_waiting() {
        let root = TempDir::new().unwrap();
        let pool = MailStorePool::new(&file_config(root.path().to_owned()));

        let session = pool.get("dave").unwrap();
        match pool.put_detached(session).unwrap() {
            Detach::Completed(result) => result.unwrap(),
            Detach::Detached(join) => join.join().unwrap().unwrap().unwrap(),
        }
        assert_eq!(0, pool.open_count());
    }

    #[test]
    fn unsafe_user_rejected() {
        let root = TempDir::new().unwrap();
        let pool = MailStorePool::new(&file_config(root.path().to_owned()));
        assert_matches!(Err(Error::UnsafeName), pool.get("../bob"));
        assert_eq!(0, pool.open_count());
    }

    #[test]
    fn concurrent_sessions() {
        let root = TempDir::new().unwrap();
        let pool = Arc::new(MailStorePool::new(&file_config(
            root.path().to_owned(),
        )));

        let threads = (0..4)
            .map(|n| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for i in 0..5 {
                        let session = pool.get("carol").unwrap();
                        {
                            let mut store = session.lock();
                            let inbox =
                                store.mailbox_id("INBOX").unwrap().unwrap();
                            let text = format!("{}-{}", n, i);
                            store
                                .add_message(inbox, text.as_bytes(), None)
                                .unwrap();
                        }
                        pool.put(session).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }

        let session = pool.get("carol").unwrap();
        {
            let store = session.lock();
            let inbox = store.mailbox_id("INBOX").unwrap().unwrap();
            assert_eq!(20, store.mailbox_status(inbox).unwrap().messages);
            assert!(store.check_counters().unwrap().is_empty());
        }
        pool.put(session).unwrap();
    }
}
