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

//! Byte-level key-value storage.
//!
//! Everything above this module sees storage only through the
//! `KeyValueStore` trait and obtains stores through a `StoreOpener`, which
//! maps a logical store name (`meta`, `message-text`, `mailbox-<id>`) to an
//! open store. Only this module knows what technology backs those names.

pub mod checksum;
pub mod file;
pub mod kv;
pub mod memory;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;

pub use self::checksum::ChecksummedStore;
pub use self::file::FileStore;
pub use self::kv::{KeyValueStore, KeyValueStoreExt};
pub use self::memory::{MemoryBackend, MemoryStore};

use crate::support::error::Error;
use crate::support::safe_name::is_safe_user_name;
use crate::support::system_config::{BackendKind, StorageConfig};

/// Opens the store with the given logical name.
pub type StoreOpener =
    Arc<dyn Fn(&str) -> Result<Box<dyn KeyValueStore>, Error> + Send + Sync>;

lazy_static! {
    /// The backend used for `backend = "memory"` configurations.
    static ref PROCESS_MEMORY: MemoryBackend = MemoryBackend::new();
}

fn wrap(
    store: impl KeyValueStore + 'static,
    checksum: bool,
) -> Box<dyn KeyValueStore> {
    if checksum {
        Box::new(ChecksummedStore::new(store))
    } else {
        Box::new(store)
    }
}

/// Return an opener which keeps each store in `<dir>/<name>.kv`.
///
/// `dir` is created on first use.
pub fn file_opener(dir: PathBuf, checksum: bool) -> StoreOpener {
    Arc::new(move |name| {
        fs::create_dir_all(&dir)?;
        let store = FileStore::open(dir.join(format!("{}.kv", name)))?;
        Ok(wrap(store, checksum))
    })
}

/// Return an opener which keeps each store in `backend` under
/// `<prefix>/<name>`.
pub fn memory_opener(
    backend: MemoryBackend,
    prefix: String,
    checksum: bool,
) -> StoreOpener {
    Arc::new(move |name| {
        Ok(wrap(backend.open(&format!("{}/{}", prefix, name)), checksum))
    })
}

/// Return the opener for all of `user`'s stores under `config`.
pub fn opener_for_user(
    config: &StorageConfig,
    user: &str,
) -> Result<StoreOpener, Error> {
    if !is_safe_user_name(user) {
        return Err(Error::UnsafeName);
    }

    Ok(match config.backend {
        BackendKind::File => {
            file_opener(config.root.join(user), config.checksum)
        }
        BackendKind::Memory => memory_opener(
            PROCESS_MEMORY.clone(),
            format!("{}/{}", config.root.display(), user),
            config.checksum,
        ),
    })
}
