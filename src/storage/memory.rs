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

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::kv::KeyValueStore;
use crate::support::error::Error;

type Table = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// A registry of in-memory tables, keyed by storage path.
///
/// Stores opened on the same path see the same data, so a store which is
/// closed and reopened behaves like one backed by a file. Cloning the backend
/// shares the registry.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<HashMap<String, Table>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (creating if necessary) the table at `path`.
    pub fn open(&self, path: &str) -> MemoryStore {
        let table = Arc::clone(
            self.tables
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_default(),
        );

        MemoryStore {
            path: path.to_owned(),
            table: Some(table),
            registry: Arc::clone(&self.tables),
        }
    }

    /// Return whether a table currently exists at `path`.
    pub fn exists(&self, path: &str) -> bool {
        self.tables.lock().unwrap().contains_key(path)
    }
}

/// A `KeyValueStore` backed by a table in a `MemoryBackend`.
pub struct MemoryStore {
    path: String,
    table: Option<Table>,
    registry: Arc<Mutex<HashMap<String, Table>>>,
}

impl MemoryStore {
    fn table(&self) -> Result<&Table, Error> {
        self.table.as_ref().ok_or(Error::StoreClosed)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.table()?.lock().unwrap().get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.table()?
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, Error> {
        Ok(self.table()?.lock().unwrap().remove(key).is_some())
    }

    fn has(&self, key: &str) -> Result<bool, Error> {
        Ok(self.table()?.lock().unwrap().contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.table()?.lock().unwrap().keys().cloned().collect())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.table().map(|_| ())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.table = None;
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), Error> {
        if self.table.is_some() {
            return Err(Error::StoreNotClosed);
        }

        self.registry.lock().unwrap().remove(&self.path);
        Ok(())
    }
}
