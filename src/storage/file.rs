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

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;

use super::kv::KeyValueStore;
use crate::support::error::Error;

/// A `KeyValueStore` kept entirely in memory and written out as a single
/// CBOR-encoded map.
///
/// The file is rewritten atomically on every `sync()` which follows a
/// modification, so a crash loses at most the writes since the last sync but
/// never leaves a half-written file behind.
pub struct FileStore {
    path: PathBuf,
    data: Option<BTreeMap<String, Vec<u8>>>,
    dirty: bool,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if the file does not
    /// exist yet. The parent directory must exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let data = match fs::File::open(&path) {
            Ok(f) => serde_cbor::from_reader(io::BufReader::new(f))?,
            Err(e) if io::ErrorKind::NotFound == e.kind() => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(FileStore {
            path,
            data: Some(data),
            dirty: false,
        })
    }

    fn data(&self) -> Result<&BTreeMap<String, Vec<u8>>, Error> {
        self.data.as_ref().ok_or(Error::StoreClosed)
    }

    fn data_mut(&mut self) -> Result<&mut BTreeMap<String, Vec<u8>>, Error> {
        self.data.as_mut().ok_or(Error::StoreClosed)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.data()?.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.data_mut()?.insert(key.to_owned(), value.to_vec());
        self.dirty = true;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<bool, Error> {
        let present = self.data_mut()?.remove(key).is_some();
        if present {
            self.dirty = true;
        }
        Ok(present)
    }

    fn has(&self, key: &str) -> Result<bool, Error> {
        Ok(self.data()?.contains_key(key))
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.data()?.keys().cloned().collect())
    }

    fn sync(&mut self) -> Result<(), Error> {
        let data = self.data()?;
        if !self.dirty {
            return Ok(());
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tf = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = io::BufWriter::new(tf.as_file_mut());
            serde_cbor::to_writer(&mut writer, data)?;
            writer.flush()?;
        }
        tf.as_file_mut().sync_all()?;
        tf.persist(&self.path).map_err(|e| e.error)?;
        debug!("Wrote {}", self.path.display());

        self.dirty = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.data.is_some() {
            self.sync()?;
            self.data = None;
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), Error> {
        if self.data.is_some() {
            return Err(Error::StoreNotClosed);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if io::ErrorKind::NotFound == e.kind() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
