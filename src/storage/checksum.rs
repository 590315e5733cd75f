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

use tiny_keccak::{Hasher, Sha3};

use super::kv::KeyValueStore;
use crate::support::error::Error;

const DIGEST_LEN: usize = 32;

/// A decorator which stores a SHA3-256 digest in front of every value and
/// verifies it on read.
///
/// A mismatch is reported as `Error::ChecksumMismatch` and never repaired.
pub struct ChecksummedStore<S> {
    inner: S,
}

impl<S: KeyValueStore> ChecksummedStore<S> {
    pub fn new(inner: S) -> Self {
        ChecksummedStore { inner }
    }

    fn unwrap_value(key: &str, raw: Vec<u8>) -> Result<Vec<u8>, Error> {
        if raw.len() < DIGEST_LEN {
            return Err(Error::ChecksumMismatch(key.to_owned()));
        }

        let (stored, value) = raw.split_at(DIGEST_LEN);
        if stored != &digest(value)[..] {
            return Err(Error::ChecksumMismatch(key.to_owned()));
        }

        Ok(value.to_vec())
    }
}

fn digest(value: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha3::v256();
    hasher.update(value);
    let mut out = [0u8; DIGEST_LEN];
    hasher.finalize(&mut out);
    out
}

impl<S: KeyValueStore> KeyValueStore for ChecksummedStore<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.inner
            .get(key)?
            .map(|raw| Self::unwrap_value(key, raw))
            .transpose()
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut raw = Vec::with_capacity(DIGEST_LEN + value.len());
        raw.extend_from_slice(&digest(value));
        raw.extend_from_slice(value);
        self.inner.put(key, &raw)
    }

    // Not verified; a corrupt value can always be removed
    fn delete(&mut self, key: &str) -> Result<bool, Error> {
        self.inner.delete(key)
    }

    fn has(&self, key: &str) -> Result<bool, Error> {
        self.inner.has(key)
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        self.inner.keys()
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.inner.sync()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        self.inner.destroy()
    }
}
