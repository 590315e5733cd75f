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

use crate::support::error::Error;

/// A byte-valued key-value store.
///
/// Keys are ASCII strings; values are opaque bytes. Nothing above the
/// `storage` module knows what technology actually holds the data.
///
/// A store starts out open. After `close()`, every operation except
/// `destroy()` fails with `Error::StoreClosed`, and `destroy()` is only
/// permitted once the store is closed.
pub trait KeyValueStore: Send {
    /// Fetch the value for `key`, or `None` if it is not present.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Set `key` to `value`, replacing any existing value.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Remove `key`, returning whether it was present.
    fn delete(&mut self, key: &str) -> Result<bool, Error>;

    fn has(&self, key: &str) -> Result<bool, Error> {
        self.get(key).map(|v| v.is_some())
    }

    /// Return all keys currently in the store, in no particular order.
    fn keys(&self) -> Result<Vec<String>, Error>;

    /// Flush any buffered writes to the backing storage.
    fn sync(&mut self) -> Result<(), Error>;

    /// Sync and release the backing storage.
    ///
    /// Closing an already closed store is a no-op.
    fn close(&mut self) -> Result<(), Error>;

    /// Permanently remove the backing storage. The store must be closed.
    fn destroy(&mut self) -> Result<(), Error>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        (**self).get(key)
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        (**self).put(key, value)
    }

    fn delete(&mut self, key: &str) -> Result<bool, Error> {
        (**self).delete(key)
    }

    fn has(&self, key: &str) -> Result<bool, Error> {
        (**self).has(key)
    }

    fn keys(&self) -> Result<Vec<String>, Error> {
        (**self).keys()
    }

    fn sync(&mut self) -> Result<(), Error> {
        (**self).sync()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn destroy(&mut self) -> Result<(), Error> {
        (**self).destroy()
    }
}

/// Convenience accessors for stores holding UTF-8 text values.
pub trait KeyValueStoreExt: KeyValueStore {
    /// Fetch `key` as a string.
    ///
    /// Non-UTF-8 data is reported as corruption.
    fn get_str(&self, key: &str) -> Result<Option<String>, Error> {
        match self.get(key)? {
            None => Ok(None),
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| Error::corrupt(key, e)),
        }
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.put(key, value.as_bytes())
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}
