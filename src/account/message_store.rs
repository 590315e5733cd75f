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

use log::debug;

use super::model::MessageId;
use crate::storage::KeyValueStore;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Maps message ids to the raw, immutable message text.
///
/// Keys are decimal message ids. There is no update operation: flags and
/// placements live in the metadata store and never touch the text.
pub struct MessageStore {
    log_prefix: LogPrefix,
    text: Box<dyn KeyValueStore>,
    next_id: u64,
}

impl MessageStore {
    /// Wrap `text`.
    ///
    /// `floor` is the highest message id ever allocated according to the
    /// metadata; new ids are allocated above both it and anything already in
    /// `text`, so ids of deleted messages are never handed out again.
    pub fn open(
        log_prefix: LogPrefix,
        text: Box<dyn KeyValueStore>,
        floor: MessageId,
    ) -> Result<Self, Error> {
        let mut this = MessageStore {
            log_prefix,
            text,
            next_id: 1,
        };
        let max = this.max_id()?.map_or(0, |id| id.0);
        this.next_id = max.max(floor.0) + 1;
        Ok(this)
    }

    /// Store `text` under a newly allocated id.
    pub fn add(&mut self, text: &[u8]) -> Result<MessageId, Error> {
        let id = MessageId(self.next_id);
        self.text.put(&id.to_string(), text)?;
        self.next_id += 1;
        debug!(
            "{} Stored message {} ({} bytes)",
            self.log_prefix,
            id,
            text.len()
        );
        Ok(id)
    }

    pub fn get(&self, id: MessageId) -> Result<Vec<u8>, Error> {
        self.text.get(&id.to_string())?.ok_or(Error::NxMessage)
    }

    pub fn delete(&mut self, id: MessageId) -> Result<(), Error> {
        if self.text.delete(&id.to_string())? {
            Ok(())
        } else {
            Err(Error::NxMessage)
        }
    }

    pub fn exists(&self, id: MessageId) -> Result<bool, Error> {
        self.text.has(&id.to_string())
    }

    /// Return the ids of all stored messages, ascending.
    ///
    /// Keys which are not message ids are ignored.
    pub fn ids(&self) -> Result<Vec<MessageId>, Error> {
        let mut ids = self
            .text
            .keys()?
            .into_iter()
            .filter_map(|k| k.parse().ok().map(MessageId))
            .collect::<Vec<_>>();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Return the largest id present, if any.
    pub fn max_id(&self) -> Result<Option<MessageId>, Error> {
        Ok(self.ids()?.last().copied())
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.text.sync()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.text.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryBackend;

    fn open(backend: &MemoryBackend, floor: u64) -> MessageStore {
        MessageStore::open(
            LogPrefix::new("test".to_owned()),
            Box::new(backend.open("message-text")),
            MessageId(floor),
        )
        .unwrap()
    }

    #[test]
    fn add_get_delete() {
        let backend = MemoryBackend::new();
        let mut store = open(&backend, 0);

        let a = store.add(b"a").unwrap();
        let b = store.add(b"bb").unwrap();
        assert_eq!(MessageId(1), a);
        assert_eq!(MessageId(2), b);
        assert_eq!(b"bb".to_vec(), store.get(b).unwrap());
        assert!(store.exists(a).unwrap());
        assert_eq!(vec![a, b], store.ids().unwrap());

        store.delete(a).unwrap();
        assert!(!store.exists(a).unwrap());
        assert_matches!(Err(Error::NxMessage), store.get(a));
        assert_matches!(Err(Error::NxMessage), store.delete(a));
    }

    #[test]
    fn ids_never_reused() {
        let backend = MemoryBackend::new();
        let mut store = open(&backend, 0);
        store.add(b"1").unwrap();
        let two = store.add(b"2").unwrap();
        store.delete(two).unwrap();
        store.close().unwrap();

        // The metadata remembers that 2 was handed out
        let mut store = open(&backend, 2);
        assert_eq!(MessageId(3), store.add(b"3").unwrap());

        // Text beyond the floor also counts
        let mut store = open(&backend, 0);
        assert_eq!(MessageId(4), store.add(b"4").unwrap());
    }
}
