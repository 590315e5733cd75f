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

use super::model::{MessageId, Uid};
use crate::storage::{KeyValueStore, KeyValueStoreExt};
use crate::support::error::Error;

const DELETED_SUFFIX: &str = ",deleted";

/// The UID table of one mailbox.
///
/// Each key is a decimal UID; the value is `<message id>`, or
/// `<message id>,deleted` if the placement is marked `\Deleted`. The marker
/// lives here rather than with the message because deletion is specific to
/// one mailbox.
pub struct MailboxIndex {
    kv: Box<dyn KeyValueStore>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    message_id: MessageId,
    deleted: bool,
}

impl MailboxIndex {
    pub fn new(kv: Box<dyn KeyValueStore>) -> Self {
        MailboxIndex { kv }
    }

    fn read(&self, uid: Uid) -> Result<Option<Entry>, Error> {
        let key = uid.to_string();
        let raw = match self.kv.get_str(&key)? {
            None => return Ok(None),
            Some(raw) => raw,
        };

        let (id, deleted) = match raw.strip_suffix(DELETED_SUFFIX) {
            Some(id) => (id, true),
            None => (&raw[..], false),
        };

        let message_id = id
            .parse()
            .map(MessageId)
            .map_err(|e| Error::corrupt(&key, e))?;
        Ok(Some(Entry {
            message_id,
            deleted,
        }))
    }

    fn write(&mut self, uid: Uid, entry: Entry) -> Result<(), Error> {
        let value = if entry.deleted {
            format!("{}{}", entry.message_id, DELETED_SUFFIX)
        } else {
            entry.message_id.to_string()
        };
        self.kv.put_str(&uid.to_string(), &value)
    }

    fn entry(&self, uid: Uid) -> Result<Entry, Error> {
        self.read(uid)?.ok_or(Error::NxUid)
    }

    /// Map `uid` to `message_id`, not marked deleted.
    ///
    /// Fails with `UidExists` if the UID is already in use.
    pub fn add(
        &mut self,
        uid: Uid,
        message_id: MessageId,
    ) -> Result<(), Error> {
        if self.exists(uid)? {
            return Err(Error::UidExists);
        }

        self.write(
            uid,
            Entry {
                message_id,
                deleted: false,
            },
        )
    }

    pub fn message_id(&self, uid: Uid) -> Result<MessageId, Error> {
        self.entry(uid).map(|e| e.message_id)
    }

    pub fn is_deleted(&self, uid: Uid) -> Result<bool, Error> {
        self.entry(uid).map(|e| e.deleted)
    }

    /// Set the deleted marker, returning the previous value.
    pub fn set_deleted(
        &mut self,
        uid: Uid,
        deleted: bool,
    ) -> Result<bool, Error> {
        let mut entry = self.entry(uid)?;
        let was = entry.deleted;
        if was != deleted {
            entry.deleted = deleted;
            self.write(uid, entry)?;
        }
        Ok(was)
    }

    /// Remove `uid`, which must be marked deleted, returning the message it
    /// referred to.
    pub fn expunge(&mut self, uid: Uid) -> Result<MessageId, Error> {
        let entry = self.entry(uid)?;
        if !entry.deleted {
            return Err(Error::UidNotDeleted);
        }

        self.kv.delete(&uid.to_string())?;
        Ok(entry.message_id)
    }

    /// Remove `uid` regardless of its deleted marker.
    ///
    /// Used when a whole mailbox is being torn down.
    pub(super) fn remove(&mut self, uid: Uid) -> Result<MessageId, Error> {
        let entry = self.entry(uid)?;
        self.kv.delete(&uid.to_string())?;
        Ok(entry.message_id)
    }

    pub fn exists(&self, uid: Uid) -> Result<bool, Error> {
        self.kv.has(&uid.to_string())
    }

    /// Return all UIDs in the mailbox, ascending.
    pub fn uids(&self) -> Result<Vec<Uid>, Error> {
        let mut uids = self
            .kv
            .keys()?
            .into_iter()
            .filter_map(|k| k.parse().ok().and_then(Uid::of))
            .collect::<Vec<_>>();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Return `(uid, message id)` for every entry, ascending by UID.
    pub fn entries(&self) -> Result<Vec<(Uid, MessageId)>, Error> {
        self.uids()?
            .into_iter()
            .map(|uid| self.message_id(uid).map(|id| (uid, id)))
            .collect()
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.kv.sync()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.kv.close()
    }

    /// Close and permanently remove the index.
    pub fn destroy(mut self) -> Result<(), Error> {
        self.kv.close()?;
        self.kv.destroy()
    }
}
