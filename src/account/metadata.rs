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

//! The mailbox/message schema, encoded into a single key-value store.
//!
//! Integers are stored as decimal strings, sets as comma-joined lists, and
//! per-message placements as a CBOR map. The keys are:
//!
//! - `cnum`. The change counter, bumped on every mutation of the account.
//! - `msg_id`. The highest message id ever allocated.
//! - `uidvalidity`. The highest mailbox id ever allocated.
//! - `mbox_set`. The ids of all live mailboxes.
//! - `mbox_id2name-<id>`, `mbox_name2id-<name>`. The name mapping.
//! - `mbox_id2uid-<id>`. The next UID to allocate in the mailbox.
//! - `mbox_id2msgnum-<id>`. The number of placements in the mailbox.
//! - `mbox_id2flagnum-<id>-<flag>`. The number of placements in the mailbox
//!   whose message has `<flag>`.
//! - `msg_id2date-<id>`. The internal date of the message (RFC 3339).
//! - `msg_id2flag-<id>`. The message-scoped flags of the message.
//! - `msg_id2mbox-<id>`. The placements of the message: mailbox id to UIDs.
//! - `dirty`. Present while the account is open.
//!
//! Nothing outside this module knows about this layout.
//!
//! There are no transactions. Every operation validates everything it
//! references before writing anything, but a crash between two writes of one
//! operation can leave counters or placements out of step. The recovery scan
//! (see `recovery.rs`) deals with the aftermath.

use std::collections::{BTreeMap, BTreeSet};

use chrono::prelude::*;
use log::info;

use super::model::*;
use crate::storage::{KeyValueStore, KeyValueStoreExt};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

const CNUM: &str = "cnum";
const MSG_ID: &str = "msg_id";
const UIDVALIDITY: &str = "uidvalidity";
const MBOX_SET: &str = "mbox_set";
const DIRTY: &str = "dirty";
pub(super) const MSG_ID2MBOX_PREFIX: &str = "msg_id2mbox-";

fn mbox_id2name(id: MailboxId) -> String {
    format!("mbox_id2name-{}", id)
}

fn mbox_name2id(name: &str) -> String {
    format!("mbox_name2id-{}", name)
}

fn mbox_id2uid(id: MailboxId) -> String {
    format!("mbox_id2uid-{}", id)
}

fn mbox_id2msgnum(id: MailboxId) -> String {
    format!("mbox_id2msgnum-{}", id)
}

fn mbox_id2flagnum(id: MailboxId, flag: Flag) -> String {
    format!("mbox_id2flagnum-{}-{}", id, flag.name())
}

fn msg_id2date(id: MessageId) -> String {
    format!("msg_id2date-{}", id)
}

fn msg_id2flag(id: MessageId) -> String {
    format!("msg_id2flag-{}", id)
}

fn msg_id2mbox(id: MessageId) -> String {
    format!("{}{}", MSG_ID2MBOX_PREFIX, id)
}

/// Where one message is placed: mailbox id to the UIDs it occupies there.
pub type Placements = BTreeMap<MailboxId, BTreeSet<Uid>>;

pub struct MetadataStore {
    log_prefix: LogPrefix,
    kv: Box<dyn KeyValueStore>,
}

impl MetadataStore {
    pub fn new(log_prefix: LogPrefix, kv: Box<dyn KeyValueStore>) -> Self {
        MetadataStore { log_prefix, kv }
    }

    pub(super) fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub(super) fn kv(&self) -> &dyn KeyValueStore {
        &*self.kv
    }

    fn get_num(&self, key: &str) -> Result<Option<u64>, Error> {
        match self.kv.get_str(key)? {
            None => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e| Error::corrupt(key, e)),
        }
    }

    fn get_num_or(&self, key: &str, default: u64) -> Result<u64, Error> {
        self.get_num(key).map(|v| v.unwrap_or(default))
    }

    fn put_num(&mut self, key: &str, value: u64) -> Result<(), Error> {
        self.kv.put_str(key, &value.to_string())
    }

    /// Add `delta` to the counter at `key`, which must not go negative.
    fn adjust_num(&mut self, key: &str, delta: i64) -> Result<u64, Error> {
        let current = self.get_num_or(key, 0)?;
        let new = if delta < 0 {
            current.checked_sub(delta.unsigned_abs())
        } else {
            current.checked_add(delta as u64)
        }
        .ok_or_else(|| Error::corrupt(key, "counter out of range"))?;
        self.put_num(key, new)?;
        Ok(new)
    }

    fn require_mailbox(&self, id: MailboxId) -> Result<(), Error> {
        if self.kv.has(&mbox_id2name(id))? {
            Ok(())
        } else {
            Err(Error::NxMailbox)
        }
    }

    fn require_message(&self, id: MessageId) -> Result<(), Error> {
        if id.0 >= 1 && id.0 <= self.message_id_high_water()?.0 {
            Ok(())
        } else {
            Err(Error::NxMessage)
        }
    }

    // ----- account-wide counters -----

    /// The change counter.
    pub fn cnum(&self) -> Result<u64, Error> {
        self.get_num_or(CNUM, 0)
    }

    /// Increment the change counter, returning the new value.
    pub fn bump_cnum(&mut self) -> Result<u64, Error> {
        self.adjust_num(CNUM, 1)
    }

    /// The last UIDVALIDITY (and mailbox id) handed out.
    pub fn uid_validity(&self) -> Result<u32, Error> {
        self.get_num_or(UIDVALIDITY, 1).map(|v| v as u32)
    }

    /// Allocate the next UIDVALIDITY value.
    pub fn bump_uid_validity(&mut self) -> Result<u32, Error> {
        let next = self.uid_validity()?.checked_add(1).ok_or_else(|| {
            Error::corrupt(UIDVALIDITY, "mailbox ids exhausted")
        })?;
        self.put_num(UIDVALIDITY, next.into())?;
        Ok(next)
    }

    /// The highest message id known to have been allocated.
    pub fn message_id_high_water(&self) -> Result<MessageId, Error> {
        self.get_num_or(MSG_ID, 0).map(MessageId)
    }

    /// Raise the message id high-water mark to at least `id`.
    pub fn advance_message_id(&mut self, id: MessageId) -> Result<(), Error> {
        if id > self.message_id_high_water()? {
            self.put_num(MSG_ID, id.0)?;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> Result<bool, Error> {
        self.kv.has(DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) -> Result<(), Error> {
        if dirty {
            self.kv.put_str(DIRTY, "1")
        } else {
            self.kv.delete(DIRTY).map(|_| ())
        }
    }

    // ----- mailboxes -----

    /// Create a mailbox named `name`, allocating its id from UIDVALIDITY.
    pub fn add_mailbox(&mut self, name: &str) -> Result<MailboxId, Error> {
        if self.mailbox_id(name)?.is_some() {
            return Err(Error::MailboxExists);
        }

        let id = MailboxId(self.bump_uid_validity()?);
        self.put_num(&mbox_id2uid(id), 1)?;
        self.put_num(&mbox_id2msgnum(id), 0)?;
        self.kv.put_str(&mbox_name2id(name), &id.to_string())?;
        self.kv.put_str(&mbox_id2name(id), name)?;

        let mut set = self.mailbox_ids()?;
        set.insert(id);
        self.put_mailbox_set(&set)?;

        info!("{} Created mailbox {} ({:?})", self.log_prefix, id, name);
        Ok(id)
    }

    /// Remove the records of mailbox `id`.
    ///
    /// This does not touch placements; the caller must detach every message
    /// from the mailbox first.
    pub fn delete_mailbox(&mut self, id: MailboxId) -> Result<(), Error> {
        let name = self.mailbox_name(id)?;

        let mut set = self.mailbox_ids()?;
        set.remove(&id);
        self.put_mailbox_set(&set)?;

        self.kv.delete(&mbox_name2id(&name))?;
        self.kv.delete(&mbox_id2uid(id))?;
        self.kv.delete(&mbox_id2msgnum(id))?;
        for &flag in &Flag::ALL {
            self.kv.delete(&mbox_id2flagnum(id, flag))?;
        }
        self.kv.delete(&mbox_id2name(id))?;

        info!("{} Deleted mailbox {} ({:?})", self.log_prefix, id, name);
        Ok(())
    }

    /// Rename mailbox `id` to `new_name`.
    ///
    /// Renaming a mailbox to its current name is a successful no-op.
    pub fn rename_mailbox(
        &mut self,
        id: MailboxId,
        new_name: &str,
    ) -> Result<(), Error> {
        let old_name = self.mailbox_name(id)?;
        if old_name == new_name {
            return Ok(());
        }

        if self.mailbox_id(new_name)?.is_some() {
            return Err(Error::MailboxExists);
        }

        self.kv.put_str(&mbox_name2id(new_name), &id.to_string())?;
        self.kv.put_str(&mbox_id2name(id), new_name)?;
        self.kv.delete(&mbox_name2id(&old_name))?;

        info!(
            "{} Renamed mailbox {} from {:?} to {:?}",
            self.log_prefix, id, old_name, new_name
        );
        Ok(())
    }

    pub fn mailbox_ids(&self) -> Result<BTreeSet<MailboxId>, Error> {
        let raw = self.kv.get_str(MBOX_SET)?.unwrap_or_default();
        decode_list(MBOX_SET, &raw)
            .map(|ids| ids.into_iter().map(MailboxId).collect())
    }

    fn put_mailbox_set(
        &mut self,
        set: &BTreeSet<MailboxId>,
    ) -> Result<(), Error> {
        let raw = set
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.kv.put_str(MBOX_SET, &raw)
    }

    /// Look up a mailbox by exact name.
    pub fn mailbox_id(&self, name: &str) -> Result<Option<MailboxId>, Error> {
        let key = mbox_name2id(name);
        match self.get_num(&key)? {
            None => Ok(None),
            Some(id) => Ok(Some(MailboxId(id as u32))),
        }
    }

    pub fn mailbox_name(&self, id: MailboxId) -> Result<String, Error> {
        self.kv.get_str(&mbox_id2name(id))?.ok_or(Error::NxMailbox)
    }

    /// The UID the next placement into the mailbox will receive.
    pub fn next_uid(&self, id: MailboxId) -> Result<Uid, Error> {
        let key = mbox_id2uid(id);
        let raw = self.get_num(&key)?.ok_or(Error::NxMailbox)?;
        Uid::of(raw as u32).ok_or_else(|| Error::corrupt(&key, "UID 0"))
    }

    /// Allocate a UID in the mailbox.
    pub fn allocate_uid(&mut self, id: MailboxId) -> Result<Uid, Error> {
        let uid = self.next_uid(id)?;
        let next = uid
            .next()
            .ok_or_else(|| Error::corrupt(&mbox_id2uid(id), "UIDs exhausted"))?;
        self.put_num(&mbox_id2uid(id), next.0.get().into())?;
        Ok(uid)
    }

    pub fn message_count(&self, id: MailboxId) -> Result<u64, Error> {
        self.require_mailbox(id)?;
        self.get_num_or(&mbox_id2msgnum(id), 0)
    }

    pub fn increment_message_count(
        &mut self,
        id: MailboxId,
    ) -> Result<u64, Error> {
        self.require_mailbox(id)?;
        self.adjust_num(&mbox_id2msgnum(id), 1)
    }

    pub fn decrement_message_count(
        &mut self,
        id: MailboxId,
    ) -> Result<u64, Error> {
        self.require_mailbox(id)?;
        self.adjust_num(&mbox_id2msgnum(id), -1)
    }

    pub fn flag_count(&self, id: MailboxId, flag: Flag) -> Result<u64, Error> {
        self.require_mailbox(id)?;
        self.get_num_or(&mbox_id2flagnum(id, flag), 0)
    }

    pub fn increment_flag_count(
        &mut self,
        id: MailboxId,
        flag: Flag,
    ) -> Result<u64, Error> {
        self.require_mailbox(id)?;
        self.adjust_num(&mbox_id2flagnum(id, flag), 1)
    }

    pub fn decrement_flag_count(
        &mut self,
        id: MailboxId,
        flag: Flag,
    ) -> Result<u64, Error> {
        self.require_mailbox(id)?;
        self.adjust_num(&mbox_id2flagnum(id, flag), -1)
    }

    /// Gather the counters of the mailbox.
    pub fn mailbox_status(
        &self,
        id: MailboxId,
    ) -> Result<MailboxStatus, Error> {
        let mut status = MailboxStatus {
            name: self.mailbox_name(id)?,
            uid_validity: id.0,
            next_uid: self.next_uid(id)?.0.get(),
            messages: self.message_count(id)?,
            flag_counts: [0; 6],
        };
        for (ix, &flag) in Flag::ALL.iter().enumerate() {
            status.flag_counts[ix] = self.flag_count(id, flag)?;
        }
        Ok(status)
    }

    // ----- messages -----

    pub fn message_date(
        &self,
        id: MessageId,
    ) -> Result<Option<DateTime<FixedOffset>>, Error> {
        let key = msg_id2date(id);
        match self.kv.get_str(&key)? {
            None => Ok(None),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(Some)
                .map_err(|e| Error::corrupt(&key, e)),
        }
    }

    pub fn set_message_date(
        &mut self,
        id: MessageId,
        date: DateTime<FixedOffset>,
    ) -> Result<(), Error> {
        self.require_message(id)?;
        self.kv.put_str(&msg_id2date(id), &date.to_rfc3339())
    }

    pub fn clear_message_date(&mut self, id: MessageId) -> Result<(), Error> {
        self.require_message(id)?;
        self.kv.delete(&msg_id2date(id)).map(|_| ())
    }

    /// Return the message-scoped flags of the message.
    pub fn message_flags(&self, id: MessageId) -> Result<FlagSet, Error> {
        self.require_message(id)?;
        let key = msg_id2flag(id);
        let raw = self.kv.get_str(&key)?.unwrap_or_default();
        let mut flags = FlagSet::empty();
        for name in raw.split(',').filter(|s| !s.is_empty()) {
            let flag: Flag =
                name.parse().map_err(|_| Error::corrupt(&key, name))?;
            flags |= flag.bit();
        }
        Ok(flags)
    }

    /// Overwrite the flags of the message without touching any counter.
    ///
    /// Only valid for a message with no placements.
    pub fn init_message_flags(
        &mut self,
        id: MessageId,
        flags: FlagSet,
    ) -> Result<(), Error> {
        self.require_message(id)?;
        let raw = flags.flags().map(Flag::name).collect::<Vec<_>>().join(",");
        self.kv.put_str(&msg_id2flag(id), &raw)
    }

    pub fn message_flag(
        &self,
        id: MessageId,
        flag: Flag,
    ) -> Result<bool, Error> {
        self.message_flags(id).map(|f| f.contains(flag.bit()))
    }

    /// Set or clear a message-scoped flag.
    ///
    /// If the value actually changes, the counter for `flag` is adjusted in
    /// every mailbox the message is placed in. Returns whether it changed.
    pub fn set_message_flag(
        &mut self,
        id: MessageId,
        flag: Flag,
        value: bool,
    ) -> Result<bool, Error> {
        if flag.is_placement_local() {
            return Err(Error::NxFlag);
        }

        let mut flags = self.message_flags(id)?;
        if flags.contains(flag.bit()) == value {
            return Ok(false);
        }

        let placements = self.placements(id)?;
        flags.set(flag.bit(), value);
        self.init_message_flags(id, flags)?;
        let delta = if value { 1 } else { -1 };
        self.adjust_counts(&placements, flag.bit(), delta)?;
        Ok(true)
    }

    /// Apply `delta` to every counter in `flags` for every placement in
    /// `placements`.
    ///
    /// This is the one place flag counters change in response to placements
    /// and flag changes.
    fn adjust_counts(
        &mut self,
        placements: &Placements,
        flags: FlagSet,
        delta: i64,
    ) -> Result<(), Error> {
        for (&mailbox, uids) in placements {
            let delta = delta * uids.len() as i64;
            for flag in flags.flags() {
                self.adjust_num(&mbox_id2flagnum(mailbox, flag), delta)?;
            }
        }
        Ok(())
    }

    // ----- placements -----

    pub fn placements(&self, id: MessageId) -> Result<Placements, Error> {
        let key = msg_id2mbox(id);
        match self.kv.get(&key)? {
            None => Ok(Placements::new()),
            Some(raw) => serde_cbor::from_slice(&raw)
                .map_err(|e| Error::corrupt(&key, e)),
        }
    }

    fn put_placements(
        &mut self,
        id: MessageId,
        placements: &Placements,
    ) -> Result<(), Error> {
        if placements.is_empty() {
            self.kv.delete(&msg_id2mbox(id)).map(|_| ())
        } else {
            let raw = serde_cbor::to_vec(placements)?;
            self.kv.put(&msg_id2mbox(id), &raw)
        }
    }

    /// Whether the message has any placement in `mailbox`.
    pub fn is_placed_in(
        &self,
        id: MessageId,
        mailbox: MailboxId,
    ) -> Result<bool, Error> {
        Ok(self
            .placements(id)?
            .get(&mailbox)
            .map_or(false, |uids| !uids.is_empty()))
    }

    /// Whether message `id` is recorded as occupying `uid` in `mailbox`.
    pub fn has_placement(
        &self,
        id: MessageId,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<bool, Error> {
        Ok(self
            .placements(id)?
            .get(&mailbox)
            .map_or(false, |uids| uids.contains(&uid)))
    }

    /// Record that message `id` occupies `uid` in `mailbox`, and count it.
    pub fn add_placement(
        &mut self,
        id: MessageId,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<(), Error> {
        self.require_mailbox(mailbox)?;
        let flags = self.message_flags(id)?;

        let mut placements = self.placements(id)?;
        if !placements.entry(mailbox).or_default().insert(uid) {
            return Err(Error::PlacementExists);
        }
        self.put_placements(id, &placements)?;

        let single = single_placement(mailbox, uid);
        self.adjust_counts(&single, flags, 1)?;
        self.increment_message_count(mailbox)?;
        Ok(())
    }

    /// Remove the placement of message `id` at `uid` in `mailbox`, and
    /// uncount it.
    pub fn remove_placement(
        &mut self,
        id: MessageId,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<(), Error> {
        self.require_mailbox(mailbox)?;
        let flags = self.message_flags(id)?;

        let mut placements = self.placements(id)?;
        let removed = match placements.get_mut(&mailbox) {
            Some(uids) => {
                let removed = uids.remove(&uid);
                if uids.is_empty() {
                    placements.remove(&mailbox);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return Err(Error::NxUid);
        }
        self.put_placements(id, &placements)?;

        let single = single_placement(mailbox, uid);
        self.adjust_counts(&single, flags, -1)?;
        self.decrement_message_count(mailbox)?;
        Ok(())
    }

    /// Return the ids of every message with at least one placement.
    pub fn placed_message_ids(&self) -> Result<BTreeSet<MessageId>, Error> {
        Ok(self
            .kv
            .keys()?
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(MSG_ID2MBOX_PREFIX)
                    .and_then(|id| id.parse().ok())
                    .map(MessageId)
            })
            .collect())
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.kv.sync()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.kv.close()
    }
}

fn single_placement(mailbox: MailboxId, uid: Uid) -> Placements {
    let mut placements = Placements::new();
    placements.entry(mailbox).or_default().insert(uid);
    placements
}

fn decode_list(key: &str, raw: &str) -> Result<Vec<u32>, Error> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|e| Error::corrupt(key, e)))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryBackend;

    fn new_store() -> (MemoryBackend, MetadataStore) {
        let backend = MemoryBackend::new();
        let store = MetadataStore::new(
            LogPrefix::new("meta".to_owned()),
            Box::new(backend.open("meta")),
        );
        (backend, store)
    }

    fn new_message(store: &mut MetadataStore) -> MessageId {
        let id = MessageId(store.message_id_high_water().unwrap().0 + 1);
        store.advance_message_id(id).unwrap();
        id
    }

    #[test]
    fn mailbox_crud() {
        let (backend, mut store) = new_store();

        let inbox = store.add_mailbox("INBOX").unwrap();
        let foo = store.add_mailbox("foo").unwrap();
        assert_eq!(MailboxId(2), inbox);
        assert_eq!(MailboxId(3), foo);
        assert_matches!(Err(Error::MailboxExists), store.add_mailbox("foo"));

        assert_eq!(Some(foo), store.mailbox_id("foo").unwrap());
        assert_eq!("INBOX", store.mailbox_name(inbox).unwrap());
        assert_eq!(
            vec![inbox, foo],
            store.mailbox_ids().unwrap().into_iter().collect::<Vec<_>>()
        );
        assert_eq!(
            Some(b"2,3".to_vec()),
            backend.open("meta").get("mbox_set").unwrap()
        );

        store.rename_mailbox(foo, "foo").unwrap();
        assert_matches!(
            Err(Error::MailboxExists),
            store.rename_mailbox(foo, "INBOX")
        );
        store.rename_mailbox(foo, "bar").unwrap();
        assert_eq!(None, store.mailbox_id("foo").unwrap());
        assert_eq!(Some(foo), store.mailbox_id("bar").unwrap());

        store.delete_mailbox(foo).unwrap();
        assert_matches!(Err(Error::NxMailbox), store.mailbox_name(foo));
        assert_matches!(Err(Error::NxMailbox), store.delete_mailbox(foo));
        assert_matches!(Err(Error::NxMailbox), store.rename_mailbox(foo, "x"));
        assert_matches!(Err(Error::NxMailbox), store.allocate_uid(foo));
        assert_eq!(None, store.mailbox_id("bar").unwrap());

        // Ids are never reused, even for the same name
        let bar = store.add_mailbox("bar").unwrap();
        assert_eq!(MailboxId(4), bar);
    }

    #[test]
    fn counters() {
        let (_backend, mut store) = new_store();
        assert_eq!(0, store.cnum().unwrap());
        assert_eq!(1, store.bump_cnum().unwrap());
        assert_eq!(2, store.bump_cnum().unwrap());

        let mb = store.add_mailbox("INBOX").unwrap();
        assert_eq!(Uid::u(1), store.allocate_uid(mb).unwrap());
        assert_eq!(Uid::u(2), store.allocate_uid(mb).unwrap());
        assert_eq!(Uid::u(3), store.next_uid(mb).unwrap());

        assert_eq!(1, store.increment_message_count(mb).unwrap());
        assert_eq!(0, store.decrement_message_count(mb).unwrap());
        assert_matches!(
            Err(Error::CorruptValue { .. }),
            store.decrement_message_count(mb)
        );

        assert_eq!(1, store.increment_flag_count(mb, Flag::Seen).unwrap());
        assert_eq!(0, store.flag_count(mb, Flag::Draft).unwrap());
        assert_matches!(
            Err(Error::NxMailbox),
            store.increment_flag_count(MailboxId(99), Flag::Seen)
        );
    }

    #[test]
    fn dates() {
        let (_backend, mut store) = new_store();
        let id = new_message(&mut store);
        assert_eq!(None, store.message_date(id).unwrap());

        let date = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2020, 5, 17, 12, 30, 0)
            .unwrap();
        store.set_message_date(id, date).unwrap();
        assert_eq!(Some(date), store.message_date(id).unwrap());

        store.clear_message_date(id).unwrap();
        assert_eq!(None, store.message_date(id).unwrap());

        assert_matches!(
            Err(Error::NxMessage),
            store.set_message_date(MessageId(99), date)
        );
    }

    #[test]
    fn placements_maintain_counters() {
        let (_backend, mut store) = new_store();
        let a = store.add_mailbox("a").unwrap();
        let b = store.add_mailbox("b").unwrap();
        let msg = new_message(&mut store);
        store
            .init_message_flags(msg, FlagSet::RECENT | FlagSet::SEEN)
            .unwrap();

        store.add_placement(msg, a, Uid::u(1)).unwrap();
        store.add_placement(msg, b, Uid::u(1)).unwrap();
        assert_matches!(
            Err(Error::PlacementExists),
            store.add_placement(msg, a, Uid::u(1))
        );
        assert!(store.is_placed_in(msg, a).unwrap());
        assert!(store.has_placement(msg, a, Uid::u(1)).unwrap());
        assert!(!store.has_placement(msg, a, Uid::u(2)).unwrap());

        for &mb in &[a, b] {
            assert_eq!(1, store.message_count(mb).unwrap());
            assert_eq!(1, store.flag_count(mb, Flag::Seen).unwrap());
            assert_eq!(1, store.flag_count(mb, Flag::Recent).unwrap());
            assert_eq!(0, store.flag_count(mb, Flag::Flagged).unwrap());
        }

        // Flag changes propagate to all placements, only on a real change
        assert!(store.set_message_flag(msg, Flag::Flagged, true).unwrap());
        assert!(!store.set_message_flag(msg, Flag::Flagged, true).unwrap());
        assert!(store.set_message_flag(msg, Flag::Seen, false).unwrap());
        for &mb in &[a, b] {
            assert_eq!(1, store.flag_count(mb, Flag::Flagged).unwrap());
            assert_eq!(0, store.flag_count(mb, Flag::Seen).unwrap());
        }
        assert_matches!(
            Err(Error::NxFlag),
            store.set_message_flag(msg, Flag::Deleted, true)
        );

        store.remove_placement(msg, a, Uid::u(1)).unwrap();
        assert_matches!(
            Err(Error::NxUid),
            store.remove_placement(msg, a, Uid::u(1))
        );
        assert_eq!(0, store.message_count(a).unwrap());
        assert_eq!(0, store.flag_count(a, Flag::Flagged).unwrap());
        assert_eq!(1, store.flag_count(b, Flag::Flagged).unwrap());
        assert!(!store.is_placed_in(msg, a).unwrap());

        let placements = store.placements(msg).unwrap();
        assert_eq!(1, placements.len());
        assert!(placements[&b].contains(&Uid::u(1)));
        assert_eq!(
            vec![msg],
            store.placed_message_ids().unwrap().into_iter().collect::<Vec<_>>()
        );

        store.remove_placement(msg, b, Uid::u(1)).unwrap();
        assert!(store.placed_message_ids().unwrap().is_empty());
    }

    #[test]
    fn unknown_references_fail_before_writing() {
        let (_backend, mut store) = new_store();
        let mb = store.add_mailbox("a").unwrap();
        assert_matches!(
            Err(Error::NxMessage),
            store.add_placement(MessageId(1), mb, Uid::u(1))
        );
        let msg = new_message(&mut store);
        assert_matches!(
            Err(Error::NxMailbox),
            store.add_placement(msg, MailboxId(42), Uid::u(1))
        );
        assert!(store.placements(msg).unwrap().is_empty());
        assert_matches!(
            Err(Error::NxMessage),
            store.message_flags(MessageId(9))
        );
    }

    #[test]
    fn dirty_marker() {
        let (_backend, mut store) = new_store();
        assert!(!store.is_dirty().unwrap());
        store.set_dirty(true).unwrap();
        assert!(store.is_dirty().unwrap());
        store.set_dirty(false).unwrap();
        assert!(!store.is_dirty().unwrap());
    }
}
