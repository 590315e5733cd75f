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

//! The single mutation boundary for one user's mail.
//!
//! A `MailStore` owns the metadata store, the message store, and one
//! `MailboxIndex` per mailbox. Every mutation goes through here so that the
//! three never drift apart in normal operation, and every mutation bumps the
//! change counter so that sessions can notice that something happened.
//!
//! Composite operations are ordered so that a crash between steps leaves at
//! worst an orphan: message text with no placement, or a mailbox index entry
//! with no placement. Nothing ever refers to text which does not exist, and
//! `recover()` finds and clears both kinds of orphan.

use std::collections::{BTreeMap, BTreeSet};

use chrono::prelude::*;
use log::{debug, info, warn};

use super::folder::MailFolder;
use super::mailbox_index::MailboxIndex;
use super::message_store::MessageStore;
use super::metadata::MetadataStore;
use super::model::*;
use super::recovery::RecoveryReport;
use crate::storage::StoreOpener;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// The mailbox orphaned messages are re-filed into.
pub const LOST_FOUND: &str = "LOST+FOUND";

fn index_name(id: MailboxId) -> String {
    format!("mailbox-{}", id)
}

/// Case-fold `INBOX`, which is the only mailbox name that is not
/// case-sensitive.
fn normalise_name(name: &str) -> &str {
    if name.eq_ignore_ascii_case("inbox") {
        "INBOX"
    } else {
        name
    }
}

/// A disagreement between a stored counter and the placements it summarises.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterMismatch {
    pub mailbox: MailboxId,
    /// The flag whose counter is wrong, or `None` for the message count.
    pub flag: Option<Flag>,
    pub recorded: u64,
    pub actual: u64,
}

pub struct MailStore {
    log_prefix: LogPrefix,
    opener: StoreOpener,
    metadata: MetadataStore,
    messages: MessageStore,
    indices: BTreeMap<MailboxId, MailboxIndex>,
    closed: bool,
}

impl MailStore {
    /// Open the store whose parts are reached through `opener`.
    ///
    /// If the store was not cleanly closed last time, the recovery scan runs
    /// before this returns.
    pub fn open(
        log_prefix: LogPrefix,
        opener: StoreOpener,
    ) -> Result<Self, Error> {
        let metadata = MetadataStore::new(
            log_prefix.deep_clone("metadata"),
            opener("meta")?,
        );
        let messages = MessageStore::open(
            log_prefix.deep_clone("messages"),
            opener("message-text")?,
            metadata.message_id_high_water()?,
        )?;

        let mut indices = BTreeMap::new();
        for id in metadata.mailbox_ids()? {
            indices.insert(id, MailboxIndex::new(opener(&index_name(id))?));
        }

        let mut this = MailStore {
            log_prefix,
            opener,
            metadata,
            messages,
            indices,
            closed: false,
        };

        if this.metadata.is_dirty()? {
            warn!(
                "{} Store was not closed cleanly; running recovery",
                this.log_prefix
            );
            this.recover(false)?;
        }

        this.metadata.set_dirty(true)?;
        this.metadata.sync()?;
        debug!(
            "{} Opened with {} mailbox(es)",
            this.log_prefix,
            this.indices.len()
        );
        Ok(this)
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    fn index(&self, id: MailboxId) -> Result<&MailboxIndex, Error> {
        self.indices.get(&id).ok_or(Error::NxMailbox)
    }

    // ----- mailboxes -----

    /// Create a mailbox, returning its id (which is also its UIDVALIDITY).
    pub fn add_mailbox(&mut self, name: &str) -> Result<MailboxId, Error> {
        let id = self.metadata.add_mailbox(normalise_name(name))?;
        let index = MailboxIndex::new((self.opener)(&index_name(id))?);
        self.indices.insert(id, index);
        self.metadata.bump_cnum()?;
        Ok(id)
    }

    /// Delete a mailbox and every placement within it.
    ///
    /// Messages themselves are kept even if this leaves them with no
    /// placement at all.
    pub fn delete_mailbox(&mut self, id: MailboxId) -> Result<(), Error> {
        self.metadata.mailbox_name(id)?;

        let entries = self.index(id)?.entries()?;
        for (uid, message_id) in entries {
            self.unplace(id, uid, message_id, false)?;
        }

        if let Some(index) = self.indices.remove(&id) {
            index.destroy()?;
        }
        self.metadata.delete_mailbox(id)?;
        self.metadata.bump_cnum()?;
        Ok(())
    }

    pub fn rename_mailbox(
        &mut self,
        id: MailboxId,
        new_name: &str,
    ) -> Result<(), Error> {
        self.metadata.rename_mailbox(id, normalise_name(new_name))?;
        self.metadata.bump_cnum()?;
        Ok(())
    }

    pub fn mailbox_id(&self, name: &str) -> Result<Option<MailboxId>, Error> {
        self.metadata.mailbox_id(normalise_name(name))
    }

    pub fn mailbox_name(&self, id: MailboxId) -> Result<String, Error> {
        self.metadata.mailbox_name(id)
    }

    pub fn mailbox_ids(&self) -> Result<BTreeSet<MailboxId>, Error> {
        self.metadata.mailbox_ids()
    }

    pub fn mailbox_status(
        &self,
        id: MailboxId,
    ) -> Result<MailboxStatus, Error> {
        self.metadata.mailbox_status(id)
    }

    pub fn uid_validity(&self, id: MailboxId) -> Result<u32, Error> {
        self.index(id)?;
        Ok(id.0)
    }

    pub fn cnum(&self) -> Result<u64, Error> {
        self.metadata.cnum()
    }

    // ----- messages -----

    /// Deliver `text` into `mailbox`.
    ///
    /// The new message is `\Recent` and has no other flags. `date` defaults
    /// to the current time.
    pub fn add_message(
        &mut self,
        mailbox: MailboxId,
        text: &[u8],
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<(MessageId, Uid), Error> {
        self.metadata.mailbox_name(mailbox)?;
        self.index(mailbox)?;

        let id = self.messages.add(text)?;
        self.metadata.advance_message_id(id)?;
        self.metadata.set_message_date(
            id,
            date.unwrap_or_else(|| Local::now().into()),
        )?;
        self.metadata.init_message_flags(id, FlagSet::RECENT)?;

        let uid = self.place(id, mailbox)?;
        self.metadata.bump_cnum()?;
        debug!(
            "{} Delivered message {} into {} as UID {}",
            self.log_prefix, id, mailbox, uid
        );
        Ok((id, uid))
    }

    /// Allocate a UID in `mailbox` for `id` and record it.
    ///
    /// The index entry is written before the placement, so the index is
    /// always a superset of the placements.
    fn place(
        &mut self,
        id: MessageId,
        mailbox: MailboxId,
    ) -> Result<Uid, Error> {
        let uid = self.metadata.allocate_uid(mailbox)?;
        self.indices
            .get_mut(&mailbox)
            .ok_or(Error::NxMailbox)?
            .add(uid, id)?;
        self.metadata.add_placement(id, mailbox, uid)?;
        Ok(uid)
    }

    /// Take the index entry at `uid` out of `mailbox` along with its
    /// placement.
    ///
    /// This is `place()` in reverse: the placement goes first and the index
    /// entry after it, with the `\Deleted` counter adjusted last. An entry
    /// with no placement is removed all the same. With `expunging`, the entry
    /// must be marked `\Deleted`.
    fn unplace(
        &mut self,
        mailbox: MailboxId,
        uid: Uid,
        id: MessageId,
        expunging: bool,
    ) -> Result<(), Error> {
        if self.metadata.has_placement(id, mailbox, uid)? {
            self.metadata.remove_placement(id, mailbox, uid)?;
        } else {
            warn!(
                "{} UID {} in {} has no placement; dropping it",
                self.log_prefix, uid, mailbox
            );
        }

        let index = self.indices.get_mut(&mailbox).ok_or(Error::NxMailbox)?;
        let deleted = index.is_deleted(uid)?;
        if expunging {
            index.expunge(uid)?;
        } else {
            index.remove(uid)?;
        }

        if deleted {
            self.metadata.decrement_flag_count(mailbox, Flag::Deleted)?;
        }
        Ok(())
    }

    /// Place message `id` into `dest`, returning its UID there.
    ///
    /// If the message is already in `dest`, nothing is placed and the
    /// existing UID is returned. Flags are message-scoped, so a copy shares
    /// the flags of the original.
    pub fn copy_message(
        &mut self,
        id: MessageId,
        dest: MailboxId,
    ) -> Result<Uid, Error> {
        if !self.messages.exists(id)? {
            return Err(Error::NxMessage);
        }
        self.metadata.mailbox_name(dest)?;
        self.index(dest)?;

        let existing = self
            .metadata
            .placements(id)?
            .get(&dest)
            .and_then(|uids| uids.iter().next().copied());
        let uid = match existing {
            Some(uid) => uid,
            None => self.place(id, dest)?,
        };

        self.metadata.bump_cnum()?;
        Ok(uid)
    }

    pub fn message_text(&self, id: MessageId) -> Result<Vec<u8>, Error> {
        self.messages.get(id)
    }

    pub fn message_date(
        &self,
        id: MessageId,
    ) -> Result<Option<DateTime<FixedOffset>>, Error> {
        self.metadata.message_date(id)
    }

    pub fn message_id_of(
        &self,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<MessageId, Error> {
        self.index(mailbox)?.message_id(uid)
    }

    /// Return every UID in `mailbox`, ascending.
    pub fn uids(&self, mailbox: MailboxId) -> Result<Vec<Uid>, Error> {
        self.index(mailbox)?.uids()
    }

    /// Return `(uid, message id)` for every message in `mailbox`, ascending
    /// by UID.
    pub fn entries(
        &self,
        mailbox: MailboxId,
    ) -> Result<Vec<(Uid, MessageId)>, Error> {
        self.index(mailbox)?.entries()
    }

    // ----- flags -----

    /// Return all flags of the message at `uid` in `mailbox`, including the
    /// mailbox-local `\Deleted`.
    pub fn message_flags(
        &self,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<FlagSet, Error> {
        let index = self.index(mailbox)?;
        let mut flags = self.metadata.message_flags(index.message_id(uid)?)?;
        flags.set(FlagSet::DELETED, index.is_deleted(uid)?);
        Ok(flags)
    }

    pub fn get_flag(
        &self,
        mailbox: MailboxId,
        uid: Uid,
        flag: Flag,
    ) -> Result<bool, Error> {
        let index = self.index(mailbox)?;
        if flag.is_placement_local() {
            index.is_deleted(uid)
        } else {
            self.metadata.message_flag(index.message_id(uid)?, flag)
        }
    }

    /// Set or clear `flag` on the message at `uid` in `mailbox`, returning
    /// whether anything changed.
    ///
    /// `\Deleted` only affects this mailbox; every other flag affects the
    /// message wherever it is placed.
    pub fn set_flag(
        &mut self,
        mailbox: MailboxId,
        uid: Uid,
        flag: Flag,
        value: bool,
    ) -> Result<bool, Error> {
        let index = self.indices.get_mut(&mailbox).ok_or(Error::NxMailbox)?;

        let changed = if flag.is_placement_local() {
            let was = index.set_deleted(uid, value)?;
            if was != value {
                if value {
                    self.metadata.increment_flag_count(mailbox, flag)?;
                } else {
                    self.metadata.decrement_flag_count(mailbox, flag)?;
                }
            }
            was != value
        } else {
            let id = index.message_id(uid)?;
            self.metadata.set_message_flag(id, flag, value)?
        };

        self.metadata.bump_cnum()?;
        Ok(changed)
    }

    /// Remove every message marked `\Deleted` from `mailbox`, returning the
    /// UIDs removed, ascending.
    pub fn expunge(&mut self, mailbox: MailboxId) -> Result<Vec<Uid>, Error> {
        let index = self.index(mailbox)?;
        let mut doomed = Vec::new();
        for (uid, id) in index.entries()? {
            if index.is_deleted(uid)? {
                doomed.push((uid, id));
            }
        }

        let mut expunged = Vec::with_capacity(doomed.len());
        for (uid, id) in doomed {
            self.unplace(mailbox, uid, id, true)?;
            expunged.push(uid);
        }

        self.metadata.bump_cnum()?;
        if !expunged.is_empty() {
            info!(
                "{} Expunged {} message(s) from {}",
                self.log_prefix,
                expunged.len(),
                mailbox
            );
        }
        Ok(expunged)
    }

    /// Select `mailbox` for a session.
    pub fn select(&self, mailbox: MailboxId) -> Result<MailFolder, Error> {
        MailFolder::open(self, mailbox)
    }

    // ----- maintenance -----

    /// Run the recovery scan over the whole store.
    ///
    /// Mailbox index entries with no placement behind them are dropped. If
    /// `refile` is set, messages with no placement are put into the
    /// `LOST+FOUND` mailbox, which is created if needed.
    pub fn recover(&mut self, refile: bool) -> Result<RecoveryReport, Error> {
        let mut report = self.metadata.recover(&self.messages)?;

        let mut dangling = Vec::new();
        for (&mailbox, index) in &self.indices {
            for (uid, id) in index.entries()? {
                if !self.metadata.has_placement(id, mailbox, uid)? {
                    dangling.push((mailbox, uid, id));
                }
            }
        }
        for &(mailbox, uid, id) in &dangling {
            self.unplace(mailbox, uid, id, false)?;
            report.dangling.push((mailbox, uid));
        }
        if !dangling.is_empty() {
            self.metadata.bump_cnum()?;
        }

        if refile && !report.lost_found.is_empty() {
            let mailbox = match self.metadata.mailbox_id(LOST_FOUND)? {
                Some(id) => id,
                None => self.add_mailbox(LOST_FOUND)?,
            };

            for &id in &report.lost_found {
                let uid = self.place(id, mailbox)?;
                info!(
                    "{} Re-filed message {} into {} as UID {}",
                    self.log_prefix, id, LOST_FOUND, uid
                );
            }

            self.metadata.bump_cnum()?;
            report.refiled_into = Some(mailbox);
        }

        Ok(report)
    }

    /// Recompute every mailbox's message and flag counters from the
    /// placements and index entries, and report any that disagree with the
    /// stored values.
    pub fn check_counters(&self) -> Result<Vec<CounterMismatch>, Error> {
        let mut actual: BTreeMap<MailboxId, (u64, [u64; 6])> = self
            .indices
            .keys()
            .map(|&id| (id, (0, [0; 6])))
            .collect();

        for id in self.metadata.placed_message_ids()? {
            let flags = self.metadata.message_flags(id)?;
            for (mailbox, uids) in self.metadata.placements(id)? {
                let counts = actual.entry(mailbox).or_default();
                counts.0 += uids.len() as u64;
                for (ix, &flag) in Flag::ALL.iter().enumerate() {
                    if flags.contains(flag.bit()) {
                        counts.1[ix] += uids.len() as u64;
                    }
                }
            }
        }

        let deleted_ix = Flag::ALL
            .iter()
            .position(|f| f.is_placement_local())
            .unwrap_or(0);
        let mut index_sizes = BTreeMap::new();
        for (&mailbox, index) in &self.indices {
            let counts = actual.entry(mailbox).or_default();
            let uids = index.uids()?;
            for &uid in &uids {
                if index.is_deleted(uid)? {
                    counts.1[deleted_ix] += 1;
                }
            }
            index_sizes.insert(mailbox, uids.len() as u64);
        }

        let mut mismatches = Vec::new();
        for (mailbox, (messages, flag_counts)) in actual {
            let status = self.metadata.mailbox_status(mailbox)?;
            // The message count must agree with both the placements and the
            // index entries; report each distinct disagreement once.
            let index_size = index_sizes.get(&mailbox).copied().unwrap_or(0);
            let mut reported = BTreeSet::new();
            for &count in &[messages, index_size] {
                if status.messages != count && reported.insert(count) {
                    mismatches.push(CounterMismatch {
                        mailbox,
                        flag: None,
                        recorded: status.messages,
                        actual: count,
                    });
                }
            }

            for (ix, &flag) in Flag::ALL.iter().enumerate() {
                if status.flag_counts[ix] != flag_counts[ix] {
                    mismatches.push(CounterMismatch {
                        mailbox,
                        flag: Some(flag),
                        recorded: status.flag_counts[ix],
                        actual: flag_counts[ix],
                    });
                }
            }
        }

        Ok(mismatches)
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        self.messages.sync()?;
        for index in self.indices.values_mut() {
            index.sync()?;
        }
        self.metadata.sync()
    }

    /// Sync everything and release the underlying stores.
    ///
    /// The dirty marker is cleared only once everything else is on disk.
    /// Closing an already closed store does nothing.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }

        self.sync()?;
        self.metadata.set_dirty(false)?;
        self.messages.close()?;
        for index in self.indices.values_mut() {
            index.close()?;
        }
        self.metadata.close()?;
        self.closed = true;
        debug!("{} Closed", self.log_prefix);
        Ok(())
    }
}
