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

use super::mail_store::MailStore;
use super::model::*;
use crate::support::error::Error;

/// A session's view of one selected mailbox.
///
/// Sequence numbers follow UID order, not message id order; a copied message
/// can have a lower message id than its neighbours.
///
/// The folder caches the UID list of the mailbox as of its last `reload()`,
/// which is what sequence numbers are relative to. Other sessions can change
/// the mailbox at any time; `updated()` tells whether that has happened since
/// the snapshot was taken.
#[derive(Clone, Debug)]
pub struct MailFolder {
    mailbox: MailboxId,
    /// Ascending by UID, i.e. in arrival order.
    messages: Vec<(Uid, MessageId)>,
    cnum: u64,
}

impl MailFolder {
    pub(super) fn open(
        store: &MailStore,
        mailbox: MailboxId,
    ) -> Result<Self, Error> {
        let mut this = MailFolder {
            mailbox,
            messages: Vec::new(),
            cnum: 0,
        };
        this.reload(store)?;
        Ok(this)
    }

    pub fn mailbox_id(&self) -> MailboxId {
        self.mailbox
    }

    /// The number of messages in the snapshot.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The change counter the snapshot was taken at.
    pub fn cnum(&self) -> u64 {
        self.cnum
    }

    /// Return whether anything in the store has changed since the snapshot.
    pub fn updated(&self, store: &MailStore) -> Result<bool, Error> {
        Ok(store.cnum()? != self.cnum)
    }

    /// Rebuild the snapshot from `store`.
    pub fn reload(&mut self, store: &MailStore) -> Result<(), Error> {
        // Read the counter first so a change racing with the read shows up
        // as an update next time rather than being lost.
        let cnum = store.cnum()?;
        self.messages = store.entries(self.mailbox)?;
        self.cnum = cnum;
        Ok(())
    }

    pub fn seqnum_to_uid(&self, seqnum: Seqnum) -> Option<Uid> {
        self.messages.get(seqnum.to_index()).map(|&(uid, _)| uid)
    }

    pub fn uid_to_seqnum(&self, uid: Uid) -> Option<Seqnum> {
        self.messages
            .binary_search_by_key(&uid, |&(u, _)| u)
            .ok()
            .map(Seqnum::from_index)
    }

    pub fn message_id(&self, seqnum: Seqnum) -> Option<MessageId> {
        self.messages.get(seqnum.to_index()).map(|&(_, id)| id)
    }

    pub fn max_uid(&self) -> Option<Uid> {
        self.messages.last().map(|&(uid, _)| uid)
    }

    /// Parse an IMAP message set against the snapshot.
    ///
    /// If `uid` is false, the set is of sequence numbers, `*` is the last
    /// sequence number, and naming one past the end is an error. If `uid` is
    /// true, the set is of UIDs, `*` is the highest UID, and UIDs not in the
    /// snapshot are ignored. Either way the result is the sequence numbers
    /// selected.
    pub fn parse_message_set(
        &self,
        raw: &str,
        uid: bool,
    ) -> Result<SeqRange<Seqnum>, Error> {
        let mut result = SeqRange::new();

        if uid {
            let max_uid = self.max_uid().map_or(0, u32::from);
            let uids = SeqRange::<Uid>::parse(raw, max_uid)?;
            for (ix, &(uid, _)) in self.messages.iter().enumerate() {
                if uids.contains(uid) {
                    result.append(Seqnum::from_index(ix));
                }
            }
        } else {
            let count = self.messages.len() as u32;
            let seqnums = SeqRange::<Seqnum>::parse(raw, count)?;
            if seqnums.max().map_or(false, |max| max > count) {
                return Err(Error::BadMessageSet);
            }
            for seqnum in seqnums.items(count) {
                result.append(seqnum);
            }
        }

        Ok(result)
    }

    /// Expunge the mailbox, returning the sequence numbers of the removed
    /// messages, ascending.
    ///
    /// The sequence numbers are those of the snapshot as of the last reload
    /// and are not adjusted for earlier removals in the same batch. Messages
    /// which arrived after the last reload have no sequence number and are
    /// not reported. The snapshot is reloaded afterwards.
    pub fn expunge(
        &mut self,
        store: &mut MailStore,
    ) -> Result<Vec<Seqnum>, Error> {
        let removed = store.expunge(self.mailbox)?;
        let seqnums = removed
            .into_iter()
            .filter_map(|uid| self.uid_to_seqnum(uid))
            .collect::<Vec<_>>();
        self.reload(store)?;
        Ok(seqnums)
    }

    /// Close the folder: expunge, then clear `\Recent` on everything that
    /// remains, since this session has now seen it.
    pub fn close(mut self, store: &mut MailStore) -> Result<(), Error> {
        self.expunge(store)?;

        let mut cleared = 0;
        for &(uid, _) in &self.messages {
            if store.set_flag(self.mailbox, uid, Flag::Recent, false)? {
                cleared += 1;
            }
        }

        debug!(
            "{} Closed folder {}, {} message(s) no longer recent",
            store.log_prefix(),
            self.mailbox,
            cleared
        );
        Ok(())
    }
}
