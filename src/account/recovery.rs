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

//! Offline consistency repair after an unclean shutdown.
//!
//! Operations on the account are not transactional, so a crash can leave
//! behind message text with no metadata, or metadata which has fallen behind
//! the message store. Operations are ordered such that the worst case is an
//! orphan or a mailbox index entry with no placement, never a placement
//! referring to missing text. The scan here finds orphans; dropping stale
//! index entries is up to the mail store, which owns the indices.

use std::collections::BTreeSet;

use chrono::prelude::*;
use log::warn;

use super::message_store::MessageStore;
use super::metadata::MetadataStore;
use super::model::*;
use crate::support::error::Error;

/// What the recovery scan found and did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// If the message id high-water mark was behind the message store, its
    /// old value.
    pub advanced_from: Option<MessageId>,
    /// The high-water mark after the scan.
    pub message_id_high_water: MessageId,
    /// Messages which had no date and were given the placeholder date.
    pub placeholder_dates: Vec<MessageId>,
    /// Messages present in the message store but placed in no mailbox.
    pub lost_found: BTreeSet<MessageId>,
    /// Mailbox index entries which had no placement and were dropped.
    pub dangling: Vec<(MailboxId, Uid)>,
    /// If the lost-and-found messages were re-filed, the mailbox they were
    /// placed into.
    pub refiled_into: Option<MailboxId>,
}

/// The date given to messages whose real date was lost.
pub fn placeholder_date() -> DateTime<FixedOffset> {
    Utc.timestamp_opt(0, 0).unwrap().into()
}

impl MetadataStore {
    /// Scan `messages` against the metadata.
    ///
    /// This advances the message id high-water mark to the largest id in
    /// `messages`, gives the placeholder date to any message without one, and
    /// reports messages with text but no placement. Nothing else is
    /// repaired; in particular, orphans are reported, not re-filed.
    pub fn recover(
        &mut self,
        messages: &MessageStore,
    ) -> Result<RecoveryReport, Error> {
        let mut report = RecoveryReport::default();
        let ids = messages.ids()?;

        let old_high_water = self.message_id_high_water()?;
        if let Some(&max) = ids.last() {
            if max > old_high_water {
                warn!(
                    "{} Message id high-water mark was {} but message {} \
                     exists",
                    self.log_prefix(),
                    old_high_water,
                    max
                );
                self.advance_message_id(max)?;
                report.advanced_from = Some(old_high_water);
            }
        }
        report.message_id_high_water = self.message_id_high_water()?;

        let placed = self.placed_message_ids()?;
        for &id in &ids {
            if self.message_date(id)?.is_none() {
                self.set_message_date(id, placeholder_date())?;
                report.placeholder_dates.push(id);
            }

            if !placed.contains(&id) {
                report.lost_found.insert(id);
            }
        }

        if !report.lost_found.is_empty() {
            warn!(
                "{} {} message(s) have no mailbox: {:?}",
                self.log_prefix(),
                report.lost_found.len(),
                report.lost_found
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryBackend;
    use crate::support::log_prefix::LogPrefix;

    #[test]
    fn scan_finds_orphans_and_advances() {
        let backend = MemoryBackend::new();
        let prefix = LogPrefix::new("recover".to_owned());
        let mut meta =
            MetadataStore::new(prefix.clone(), Box::new(backend.open("meta")));
        let mut text = MessageStore::open(
            prefix,
            Box::new(backend.open("message-text")),
            MessageId(0),
        )
        .unwrap();

        let inbox = meta.add_mailbox("INBOX").unwrap();

        // A properly filed message
        let filed = text.add(b"filed").unwrap();
        meta.advance_message_id(filed).unwrap();
        meta.set_message_date(filed, Utc::now().into()).unwrap();
        meta.init_message_flags(filed, FlagSet::RECENT).unwrap();
        meta.add_placement(filed, inbox, Uid::u(1)).unwrap();

        // Text was stored, then we crashed before any metadata was written
        let orphan = text.add(b"orphan").unwrap();

        let report = meta.recover(&text).unwrap();
        assert_eq!(Some(filed), report.advanced_from);
        assert_eq!(orphan, report.message_id_high_water);
        assert_eq!(vec![orphan], report.placeholder_dates);
        assert_eq!(
            vec![orphan],
            report.lost_found.iter().copied().collect::<Vec<_>>()
        );
        assert_eq!(
            Some(placeholder_date()),
            meta.message_date(orphan).unwrap()
        );

        // Running again changes nothing more
        let report = meta.recover(&text).unwrap();
        assert_eq!(None, report.advanced_from);
        assert!(report.placeholder_dates.is_empty());
        assert_eq!(1, report.lost_found.len());
    }
}
