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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe user name")]
    UnsafeName,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such message")]
    NxMessage,
    #[error("No such UID in mailbox")]
    NxUid,
    #[error("Unknown flag")]
    NxFlag,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("UID already in use in mailbox")]
    UidExists,
    #[error("Message already placed at that UID")]
    PlacementExists,
    #[error("Message is not marked \\Deleted in this mailbox")]
    UidNotDeleted,
    #[error("Malformed message set")]
    BadMessageSet,
    #[error("Timed out waiting for read lock")]
    ReadLockTimeout,
    #[error("Timed out waiting for write lock")]
    WriteLockTimeout,
    #[error("Illegal lock state: {0}")]
    IllegalLockState(&'static str),
    #[error("Handle does not belong to this pool")]
    ForeignHandle,
    #[error("Checksum mismatch on key {0:?}")]
    ChecksumMismatch(String),
    #[error("Corrupt value at key {key:?}: {reason}")]
    CorruptValue { key: String, reason: String },
    #[error("Publisher has been detached")]
    PublisherDetached,
    #[error("Publisher/subscriber pair is not registered")]
    SubscriptionMismatch,
    #[error("Store is closed")]
    StoreClosed,
    #[error("Store must be closed first")]
    StoreNotClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this is a lock timeout, which callers may retry.
    pub fn is_timeout(&self) -> bool {
        matches!(*self, Error::ReadLockTimeout | Error::WriteLockTimeout)
    }

    /// Whether this error names something that does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            *self,
            Error::NxMailbox | Error::NxMessage | Error::NxUid | Error::NxFlag
        )
    }

    /// Whether this error is a naming or placement conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(
            *self,
            Error::MailboxExists | Error::UidExists | Error::PlacementExists
        )
    }

    pub(crate) fn corrupt(key: &str, reason: impl ToString) -> Self {
        Error::CorruptValue {
            key: key.to_owned(),
            reason: reason.to_string(),
        }
    }
}
