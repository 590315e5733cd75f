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

//! One user's mail: mailboxes, messages, and the schema tying them together.
//!
//! `MailStore` is the only thing that mutates anything here. Below it,
//! `MetadataStore` holds the schema, `MessageStore` the raw message text, and
//! one `MailboxIndex` per mailbox the UID table. Above it, `MailFolder` is a
//! session's view of one selected mailbox and `MailStorePool` shares stores
//! between the sessions of one user.

pub mod folder;
pub mod mail_store;
pub mod mailbox_index;
pub mod message_store;
pub mod metadata;
pub mod model;
pub mod pool;
pub mod recovery;
