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

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{error, info};

use super::main::{close_user, exit_status, open_user, DeliverSubcommand};
use kvmail::account::mail_store::MailStore;
use kvmail::account::pool::MailStorePool;
use kvmail::support::error::Error;
use kvmail::support::sysexits::*;

pub(super) fn deliver(pool: &MailStorePool, cmd: DeliverSubcommand) {
    let stdin = io::stdin();
    let session = open_user(pool, &cmd.user);
    let result = run_delivery(
        &mut session.lock(),
        &cmd.mailbox,
        cmd.create,
        &cmd.inputs,
        stdin.lock(),
    );
    close_user(pool, session);

    if let Err(exit) = result {
        exit.exit();
    }
}

fn run_delivery(
    store: &mut MailStore,
    mailbox_name: &str,
    create: bool,
    inputs: &[PathBuf],
    mut stdin: impl Read,
) -> Result<(), Sysexit> {
    let mailbox = match store.mailbox_id(mailbox_name) {
        Ok(Some(id)) => id,
        Ok(None) if create => store.add_mailbox(mailbox_name).map_err(|e| {
            error!("Failed to create {}: {}", mailbox_name, e);
            EX_CANTCREAT
        })?,
        Ok(None) => {
            error!("{}: Non-existent mailbox", mailbox_name);
            return Err(EX_CANTCREAT);
        }
        Err(e) => {
            error!("Failed to look up {}: {}", mailbox_name, e);
            return Err(exit_status(&e));
        }
    };

    let mut messages = Vec::with_capacity(inputs.len());
    for input in inputs {
        match read_input(input, &mut stdin) {
            Ok(data) => messages.push((input, data)),
            Err(e) => {
                error!("Unable to read {}: {}", input.display(), e);
                return Err(match e {
                    Error::Io(ref e) if io::ErrorKind::NotFound == e.kind() => {
                        EX_NOINPUT
                    }
                    _ => EX_IOERR,
                });
            }
        }
    }

    for (input, data) in messages {
        match store.add_message(mailbox, &data, None) {
            Ok((id, uid)) => info!(
                "Delivered {} to {} as message {}, UID {}",
                input.display(),
                mailbox_name,
                id,
                uid
            ),
            Err(e) => {
                error!("Unable to deliver {}: {}", input.display(), e);
                return Err(match e {
                    Error::Io(_) => EX_UNAVAILABLE,
                    ref e => exit_status(e),
                });
            }
        }
    }

    Ok(())
}

fn read_input(item: &Path, stdin: &mut impl Read) -> Result<Vec<u8>, Error> {
    let mut data = Vec::new();
    if Path::new("-") == item {
        stdin.read_to_end(&mut data)?;
    } else {
        fs::File::open(item)?.read_to_end(&mut data)?;
    }

    Ok(normalise_line_endings(data))
}

/// If the first line of `data` ends with a bare LF, convert every bare LF to
/// CRLF. Otherwise, return `data` unchanged.
fn normalise_line_endings(data: Vec<u8>) -> Vec<u8> {
    let first_lf = match data.iter().position(|&b| b'\n' == b) {
        Some(ix) => ix,
        None => return data,
    };

    if first_lf > 0 && b'\r' == data[first_lf - 1] {
        return data;
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut prev = 0u8;
    for b in data {
        if b'\n' == b && b'\r' != prev {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}
