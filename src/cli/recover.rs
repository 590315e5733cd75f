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

use std::fmt::Write as _;

use super::main::{close_user, exit_status, open_user, RecoverSubcommand};
use kvmail::account::mail_store::LOST_FOUND;
use kvmail::account::pool::MailStorePool;
use kvmail::account::recovery::RecoveryReport;

pub(super) fn recover(pool: &MailStorePool, cmd: RecoverSubcommand) {
    let session = open_user(pool, &cmd.user);
    let result = session.lock().recover(cmd.refile);
    close_user(pool, session);

    match result {
        Ok(report) => print!("{}", describe(&report)),
        Err(e) => {
            die!(exit_status(&e), "Recovery of {} failed: {}", cmd.user, e)
        }
    }
}

fn describe(report: &RecoveryReport) -> String {
    let mut out = String::new();
    if let Some(old) = report.advanced_from {
        let _ = writeln!(
            out,
            "Advanced message id high-water mark from {} to {}",
            old, report.message_id_high_water
        );
    }

    if !report.placeholder_dates.is_empty() {
        let _ = writeln!(
            out,
            "Gave {} message(s) the placeholder date",
            report.placeholder_dates.len()
        );
    }

    for &(mailbox, uid) in &report.dangling {
        let _ = writeln!(
            out,
            "Dropped UID {} of mailbox {}, which referred to no message",
            uid, mailbox
        );
    }

    if report.lost_found.is_empty() {
        let _ = writeln!(out, "No messages outside of any mailbox");
    } else {
        let ids = report
            .lost_found
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        match report.refiled_into {
            Some(_) => {
                let _ = writeln!(out, "Re-filed into {}: {}", LOST_FOUND, ids);
            }
            None => {
                let _ = writeln!(
                    out,
                    "Messages outside of any mailbox: {}\n\
                     Run again with --refile to place them into {}",
                    ids, LOST_FOUND
                );
            }
        }
    }

    out
}
