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

use super::main::{close_user, exit_status, open_user, UserSubcommand};
use kvmail::account::model::{Flag, MailboxStatus};
use kvmail::account::pool::MailStorePool;

pub(super) fn stat(pool: &MailStorePool, cmd: UserSubcommand) {
    let session = open_user(pool, &cmd.user);
    let result = {
        let store = session.lock();
        store.mailbox_ids().and_then(|ids| {
            ids.into_iter()
                .map(|id| store.mailbox_status(id))
                .collect::<Result<Vec<_>, _>>()
        })
    };
    close_user(pool, session);

    match result {
        Ok(statuses) => {
            println!("{}", header());
            for status in &statuses {
                println!("{}", row(status));
            }
        }
        Err(e) => die!(exit_status(&e), "Stat of {} failed: {}", cmd.user, e),
    }
}

fn header() -> String {
    let mut line =
        format!("{:<24} {:>10} {:>8}", "MAILBOX", "VALIDITY", "MESSAGES");
    for flag in &Flag::ALL {
        line.push_str(&format!(" {:>8}", flag.name().to_uppercase()));
    }
    line
}

fn row(status: &MailboxStatus) -> String {
    let mut line = format!(
        "{:<24} {:>10} {:>8}",
        status.name, status.uid_validity, status.messages
    );
    for &flag in &Flag::ALL {
        line.push_str(&format!(" {:>8}", status.count(flag)));
    }
    line
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rows_line_up() {
        let mut status = MailboxStatus {
            name: "INBOX".to_owned(),
            uid_validity: 1,
            next_uid: 4,
            messages: 3,
            flag_counts: [0; 6],
        };
        status.flag_counts[0] = 2;

        let header = header();
        let row = row(&status);
        assert_eq!(header.len(), row.len());
        assert!(row.starts_with("INBOX "));
        assert!(row.contains("        3        2"));
    }
}
