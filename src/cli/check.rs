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
use kvmail::account::mail_store::CounterMismatch;
use kvmail::account::pool::MailStorePool;
use kvmail::support::sysexits::*;

pub(super) fn check(pool: &MailStorePool, cmd: UserSubcommand) {
    let session = open_user(pool, &cmd.user);
    let result = {
        let store = session.lock();
        store.check_counters().and_then(|mismatches| {
            mismatches
                .into_iter()
                .map(|m| store.mailbox_name(m.mailbox).map(|name| (name, m)))
                .collect::<Result<Vec<_>, _>>()
        })
    };
    close_user(pool, session);

    let mismatches = match result {
        Ok(m) => m,
        Err(e) => die!(exit_status(&e), "Check of {} failed: {}", cmd.user, e),
    };

    if mismatches.is_empty() {
        println!("All counters agree");
        return;
    }

    for (name, mismatch) in &mismatches {
        println!("{}", describe(name, mismatch));
    }
    EX_DATAERR.exit();
}

fn describe(mailbox_name: &str, mismatch: &CounterMismatch) -> String {
    let what = match mismatch.flag {
        Some(flag) => format!("{} count", flag),
        None => "message count".to_owned(),
    };
    format!(
        "{}: {} is {}, but {} message(s) are present",
        mailbox_name, what, mismatch.recorded, mismatch.actual
    )
}
