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
use std::mem;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use kvmail::account::pool::{MailStorePool, PooledMailStore};
use kvmail::support::error::Error;
use kvmail::support::sysexits::*;
use kvmail::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    Recover(RecoverSubcommand),
    /// Verify that a user's mailbox counters agree with the messages.
    ///
    /// Every mailbox's message count and per-flag counts are recomputed from
    /// the placements and compared with the stored values. Any mismatch is
    /// printed and the command exits with EX_DATAERR.
    Check(UserSubcommand),
    Deliver(DeliverSubcommand),
    /// List a user's mailboxes with their counters.
    Stat(UserSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// The directory containing `kvmail.toml` etc
    /// [default: /etc/kvmail or /usr/local/etc/kvmail]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
pub(super) struct UserSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// The user whose store to operate on.
    pub(super) user: String,
}

/// Run the recovery scan over a user's store.
///
/// This advances the message id allocator past any message text found on
/// disk, gives a placeholder date to messages whose date was lost, and lists
/// messages which are in no mailbox at all. With --refile, those messages
/// are placed into the LOST+FOUND mailbox.
///
/// The scan also runs automatically when a store which was not closed
/// cleanly is opened, but never re-files anything on its own.
#[derive(StructOpt)]
pub(super) struct RecoverSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Place messages which are in no mailbox into LOST+FOUND.
    #[structopt(long)]
    pub(super) refile: bool,

    /// The user whose store to scan.
    pub(super) user: String,
}

/// Deliver raw messages into a user's mailbox.
///
/// Each input is added as one message, dated now and marked \Recent. Inputs
/// are read in full before anything is stored.
#[derive(StructOpt)]
pub(super) struct DeliverSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Deliver to this mailbox.
    #[structopt(short, long, default_value = "INBOX")]
    pub(super) mailbox: String,

    /// Create the destination mailbox if it does not already exist.
    #[structopt(short, long)]
    pub(super) create: bool,

    /// The user to deliver to.
    pub(super) user: String,

    /// The files to deliver. "-" will read from stdin.
    #[structopt(parse(from_os_str), default_value = "-")]
    pub(super) inputs: Vec<PathBuf>,
}

impl Command {
    fn common_options(&mut self) -> CommonOptions {
        match *self {
            Command::Recover(ref mut c) => mem::take(&mut c.common),
            Command::Check(ref mut c) | Command::Stat(ref mut c) => {
                mem::take(&mut c.common)
            }
            Command::Deliver(ref mut c) => mem::take(&mut c.common),
        }
    }
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let mut cmd = Command::from_clap(&match Command::clap().get_matches_safe()
    {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let common = cmd.common_options();
    let root = common.root.unwrap_or_else(|| {
        if Path::new("/etc/kvmail/kvmail.toml").is_file() {
            "/etc/kvmail".to_owned().into()
        } else if Path::new("/usr/local/etc/kvmail/kvmail.toml").is_file() {
            "/usr/local/etc/kvmail".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/kvmail nor /usr/local/etc/kvmail looks like\n\
                 the Kvmail root; use --root=/path/to/kvmail if your\n\
                 installation is elsewhere."
            )
        }
    });

    let system_config = load_config(&root);
    init_logging(&root);

    let pool = MailStorePool::new(&system_config);
    match cmd {
        Command::Recover(cmd) => super::recover::recover(&pool, cmd),
        Command::Check(cmd) => super::check::check(&pool, cmd),
        Command::Deliver(cmd) => super::deliver::deliver(&pool, cmd),
        Command::Stat(cmd) => super::stat::stat(&pool, cmd),
    }
}

fn load_config(root: &Path) -> SystemConfig {
    let system_config_path = root.join("kvmail.toml");
    let system_config_toml = match fs::read(&system_config_path) {
        Ok(data) => data,
        Err(e) => die!(
            EX_CONFIG,
            "Error reading '{}': {}",
            system_config_path.display(),
            e
        ),
    };

    match toml::from_slice(&system_config_toml) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            system_config_path.display(),
            e
        ),
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        kvmail::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            die!(
                EX_CONFIG,
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        let logger = match syslog::unix(formatter) {
            Ok(logger) => logger,
            Err(e) => die!(EX_SOFTWARE, "Failed to connect to syslog: {}", e),
        };
        if let Err(e) =
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
        {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
    }
}

/// Map a store error to the exit status reported for it.
pub(super) fn exit_status(e: &Error) -> Sysexit {
    match *e {
        Error::UnsafeName => EX_NOUSER,
        Error::Io(_) => EX_IOERR,
        Error::ChecksumMismatch(_) | Error::CorruptValue { .. } => EX_DATAERR,
        ref e if e.is_timeout() => EX_TEMPFAIL,
        _ => EX_SOFTWARE,
    }
}

/// Obtain `user`'s store from `pool`, or exit.
pub(super) fn open_user(pool: &MailStorePool, user: &str) -> PooledMailStore {
    match pool.get(user) {
        Ok(store) => store,
        Err(e) => die!(exit_status(&e), "Failed to open {}: {}", user, e),
    }
}

/// Give `store` back to `pool`, closing it, or exit.
pub(super) fn close_user(pool: &MailStorePool, store: PooledMailStore) {
    let user = store.key().clone();
    if let Err(e) = pool.put(store) {
        die!(exit_status(&e), "Failed to close {}: {}", user, e);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exit_statuses() {
        assert_eq!(EX_NOUSER, exit_status(&Error::UnsafeName));
        assert_eq!(EX_TEMPFAIL, exit_status(&Error::WriteLockTimeout));
        assert_eq!(
            EX_DATAERR,
            exit_status(&Error::ChecksumMismatch("cnum".to_owned()))
        );
        assert_eq!(EX_SOFTWARE, exit_status(&Error::NxMailbox));
    }

    #[test]
    fn parse_deliver() {
        let cmd = Command::from_iter_safe(&[
            "kvmail", "deliver", "-c", "-m", "Archive", "alice", "a.eml",
            "b.eml",
        ])
        .unwrap();
        match cmd {
            Command::Deliver(cmd) => {
                assert!(cmd.create);
                assert_eq!("Archive", cmd.mailbox);
                assert_eq!("alice", cmd.user);
                assert_eq!(
                    vec![PathBuf::from("a.eml"), PathBuf::from("b.eml")],
                    cmd.inputs
                );
            }
            _ => panic!("parsed as wrong subcommand"),
        }
    }
}
