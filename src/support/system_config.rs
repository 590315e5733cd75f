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

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The contents of `kvmail.toml`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Where and how user data is stored.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Timeouts for the shared-state primitives.
    ///
    /// The defaults are reasonable for most installations.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One CBOR file per logical store under the user directory.
    File,
    /// Process-local maps. Nothing survives a restart.
    Memory,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::File
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// The directory holding one subdirectory per user.
    pub root: PathBuf,
    /// Which key-value backend to open stores with.
    pub backend: BackendKind,
    /// If true, every value is stored with a digest which is verified on
    /// read.
    pub checksum: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: PathBuf::from("/var/lib/kvmail"),
            backend: BackendKind::default(),
            checksum: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// How long to wait on a user's pool entry before giving up.
    pub pool_lock_timeout_ms: u64,
    /// The initial wait of a detachable write lock attempt.
    pub detach_first_timeout_ms: u64,
    /// The per-attempt wait of a detached write lock retry.
    pub detach_retry_timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        ConcurrencyConfig {
            pool_lock_timeout_ms: 5_000,
            detach_first_timeout_ms: 100,
            detach_retry_timeout_ms: 10_000,
        }
    }
}

impl ConcurrencyConfig {
    pub fn pool_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_lock_timeout_ms)
    }

    pub fn detach_first_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_first_timeout_ms)
    }

    pub fn detach_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_retry_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!(BackendKind::File, config.storage.backend);
        assert!(config.storage.checksum);
        assert_eq!(
            Duration::from_secs(5),
            config.concurrency.pool_lock_timeout()
        );
    }

    #[test]
    fn parse_full() {
        let config: SystemConfig = toml::from_str(
            r#"
[storage]
root = "/srv/mail"
backend = "memory"
checksum = false

[concurrency]
pool_lock_timeout_ms = 250
detach_first_timeout_ms = 10
detach_retry_timeout_ms = 2000
"#,
        )
        .unwrap();

        assert_eq!(PathBuf::from("/srv/mail"), config.storage.root);
        assert_eq!(BackendKind::Memory, config.storage.backend);
        assert!(!config.storage.checksum);
        assert_eq!(
            Duration::from_millis(250),
            config.concurrency.pool_lock_timeout()
        );
        assert_eq!(
            Duration::from_millis(10),
            config.concurrency.detach_first_timeout()
        );
        assert_eq!(
            Duration::from_secs(2),
            config.concurrency.detach_retry_timeout()
        );
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!(toml::from_str::<SystemConfig>(
            "[storage]\nbackend = \"floppy\"\n"
        )
        .is_err());
    }
}
