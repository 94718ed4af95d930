// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The firmware blacklist.

use crate::PersistenceGateway;
use firmware_types::BlacklistRecord;
use firmware_types::FirmwareIdentifier;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::watch;

/// Firmware versions that must not be installed on a device.
///
/// The effective blacklist is the union of a persisted set and a build-time
/// preset set. Un-blacklisting a firmware is not a supported scenario, so
/// the persisted set only ever grows; remote-declared entries are merged
/// into it.
#[derive(Debug)]
pub struct FirmwareBlacklist {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
    persistence: Arc<dyn PersistenceGateway>,
    log: Logger,
}

#[derive(Debug)]
struct Inner {
    stored: BTreeSet<FirmwareIdentifier>,
    preset: BTreeSet<FirmwareIdentifier>,
}

impl FirmwareBlacklist {
    /// Loads the persisted blacklist (each record validated on its own;
    /// rejected records are dropped and the cleaned set saved back) and
    /// overlays the preset set.
    pub fn load(
        persistence: Arc<dyn PersistenceGateway>,
        preset: BTreeSet<FirmwareIdentifier>,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "FirmwareBlacklist"));

        let records = match persistence.load_blacklist_records() {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    log, "failed to load persisted blacklist, starting empty";
                    InlineErrorChain::new(&err),
                );
                Vec::new()
            }
        };

        let mut stored = BTreeSet::new();
        let mut any_rejected = false;
        for record in &records {
            match record.validate() {
                Ok(firmware) => {
                    stored.insert(firmware);
                }
                Err(err) => {
                    any_rejected = true;
                    warn!(
                        log, "dropping invalid persisted blacklist record";
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }

        let blacklist = Self {
            inner: Mutex::new(Inner { stored, preset }),
            changes: watch::Sender::new(0),
            persistence,
            log,
        };

        if any_rejected {
            let inner = blacklist.inner.lock().unwrap();
            blacklist.save(&inner);
        }

        blacklist
    }

    /// Subscribes to change notifications (a generation counter).
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn is_blacklisted(&self, firmware: &FirmwareIdentifier) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.stored.contains(firmware) || inner.preset.contains(firmware)
    }

    /// Merges remote-declared blacklist entries into the persisted set.
    /// Grow-only: entries are never removed once blacklisted. Persists and
    /// notifies only if the set actually grew.
    pub fn merge_remote(&self, firmwares: BTreeSet<FirmwareIdentifier>) {
        let mut inner = self.inner.lock().unwrap();
        let mut grew = false;
        for firmware in firmwares {
            if inner.stored.insert(firmware.clone()) {
                info!(
                    self.log, "firmware blacklisted by update server";
                    "firmware" => %firmware,
                );
                grew = true;
            }
        }
        if grew {
            self.save(&inner);
            self.changes.send_modify(|generation| *generation += 1);
        }
    }

    fn save(&self, inner: &Inner) {
        let records: Vec<BlacklistRecord> = inner
            .stored
            .iter()
            .map(BlacklistRecord::from_identifier)
            .collect();
        if let Err(err) = self.persistence.save_blacklist_records(&records) {
            warn!(
                self.log, "failed to persist firmware blacklist";
                InlineErrorChain::new(&err),
            );
        }
    }
}
