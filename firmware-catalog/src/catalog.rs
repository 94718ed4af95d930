// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The catalog of all known firmwares.

use crate::DeviceInventory;
use crate::PersistenceGateway;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use firmware_types::CatalogEntry;
use firmware_types::CatalogRecord;
use firmware_types::FirmwareIdentifier;
use firmware_types::FirmwareInfo;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::SystemTime;
use tokio::sync::watch;
use url::Url;

/// How long a downloaded update file is shielded from obsolete-pruning after
/// it was last written, so we never delete a file that was fetched moments
/// ago and not yet consumed.
pub const DEFAULT_PRUNE_GRACE_WINDOW: Duration =
    Duration::from_secs(24 * 60 * 60);

/// All firmwares known to the system, either present on local storage or
/// known to be downloadable from the update server.
///
/// The catalog is the single source of truth for "is this firmware available
/// locally". Entry points lock a mutex held only for short, non-blocking
/// critical sections; the catalog never awaits and is safe to consult from
/// async contexts.
#[derive(Debug)]
pub struct FirmwareCatalog {
    inner: Mutex<BTreeMap<FirmwareIdentifier, CatalogEntry>>,
    changes: watch::Sender<u64>,
    persistence: Arc<dyn PersistenceGateway>,
    inventory: Arc<dyn DeviceInventory>,
    grace_window: Duration,
    log: Logger,
}

impl FirmwareCatalog {
    /// Loads the catalog: persisted records first (each validated on its
    /// own; rejected records are dropped and any local file they referenced
    /// is deleted best-effort), then build-time presets, which always
    /// override persisted state and are never written back.
    pub fn load(
        persistence: Arc<dyn PersistenceGateway>,
        inventory: Arc<dyn DeviceInventory>,
        presets: Vec<CatalogEntry>,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "FirmwareCatalog"));

        let records = match persistence.load_catalog_records() {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    log, "failed to load persisted catalog, starting empty";
                    InlineErrorChain::new(&err),
                );
                Vec::new()
            }
        };

        let mut entries = BTreeMap::new();
        let mut any_rejected = false;
        for record in &records {
            match record.validate(false, &log) {
                Ok(entry) => {
                    entries.insert(entry.firmware().clone(), entry);
                }
                Err(err) => {
                    any_rejected = true;
                    warn!(
                        log, "dropping invalid persisted firmware record";
                        InlineErrorChain::new(&err),
                    );
                    // The record may have referenced a downloaded file
                    // nothing will ever point at again.
                    if let Some(path) = &record.path {
                        delete_update_file(Utf8Path::new(path), &log);
                    }
                }
            }
        }

        let catalog = Self {
            inner: Mutex::new(entries),
            changes: watch::Sender::new(0),
            persistence,
            inventory,
            grace_window: DEFAULT_PRUNE_GRACE_WINDOW,
            log,
        };

        if any_rejected {
            // Write the cleaned list back so the next load is quiet.
            let inner = catalog.inner.lock().unwrap();
            catalog.save(&inner);
        }

        {
            let mut inner = catalog.inner.lock().unwrap();
            for preset in presets {
                inner.insert(preset.firmware().clone(), preset);
            }
        }

        catalog
    }

    /// Overrides the pruning grace window (defaults to
    /// [`DEFAULT_PRUNE_GRACE_WINDOW`]).
    pub fn with_grace_window(mut self, grace_window: Duration) -> Self {
        self.grace_window = grace_window;
        self
    }

    /// Subscribes to change notifications. The value is a generation
    /// counter bumped on every observable catalog change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn contains(&self, firmware: &FirmwareIdentifier) -> bool {
        self.inner.lock().unwrap().contains_key(firmware)
    }

    pub fn descriptor(
        &self,
        firmware: &FirmwareIdentifier,
    ) -> Option<FirmwareInfo> {
        self.inner.lock().unwrap().get(firmware).map(|e| e.info().clone())
    }

    /// Path of the update file for `firmware` if one is available on local
    /// storage (downloaded or preset).
    pub fn update_file(
        &self,
        firmware: &FirmwareIdentifier,
    ) -> Option<Utf8PathBuf> {
        self.inner
            .lock()
            .unwrap()
            .get(firmware)
            .and_then(|e| e.update_file())
            .map(|p| p.to_owned())
    }

    pub fn remote_url(&self, firmware: &FirmwareIdentifier) -> Option<Url> {
        self.inner
            .lock()
            .unwrap()
            .get(firmware)
            .and_then(|e| e.remote_url())
            .cloned()
    }

    /// All entries currently in the catalog.
    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// The ordered sequence of updates that brings a device running
    /// `firmware` to the newest version reachable from it.
    ///
    /// Each step greedily selects the highest-versioned eligible entry: same
    /// model, version strictly greater than the current one, and an
    /// applicability window containing the current version. With
    /// `local_only`, entries without a local (or preset) update file are not
    /// considered. Every step strictly increases the version, so the chain
    /// is finite even with adversarial applicability windows.
    pub fn update_chain(
        &self,
        firmware: &FirmwareIdentifier,
        local_only: bool,
    ) -> Vec<FirmwareInfo> {
        let inner = self.inner.lock().unwrap();
        update_chain(&inner, firmware, local_only)
            .into_iter()
            .map(|entry| entry.info().clone())
            .collect()
    }

    /// The updates from `firmware`'s full chain that still need to be
    /// downloaded before the whole chain can be applied.
    pub fn downloadable_updates(
        &self,
        firmware: &FirmwareIdentifier,
    ) -> Vec<FirmwareInfo> {
        let inner = self.inner.lock().unwrap();
        update_chain(&inner, firmware, false)
            .into_iter()
            .filter(|entry| entry.update_file().is_none())
            .map(|entry| entry.info().clone())
            .collect()
    }

    /// The updates that can be applied right now, without downloading.
    pub fn applicable_updates(
        &self,
        firmware: &FirmwareIdentifier,
    ) -> Vec<FirmwareInfo> {
        self.update_chain(firmware, true)
    }

    /// The newest version reachable from `firmware`, or `None` if the
    /// device is already up to date (or nothing is known about its model).
    pub fn ideal_update(
        &self,
        firmware: &FirmwareIdentifier,
    ) -> Option<FirmwareInfo> {
        self.update_chain(firmware, false).pop()
    }

    /// Merges a validated remote snapshot into the catalog.
    ///
    /// Existing non-preset entries present in the snapshot receive its
    /// remote locator; entries absent from the snapshot lose theirs (and are
    /// removed entirely if no locator remains). Snapshot entries for
    /// firmwares we did not know yet are inserted as new entries.
    pub fn merge_remote(
        &self,
        mut snapshot: BTreeMap<FirmwareIdentifier, CatalogEntry>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = false;
        let mut remove = Vec::new();

        for (firmware, entry) in inner.iter_mut() {
            match snapshot.remove(firmware) {
                Some(remote_entry) => {
                    // Presets always override remote knowledge; their
                    // matching snapshot entry is consumed above so it is not
                    // re-inserted as a duplicate below.
                    if !entry.is_preset() {
                        if let Some(url) = remote_entry.remote_url() {
                            changed |= entry.set_remote(url.clone());
                        }
                    }
                }
                None => {
                    if entry.remote_url().is_some() {
                        changed = true;
                        if entry.clear_remote() {
                            remove.push(firmware.clone());
                        }
                    }
                }
            }
        }

        for firmware in remove {
            debug!(
                self.log, "firmware gone from update server, dropping entry";
                "firmware" => %firmware,
            );
            inner.remove(&firmware);
        }

        changed |= !snapshot.is_empty();
        inner.extend(snapshot);

        if changed {
            self.save_and_notify(&inner);
        }
    }

    /// Records that a downloaded update file for `firmware` now exists at
    /// `path`. Unknown firmwares are ignored.
    pub fn attach_local(
        &self,
        firmware: &FirmwareIdentifier,
        path: Utf8PathBuf,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let changed = match inner.get_mut(firmware) {
            Some(entry) => entry.set_local(path),
            None => false,
        };
        if changed {
            self.save_and_notify(&inner);
        }
    }

    /// Deletes the downloaded update file for `firmware` and clears its
    /// local locator; the entry itself is removed if no other locator
    /// remains. Returns whether a deletion actually occurred. Preset files
    /// are never deleted.
    pub fn delete_local(&self, firmware: &FirmwareIdentifier) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get_mut(firmware) else {
            return false;
        };
        let Some(path) = entry.local_file().map(|p| p.to_owned()) else {
            return false;
        };

        info!(
            self.log, "deleting local firmware file";
            "firmware" => %firmware,
            "path" => %path,
        );
        if !delete_update_file(&path, &self.log) {
            return false;
        }
        if entry.clear_local() {
            inner.remove(firmware);
        }
        self.save_and_notify(&inner);
        true
    }

    /// Deletes downloaded update files that no known device needs.
    ///
    /// An update file is kept if it appears in some known device's
    /// local-only update chain, or if it was written within the grace
    /// window. Preset files are never touched.
    pub fn prune_obsolete(&self) {
        let devices = self.inventory.installed_firmwares();
        let mut inner = self.inner.lock().unwrap();

        let mut keep = BTreeSet::new();
        for installed in &devices {
            for entry in update_chain(&inner, installed, true) {
                keep.insert(entry.firmware().clone());
            }
        }

        let cutoff = SystemTime::now().checked_sub(self.grace_window);
        let mut changed = false;
        let mut remove = Vec::new();

        for (firmware, entry) in inner.iter_mut() {
            if keep.contains(firmware) {
                continue;
            }
            let Some(path) = entry.local_file().map(|p| p.to_owned()) else {
                continue;
            };
            if is_within_grace_window(&path, cutoff) {
                continue;
            }
            info!(
                self.log, "pruning obsolete local firmware file";
                "firmware" => %firmware,
                "path" => %path,
            );
            if delete_update_file(&path, &self.log) {
                if entry.clear_local() {
                    remove.push(firmware.clone());
                }
                changed = true;
            }
        }

        for firmware in remove {
            inner.remove(&firmware);
        }
        if changed {
            self.save_and_notify(&inner);
        }
    }

    fn save(&self, inner: &BTreeMap<FirmwareIdentifier, CatalogEntry>) {
        let records: Vec<CatalogRecord> = inner
            .values()
            .filter(|entry| !entry.is_preset())
            .map(CatalogRecord::from_entry)
            .collect();
        if let Err(err) = self.persistence.save_catalog_records(&records) {
            warn!(
                self.log, "failed to persist firmware catalog";
                InlineErrorChain::new(&err),
            );
        }
    }

    fn save_and_notify(
        &self,
        inner: &BTreeMap<FirmwareIdentifier, CatalogEntry>,
    ) {
        self.save(inner);
        self.changes.send_modify(|generation| *generation += 1);
    }
}

/// Chain resolution over the entry map; see
/// [`FirmwareCatalog::update_chain`].
fn update_chain<'a>(
    entries: &'a BTreeMap<FirmwareIdentifier, CatalogEntry>,
    firmware: &FirmwareIdentifier,
    local_only: bool,
) -> Vec<&'a CatalogEntry> {
    let mut chain: Vec<&CatalogEntry> = Vec::new();
    let mut current = firmware;
    loop {
        let best = entries
            .values()
            .filter(|entry| {
                let candidate = entry.firmware();
                candidate.model == current.model
                    && candidate.version > current.version
                    && entry.applies_to(&current.version)
                    && (!local_only || entry.update_file().is_some())
            })
            .max_by(|a, b| {
                a.firmware().version.cmp(&b.firmware().version)
            });
        match best {
            Some(entry) => {
                chain.push(entry);
                current = entry.firmware();
            }
            None => return chain,
        }
    }
}

fn is_within_grace_window(
    path: &Utf8Path,
    cutoff: Option<SystemTime>,
) -> bool {
    let Some(cutoff) = cutoff else {
        // A grace window longer than the clock can express shields
        // everything.
        return true;
    };
    match fs::metadata(path).and_then(|metadata| metadata.modified()) {
        Ok(modified) => modified > cutoff,
        // Can't stat the file (most likely already gone): let the deletion
        // path clean up the bookkeeping.
        Err(_) => false,
    }
}

/// Best-effort deletion; an already-missing file counts as deleted.
fn delete_update_file(path: &Utf8Path, log: &Logger) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            warn!(
                log, "could not delete firmware update file";
                "path" => %path,
                InlineErrorChain::new(&err),
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FilePersistence;
    use camino_tempfile::Utf8TempDir;
    use crate::PersistenceError;
    use firmware_types::DeviceModel;
    use firmware_types::FirmwareVersion;
    use test_strategy::proptest;

    const MODEL: DeviceModel = DeviceModel::new(0x0901);

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn id(major: u64, minor: u64) -> FirmwareIdentifier {
        FirmwareIdentifier::new(MODEL, FirmwareVersion::new(major, minor, 0))
    }

    fn info(firmware: FirmwareIdentifier, size: u64) -> FirmwareInfo {
        FirmwareInfo::new(firmware, size, None, Default::default())
    }

    struct EntrySpec {
        firmware: FirmwareIdentifier,
        local: Option<Utf8PathBuf>,
        remote: bool,
        min: Option<FirmwareVersion>,
        max: Option<FirmwareVersion>,
        preset: bool,
    }

    impl EntrySpec {
        fn new(firmware: FirmwareIdentifier) -> Self {
            Self {
                firmware,
                local: None,
                remote: true,
                min: None,
                max: None,
                preset: false,
            }
        }

        fn local(mut self, path: &str) -> Self {
            self.local = Some(path.into());
            self
        }

        fn no_remote(mut self) -> Self {
            self.remote = false;
            self
        }

        fn max(mut self, major: u64, minor: u64) -> Self {
            self.max = Some(FirmwareVersion::new(major, minor, 0));
            self
        }

        fn min(mut self, major: u64, minor: u64) -> Self {
            self.min = Some(FirmwareVersion::new(major, minor, 0));
            self
        }

        fn preset(mut self, path: &str) -> Self {
            self.preset = true;
            self.local = Some(path.into());
            self
        }

        fn build(self) -> CatalogEntry {
            let remote = self.remote.then(|| {
                format!("https://updates.example/{}.bin", self.firmware)
                    .parse()
                    .unwrap()
            });
            CatalogEntry::new(
                info(self.firmware, 1024),
                self.local,
                remote,
                self.min,
                self.max,
                self.preset,
            )
        }
    }

    /// In-memory persistence for tests that don't exercise the disk.
    #[derive(Debug, Default)]
    struct MemoryPersistence {
        catalog: Mutex<Vec<CatalogRecord>>,
        blacklist: Mutex<Vec<firmware_types::BlacklistRecord>>,
    }

    impl PersistenceGateway for MemoryPersistence {
        fn load_catalog_records(
            &self,
        ) -> Result<Vec<CatalogRecord>, PersistenceError> {
            Ok(self.catalog.lock().unwrap().clone())
        }

        fn save_catalog_records(
            &self,
            records: &[CatalogRecord],
        ) -> Result<(), PersistenceError> {
            *self.catalog.lock().unwrap() = records.to_vec();
            Ok(())
        }

        fn load_blacklist_records(
            &self,
        ) -> Result<Vec<firmware_types::BlacklistRecord>, PersistenceError>
        {
            Ok(self.blacklist.lock().unwrap().clone())
        }

        fn save_blacklist_records(
            &self,
            records: &[firmware_types::BlacklistRecord],
        ) -> Result<(), PersistenceError> {
            *self.blacklist.lock().unwrap() = records.to_vec();
            Ok(())
        }

        fn local_path_for(
            &self,
            firmware: &FirmwareIdentifier,
            source: &Url,
        ) -> Utf8PathBuf {
            let name = source
                .path_segments()
                .and_then(|mut s| s.next_back())
                .unwrap_or("firmware.bin");
            Utf8PathBuf::from(format!("/downloads/{firmware}/{name}"))
        }
    }

    #[derive(Debug, Default)]
    struct Inventory(Vec<FirmwareIdentifier>);

    impl DeviceInventory for Inventory {
        fn installed_firmwares(&self) -> Vec<FirmwareIdentifier> {
            self.0.clone()
        }
    }

    fn catalog_with(presets: Vec<CatalogEntry>) -> FirmwareCatalog {
        FirmwareCatalog::load(
            Arc::new(MemoryPersistence::default()),
            Arc::new(Inventory::default()),
            presets,
            &log(),
        )
    }

    #[test]
    fn chain_prefers_highest_eligible_version() {
        // One full update with no bounds and one incremental update capped
        // at 1.4: from 1.0 both are eligible, the full one wins.
        let catalog = catalog_with(vec![
            EntrySpec::new(id(2, 0)).preset("/p/2.0.bin").build(),
            EntrySpec::new(id(1, 5)).preset("/p/1.5.bin").max(1, 4).build(),
        ]);
        let chain = catalog.update_chain(&id(1, 0), false);
        assert_eq!(
            chain.iter().map(|i| i.firmware.clone()).collect::<Vec<_>>(),
            vec![id(2, 0)]
        );
    }

    #[test]
    fn chain_steps_through_required_intermediates() {
        // 1.0 can only reach 1.2; 1.4 requires at least 1.2; 2.0 requires
        // at least 1.4.
        let catalog = catalog_with(vec![
            EntrySpec::new(id(1, 2)).preset("/p/1.2.bin").build(),
            EntrySpec::new(id(1, 4)).preset("/p/1.4.bin").min(1, 2).build(),
            EntrySpec::new(id(2, 0)).preset("/p/2.0.bin").min(1, 4).build(),
        ]);
        let chain = catalog.update_chain(&id(1, 0), false);
        assert_eq!(
            chain.iter().map(|i| i.firmware.clone()).collect::<Vec<_>>(),
            vec![id(1, 2), id(1, 4), id(2, 0)]
        );
    }

    #[test]
    fn chain_ignores_other_models_and_older_versions() {
        let other = FirmwareIdentifier::new(
            DeviceModel::new(0x090c),
            FirmwareVersion::new(9, 9, 0),
        );
        let catalog = catalog_with(vec![
            EntrySpec::new(other).preset("/p/other.bin").build(),
            EntrySpec::new(id(0, 9)).preset("/p/0.9.bin").build(),
        ]);
        assert!(catalog.update_chain(&id(1, 0), false).is_empty());
        assert!(catalog.ideal_update(&id(1, 0)).is_none());
    }

    #[test]
    fn downloadable_and_applicable_split_on_local_presence() {
        let catalog = catalog_with(vec![
            EntrySpec::new(id(1, 2)).preset("/p/1.2.bin").build(),
            EntrySpec::new(id(1, 4)).min(1, 2).build(), // remote only
        ]);

        let applicable = catalog.applicable_updates(&id(1, 0));
        assert_eq!(
            applicable.iter().map(|i| i.firmware.clone()).collect::<Vec<_>>(),
            vec![id(1, 2)]
        );

        let downloadable = catalog.downloadable_updates(&id(1, 0));
        assert_eq!(
            downloadable
                .iter()
                .map(|i| i.firmware.clone())
                .collect::<Vec<_>>(),
            vec![id(1, 4)]
        );

        assert_eq!(
            catalog.ideal_update(&id(1, 0)).unwrap().firmware,
            id(1, 4)
        );
    }

    #[test]
    fn merge_remote_updates_clears_and_inserts() {
        let persistence = Arc::new(MemoryPersistence::default());
        let catalog = FirmwareCatalog::load(
            persistence.clone(),
            Arc::new(Inventory::default()),
            Vec::new(),
            &log(),
        );

        // Seed with two remote-only entries via a first merge.
        let mut snapshot = BTreeMap::new();
        for entry in
            [EntrySpec::new(id(1, 2)).build(), EntrySpec::new(id(1, 4)).build()]
        {
            snapshot.insert(entry.firmware().clone(), entry);
        }
        catalog.merge_remote(snapshot);
        assert!(catalog.contains(&id(1, 2)));
        assert!(catalog.contains(&id(1, 4)));

        let mut watcher = catalog.watch();
        watcher.mark_unchanged();

        // Next snapshot drops 1.2 (entry goes away entirely: no other
        // locator) and adds 2.0.
        let mut snapshot = BTreeMap::new();
        for entry in
            [EntrySpec::new(id(1, 4)).build(), EntrySpec::new(id(2, 0)).build()]
        {
            snapshot.insert(entry.firmware().clone(), entry);
        }
        catalog.merge_remote(snapshot);

        assert!(!catalog.contains(&id(1, 2)));
        assert!(catalog.contains(&id(1, 4)));
        assert!(catalog.contains(&id(2, 0)));
        assert!(watcher.has_changed().unwrap());

        // An identical snapshot changes nothing and does not notify.
        watcher.mark_unchanged();
        let mut snapshot = BTreeMap::new();
        for entry in
            [EntrySpec::new(id(1, 4)).build(), EntrySpec::new(id(2, 0)).build()]
        {
            snapshot.insert(entry.firmware().clone(), entry);
        }
        catalog.merge_remote(snapshot);
        assert!(!watcher.has_changed().unwrap());
    }

    #[test]
    fn merge_remote_keeps_entry_with_local_file() {
        let catalog = catalog_with(Vec::new());
        let mut snapshot = BTreeMap::new();
        let entry = EntrySpec::new(id(1, 2)).build();
        snapshot.insert(entry.firmware().clone(), entry);
        catalog.merge_remote(snapshot);

        catalog.attach_local(&id(1, 2), "/downloads/fw.bin".into());

        // Snapshot no longer lists 1.2: remote locator goes away, but the
        // local file keeps the entry alive.
        catalog.merge_remote(BTreeMap::new());
        assert!(catalog.contains(&id(1, 2)));
        assert!(catalog.remote_url(&id(1, 2)).is_none());
        assert_eq!(
            catalog.update_file(&id(1, 2)).unwrap(),
            Utf8PathBuf::from("/downloads/fw.bin")
        );
    }

    #[test]
    fn merge_remote_does_not_touch_presets() {
        let catalog = catalog_with(vec![EntrySpec::new(id(1, 2))
            .no_remote()
            .preset("/p/1.2.bin")
            .build()]);

        let mut snapshot = BTreeMap::new();
        let entry = EntrySpec::new(id(1, 2)).build();
        snapshot.insert(entry.firmware().clone(), entry);
        catalog.merge_remote(snapshot);

        // The preset entry neither gained a remote locator nor was replaced
        // by the snapshot entry.
        let entries = catalog.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_preset());
        assert!(entries[0].remote_url().is_none());

        // And a snapshot omitting the preset does not remove it.
        catalog.merge_remote(BTreeMap::new());
        assert!(catalog.contains(&id(1, 2)));
    }

    #[test]
    fn attach_local_unknown_firmware_is_a_noop() {
        let catalog = catalog_with(Vec::new());
        let mut watcher = catalog.watch();
        watcher.mark_unchanged();
        catalog.attach_local(&id(1, 0), "/downloads/fw.bin".into());
        assert!(!catalog.contains(&id(1, 0)));
        assert!(!watcher.has_changed().unwrap());
    }

    #[test]
    fn delete_local_removes_file_and_maybe_entry() {
        let dir = Utf8TempDir::new().unwrap();
        let with_remote = dir.path().join("with_remote.bin");
        let local_only = dir.path().join("local_only.bin");
        fs::write(&with_remote, b"fw").unwrap();
        fs::write(&local_only, b"fw").unwrap();

        let catalog = catalog_with(Vec::new());
        let mut snapshot = BTreeMap::new();
        let entry = EntrySpec::new(id(1, 2)).build();
        snapshot.insert(entry.firmware().clone(), entry);
        catalog.merge_remote(snapshot);
        catalog.attach_local(&id(1, 2), with_remote.clone());

        assert!(catalog.delete_local(&id(1, 2)));
        assert!(!with_remote.exists());
        // remote locator remains, so does the entry
        assert!(catalog.contains(&id(1, 2)));
        assert!(catalog.update_file(&id(1, 2)).is_none());

        // an entry whose only locator was the local file disappears
        let catalog = catalog_with(vec![EntrySpec::new(id(1, 4))
            .no_remote()
            .local(local_only.as_str())
            .build()]);
        assert!(catalog.delete_local(&id(1, 4)));
        assert!(!catalog.contains(&id(1, 4)));

        // unknown firmware, nothing to delete
        assert!(!catalog.delete_local(&id(9, 9)));
    }

    #[test]
    fn delete_local_never_deletes_presets() {
        let dir = Utf8TempDir::new().unwrap();
        let preset = dir.path().join("preset.bin");
        fs::write(&preset, b"fw").unwrap();

        let catalog = catalog_with(vec![EntrySpec::new(id(1, 2))
            .no_remote()
            .preset(preset.as_str())
            .build()]);
        assert!(!catalog.delete_local(&id(1, 2)));
        assert!(preset.exists());
    }

    #[test]
    fn prune_keeps_needed_and_fresh_files() {
        let dir = Utf8TempDir::new().unwrap();
        let needed = dir.path().join("needed.bin");
        let obsolete = dir.path().join("obsolete.bin");
        fs::write(&needed, b"fw").unwrap();
        fs::write(&obsolete, b"fw").unwrap();

        // A device at 2.0 needs 2.1; nothing needs 1.0 anymore. Both
        // entries carry plain (non-preset) local files.
        let catalog = FirmwareCatalog::load(
            Arc::new(MemoryPersistence::default()),
            Arc::new(Inventory(vec![id(2, 0)])),
            vec![
                EntrySpec::new(id(2, 1))
                    .no_remote()
                    .local(needed.as_str())
                    .build(),
                EntrySpec::new(id(1, 0))
                    .no_remote()
                    .local(obsolete.as_str())
                    .build(),
            ],
            &log(),
        )
        .with_grace_window(Duration::ZERO);

        catalog.prune_obsolete();

        assert!(needed.exists());
        assert!(catalog.contains(&id(2, 1)));
        assert!(!obsolete.exists());
        assert!(!catalog.contains(&id(1, 0)));
    }

    #[test]
    fn prune_respects_grace_window() {
        let dir = Utf8TempDir::new().unwrap();
        let fresh = dir.path().join("fresh.bin");
        fs::write(&fresh, b"fw").unwrap();

        // Default 24h grace window: the just-written file survives even
        // though no device needs it.
        let catalog = FirmwareCatalog::load(
            Arc::new(MemoryPersistence::default()),
            Arc::new(Inventory::default()),
            vec![EntrySpec::new(id(1, 0))
                .no_remote()
                .local(fresh.as_str())
                .build()],
            &log(),
        );
        catalog.prune_obsolete();
        assert!(fresh.exists());
        assert!(catalog.contains(&id(1, 0)));
    }

    #[test]
    fn load_rejects_invalid_records_and_cleans_up() {
        let dir = Utf8TempDir::new().unwrap();
        let orphan = dir.path().join("orphan.bin");
        fs::write(&orphan, b"fw").unwrap();

        let persistence =
            Arc::new(FilePersistence::new(dir.path().to_owned(), &log()));
        let records = format!(
            r#"[
                {{ "product": "0901", "version": "1.2.0", "size": 10,
                   "remote_url": "https://updates.example/fw.bin" }},
                {{ "product": "0901", "version": "garbage", "size": 10,
                   "path": "{orphan}" }}
            ]"#
        );
        fs::write(dir.path().join("catalog.json"), records).unwrap();

        let catalog = FirmwareCatalog::load(
            persistence.clone(),
            Arc::new(Inventory::default()),
            Vec::new(),
            &log(),
        );

        // the invalid record is gone, along with its orphaned file
        assert_eq!(catalog.entries().len(), 1);
        assert!(catalog.contains(&id(1, 2)));
        assert!(!orphan.exists());

        // the cleaned list was saved back
        let reloaded = persistence.load_catalog_records().unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn persisted_catalog_round_trips() {
        let dir = Utf8TempDir::new().unwrap();
        let persistence =
            Arc::new(FilePersistence::new(dir.path().to_owned(), &log()));

        let catalog = FirmwareCatalog::load(
            persistence.clone(),
            Arc::new(Inventory::default()),
            vec![EntrySpec::new(id(3, 0)).preset("/p/3.0.bin").build()],
            &log(),
        );
        let mut snapshot = BTreeMap::new();
        for entry in [
            EntrySpec::new(id(1, 2)).build(),
            EntrySpec::new(id(1, 4)).min(1, 2).max(1, 3).build(),
        ] {
            snapshot.insert(entry.firmware().clone(), entry);
        }
        catalog.merge_remote(snapshot);
        catalog.attach_local(&id(1, 2), "/downloads/1.2.bin".into());

        // A fresh load from the same persistence reproduces the non-preset
        // catalog; the preset was not persisted.
        let reloaded = FirmwareCatalog::load(
            persistence,
            Arc::new(Inventory::default()),
            Vec::new(),
            &log(),
        );
        assert!(!reloaded.contains(&id(3, 0)));

        // field-by-field equivalence, via the flat record form
        let original: Vec<CatalogRecord> = catalog
            .entries()
            .iter()
            .filter(|entry| !entry.is_preset())
            .map(CatalogRecord::from_entry)
            .collect();
        let round_tripped: Vec<CatalogRecord> = reloaded
            .entries()
            .iter()
            .map(CatalogRecord::from_entry)
            .collect();
        assert_eq!(original, round_tripped);
    }

    fn version_of(t: (u8, u8, u8)) -> FirmwareVersion {
        FirmwareVersion::new(t.0 as u64, t.1 as u64, t.2 as u64)
    }

    type ArbitraryEntry =
        ((u8, u8, u8), Option<(u8, u8, u8)>, Option<(u8, u8, u8)>);

    #[proptest]
    fn proptest_chains_strictly_increase(
        #[strategy(proptest::collection::vec(
            (
                (0u8..4, 0u8..4, 0u8..4),
                proptest::option::of((0u8..4, 0u8..4, 0u8..4)),
                proptest::option::of((0u8..4, 0u8..4, 0u8..4)),
            ),
            0..12,
        ))]
        entries: Vec<ArbitraryEntry>,
        #[strategy((0u8..4, 0u8..4, 0u8..4))] start: (u8, u8, u8),
    ) {
        let presets = entries
            .into_iter()
            .map(|(version, min, max)| {
                CatalogEntry::new(
                    info(
                        FirmwareIdentifier::new(MODEL, version_of(version)),
                        1,
                    ),
                    Some("/p/fw.bin".into()),
                    None,
                    min.map(version_of),
                    max.map(version_of),
                    true,
                )
            })
            .collect();
        let catalog = catalog_with(presets);

        let start =
            FirmwareIdentifier::new(MODEL, version_of(start));
        let chain = catalog.update_chain(&start, false);

        let mut previous = start.version.clone();
        for step in &chain {
            // no step may ever go to a version at or below the current one,
            // even with adversarial applicability windows
            assert!(step.firmware.version > previous);
            previous = step.firmware.version.clone();
        }
    }
}
