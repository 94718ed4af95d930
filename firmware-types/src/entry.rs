// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Catalog entries.

use crate::FirmwareIdentifier;
use crate::FirmwareInfo;
use crate::FirmwareVersion;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use url::Url;

/// One firmware known to the catalog, together with where its update file
/// can be found.
///
/// An entry carries up to three locators: a *preset* path bundled with the
/// application at build time (never persisted), a *local* path to a
/// downloaded file, and a *remote* URL on the update server. The catalog
/// maintains the invariant that an entry exists only while at least one
/// locator is set; `clear_local`/`clear_remote` report when the entry has
/// gone bare so the caller can drop it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogEntry {
    info: FirmwareInfo,
    preset: Option<Utf8PathBuf>,
    local: Option<Utf8PathBuf>,
    remote: Option<Url>,
    min_version: Option<FirmwareVersion>,
    max_version: Option<FirmwareVersion>,
}

impl CatalogEntry {
    /// `preset` decides which slot `local` lands in: preset entries behave
    /// as always-available local files but are never written back to
    /// persistent storage.
    pub fn new(
        info: FirmwareInfo,
        local: Option<Utf8PathBuf>,
        remote: Option<Url>,
        min_version: Option<FirmwareVersion>,
        max_version: Option<FirmwareVersion>,
        preset: bool,
    ) -> Self {
        let (preset, local) = if preset { (local, None) } else { (None, local) };
        Self { info, preset, local, remote, min_version, max_version }
    }

    pub fn info(&self) -> &FirmwareInfo {
        &self.info
    }

    pub fn firmware(&self) -> &FirmwareIdentifier {
        &self.info.firmware
    }

    /// Path of the update file if one is available on device storage,
    /// falling back to the preset file for preset entries.
    pub fn update_file(&self) -> Option<&Utf8Path> {
        self.local.as_deref().or(self.preset.as_deref())
    }

    /// Path of a *downloaded* update file. Unlike [`Self::update_file`] this
    /// never reports the preset file, which must not be deleted.
    pub fn local_file(&self) -> Option<&Utf8Path> {
        self.local.as_deref()
    }

    pub fn remote_url(&self) -> Option<&Url> {
        self.remote.as_ref()
    }

    pub fn min_applicable_version(&self) -> Option<&FirmwareVersion> {
        self.min_version.as_ref()
    }

    pub fn max_applicable_version(&self) -> Option<&FirmwareVersion> {
        self.max_version.as_ref()
    }

    pub fn is_preset(&self) -> bool {
        self.preset.is_some()
    }

    /// Whether this update may be applied onto a device currently running
    /// `version`, according to the entry's applicability window. An absent
    /// bound is unbounded on that side.
    pub fn applies_to(&self, version: &FirmwareVersion) -> bool {
        self.min_version.as_ref().is_none_or(|min| min <= version)
            && self.max_version.as_ref().is_none_or(|max| max >= version)
    }

    /// Returns whether the entry changed.
    pub fn set_local(&mut self, path: Utf8PathBuf) -> bool {
        if self.local.as_ref() == Some(&path) {
            return false;
        }
        self.local = Some(path);
        true
    }

    /// Returns whether the entry changed.
    pub fn set_remote(&mut self, url: Url) -> bool {
        if self.remote.as_ref() == Some(&url) {
            return false;
        }
        self.remote = Some(url);
        true
    }

    /// Clears the local locator; returns true if the entry is now bare (no
    /// locator of any kind left) and should be removed from the catalog.
    pub fn clear_local(&mut self) -> bool {
        self.local = None;
        self.preset.is_none() && self.remote.is_none()
    }

    /// Clears the remote locator; returns true if the entry is now bare.
    pub fn clear_remote(&mut self) -> bool {
        self.remote = None;
        self.preset.is_none() && self.local.is_none()
    }
}
