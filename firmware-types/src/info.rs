// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Public firmware descriptors.

use crate::FirmwareIdentifier;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::hash::Hasher;

/// A property of a firmware update that callers may want to surface before
/// applying it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FirmwareAttribute {
    /// Applying the update reboots the device.
    RequiresReboot,
    /// Applying the update erases user data on the device.
    DeletesUserData,
}

impl FirmwareAttribute {
    /// Parses a wire flag string.
    ///
    /// The update server historically spells the data-erasing flag
    /// `delete_user_data` while persisted records use `deletes_user_data`;
    /// both are accepted, case-insensitively.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag.to_ascii_lowercase().as_str() {
            "requires_reboot" => Some(Self::RequiresReboot),
            "deletes_user_data" | "delete_user_data" => {
                Some(Self::DeletesUserData)
            }
            _ => None,
        }
    }

    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::RequiresReboot => "requires_reboot",
            Self::DeletesUserData => "deletes_user_data",
        }
    }
}

/// Describes one firmware known to the catalog.
///
/// Two descriptors are equal when they identify the same firmware; the
/// remaining fields are metadata about the update file and never participate
/// in equality or hashing.
#[derive(Clone, Debug)]
pub struct FirmwareInfo {
    pub firmware: FirmwareIdentifier,
    /// Size of the update file in bytes.
    pub size: u64,
    /// MD5 checksum of the update file, when the source declared one.
    pub checksum: Option<String>,
    pub attributes: BTreeSet<FirmwareAttribute>,
}

impl FirmwareInfo {
    pub fn new(
        firmware: FirmwareIdentifier,
        size: u64,
        checksum: Option<String>,
        attributes: BTreeSet<FirmwareAttribute>,
    ) -> Self {
        Self { firmware, size, checksum, attributes }
    }
}

impl PartialEq for FirmwareInfo {
    fn eq(&self, other: &Self) -> bool {
        self.firmware == other.firmware
    }
}

impl Eq for FirmwareInfo {}

impl Hash for FirmwareInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.firmware.hash(state);
    }
}
