// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device model and firmware version identifiers.

use std::fmt;
use std::str::FromStr;

/// Identifies a device model by its 16-bit product id.
///
/// The historical record format carries product ids as 4-digit lowercase hex
/// strings (e.g. `"0901"`), which is how this type displays and parses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceModel(u16);

impl DeviceModel {
    pub const fn new(product_id: u16) -> Self {
        Self(product_id)
    }

    pub fn product_id(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl FromStr for DeviceModel {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str_radix(s, 16).map(Self)
    }
}

/// A firmware version.
///
/// Parsing and ordering are delegated entirely to `semver`; this subsystem
/// only ever treats versions as opaque, totally-ordered keys.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion(semver::Version);

impl FirmwareVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FirmwareVersion {
    type Err = semver::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<semver::Version> for FirmwareVersion {
    fn from(version: semver::Version) -> Self {
        Self(version)
    }
}

/// Uniquely identifies one firmware: the device model it applies to and its
/// version.
///
/// Ordered by (model, version) so that map iteration is deterministic and
/// versions of the same model sort together.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareIdentifier {
    pub model: DeviceModel,
    pub version: FirmwareVersion,
}

impl FirmwareIdentifier {
    pub fn new(model: DeviceModel, version: FirmwareVersion) -> Self {
        Self { model, version }
    }
}

impl fmt::Display for FirmwareIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model, self.version)
    }
}
