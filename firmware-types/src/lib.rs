// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared types for the firmware update subsystem.
//!
//! This crate defines the vocabulary the rest of the workspace speaks:
//! firmware identifiers and descriptors, catalog entries with their three
//! kinds of locators (preset, local, remote), the flat records used for
//! persistence, and the manifest format served by the update server.
//! Validation of untrusted records lives here too, with per-record failure
//! isolation: one malformed record never poisons the batch it arrived in.

mod entry;
mod identity;
mod info;
mod manifest;
mod record;

pub use entry::CatalogEntry;
pub use identity::DeviceModel;
pub use identity::FirmwareIdentifier;
pub use identity::FirmwareVersion;
pub use info::FirmwareAttribute;
pub use info::FirmwareInfo;
pub use manifest::BlacklistGroupRecord;
pub use manifest::FirmwareManifest;
pub use manifest::RemoteFirmwareRecord;
pub use manifest::RemoteSnapshot;
pub use record::parse_preset_blacklist;
pub use record::parse_preset_catalog;
pub use record::BlacklistRecord;
pub use record::CatalogRecord;
pub use record::PresetParseError;
pub use record::RecordError;
