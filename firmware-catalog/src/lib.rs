// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The firmware catalog and blacklist.
//!
//! [`FirmwareCatalog`] owns the mapping from firmware identifier to catalog
//! entry, built by merging persisted records, remote manifest snapshots, and
//! build-time presets. It resolves update chains (the ordered sequence of
//! updates that brings a device to its newest reachable firmware) and prunes
//! downloaded files no known device needs anymore.
//!
//! [`FirmwareBlacklist`] tracks firmware versions that must not be
//! installed; it only ever grows.
//!
//! Both notify interested parties of changes through a watch channel
//! carrying a generation counter.

mod blacklist;
mod catalog;
mod inventory;
mod persistence;

pub use blacklist::FirmwareBlacklist;
pub use catalog::FirmwareCatalog;
pub use catalog::DEFAULT_PRUNE_GRACE_WINDOW;
pub use inventory::DeviceInventory;
pub use persistence::FilePersistence;
pub use persistence::PersistenceError;
pub use persistence::PersistenceGateway;
