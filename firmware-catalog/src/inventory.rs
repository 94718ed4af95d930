// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use firmware_types::FirmwareIdentifier;
use std::fmt;

/// Reports the firmware currently installed on every known device.
///
/// The catalog consults this when pruning: an update file is only obsolete
/// if no known device's update chain needs it.
pub trait DeviceInventory: Send + Sync + fmt::Debug {
    fn installed_firmwares(&self) -> Vec<FirmwareIdentifier>;
}
