// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The manifest document served by the update server.
//!
//! The manifest lists remotely downloadable firmwares and blacklisted
//! firmware versions. Both lists are validated record by record: a record
//! the server got wrong (or one using fields newer than this client) is
//! dropped with a warning while the rest of the document is still applied.

use crate::record::validate_attributes;
use crate::record::validate_identifier;
use crate::record::validate_remote_url;
use crate::record::validate_size;
use crate::record::validate_version;
use crate::CatalogEntry;
use crate::FirmwareIdentifier;
use crate::FirmwareInfo;
use crate::RecordError;
use serde::Deserialize;
use serde::Serialize;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// One downloadable firmware as described by the update server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteFirmwareRecord {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "md5", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<String>,
}

impl RemoteFirmwareRecord {
    /// Produces a remote-only catalog entry. Unknown flags are dropped with
    /// a warning rather than rejected: the server may be newer than us.
    pub fn validate(&self, log: &Logger) -> Result<CatalogEntry, RecordError> {
        let firmware = validate_identifier(&self.product, &self.version)?;
        let url = self.url.as_deref().ok_or(RecordError::MissingField("url"))?;
        let remote = validate_remote_url("url", url)?;
        let size = validate_size("size", self.size)?;
        let attributes = validate_attributes("flags", &self.flags, false, log)?;
        let min_version = self
            .required_version
            .as_deref()
            .map(|v| validate_version("required_version", v))
            .transpose()?;
        let max_version = self
            .max_version
            .as_deref()
            .map(|v| validate_version("max_version", v))
            .transpose()?;

        Ok(CatalogEntry::new(
            FirmwareInfo::new(firmware, size, self.checksum.clone(), attributes),
            None,
            Some(remote),
            min_version,
            max_version,
            false,
        ))
    }
}

/// A group of blacklisted versions for one device model, as they appear both
/// in the server manifest and in preset blacklist declarations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlacklistGroupRecord {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub versions: Option<Vec<String>>,
}

impl BlacklistGroupRecord {
    pub fn validate(&self) -> Result<Vec<FirmwareIdentifier>, RecordError> {
        let product = self
            .product
            .as_deref()
            .ok_or(RecordError::MissingField("product"))?;
        let versions = self
            .versions
            .as_deref()
            .ok_or(RecordError::MissingField("versions"))?;
        let model = crate::record::validate_model("product", product)?;
        versions
            .iter()
            .map(|version| {
                Ok(FirmwareIdentifier::new(
                    model,
                    validate_version("versions", version)?,
                ))
            })
            .collect()
    }
}

/// The raw manifest document.
///
/// Both lists are kept as uninterpreted JSON values so that one malformed
/// element cannot fail deserialization of the whole document;
/// [`FirmwareManifest::validate`] interprets them one by one.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FirmwareManifest {
    #[serde(default, rename = "firmware")]
    pub firmwares: Vec<serde_json::Value>,
    #[serde(default)]
    pub blacklist: Vec<serde_json::Value>,
}

/// The validated contents of a manifest, ready to merge into the catalog and
/// blacklist.
#[derive(Clone, Debug, Default)]
pub struct RemoteSnapshot {
    pub firmwares: BTreeMap<FirmwareIdentifier, CatalogEntry>,
    pub blacklist: BTreeSet<FirmwareIdentifier>,
}

impl FirmwareManifest {
    /// Validates every record in the manifest, dropping (and logging) the
    /// ones that fail.
    pub fn validate(&self, log: &Logger) -> RemoteSnapshot {
        let mut snapshot = RemoteSnapshot::default();

        for (index, value) in self.firmwares.iter().enumerate() {
            let parsed = serde_json::from_value::<RemoteFirmwareRecord>(
                value.clone(),
            )
            .map_err(|err| InlineErrorChain::new(&err).to_string())
            .and_then(|record| {
                record
                    .validate(log)
                    .map_err(|err| InlineErrorChain::new(&err).to_string())
            });
            match parsed {
                Ok(entry) => {
                    snapshot
                        .firmwares
                        .insert(entry.firmware().clone(), entry);
                }
                Err(error) => {
                    warn!(
                        log, "dropping invalid manifest firmware record";
                        "index" => index + 1,
                        "error" => error,
                    );
                }
            }
        }

        for (index, value) in self.blacklist.iter().enumerate() {
            let parsed = serde_json::from_value::<BlacklistGroupRecord>(
                value.clone(),
            )
            .map_err(|err| InlineErrorChain::new(&err).to_string())
            .and_then(|record| {
                record
                    .validate()
                    .map_err(|err| InlineErrorChain::new(&err).to_string())
            });
            match parsed {
                Ok(identifiers) => snapshot.blacklist.extend(identifiers),
                Err(error) => {
                    warn!(
                        log, "dropping invalid manifest blacklist record";
                        "index" => index + 1,
                        "error" => error,
                    );
                }
            }
        }

        snapshot
    }
}
