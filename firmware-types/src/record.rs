// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flat records for persistent storage, and their validation.
//!
//! Records deliberately mirror the historical on-disk format: every field is
//! a string or a plain integer, and all typing happens in `validate()`. A
//! record that fails validation is rejected on its own; callers drop it and
//! keep the rest of the batch.

use crate::CatalogEntry;
use crate::DeviceModel;
use crate::FirmwareAttribute;
use crate::FirmwareIdentifier;
use crate::FirmwareInfo;
use crate::FirmwareVersion;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::warn;
use slog::Logger;
use std::collections::BTreeSet;
use thiserror::Error;
use url::Url;

/// Why a record was rejected.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("missing required '{0}' field")]
    MissingField(&'static str),
    #[error("invalid value for '{field}' field: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("invalid scheme for '{field}' field: {value}")]
    InvalidScheme { field: &'static str, value: String },
}

impl RecordError {
    fn invalid(field: &'static str, value: impl ToString) -> Self {
        Self::InvalidValue { field, value: value.to_string() }
    }
}

/// A catalog entry as serialized to persistent storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Local path of the downloaded update file, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "md5", default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub flags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

impl CatalogRecord {
    /// Validates this record field by field and produces a catalog entry.
    ///
    /// Unknown flags fail validation here: persisted and preset records are
    /// produced by us, so an unknown flag means corrupt data rather than a
    /// newer server.
    pub fn validate(
        &self,
        as_preset: bool,
        log: &Logger,
    ) -> Result<CatalogEntry, RecordError> {
        let firmware = validate_identifier(&self.product, &self.version)?;

        let local = match &self.path {
            Some(path) => Some(validate_local_path("path", path)?),
            None => None,
        };
        let remote = match &self.remote_url {
            Some(url) => Some(validate_remote_url("remote_url", url)?),
            None => None,
        };
        let size = validate_size("size", self.size)?;
        let attributes = validate_attributes("flags", &self.flags, true, log)?;
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
            local,
            remote,
            min_version,
            max_version,
            as_preset,
        ))
    }

    /// Serializes a catalog entry back into its flat record form.
    ///
    /// Preset locators are intentionally not representable here; the caller
    /// skips preset entries entirely when persisting.
    pub fn from_entry(entry: &CatalogEntry) -> Self {
        let info = entry.info();
        Self {
            product: Some(info.firmware.model.to_string()),
            version: Some(info.firmware.version.to_string()),
            path: entry.local_file().map(|p| p.to_string()),
            remote_url: entry.remote_url().map(|u| u.to_string()),
            size: info.size as i64,
            checksum: info.checksum.clone(),
            flags: info
                .attributes
                .iter()
                .map(|a| a.as_flag().to_string())
                .collect(),
            required_version: entry
                .min_applicable_version()
                .map(ToString::to_string),
            max_version: entry.max_applicable_version().map(ToString::to_string),
        }
    }
}

/// A blacklist entry as serialized to persistent storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistRecord {
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl BlacklistRecord {
    pub fn validate(&self) -> Result<FirmwareIdentifier, RecordError> {
        validate_identifier(&self.product, &self.version)
    }

    pub fn from_identifier(firmware: &FirmwareIdentifier) -> Self {
        Self {
            product: Some(firmware.model.to_string()),
            version: Some(firmware.version.to_string()),
        }
    }
}

/// Parses an application-bundled preset catalog declaration (a JSON array of
/// [`CatalogRecord`]s whose paths point at bundled files).
///
/// Unlike persisted or remote data, presets ship with the application, so a
/// malformed declaration is a build problem and fails the whole parse.
pub fn parse_preset_catalog(
    json: &str,
    log: &Logger,
) -> Result<Vec<CatalogEntry>, PresetParseError> {
    let records: Vec<CatalogRecord> = serde_json::from_str(json)?;
    records
        .iter()
        .map(|record| record.validate(true, log).map_err(Into::into))
        .collect()
}

/// Parses an application-bundled preset blacklist declaration (a JSON array
/// of `{ "product": ..., "versions": [...] }` groups).
pub fn parse_preset_blacklist(
    json: &str,
) -> Result<BTreeSet<FirmwareIdentifier>, PresetParseError> {
    let groups: Vec<crate::BlacklistGroupRecord> = serde_json::from_str(json)?;
    let mut blacklist = BTreeSet::new();
    for group in &groups {
        blacklist.extend(group.validate()?);
    }
    Ok(blacklist)
}

#[derive(Debug, Error)]
pub enum PresetParseError {
    #[error("preset declaration is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("invalid preset record")]
    Record(#[from] RecordError),
}

pub(crate) fn validate_identifier(
    product: &Option<String>,
    version: &Option<String>,
) -> Result<FirmwareIdentifier, RecordError> {
    let product =
        product.as_deref().ok_or(RecordError::MissingField("product"))?;
    let version =
        version.as_deref().ok_or(RecordError::MissingField("version"))?;
    Ok(FirmwareIdentifier::new(
        validate_model("product", product)?,
        validate_version("version", version)?,
    ))
}

pub(crate) fn validate_model(
    field: &'static str,
    value: &str,
) -> Result<DeviceModel, RecordError> {
    value.parse().map_err(|_| RecordError::invalid(field, value))
}

pub(crate) fn validate_version(
    field: &'static str,
    value: &str,
) -> Result<FirmwareVersion, RecordError> {
    value.parse().map_err(|_| RecordError::invalid(field, value))
}

pub(crate) fn validate_local_path(
    field: &'static str,
    value: &str,
) -> Result<Utf8PathBuf, RecordError> {
    let path = Utf8PathBuf::from(value);
    if !path.is_absolute() {
        return Err(RecordError::invalid(field, value));
    }
    Ok(path)
}

pub(crate) fn validate_remote_url(
    field: &'static str,
    value: &str,
) -> Result<Url, RecordError> {
    let url: Url =
        value.parse().map_err(|_| RecordError::invalid(field, value))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RecordError::InvalidScheme {
            field,
            value: value.to_string(),
        });
    }
    if url.path().is_empty() || url.path() == "/" {
        return Err(RecordError::invalid(field, value));
    }
    Ok(url)
}

pub(crate) fn validate_size(
    field: &'static str,
    value: i64,
) -> Result<u64, RecordError> {
    u64::try_from(value).map_err(|_| RecordError::invalid(field, value))
}

/// Validates a set of wire flag strings.
///
/// `fail_if_unknown` selects between the two historical policies: persisted
/// records reject unknown flags, remote records drop them with a warning so
/// a newer update server does not break older clients.
pub(crate) fn validate_attributes(
    field: &'static str,
    flags: &BTreeSet<String>,
    fail_if_unknown: bool,
    log: &Logger,
) -> Result<BTreeSet<FirmwareAttribute>, RecordError> {
    let mut attributes = BTreeSet::new();
    for flag in flags {
        match FirmwareAttribute::from_flag(flag) {
            Some(attribute) => {
                attributes.insert(attribute);
            }
            None if fail_if_unknown => {
                return Err(RecordError::invalid(field, flag));
            }
            None => {
                warn!(
                    log, "dropping unknown firmware flag";
                    "field" => field,
                    "flag" => flag.as_str(),
                );
            }
        }
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn record() -> CatalogRecord {
        CatalogRecord {
            product: Some("0901".to_string()),
            version: Some("1.2.0".to_string()),
            path: Some("/data/firmwares/0901/1.2.0/fw.tar.gz".to_string()),
            remote_url: Some("https://updates.example/fw.tar.gz".to_string()),
            size: 2048,
            checksum: Some("d41d8cd98f00b204e9800998ecf8427e".to_string()),
            flags: BTreeSet::from(["delete_user_data".to_string()]),
            required_version: Some("1.0.0".to_string()),
            max_version: Some("1.1.0".to_string()),
        }
    }

    #[test]
    fn valid_record_round_trips() {
        let entry = record().validate(false, &log()).unwrap();
        assert_eq!(entry.firmware().to_string(), "0901@1.2.0");
        assert_eq!(entry.info().size, 2048);
        assert_eq!(
            entry.update_file().unwrap(),
            "/data/firmwares/0901/1.2.0/fw.tar.gz"
        );
        assert!(entry
            .info()
            .attributes
            .contains(&FirmwareAttribute::DeletesUserData));

        let back = CatalogRecord::from_entry(&entry);
        assert_eq!(back.product, record().product);
        assert_eq!(back.version, record().version);
        assert_eq!(back.path, record().path);
        assert_eq!(back.remote_url, record().remote_url);
        assert_eq!(back.size, 2048);
        // flags are written back in their canonical spelling
        assert_eq!(
            back.flags,
            BTreeSet::from(["deletes_user_data".to_string()])
        );
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut r = record();
        r.product = None;
        assert!(matches!(
            r.validate(false, &log()),
            Err(RecordError::MissingField("product"))
        ));

        let mut r = record();
        r.version = None;
        assert!(matches!(
            r.validate(false, &log()),
            Err(RecordError::MissingField("version"))
        ));
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut r = record();
        r.version = Some("not-a-version".to_string());
        assert!(r.validate(false, &log()).is_err());

        let mut r = record();
        r.size = -1;
        assert!(r.validate(false, &log()).is_err());

        let mut r = record();
        r.path = Some("relative/path".to_string());
        assert!(r.validate(false, &log()).is_err());

        let mut r = record();
        r.remote_url = Some("ftp://updates.example/fw.bin".to_string());
        assert!(matches!(
            r.validate(false, &log()),
            Err(RecordError::InvalidScheme { .. })
        ));
    }

    #[test]
    fn unknown_flag_policy() {
        let mut r = record();
        r.flags = BTreeSet::from(["mystery_flag".to_string()]);
        // persisted records reject unknown flags
        assert!(r.validate(false, &log()).is_err());

        // the remote-record policy drops them instead
        let attributes =
            validate_attributes("flags", &r.flags, false, &log()).unwrap();
        assert!(attributes.is_empty());
    }

    #[test]
    fn preset_catalog_parsing() {
        let json = r#"[{
            "product": "0901",
            "version": "1.0.0",
            "path": "/bundled/fw-1.0.0.tar.gz",
            "size": 512
        }]"#;
        let entries = parse_preset_catalog(json, &log()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_preset());
        assert_eq!(entries[0].update_file().unwrap(), "/bundled/fw-1.0.0.tar.gz");

        // one bad record fails the whole preset declaration
        let json = r#"[{ "product": "0901", "version": "garbage", "size": 0 }]"#;
        assert!(parse_preset_catalog(json, &log()).is_err());
    }

    #[test]
    fn preset_blacklist_parsing() {
        let json = r#"[{ "product": "0901", "versions": ["1.0.0", "1.1.0"] }]"#;
        let blacklist = parse_preset_blacklist(json).unwrap();
        assert_eq!(blacklist.len(), 2);

        let json = r#"[{ "versions": ["1.0.0"] }]"#;
        assert!(parse_preset_blacklist(json).is_err());
    }
}
