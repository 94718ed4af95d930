// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage for catalog and blacklist records.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use firmware_types::BlacklistRecord;
use firmware_types::CatalogRecord;
use firmware_types::FirmwareIdentifier;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::fmt;
use std::fs;
use std::io;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read {path}")]
    Read {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to serialize records for {path}")]
    Serialize {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

/// Loads and saves catalog/blacklist records and decides where downloaded
/// update files live on local storage.
///
/// Saving replaces the previously persisted set wholesale; callers persist
/// the full record list on every change.
pub trait PersistenceGateway: Send + Sync + fmt::Debug {
    fn load_catalog_records(&self) -> Result<Vec<CatalogRecord>, PersistenceError>;
    fn save_catalog_records(
        &self,
        records: &[CatalogRecord],
    ) -> Result<(), PersistenceError>;
    fn load_blacklist_records(
        &self,
    ) -> Result<Vec<BlacklistRecord>, PersistenceError>;
    fn save_blacklist_records(
        &self,
        records: &[BlacklistRecord],
    ) -> Result<(), PersistenceError>;

    /// Computes the path a downloaded update file for `firmware` should be
    /// stored at, given the URL it is fetched from.
    fn local_path_for(
        &self,
        firmware: &FirmwareIdentifier,
        source: &Url,
    ) -> Utf8PathBuf;
}

/// File-backed persistence: JSON array files under a data directory, with
/// downloaded update files stored alongside them.
///
/// Writes go to a temporary file in the target directory first and are then
/// renamed into place, so a crash mid-write never leaves a truncated record
/// file behind.
#[derive(Debug)]
pub struct FilePersistence {
    data_dir: Utf8PathBuf,
    log: Logger,
}

const CATALOG_FILE: &str = "catalog.json";
const BLACKLIST_FILE: &str = "blacklist.json";
const FIRMWARE_DIR: &str = "firmwares";

impl FilePersistence {
    pub fn new(data_dir: Utf8PathBuf, log: &Logger) -> Self {
        let log = log.new(o!("component" => "FilePersistence"));
        Self { data_dir, log }
    }

    fn load_records<T: DeserializeOwned>(
        &self,
        file: &str,
    ) -> Result<Vec<T>, PersistenceError> {
        let path = self.data_dir.join(file);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(PersistenceError::Read { path, err }),
        };

        // The file is an array of records. Parse it into raw values first so
        // one malformed element costs only itself, not the whole file.
        let values: Vec<serde_json::Value> =
            match serde_json::from_str(&contents) {
                Ok(values) => values,
                Err(err) => {
                    warn!(
                        self.log, "record file is not a JSON array, ignoring";
                        "path" => %path,
                        InlineErrorChain::new(&err),
                    );
                    return Ok(Vec::new());
                }
            };

        let mut records = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match serde_json::from_value(value) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(
                        self.log, "skipping malformed record";
                        "path" => %path,
                        "index" => index + 1,
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }
        Ok(records)
    }

    fn save_records<T: Serialize>(
        &self,
        file: &str,
        records: &[T],
    ) -> Result<(), PersistenceError> {
        let path = self.data_dir.join(file);
        let contents = serde_json::to_vec_pretty(records).map_err(|err| {
            PersistenceError::Serialize { path: path.clone(), err }
        })?;

        fs::create_dir_all(&self.data_dir).map_err(|err| {
            PersistenceError::Write { path: self.data_dir.clone(), err }
        })?;
        let tmp = self.data_dir.join(format!("{file}.tmp"));
        fs::write(&tmp, &contents)
            .map_err(|err| PersistenceError::Write { path: tmp.clone(), err })?;
        fs::rename(&tmp, &path)
            .map_err(|err| PersistenceError::Write { path, err })
    }
}

impl PersistenceGateway for FilePersistence {
    fn load_catalog_records(
        &self,
    ) -> Result<Vec<CatalogRecord>, PersistenceError> {
        self.load_records(CATALOG_FILE)
    }

    fn save_catalog_records(
        &self,
        records: &[CatalogRecord],
    ) -> Result<(), PersistenceError> {
        self.save_records(CATALOG_FILE, records)
    }

    fn load_blacklist_records(
        &self,
    ) -> Result<Vec<BlacklistRecord>, PersistenceError> {
        self.load_records(BLACKLIST_FILE)
    }

    fn save_blacklist_records(
        &self,
        records: &[BlacklistRecord],
    ) -> Result<(), PersistenceError> {
        self.save_records(BLACKLIST_FILE, records)
    }

    fn local_path_for(
        &self,
        firmware: &FirmwareIdentifier,
        source: &Url,
    ) -> Utf8PathBuf {
        self.data_dir
            .join(FIRMWARE_DIR)
            .join(firmware.model.to_string())
            .join(firmware.version.to_string())
            .join(file_name_from_url(source))
    }
}

/// Picks the stored file name from the source URL's final path segment.
/// Bundled `.tar.gz` files are historically renamed `.tgz` on the server;
/// recover the proper extension.
fn file_name_from_url(source: &Url) -> String {
    let name = source
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("firmware.bin");
    match name.strip_suffix(".tgz") {
        Some(stem) => format!("{stem}.tar.gz"),
        None => name.to_string(),
    }
}
