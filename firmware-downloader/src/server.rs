// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the update server's manifest endpoint.

use firmware_types::DeviceModel;
use firmware_types::FirmwareManifest;
use slog::debug;
use slog::o;
use slog::Logger;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ManifestFetchError {
    #[error("could not build manifest URL from base {0}")]
    BadBaseUrl(Url),
    #[error("request to update server failed")]
    Request(#[from] reqwest::Error),
}

/// Fetches the firmware manifest from the update server.
///
/// The manifest lists, per supported device model, the firmwares available
/// for download and the blacklisted versions. Callers validate the returned
/// document ([`FirmwareManifest::validate`]) and merge the result into the
/// catalog and blacklist. Scheduling of fetches (and whether the network is
/// available at all) is the caller's concern.
#[derive(Clone, Debug)]
pub struct UpdateServerClient {
    base_url: Url,
    client: reqwest::Client,
    log: Logger,
}

impl UpdateServerClient {
    pub fn new(base_url: Url, log: &Logger) -> Self {
        let log = log.new(o!(
            "component" => "UpdateServerClient",
            "server" => base_url.to_string(),
        ));
        Self { base_url, client: reqwest::Client::new(), log }
    }

    /// Requests the manifest covering the given device models.
    pub async fn fetch_manifest(
        &self,
        models: &[DeviceModel],
    ) -> Result<FirmwareManifest, ManifestFetchError> {
        let mut url = self
            .base_url
            .join("apiv1/update")
            .map_err(|_| ManifestFetchError::BadBaseUrl(self.base_url.clone()))?;
        let products = models
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        url.query_pairs_mut().append_pair("product", &products);

        debug!(self.log, "fetching firmware manifest"; "url" => %url);
        let manifest = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)?
            .json::<FirmwareManifest>()
            .await?;
        debug!(
            self.log, "fetched firmware manifest";
            "firmwares" => manifest.firmwares.len(),
            "blacklist_groups" => manifest.blacklist.len(),
        );
        Ok(manifest)
    }
}
