// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Downloading firmware update files from the update server.
//!
//! [`DownloadCoordinator`] accepts download requests (ordered lists of
//! firmware descriptors), de-duplicates overlapping in-flight downloads
//! across requests, drives at most one transfer at a time, and reports
//! per-task progress through watch-channel snapshots. The actual byte
//! transfer is behind the [`Transport`] trait; [`HttpTransport`] is the
//! production implementation. [`UpdateServerClient`] fetches the server's
//! firmware manifest for the catalog and blacklist to merge.

mod coordinator;
mod server;
mod transport;

pub use coordinator::DownloadCoordinator;
pub use coordinator::DownloadError;
pub use coordinator::DownloadState;
pub use coordinator::DownloadTask;
pub use coordinator::TaskSnapshot;
pub use server::ManifestFetchError;
pub use server::UpdateServerClient;
pub use transport::HttpTransport;
pub use transport::TransferEvent;
pub use transport::TransferHandle;
pub use transport::TransferStatus;
pub use transport::Transport;
