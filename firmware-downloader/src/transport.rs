// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte-transfer seam between the coordinator and the network.

use camino::Utf8Path;
use camino::Utf8PathBuf;
use futures::StreamExt;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::fmt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use url::Url;

/// How a transfer ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed,
    Canceled,
}

/// Events a transfer reports back to the coordinator: zero or more progress
/// updates (percent of the file transferred) followed by exactly one
/// completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Progress(u8),
    Completed(TransferStatus),
}

/// Handle to an in-flight transfer.
///
/// Cancellation is cooperative: [`TransferHandle::cancel`] (or dropping the
/// handle) asks the transfer to stop; the transfer still reports
/// `Completed(Canceled)` through its event channel once it has wound down.
#[derive(Debug)]
pub struct TransferHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl TransferHandle {
    pub fn new(cancel: oneshot::Sender<()>) -> Self {
        Self { cancel: Some(cancel) }
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The transfer may have completed concurrently; that's fine.
            let _ = cancel.send(());
        }
    }
}

/// Starts cancelable, progress-reporting downloads.
///
/// `expected_size` is the size the catalog advertises for the file; an
/// implementation may prefer a size learned from its own protocol when
/// reporting progress.
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    fn start_download(
        &self,
        source: &Url,
        destination: &Utf8Path,
        expected_size: u64,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> TransferHandle;
}

/// The production [`Transport`]: streams the file over HTTP(S) into the
/// destination path, reporting percent progress per received chunk.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    log: Logger,
}

impl HttpTransport {
    pub fn new(log: &Logger) -> Self {
        let log = log.new(o!("component" => "HttpTransport"));
        Self { client: reqwest::Client::new(), log }
    }
}

impl Transport for HttpTransport {
    fn start_download(
        &self,
        source: &Url,
        destination: &Utf8Path,
        expected_size: u64,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> TransferHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run_download(
            self.client.clone(),
            self.log.new(o!("source" => source.to_string())),
            source.clone(),
            destination.to_owned(),
            expected_size,
            events,
            cancel_rx,
        ));
        TransferHandle::new(cancel_tx)
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("request for {url} failed")]
    Request {
        url: Url,
        #[source]
        err: reqwest::Error,
    },
    #[error("failed to write {path}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

async fn run_download(
    client: reqwest::Client,
    log: Logger,
    source: Url,
    destination: Utf8PathBuf,
    expected_size: u64,
    events: mpsc::UnboundedSender<TransferEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    let result = tokio::select! {
        result = fetch_to_file(
            &client,
            &source,
            &destination,
            expected_size,
            &events,
        ) => result.map(Some),
        // Completes on an explicit cancel and when the handle is dropped.
        _ = &mut cancel => Ok(None),
    };

    let status = match result {
        Ok(Some(())) => {
            debug!(log, "download complete"; "destination" => %destination);
            TransferStatus::Success
        }
        Ok(None) => {
            debug!(log, "download canceled");
            remove_partial_file(&destination, &log).await;
            TransferStatus::Canceled
        }
        Err(err) => {
            warn!(log, "download failed"; InlineErrorChain::new(&err));
            remove_partial_file(&destination, &log).await;
            TransferStatus::Failed
        }
    };
    let _ = events.send(TransferEvent::Completed(status));
}

async fn fetch_to_file(
    client: &reqwest::Client,
    source: &Url,
    destination: &Utf8Path,
    expected_size: u64,
    events: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<(), FetchError> {
    let request_err =
        |err| FetchError::Request { url: source.clone(), err };

    let response = client
        .get(source.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(request_err)?;

    // Prefer the size the server reports for this exact response; fall back
    // to the catalog's idea of the file size.
    let total = response.content_length().unwrap_or(expected_size);

    if let Some(parent) = destination.parent() {
        let write_err = |err| FetchError::Write { path: parent.to_owned(), err };
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let write_err =
        |err| FetchError::Write { path: destination.to_owned(), err };
    let mut file =
        tokio::fs::File::create(destination).await.map_err(write_err)?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_percent: u8 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(request_err)?;
        file.write_all(&chunk).await.map_err(write_err)?;
        downloaded += chunk.len() as u64;
        if total > 0 {
            let percent = (downloaded * 100 / total).min(100) as u8;
            if percent != last_percent {
                last_percent = percent;
                let _ = events.send(TransferEvent::Progress(percent));
            }
        }
    }
    file.flush().await.map_err(write_err)?;
    Ok(())
}

async fn remove_partial_file(destination: &Utf8Path, log: &Logger) {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => (),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => {
            warn!(
                log, "failed to remove partial download";
                "path" => %destination,
                InlineErrorChain::new(&err),
            );
        }
    }
}
