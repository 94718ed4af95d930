// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queued, de-duplicated firmware downloads.
//!
//! All coordinator state lives in a single actor task: callers submit
//! requests over a channel and observe their task through watch-channel
//! snapshots, so every mutation of the wait-set map and of task state is
//! serialized without locks. The actor drives at most one transfer at a
//! time; firmwares wait their turn in FIFO order of first request.

use crate::transport::TransferEvent;
use crate::transport::TransferHandle;
use crate::transport::TransferStatus;
use crate::transport::Transport;
use camino::Utf8PathBuf;
use firmware_catalog::FirmwareCatalog;
use firmware_catalog::PersistenceGateway;
use firmware_types::FirmwareIdentifier;
use firmware_types::FirmwareInfo;
use indexmap::IndexMap;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no firmwares requested")]
    EmptyRequest,
    #[error("download coordinator is shut down")]
    Shutdown,
}

/// State of a download task.
///
/// A multi-item task goes back to `Queued` between items; `Success`,
/// `Failed` and `Canceled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadState {
    Queued,
    Downloading,
    Success,
    Failed,
    Canceled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

/// A point-in-time view of a download task.
#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    pub state: DownloadState,
    /// The firmwares originally requested, in download order.
    pub requested: Arc<[FirmwareInfo]>,
    /// How many of them have completed so far.
    pub completed: usize,
    /// Progress of the item currently downloading, 0–100.
    pub current_progress: u8,
    /// Progress over the whole request, weighted by file size, 0–100.
    pub overall_progress: u8,
}

impl TaskSnapshot {
    /// The suffix of the request still to be downloaded.
    pub fn remaining(&self) -> &[FirmwareInfo] {
        &self.requested[self.completed..]
    }
}

/// Caller-side handle to a download submitted to the coordinator.
#[derive(Debug)]
pub struct DownloadTask {
    id: Uuid,
    requests: mpsc::UnboundedSender<Request>,
    updates: watch::Receiver<TaskSnapshot>,
}

impl DownloadTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.updates.borrow().clone()
    }

    /// Subscribes to state changes of this task.
    pub fn updates(&self) -> watch::Receiver<TaskSnapshot> {
        self.updates.clone()
    }

    /// Requests cancellation. Takes effect only while the task is queued or
    /// downloading; if this task was the only one interested in the
    /// firmware being transferred, the transfer is aborted.
    pub fn cancel(&self) {
        let _ = self.requests.send(Request::Cancel { task: self.id });
    }

    /// Waits until the task reaches a terminal state and returns the final
    /// snapshot.
    pub async fn wait(&mut self) -> TaskSnapshot {
        loop {
            let snapshot = self.updates.borrow_and_update().clone();
            if snapshot.state.is_terminal() {
                return snapshot;
            }
            if self.updates.changed().await.is_err() {
                return self.updates.borrow().clone();
            }
        }
    }
}

#[derive(Debug)]
enum Request {
    Download {
        id: Uuid,
        requested: Arc<[FirmwareInfo]>,
        updates: watch::Sender<TaskSnapshot>,
    },
    Cancel {
        task: Uuid,
    },
}

/// Accepts download requests and fans shared transfers out to every task
/// waiting on them.
///
/// Must be created from within a tokio runtime. Before starting any
/// transfer the coordinator consults the catalog, so a firmware another
/// task already downloaded is never fetched twice; completed downloads are
/// attached to the catalog before waiters are notified.
#[derive(Debug)]
pub struct DownloadCoordinator {
    requests: mpsc::UnboundedSender<Request>,
}

impl DownloadCoordinator {
    pub fn new(
        catalog: Arc<FirmwareCatalog>,
        persistence: Arc<dyn PersistenceGateway>,
        transport: Arc<dyn Transport>,
        log: &Logger,
    ) -> Self {
        let log = log.new(o!("component" => "DownloadCoordinator"));
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            catalog,
            persistence,
            transport,
            queue: IndexMap::new(),
            tasks: HashMap::new(),
            active: None,
            log,
        };
        tokio::spawn(actor.run(requests_rx));
        Self { requests: requests_tx }
    }

    /// Submits a download of the given firmwares, in order. Returns
    /// immediately; completion is observed through the task's snapshots.
    pub fn download(
        &self,
        firmwares: Vec<FirmwareInfo>,
    ) -> Result<DownloadTask, DownloadError> {
        if firmwares.is_empty() {
            return Err(DownloadError::EmptyRequest);
        }
        let id = Uuid::new_v4();
        let requested: Arc<[FirmwareInfo]> = firmwares.into();
        let (updates_tx, updates_rx) = watch::channel(TaskSnapshot {
            state: DownloadState::Queued,
            requested: requested.clone(),
            completed: 0,
            current_progress: 0,
            overall_progress: 0,
        });
        self.requests
            .send(Request::Download { id, requested, updates: updates_tx })
            .map_err(|_| DownloadError::Shutdown)?;
        Ok(DownloadTask { id, requests: self.requests.clone(), updates: updates_rx })
    }
}

struct TaskEntry {
    requested: Arc<[FirmwareInfo]>,
    completed: usize,
    state: DownloadState,
    current_progress: u8,
    updates: watch::Sender<TaskSnapshot>,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            state: self.state,
            requested: self.requested.clone(),
            completed: self.completed,
            current_progress: self.current_progress,
            overall_progress: overall_progress(
                &self.requested,
                self.completed,
                self.current_progress,
            ),
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }
}

/// `round(100 * done_bytes / total_bytes)`, where completed items count
/// their full size and the in-progress item counts proportionally. A
/// request of zero total bytes reports zero.
fn overall_progress(
    requested: &[FirmwareInfo],
    completed: usize,
    current_progress: u8,
) -> u8 {
    let total: u64 = requested.iter().map(|info| info.size).sum();
    if total == 0 {
        return 0;
    }
    let mut done: u64 =
        requested[..completed].iter().map(|info| info.size).sum();
    if let Some(current) = requested.get(completed) {
        done += current.size * u64::from(current_progress) / 100;
    }
    ((done * 100 + total / 2) / total).min(100) as u8
}

struct ActiveTransfer {
    firmware: FirmwareIdentifier,
    destination: Utf8PathBuf,
    handle: TransferHandle,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    progress: u8,
}

enum Step {
    Request(Option<Request>),
    Transfer(Option<TransferEvent>),
}

struct Actor {
    catalog: Arc<FirmwareCatalog>,
    persistence: Arc<dyn PersistenceGateway>,
    transport: Arc<dyn Transport>,
    /// Wait-sets: each queued firmware maps to the tasks waiting on it, in
    /// FIFO order of first queueing. The first key is the next (or current)
    /// transfer.
    queue: IndexMap<FirmwareIdentifier, Vec<Uuid>>,
    /// Live (non-terminal) tasks.
    tasks: HashMap<Uuid, TaskEntry>,
    active: Option<ActiveTransfer>,
    log: Logger,
}

impl Actor {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            let step = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    request = requests.recv() => Step::Request(request),
                    event = active.events.recv() => Step::Transfer(event),
                },
                None => Step::Request(requests.recv().await),
            };
            match step {
                Step::Request(Some(Request::Download {
                    id,
                    requested,
                    updates,
                })) => {
                    self.tasks.insert(
                        id,
                        TaskEntry {
                            requested,
                            completed: 0,
                            state: DownloadState::Queued,
                            current_progress: 0,
                            updates,
                        },
                    );
                    self.advance_task(id);
                    self.process_queue();
                }
                Step::Request(Some(Request::Cancel { task })) => {
                    self.handle_cancel(task);
                }
                // The coordinator and every task handle are gone; an active
                // transfer (if any) is canceled by dropping its handle.
                Step::Request(None) => break,
                Step::Transfer(event) => self.handle_transfer_event(event),
            }
        }
    }

    /// Advances a task through its request list: items whose firmware is
    /// already on local storage complete on the spot; the first item that
    /// is not joins that firmware's wait-set. An exhausted request list is
    /// success.
    fn advance_task(&mut self, id: Uuid) {
        loop {
            let next = {
                let Some(task) = self.tasks.get_mut(&id) else { return };
                match task.requested.get(task.completed) {
                    None => {
                        task.state = DownloadState::Success;
                        task.publish();
                        self.tasks.remove(&id);
                        return;
                    }
                    Some(info) => {
                        task.state = DownloadState::Queued;
                        task.current_progress = 0;
                        info.firmware.clone()
                    }
                }
            };

            // No network access needed if some earlier download (possibly
            // another task's) already produced the file.
            if self.catalog.update_file(&next).is_some() {
                let task = self.tasks.get_mut(&id).expect("checked above");
                task.current_progress = 100;
                task.completed += 1;
                task.publish();
                continue;
            }

            let waiters = self.queue.entry(next.clone()).or_default();
            if !waiters.contains(&id) {
                waiters.push(id);
            }
            // Joining a transfer already in flight: adopt its progress.
            if self.active.as_ref().is_some_and(|a| a.firmware == next) {
                let progress =
                    self.active.as_ref().map_or(0, |a| a.progress);
                let task = self.tasks.get_mut(&id).expect("checked above");
                task.state = DownloadState::Downloading;
                task.current_progress = progress;
            }
            if let Some(task) = self.tasks.get(&id) {
                task.publish();
            }
            return;
        }
    }

    /// Starts the transfer for the first queued firmware, if none is in
    /// flight. Firmwares that turn out to need no transfer (or cannot be
    /// transferred) are resolved on the spot and the loop moves on.
    fn process_queue(&mut self) {
        while self.active.is_none() {
            let Some(firmware) = self.queue.keys().next().cloned() else {
                return;
            };

            if self.catalog.update_file(&firmware).is_some() {
                self.finish_firmware(&firmware, TransferStatus::Success);
                continue;
            }
            let Some(descriptor) = self.catalog.descriptor(&firmware) else {
                warn!(
                    self.log, "queued firmware is not in the catalog";
                    "firmware" => %firmware,
                );
                self.finish_firmware(&firmware, TransferStatus::Failed);
                continue;
            };
            let Some(source) = self.catalog.remote_url(&firmware) else {
                warn!(
                    self.log, "queued firmware has no remote source";
                    "firmware" => %firmware,
                );
                self.finish_firmware(&firmware, TransferStatus::Failed);
                continue;
            };

            let destination =
                self.persistence.local_path_for(&firmware, &source);
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let handle = self.transport.start_download(
                &source,
                &destination,
                descriptor.size,
                events_tx,
            );
            info!(
                self.log, "starting firmware download";
                "firmware" => %firmware,
                "source" => %source,
                "destination" => %destination,
            );
            self.active = Some(ActiveTransfer {
                firmware: firmware.clone(),
                destination,
                handle,
                events: events_rx,
                progress: 0,
            });
            self.broadcast_progress(&firmware, 0);
        }
    }

    fn handle_transfer_event(&mut self, event: Option<TransferEvent>) {
        // A transport that drops its event channel without reporting
        // completion is treated as a failed transfer.
        let event = event
            .unwrap_or(TransferEvent::Completed(TransferStatus::Failed));
        match event {
            TransferEvent::Progress(progress) => {
                let Some(active) = self.active.as_mut() else { return };
                active.progress = progress;
                let firmware = active.firmware.clone();
                self.broadcast_progress(&firmware, progress);
            }
            TransferEvent::Completed(status) => {
                let Some(ActiveTransfer { firmware, destination, .. }) =
                    self.active.take()
                else {
                    return;
                };
                match status {
                    TransferStatus::Success => {
                        info!(
                            self.log, "firmware download complete";
                            "firmware" => %firmware,
                        );
                        self.catalog.attach_local(&firmware, destination);
                        self.finish_firmware(
                            &firmware,
                            TransferStatus::Success,
                        );
                    }
                    TransferStatus::Failed => {
                        warn!(
                            self.log, "firmware download failed";
                            "firmware" => %firmware,
                        );
                        self.finish_firmware(&firmware, TransferStatus::Failed);
                    }
                    TransferStatus::Canceled => {
                        info!(
                            self.log, "firmware download canceled";
                            "firmware" => %firmware,
                        );
                        self.finish_firmware(
                            &firmware,
                            TransferStatus::Canceled,
                        );
                    }
                }
                self.process_queue();
            }
        }
    }

    /// Resolves a firmware's wait-set: on success every waiting task
    /// completes its current item and advances; on failure or cancellation
    /// every waiting task terminates (a multi-item task fails as a whole,
    /// this layer does not retry).
    fn finish_firmware(
        &mut self,
        firmware: &FirmwareIdentifier,
        status: TransferStatus,
    ) {
        let waiters = self.queue.shift_remove(firmware).unwrap_or_default();
        match status {
            TransferStatus::Success => {
                for id in waiters {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.current_progress = 100;
                        task.completed += 1;
                    }
                    self.advance_task(id);
                }
            }
            TransferStatus::Failed | TransferStatus::Canceled => {
                let state = match status {
                    TransferStatus::Failed => DownloadState::Failed,
                    _ => DownloadState::Canceled,
                };
                for id in waiters {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        task.state = state;
                        task.publish();
                    }
                    self.tasks.remove(&id);
                }
            }
        }
    }

    fn broadcast_progress(
        &mut self,
        firmware: &FirmwareIdentifier,
        progress: u8,
    ) {
        let Some(waiters) = self.queue.get(firmware) else { return };
        for id in waiters.clone() {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.state = DownloadState::Downloading;
                task.current_progress = progress;
                task.publish();
            }
        }
    }

    fn handle_cancel(&mut self, id: Uuid) {
        let Some(task) = self.tasks.get(&id) else {
            // already terminal (or never existed)
            return;
        };

        if let Some(current) = task.requested.get(task.completed) {
            let firmware = current.firmware.clone();
            let mut now_empty = false;
            if let Some(waiters) = self.queue.get_mut(&firmware) {
                waiters.retain(|waiter| *waiter != id);
                now_empty = waiters.is_empty();
            }
            if now_empty {
                let downloading = self
                    .active
                    .as_mut()
                    .filter(|active| active.firmware == firmware);
                match downloading {
                    Some(active) => {
                        // Nobody is interested in this transfer anymore.
                        // The wait-set entry is cleaned up when the
                        // transport confirms the cancellation.
                        active.handle.cancel();
                    }
                    None => {
                        self.queue.shift_remove(&firmware);
                    }
                }
            }
        }

        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = DownloadState::Canceled;
            task.publish();
        }
        self.tasks.remove(&id);
    }
}
