//! The resumable upload engine.
//!
//! One [`UploadEngine`] owns one [`UploadSession`] and sends at most one chunk
//! at a time. Pause and cancel arrive through a [`SessionHandle`] (or the
//! engine's own methods) and abort the chunk in flight by dropping its
//! request; `offset` only moves on an acknowledgment, so an aborted chunk is
//! simply sent again later.

use crate::error::{ClientError, Result};
use crate::source::ChunkSource;
use crate::transport::{FinalizeReceipt, Transport};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::{
    DEFAULT_CHUNK_SIZE, FileDescriptor, RetryState, UploadMetadata, UploadProgress,
    UploadSession, UploadStatus,
};
use tokio::sync::{mpsc, watch};

/// Delays before each retry of a failed request: immediately, then 1s, 3s, 5s.
pub const DEFAULT_RETRY_DELAYS: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Fixed for the life of the session.
    pub chunk_size: u64,
    /// One entry per retry; the session fails once they run out.
    pub retry_delays: Vec<Duration>,
    /// Progress events buffered before new ones are dropped.
    pub progress_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_delays: DEFAULT_RETRY_DELAYS.to_vec(),
            progress_capacity: 64,
        }
    }
}

/// Requested run state, set from outside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
}

/// Controls a running engine from another task.
#[derive(Clone)]
pub struct SessionHandle {
    control: Arc<watch::Sender<Control>>,
}

impl SessionHandle {
    pub fn pause(&self) {
        self.control.send_if_modified(|c| {
            let changed = *c == Control::Run;
            if changed {
                *c = Control::Pause;
            }
            changed
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|c| {
            let changed = *c == Control::Pause;
            if changed {
                *c = Control::Run;
            }
            changed
        });
    }

    /// Cancel for good; a later `resume` has no effect.
    pub fn cancel(&self) {
        self.control.send_replace(Control::Cancel);
    }

    pub fn current(&self) -> Control {
        *self.control.borrow()
    }
}

/// Result of one call to [`UploadEngine::upload_next_chunk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A chunk was acknowledged; holds the new offset.
    Advanced(u64),
    Paused,
    Cancelled,
}

/// Everything needed to pick an upload up again in a new process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: UploadSession,
    pub metadata: UploadMetadata,
}

/// Drives one resumable upload.
pub struct UploadEngine {
    transport: Arc<dyn Transport>,
    source: Arc<dyn ChunkSource>,
    metadata: UploadMetadata,
    session: UploadSession,
    retry_delays: Vec<Duration>,
    control_tx: Arc<watch::Sender<Control>>,
    control: watch::Receiver<Control>,
    progress: Option<mpsc::Sender<UploadProgress>>,
    progress_capacity: usize,
    last_error: Option<String>,
    receipt: Option<FinalizeReceipt>,
}

impl UploadEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        source: Arc<dyn ChunkSource>,
        metadata: UploadMetadata,
        config: SessionConfig,
    ) -> Result<Self> {
        let file = FileDescriptor {
            name: metadata.filename.clone(),
            size: source.len(),
            mime_type: metadata.filetype.clone(),
        };
        let session = UploadSession::new(file, config.chunk_size)?;
        Ok(Self::from_parts(transport, source, metadata, session, config))
    }

    /// Rebuild an engine from a snapshot.
    ///
    /// A session that had started comes back `Paused`; [`UploadEngine::resume`]
    /// (or [`UploadEngine::run`]) asks the server where to continue from.
    pub fn restore(
        transport: Arc<dyn Transport>,
        source: Arc<dyn ChunkSource>,
        snapshot: SessionSnapshot,
        config: SessionConfig,
    ) -> Result<Self> {
        let SessionSnapshot {
            mut session,
            metadata,
        } = snapshot;
        if session.status.is_terminal() {
            return Err(ClientError::InvalidState {
                operation: "restore",
                status: session.status,
            });
        }
        if source.len() != session.file.size {
            return Err(ClientError::SourceChanged {
                expected: session.file.size,
                actual: source.len(),
            });
        }
        session.status = if session.upload_url.is_some() {
            UploadStatus::Paused
        } else {
            UploadStatus::Idle
        };
        session.retry_state = RetryState::default();
        Ok(Self::from_parts(transport, source, metadata, session, config))
    }

    fn from_parts(
        transport: Arc<dyn Transport>,
        source: Arc<dyn ChunkSource>,
        metadata: UploadMetadata,
        session: UploadSession,
        config: SessionConfig,
    ) -> Self {
        let (control_tx, control) = watch::channel(Control::Run);
        Self {
            transport,
            source,
            metadata,
            session,
            retry_delays: config.retry_delays,
            control_tx: Arc::new(control_tx),
            control,
            progress: None,
            progress_capacity: config.progress_capacity.max(1),
            last_error: None,
            receipt: None,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            control: self.control_tx.clone(),
        }
    }

    /// Receive a progress event after every acknowledged chunk.
    ///
    /// Events are dropped rather than blocking the upload when the receiver
    /// falls behind. Calling this again replaces the previous receiver.
    pub fn subscribe_progress(&mut self) -> mpsc::Receiver<UploadProgress> {
        let (tx, rx) = mpsc::channel(self.progress_capacity);
        self.progress = Some(tx);
        rx
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn status(&self) -> UploadStatus {
        self.session.status
    }

    pub fn offset(&self) -> u64 {
        self.session.offset
    }

    /// Message of the error that failed the session, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn receipt(&self) -> Option<&FinalizeReceipt> {
        self.receipt.as_ref()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Register the upload with the server and start at offset 0.
    pub async fn start(&mut self) -> Result<()> {
        self.require(&[UploadStatus::Idle], "start")?;
        let transport = self.transport.clone();
        let metadata = self.metadata.clone();
        let size = self.session.file.size;
        let reference = self
            .with_retry("create", || {
                let transport = transport.clone();
                let metadata = metadata.clone();
                async move { transport.create(&metadata, size).await }
            })
            .await?;

        tracing::info!(upload_id = %self.session.id, reference = %reference, size, "upload started");
        self.session.upload_url = Some(reference);
        self.session.offset = 0;
        self.session.status = UploadStatus::Uploading;
        Ok(())
    }

    /// Send the chunk at the current offset, retrying on the delay schedule.
    ///
    /// Returns early with [`Step::Paused`] or [`Step::Cancelled`] when asked
    /// to stop, including while the chunk is in flight.
    pub async fn upload_next_chunk(&mut self) -> Result<Step> {
        self.require(&[UploadStatus::Uploading], "upload a chunk of")?;
        let reference = self.reference()?;

        loop {
            let control = *self.control.borrow_and_update();
            if control != Control::Run {
                return self.interrupt(control).await;
            }

            let range = self.session.next_range();
            let sent_from = range.start;
            let sent_len = range.end - range.start;

            let error = match self.send_chunk(&reference, sent_from, sent_len).await {
                Ok(Sent::Acked(acked)) => {
                    if let Err(e) = self.session.acknowledge(sent_from, sent_len, acked) {
                        let error = ClientError::Protocol(e.to_string());
                        self.fail(&error);
                        return Err(error);
                    }
                    self.session.retry_state = RetryState::default();
                    self.emit_progress();
                    tracing::debug!(
                        upload_id = %self.session.id,
                        offset = self.session.offset,
                        total = self.session.file.size,
                        "chunk acknowledged"
                    );
                    return Ok(Step::Advanced(self.session.offset));
                }
                Ok(Sent::Interrupted(control)) => return self.interrupt(control).await,
                Err(e) => e,
            };

            if let ClientError::OffsetMismatch { server, .. } = error
                && let Err(e) = self.adopt_server_offset(server)
            {
                self.fail(&e);
                return Err(e);
            }

            match self.backoff("send_chunk", &error).await {
                Backoff::Retry => {}
                Backoff::Interrupted(control) => return self.interrupt(control).await,
                Backoff::GiveUp => {
                    self.fail(&error);
                    return Err(error);
                }
            }
        }
    }

    /// Stop between chunks. The offset is kept.
    pub fn pause(&mut self) -> Result<()> {
        self.require(&[UploadStatus::Uploading, UploadStatus::Paused], "pause")?;
        self.control_tx.send_if_modified(|c| {
            let changed = *c == Control::Run;
            if changed {
                *c = Control::Pause;
            }
            changed
        });
        if self.session.status != UploadStatus::Paused {
            tracing::info!(upload_id = %self.session.id, offset = self.session.offset, "upload paused");
        }
        self.session.status = UploadStatus::Paused;
        Ok(())
    }

    /// Continue a paused or failed session from the server's offset.
    ///
    /// A server offset below the acknowledged one fails the session, since
    /// the server dropped bytes it had already confirmed.
    pub async fn resume(&mut self) -> Result<()> {
        self.require(&[UploadStatus::Paused, UploadStatus::Failed], "resume")?;
        let reference = self.reference()?;
        let transport = self.transport.clone();

        self.control_tx.send_if_modified(|c| {
            let changed = *c == Control::Pause;
            if changed {
                *c = Control::Run;
            }
            changed
        });

        let server = self
            .with_retry("get_offset", || {
                let transport = transport.clone();
                let reference = reference.clone();
                async move { transport.get_offset(&reference).await }
            })
            .await?;
        if let Err(e) = self.adopt_server_offset(server) {
            self.fail(&e);
            return Err(e);
        }

        self.session.retry_state = RetryState::default();
        self.session.status = UploadStatus::Uploading;
        self.last_error = None;
        tracing::info!(upload_id = %self.session.id, offset = server, "upload resumed");
        Ok(())
    }

    /// Abort and ask the server to discard what it holds. Terminal.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.session.status.is_terminal() {
            return Err(ClientError::InvalidState {
                operation: "cancel",
                status: self.session.status,
            });
        }
        self.control_tx.send_replace(Control::Cancel);

        if let Some(reference) = &self.session.upload_url
            && let Err(e) = self.transport.discard(reference).await
        {
            tracing::warn!(
                upload_id = %self.session.id,
                error = %e,
                "server did not discard cancelled upload"
            );
        }
        self.session.status = UploadStatus::Cancelled;
        tracing::info!(upload_id = %self.session.id, "upload cancelled");
        Ok(())
    }

    /// Finalize once every byte is acknowledged.
    pub async fn finalize(&mut self) -> Result<FinalizeReceipt> {
        self.require(&[UploadStatus::Uploading], "finalize")?;
        if !self.session.is_fully_acknowledged() {
            return Err(ClientError::Protocol(format!(
                "cannot finalize at offset {} of {}",
                self.session.offset, self.session.file.size
            )));
        }
        let reference = self.reference()?;
        let transport = self.transport.clone();
        let receipt = match self
            .with_retry("finalize", || {
                let transport = transport.clone();
                let reference = reference.clone();
                async move { transport.finalize(&reference).await }
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        self.session.status = UploadStatus::Completed;
        tracing::info!(
            upload_id = %self.session.id,
            job_id = %receipt.job_id,
            "upload completed"
        );
        self.receipt = Some(receipt.clone());
        Ok(receipt)
    }

    /// Drive the session to completion.
    ///
    /// Starts or resumes as needed and waits out pauses requested through
    /// the [`SessionHandle`]. Returns [`ClientError::Cancelled`] if cancelled.
    pub async fn run(&mut self) -> Result<FinalizeReceipt> {
        match self.session.status {
            UploadStatus::Idle => self.start().await?,
            UploadStatus::Paused | UploadStatus::Failed => {
                if !self.wait_while_paused().await? {
                    return Err(ClientError::Cancelled);
                }
            }
            UploadStatus::Uploading => {}
            status => {
                return Err(ClientError::InvalidState {
                    operation: "run",
                    status,
                });
            }
        }

        while !self.session.is_fully_acknowledged() {
            match self.upload_next_chunk().await? {
                Step::Advanced(_) => {}
                Step::Paused => {
                    if !self.wait_while_paused().await? {
                        return Err(ClientError::Cancelled);
                    }
                }
                Step::Cancelled => return Err(ClientError::Cancelled),
            }
        }
        self.finalize().await
    }

    /// Wait until the handle asks to run again, then resume.
    /// Returns `false` if the session was cancelled instead.
    async fn wait_while_paused(&mut self) -> Result<bool> {
        // The engine holds a sender, so the channel never closes under us.
        let control = self
            .control
            .wait_for(|c| *c != Control::Pause)
            .await
            .map(|c| *c)
            .unwrap_or(Control::Cancel);
        match control {
            Control::Cancel => {
                if self.session.status != UploadStatus::Cancelled {
                    self.cancel().await?;
                }
                Ok(false)
            }
            _ => {
                self.resume().await?;
                Ok(true)
            }
        }
    }

    fn reference(&self) -> Result<String> {
        self.session
            .upload_url
            .clone()
            .ok_or_else(|| ClientError::Protocol("upload has not been created".to_string()))
    }

    fn require(&self, allowed: &[UploadStatus], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.session.status) {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                operation,
                status: self.session.status,
            })
        }
    }

    async fn send_chunk(&mut self, reference: &str, offset: u64, len: u64) -> Result<Sent> {
        let chunk = self.source.read_at(offset, len as usize).await?;
        tokio::select! {
            biased;
            control = interrupted(&mut self.control) => Ok(Sent::Interrupted(control)),
            acked = self.transport.send_chunk(reference, offset, chunk) => acked.map(Sent::Acked),
        }
    }

    async fn interrupt(&mut self, control: Control) -> Result<Step> {
        match control {
            Control::Cancel => {
                self.cancel().await?;
                Ok(Step::Cancelled)
            }
            _ => {
                self.pause()?;
                Ok(Step::Paused)
            }
        }
    }

    /// Accept the server's offset, which must lie between the acknowledged
    /// offset and the end of the file. `offset` never moves backwards.
    fn adopt_server_offset(&mut self, server: u64) -> Result<()> {
        if server > self.session.file.size {
            return Err(ClientError::Protocol(format!(
                "server offset {server} is past the end of {} bytes",
                self.session.file.size
            )));
        }
        if server < self.session.offset {
            return Err(ClientError::Protocol(format!(
                "server lost acknowledged bytes: it holds {server} but acknowledged {}",
                self.session.offset
            )));
        }
        self.session.offset = server;
        Ok(())
    }

    /// Record a failed attempt and wait before the next one.
    async fn backoff(&mut self, step: &'static str, error: &ClientError) -> Backoff {
        if !error.is_retryable() {
            return Backoff::GiveUp;
        }
        let attempt = self.session.retry_state.attempt + 1;
        let Some(scheduled) = self.retry_delays.get(attempt as usize - 1).copied() else {
            return Backoff::GiveUp;
        };
        let delay = error.retry_after().map_or(scheduled, |hint| hint.max(scheduled));
        self.session.retry_state = RetryState {
            attempt,
            next_delay_ms: Some(delay.as_millis() as u64),
        };
        tracing::warn!(
            upload_id = %self.session.id,
            step,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request failed, retrying"
        );
        tokio::select! {
            control = interrupted(&mut self.control) => Backoff::Interrupted(control),
            _ = tokio::time::sleep(delay) => Backoff::Retry,
        }
    }

    /// Run a single request with the retry schedule. Pauses are ignored
    /// here; a cancel aborts with [`ClientError::Cancelled`].
    async fn with_retry<T, F, Fut>(&mut self, step: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.session.retry_state = RetryState::default();
        loop {
            let error = match op().await {
                Ok(value) => {
                    self.session.retry_state = RetryState::default();
                    return Ok(value);
                }
                Err(e) => e,
            };
            match self.backoff(step, &error).await {
                Backoff::Retry => {}
                Backoff::Interrupted(Control::Cancel) => return Err(ClientError::Cancelled),
                Backoff::Interrupted(_) => {
                    // Finish the wait, then try again.
                    let delay = self
                        .session
                        .retry_state
                        .next_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or_default();
                    tokio::time::sleep(delay).await;
                }
                Backoff::GiveUp => return Err(error),
            }
        }
    }

    fn fail(&mut self, error: &ClientError) {
        tracing::error!(
            upload_id = %self.session.id,
            offset = self.session.offset,
            error = %error,
            "upload failed"
        );
        self.session.status = UploadStatus::Failed;
        self.last_error = Some(error.to_string());
    }

    fn emit_progress(&self) {
        if let Some(tx) = &self.progress
            && tx.try_send(self.session.progress()).is_err()
        {
            tracing::trace!(upload_id = %self.session.id, "progress event dropped");
        }
    }
}

enum Sent {
    Acked(u64),
    Interrupted(Control),
}

enum Backoff {
    Retry,
    Interrupted(Control),
    GiveUp,
}

/// Resolves once the control leaves `Run`.
async fn interrupted(control: &mut watch::Receiver<Control>) -> Control {
    let changed = control.wait_for(|c| *c != Control::Run).await.map(|c| *c);
    match changed {
        Ok(c) => c,
        Err(_) => std::future::pending().await,
    }
}
