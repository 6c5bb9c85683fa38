//! Delivery destinations.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{DeliveryRequest, RemoteRef};
use crate::error::{ErrorKind, StageError};
use crate::utils::filename::sanitize_filename;
use crate::utils::fs::remove_file_quiet;

/// Opens an upload for one delivery.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn open(&self, request: &DeliveryRequest) -> Result<Box<dyn UploadSession>, StageError>;
}

/// A delivery in progress. Exactly one of `finish` or `abort` ends it.
#[async_trait]
pub trait UploadSession: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StageError>;
    async fn finish(self: Box<Self>) -> Result<RemoteRef, StageError>;
    /// Discard whatever was written so far.
    async fn abort(self: Box<Self>);
}

/// Writes deliveries into `<root>/<destination>/<filename>`.
///
/// Data goes to a `.part` file in [`staging_dir`](Self::staging_dir) first
/// and is renamed into place on finish. An existing file is never
/// overwritten; a ` (n)` suffix is added instead.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

/// Staging directory name under the sink root.
const STAGING_DIR: &str = ".partial";

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where unfinished deliveries live. Anything left here after a crash is
    /// garbage and can be removed before workers start.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn destination_dir(&self, destination: &str) -> PathBuf {
        let destination = destination.trim();
        if destination.is_empty() {
            self.root.clone()
        } else {
            self.root.join(sanitize_filename(destination))
        }
    }
}

fn numbered_name(filename: &str, n: u32) -> String {
    if n == 0 {
        return filename.to_string();
    }
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{filename} ({n})"),
    }
}

/// Claim the first free name for `filename` in `dir` by creating it
/// exclusively. Concurrent callers never get the same path.
async fn claim_target(dir: &Path, filename: &str) -> Result<PathBuf, StageError> {
    let mut n = 0u32;
    loop {
        let candidate = dir.join(numbered_name(filename, n));
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(StageError::from_io("claiming delivery name", &e)),
        }
    }
}

#[async_trait]
impl DeliverySink for DirectorySink {
    async fn open(&self, request: &DeliveryRequest) -> Result<Box<dyn UploadSession>, StageError> {
        let dir = self.destination_dir(&request.destination);
        let staging = self.staging_dir();
        for d in [&dir, &staging] {
            tokio::fs::create_dir_all(d)
                .await
                .map_err(|e| StageError::from_io("creating delivery directory", &e))?;
        }

        let part = staging.join(format!(
            "{}.{}.part",
            request.job_id,
            uuid::Uuid::new_v4().simple()
        ));
        let file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| StageError::from_io("creating delivery file", &e))?;

        Ok(Box::new(DirectorySession {
            dir,
            part,
            file: Some(file),
            filename: request.filename.clone(),
            thumbnail: request.thumbnail.as_ref().map(|t| t.path.clone()),
        }))
    }
}

struct DirectorySession {
    dir: PathBuf,
    part: PathBuf,
    /// `None` once the session has ended.
    file: Option<tokio::fs::File>,
    filename: String,
    thumbnail: Option<PathBuf>,
}

impl DirectorySession {
    fn file(&mut self) -> Result<&mut tokio::fs::File, StageError> {
        self.file
            .as_mut()
            .ok_or_else(|| StageError::fatal(ErrorKind::IOFailure, "session already closed"))
    }

    async fn place(&mut self) -> Result<PathBuf, StageError> {
        let file = self.file()?;
        file.flush()
            .await
            .map_err(|e| StageError::from_io("flushing delivery file", &e))?;
        file.sync_all()
            .await
            .map_err(|e| StageError::from_io("syncing delivery file", &e))?;
        self.file = None;

        let target = claim_target(&self.dir, &self.filename).await?;
        // Replaces only the empty placeholder claimed above.
        if let Err(e) = tokio::fs::rename(&self.part, &target).await {
            remove_file_quiet(&target).await;
            return Err(StageError::from_io("renaming delivery file", &e));
        }
        Ok(target)
    }
}

#[async_trait]
impl UploadSession for DirectorySession {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StageError> {
        self.file()?
            .write_all(&chunk)
            .await
            .map_err(|e| StageError::from_io("writing delivery file", &e))
    }

    async fn finish(mut self: Box<Self>) -> Result<RemoteRef, StageError> {
        let target = self.place().await?;

        if let Some(thumb) = &self.thumbnail {
            let thumb_target = target.with_extension("thumb.jpg");
            if let Err(e) = tokio::fs::copy(thumb, &thumb_target).await {
                warn!(path = %thumb.display(), error = %e, "Failed to attach thumbnail");
            }
        }

        debug!(path = %target.display(), "Delivery written");
        Ok(RemoteRef(target.to_string_lossy().to_string()))
    }

    async fn abort(mut self: Box<Self>) {
        self.file = None;
        remove_file_quiet(&self.part).await;
    }
}

impl Drop for DirectorySession {
    // A session dropped mid-write (timeout, panic) still removes its part
    // file. After `finish` or `abort` the file is already gone.
    fn drop(&mut self) {
        self.file = None;
        if let Err(e) = std::fs::remove_file(&self.part)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.part.display(), error = %e, "Failed to remove partial delivery");
        }
    }
}

/// Streams deliveries as the body of a POST to an HTTP endpoint.
///
/// The remote reference is the response body, or the `Location` header
/// when the body is empty. A thumbnail follows in a second POST to the same
/// endpoint, as `image/jpeg` with `thumbnail_for=<remote reference>`.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, endpoint: url::Url) -> Self {
        Self { client, endpoint }
    }
}

type BodyChunk = Result<Bytes, std::io::Error>;

#[async_trait]
impl DeliverySink for HttpSink {
    async fn open(&self, request: &DeliveryRequest) -> Result<Box<dyn UploadSession>, StageError> {
        let (tx, rx) = mpsc::channel::<BodyChunk>(4);
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));

        let call = self
            .client
            .post(self.endpoint.clone())
            .query(&[
                ("job_id", request.job_id.as_str()),
                ("destination", request.destination.as_str()),
                ("filename", request.filename.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, request.mime.as_str())
            .header(reqwest::header::CONTENT_LENGTH, request.size)
            .body(body);

        let task = tokio::spawn(async move {
            let response = call
                .send()
                .await
                .map_err(|e| StageError::from_reqwest("deliver", &e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(StageError::from_http_status("deliver", status.as_u16()));
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let text = response
                .text()
                .await
                .map_err(|e| StageError::from_reqwest("deliver", &e))?;
            let remote = Some(text.trim().to_string())
                .filter(|t| !t.is_empty())
                .or(location)
                .ok_or_else(|| {
                    StageError::fatal(
                        ErrorKind::SourceUnavailable,
                        "delivery endpoint returned no reference",
                    )
                })?;
            Ok(RemoteRef(remote))
        });

        Ok(Box::new(HttpSession {
            tx: Some(tx),
            task: Some(task),
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            job_id: request.job_id.clone(),
            thumbnail: request.thumbnail.as_ref().map(|t| t.path.clone()),
        }))
    }
}

struct HttpSession {
    tx: Option<mpsc::Sender<BodyChunk>>,
    task: Option<JoinHandle<Result<RemoteRef, StageError>>>,
    client: reqwest::Client,
    endpoint: url::Url,
    job_id: String,
    thumbnail: Option<PathBuf>,
}

impl HttpSession {
    async fn send_thumbnail(&self, path: &Path, remote: &RemoteRef) -> Result<(), StageError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| StageError::from_io("reading thumbnail", &e))?;
        let response = self
            .client
            .post(self.endpoint.clone())
            .query(&[
                ("job_id", self.job_id.as_str()),
                ("thumbnail_for", remote.0.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(data)
            .send()
            .await
            .map_err(|e| StageError::from_reqwest("deliver thumbnail", &e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::from_http_status(
                "deliver thumbnail",
                status.as_u16(),
            ));
        }
        Ok(())
    }

    async fn join(&mut self) -> Result<RemoteRef, StageError> {
        self.tx = None;
        let Some(task) = self.task.take() else {
            return Err(StageError::fatal(ErrorKind::IOFailure, "session already closed"));
        };
        task.await.map_err(|e| {
            StageError::transient(
                ErrorKind::SourceUnavailable,
                format!("delivery request task failed: {e}"),
            )
        })?
    }
}

#[async_trait]
impl UploadSession for HttpSession {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), StageError> {
        let Some(tx) = &self.tx else {
            return Err(StageError::fatal(ErrorKind::IOFailure, "session already closed"));
        };
        if tx.send(Ok(chunk)).await.is_ok() {
            return Ok(());
        }
        // The request ended early; surface its error.
        match self.join().await {
            Ok(_) => Err(StageError::transient(
                ErrorKind::SourceUnavailable,
                "delivery endpoint closed the request early",
            )),
            Err(e) => Err(e),
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<RemoteRef, StageError> {
        let remote = self.join().await?;
        if let Some(path) = &self.thumbnail
            && let Err(e) = self.send_thumbnail(path, &remote).await
        {
            warn!(job_id = %self.job_id, path = %path.display(), "Failed to attach thumbnail: {e}");
        }
        Ok(remote)
    }

    async fn abort(mut self: Box<Self>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(std::io::Error::other("delivery aborted"))).await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
