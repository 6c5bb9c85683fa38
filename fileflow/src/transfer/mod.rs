//! Moving bytes in and out of the local staging area.
//!
//! [`Transfer::fetch`] pulls a job's source into its scratch directory and
//! [`Transfer::deliver`] streams the finished file to a [`DeliverySink`].
//! Both observe the job's cancellation token between chunks and report
//! byte progress through a callback.

pub mod sink;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{JobId, JobSpec, SourceRef, ThumbnailRef, UserId};
use crate::error::{ErrorKind, StageError};
use crate::utils::filename::sanitize_filename;

pub use sink::{DeliverySink, DirectorySink, HttpSink, UploadSession};

/// Byte progress callback: `(done, total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// A fetched file in the job's scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHandle {
    pub path: PathBuf,
    pub size: u64,
    /// Name the content arrived with.
    pub original_name: String,
    /// Content type declared by the source, if any.
    pub mime_hint: Option<String>,
}

/// Identifier of a delivered file on the destination side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRef(pub String);

impl std::fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a sink needs to place a file.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub job_id: JobId,
    pub user_id: UserId,
    pub destination: String,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub thumbnail: Option<ThumbnailRef>,
}

#[async_trait]
pub trait Transfer: Send + Sync {
    /// Stage the job's source under `job_dir`.
    async fn fetch(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError>;

    /// Send a staged file to its destination.
    async fn deliver(
        &self,
        local: &LocalHandle,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<RemoteRef, StageError>;
}

/// Default chunk size for reads and writes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunked transfer over the local filesystem and HTTP.
pub struct TransferExecutor {
    http: reqwest::Client,
    /// Directory where the transport layer stages uploaded files.
    upload_root: PathBuf,
    chunk_size: usize,
    max_file_size: u64,
    sink: Arc<dyn DeliverySink>,
}

impl TransferExecutor {
    pub fn new(
        http: reqwest::Client,
        upload_root: impl Into<PathBuf>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            http,
            upload_root: upload_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: u64::MAX,
            sink,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(4096);
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    fn too_large(&self, size: u64) -> StageError {
        StageError::fatal(
            ErrorKind::QuotaExceeded,
            format!(
                "file is {size} bytes, limit is {} bytes",
                self.max_file_size
            ),
        )
    }

    /// Resolve an upload handle inside the upload root.
    fn upload_path(&self, handle: &str) -> Result<PathBuf, StageError> {
        let relative = Path::new(handle);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if handle.is_empty() || escapes {
            return Err(StageError::fatal(
                ErrorKind::SourceUnavailable,
                format!("upload handle '{handle}' is outside the upload area"),
            ));
        }
        Ok(self.upload_root.join(relative))
    }

    async fn create_target(
        job_dir: &Path,
        name: &str,
    ) -> Result<(PathBuf, tokio::fs::File), StageError> {
        tokio::fs::create_dir_all(job_dir)
            .await
            .map_err(|e| StageError::from_io("creating job directory", &e))?;
        let path = job_dir.join(format!("source_{}", sanitize_filename(name)));
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| StageError::from_io("creating staged file", &e))?;
        Ok((path, file))
    }

    async fn fetch_upload(
        &self,
        handle: &str,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError> {
        let source = self.upload_path(handle)?;
        let mut input = tokio::fs::File::open(&source).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StageError::fatal(
                    ErrorKind::SourceUnavailable,
                    format!("upload '{handle}' does not exist"),
                )
            } else {
                StageError::from_io("opening upload", &e)
            }
        })?;
        let total = input
            .metadata()
            .await
            .map_err(|e| StageError::from_io("reading upload metadata", &e))?
            .len();
        if total > self.max_file_size {
            return Err(self.too_large(total));
        }

        let name = spec.display_name();
        let (path, mut output) = Self::create_target(job_dir, &name).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut done = 0u64;
        progress(0, Some(total));

        loop {
            if cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| StageError::from_io("reading upload", &e))?;
            if n == 0 {
                break;
            }
            output
                .write_all(&buf[..n])
                .await
                .map_err(|e| StageError::from_io("writing staged file", &e))?;
            done += n as u64;
            if done > self.max_file_size {
                return Err(self.too_large(done));
            }
            progress(done, Some(total));
        }
        output
            .flush()
            .await
            .map_err(|e| StageError::from_io("flushing staged file", &e))?;

        debug!(path = %path.display(), size = done, "Staged upload");
        Ok(LocalHandle {
            path,
            size: done,
            original_name: name,
            mime_hint: spec.mime_hint.clone(),
        })
    }

    async fn fetch_url(
        &self,
        url: &str,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError> {
        let parsed = url::Url::parse(url).map_err(|e| {
            StageError::fatal(ErrorKind::SourceUnavailable, format!("invalid URL '{url}': {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(StageError::fatal(
                ErrorKind::SourceUnavailable,
                format!("unsupported URL scheme '{}'", parsed.scheme()),
            ));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(StageError::cancelled()),
            r = self.http.get(parsed).send() => r.map_err(|e| StageError::from_reqwest("fetch", &e))?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(StageError::from_http_status("fetch", status.as_u16()));
        }

        let total = response.content_length();
        if let Some(total) = total
            && total > self.max_file_size
        {
            return Err(self.too_large(total));
        }
        let mime_hint = spec.mime_hint.clone().or_else(|| {
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

        let name = spec.display_name();
        let (path, mut output) = Self::create_target(job_dir, &name).await?;
        let mut stream = response.bytes_stream();
        let mut done = 0u64;
        progress(0, total);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(StageError::cancelled()),
                next = stream.next() => match next {
                    Some(chunk) => chunk.map_err(|e| StageError::from_reqwest("fetch", &e))?,
                    None => break,
                },
            };
            done += chunk.len() as u64;
            if done > self.max_file_size {
                return Err(self.too_large(done));
            }
            output
                .write_all(&chunk)
                .await
                .map_err(|e| StageError::from_io("writing staged file", &e))?;
            progress(done, total);
        }
        output
            .flush()
            .await
            .map_err(|e| StageError::from_io("flushing staged file", &e))?;

        if let Some(total) = total
            && done < total
        {
            return Err(StageError::transient(
                ErrorKind::SourceUnavailable,
                format!("connection closed after {done} of {total} bytes"),
            ));
        }

        debug!(url, path = %path.display(), size = done, "Downloaded source");
        Ok(LocalHandle {
            path,
            size: done,
            original_name: name,
            mime_hint,
        })
    }

    async fn stream_to_session(
        &self,
        local: &LocalHandle,
        session: &mut Box<dyn UploadSession>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<(), StageError> {
        let mut input = tokio::fs::File::open(&local.path)
            .await
            .map_err(|e| StageError::from_io("opening staged file", &e))?;
        let mut done = 0u64;
        progress(0, Some(local.size));

        loop {
            if cancel.is_cancelled() {
                return Err(StageError::cancelled());
            }
            let mut buf = vec![0u8; self.chunk_size];
            let n = input
                .read(&mut buf)
                .await
                .map_err(|e| StageError::from_io("reading staged file", &e))?;
            if n == 0 {
                return Ok(());
            }
            buf.truncate(n);
            session.write_chunk(Bytes::from(buf)).await?;
            done += n as u64;
            progress(done, Some(local.size));
        }
    }
}

#[async_trait]
impl Transfer for TransferExecutor {
    async fn fetch(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<LocalHandle, StageError> {
        match &spec.source {
            SourceRef::Upload { handle } => {
                self.fetch_upload(handle, spec, job_dir, cancel, progress)
                    .await
            }
            SourceRef::Url { url } => self.fetch_url(url, spec, job_dir, cancel, progress).await,
        }
    }

    async fn deliver(
        &self,
        local: &LocalHandle,
        request: &DeliveryRequest,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<RemoteRef, StageError> {
        if local.size > self.max_file_size {
            return Err(self.too_large(local.size));
        }

        let mut session = self.sink.open(request).await?;
        match self
            .stream_to_session(local, &mut session, cancel, progress)
            .await
        {
            Ok(()) => {
                let remote = session.finish().await?;
                info!(job_id = %request.job_id, remote = %remote, "Delivered {}", request.filename);
                Ok(remote)
            }
            Err(e) => {
                session.abort().await;
                Err(e)
            }
        }
    }
}
