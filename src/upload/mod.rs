//! Upload module
//!
//! One entry point, [`AsyncClient::upload`](crate::AsyncClient::upload),
//! accepts a file path, an in-memory buffer or a reader and picks the
//! transfer method:
//!
//! | Source | Size | Method |
//! |--------|------|--------|
//! | Path | > `multipart_threshold` | multipart, `part_size` chunks |
//! | Path | <= `multipart_threshold` | single `put_object` |
//! | Bytes / Reader | any | single `put_object` |
//!
//! A multipart upload either completes or is aborted; no partial object is
//! ever left behind by a failed call.

use crate::client::{BlockingClient, Params, Response, ServiceError};
use crate::error::BridgeError;
use crate::metrics;
use crate::proxy::AsyncClient;
use bytes::Bytes;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, Span};

pub mod multipart;
pub mod put_object;

pub use multipart::CompletedPart;

/// Files above this size go multipart (8 MiB)
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 1 << 23;

/// Multipart chunk size (8 MiB)
pub const DEFAULT_PART_SIZE: usize = 1 << 23;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("No key given and none can be derived from the source")]
    MissingKey,

    #[error("Multipart upload {upload_id} produced no parts")]
    EmptyMultipart { upload_id: String },

    #[error("CreateMultipartUpload returned no UploadId")]
    MissingUploadId,

    #[error("UploadPart returned no ETag for part {0}")]
    MissingETag(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bridge(BridgeError),
}

impl UploadError {
    /// Caller-side mistakes rather than transfer failures
    pub fn is_config_error(&self) -> bool {
        match self {
            UploadError::MissingKey | UploadError::EmptyMultipart { .. } => true,
            UploadError::Bridge(e) => e.is_config_error(),
            _ => false,
        }
    }

    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            UploadError::Bridge(e) => e.service_error(),
            _ => None,
        }
    }
}

impl From<BridgeError> for UploadError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Io(e) => UploadError::Io(e),
            other => UploadError::Bridge(other),
        }
    }
}

impl From<ServiceError> for UploadError {
    fn from(e: ServiceError) -> Self {
        UploadError::Bridge(BridgeError::Service(e))
    }
}

/// What to upload
pub enum UploadSource {
    /// File on disk; its name supplies the default key
    Path(PathBuf),
    Bytes(Bytes),
    /// Read to the end before upload
    Reader(Box<dyn Read + Send>),
}

impl UploadSource {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        UploadSource::Reader(Box::new(reader))
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            UploadSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            UploadSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<PathBuf> for UploadSource {
    fn from(path: PathBuf) -> Self {
        UploadSource::Path(path)
    }
}

impl From<&Path> for UploadSource {
    fn from(path: &Path) -> Self {
        UploadSource::Path(path.to_path_buf())
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        UploadSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        UploadSource::Bytes(Bytes::from(bytes))
    }
}

/// Parameters of one upload call
#[derive(Debug)]
pub struct UploadRequest {
    bucket: String,
    source: UploadSource,
    upload_path: Option<String>,
    key: Option<String>,
    content_type: Option<String>,
    extra: Params,
}

impl UploadRequest {
    pub fn new(bucket: impl Into<String>, source: impl Into<UploadSource>) -> Self {
        Self {
            bucket: bucket.into(),
            source: source.into(),
            upload_path: None,
            key: None,
            content_type: None,
            extra: Params::new(),
        }
    }

    /// Key prefix for file sources; a trailing `/` is added when missing.
    /// Buffers and readers keep their key as given.
    pub fn upload_path(mut self, upload_path: impl Into<String>) -> Self {
        self.upload_path = Some(upload_path.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Overrides the type guessed from the file name
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Extra parameters forwarded to `put_object` / `create_multipart_upload`
    pub fn param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.set(name, value);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Upload with key, content type and payload resolved
#[derive(Debug)]
pub(crate) struct Target {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub extra: Params,
}

impl Target {
    /// Bucket, key, content type and extras
    pub(crate) fn params(&self) -> Params {
        let mut params = Params::new()
            .with("Bucket", self.bucket.as_str())
            .with("Key", self.key.as_str());
        if let Some(content_type) = &self.content_type {
            params.set("ContentType", content_type.as_str());
        }
        params.merge_missing(&self.extra);
        params
    }
}

enum Payload {
    File { path: PathBuf, size: u64 },
    Memory(Bytes),
}

impl Payload {
    fn len(&self) -> u64 {
        match self {
            Payload::File { size, .. } => *size,
            Payload::Memory(bytes) => bytes.len() as u64,
        }
    }
}

/// Join `prefix` and `key` with exactly one `/`
pub fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        return key.to_string();
    }
    if prefix.ends_with('/') {
        format!("{}{}", prefix, key)
    } else {
        format!("{}/{}", prefix, key)
    }
}

/// Content type guessed from a file name
pub fn guess_content_type(path: &Path) -> Option<String> {
    mime_guess::from_path(path).first_raw().map(String::from)
}

/// Resolve key, content type and payload. Filesystem access is dispatched.
async fn resolve<C: BlockingClient + ?Sized>(
    client: &AsyncClient<C>,
    request: UploadRequest,
) -> Result<(Target, Payload), UploadError> {
    let UploadRequest {
        bucket,
        source,
        upload_path,
        mut key,
        mut content_type,
        extra,
    } = request;

    let payload = match source {
        UploadSource::Bytes(bytes) => Payload::Memory(bytes),
        UploadSource::Reader(mut reader) => {
            let data = client
                .run_blocking(move || {
                    let mut buffer = Vec::new();
                    reader.read_to_end(&mut buffer).map(|_| buffer)
                })
                .await??;
            Payload::Memory(Bytes::from(data))
        }
        UploadSource::Path(path) => {
            let stat_path = path.clone();
            let size = client
                .run_blocking(move || std::fs::metadata(&stat_path).map(|m| m.len()))
                .await??;

            if key.is_none() {
                key = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());
            }
            if let Some(prefix) = upload_path.as_deref() {
                key = key.map(|k| prefixed_key(prefix, &k));
            }
            if content_type.is_none() {
                content_type = guess_content_type(&path);
            }
            Payload::File { path, size }
        }
    };

    let key = key.filter(|k| !k.is_empty()).ok_or(UploadError::MissingKey)?;

    Ok((
        Target {
            bucket,
            key,
            content_type,
            extra,
        },
        payload,
    ))
}

/// Upload `request` through `client`
#[tracing::instrument(
    name = "upload",
    skip(client, request),
    fields(
        s3.bucket = %request.bucket,
        s3.key = tracing::field::Empty,
        upload.method = tracing::field::Empty,
        upload.bytes = tracing::field::Empty,
    ),
    err
)]
pub(crate) async fn upload<C: BlockingClient + ?Sized>(
    client: &AsyncClient<C>,
    request: UploadRequest,
) -> Result<Response, UploadError> {
    let started = Instant::now();
    let bucket = request.bucket.clone();

    let (target, payload) = match resolve(client, request).await {
        Ok(resolved) => resolved,
        Err(e) => {
            metrics::record_upload_failure(&bucket, "unresolved");
            return Err(e);
        }
    };

    let config = client.upload_config();
    let bytes = payload.len();
    let method = match &payload {
        Payload::File { size, .. } if *size > config.multipart_threshold => "multipart",
        _ => "put_object",
    };

    let span = Span::current();
    span.record("s3.key", target.key.as_str());
    span.record("upload.method", method);
    span.record("upload.bytes", bytes);
    debug!(key = %target.key, method, bytes, "Upload routed");

    let result = match payload {
        Payload::File { path, .. } if method == "multipart" => {
            multipart::upload_file(client, &target, path, config.part_size).await
        }
        Payload::File { path, .. } => {
            let data = client.run_blocking(move || std::fs::read(path)).await?;
            match data {
                Ok(data) => put_object::upload(client, &target, Bytes::from(data)).await,
                Err(e) => Err(e.into()),
            }
        }
        Payload::Memory(data) => put_object::upload(client, &target, data).await,
    };

    match result {
        Ok(mut response) => {
            response.set_if_absent("Key", target.key.as_str());
            response.set_if_absent("Bucket", target.bucket.as_str());
            metrics::record_upload_success(
                &target.bucket,
                method,
                bytes,
                started.elapsed().as_secs_f64(),
            );
            Ok(response)
        }
        Err(e) => {
            metrics::record_upload_failure(&target.bucket, method);
            Err(e)
        }
    }
}
