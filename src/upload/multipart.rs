//! Multipart upload
//!
//! A file is read in fixed-size chunks, one `upload_part` call per chunk,
//! numbered from 1 in read order. `UploadSession` owns the upload id for
//! the lifetime of the transfer: every failure path aborts it, and dropping
//! an unfinished session (cancellation) issues a detached abort. An upload
//! id the service hands out after the caller stopped waiting is aborted the
//! same way.

use super::{Target, UploadError};
use crate::body::ChunkReader;
use crate::client::{BlockingClient, Operation, Params, Response};
use crate::metrics;
use crate::proxy::AsyncClient;
use bytes::Bytes;
use serde_json::{json, Value};
use std::fs::File;
use std::path::PathBuf;
use tracing::{info, warn};

/// Smallest part the service accepts for all but the last part (5 MiB)
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Completed part info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

impl CompletedPart {
    fn to_value(&self) -> Value {
        json!({ "ETag": self.etag, "PartNumber": self.part_number })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Completed,
    Aborted,
}

/// Issue a detached abort for the upload named in `params`
fn abort_detached<C: BlockingClient + ?Sized>(
    client: &AsyncClient<C>,
    params: Params,
    reason: &str,
) {
    warn!(
        upload_id = params.get_str("UploadId").unwrap_or_default(),
        reason,
        "Aborting multipart upload in background"
    );
    metrics::record_multipart_abort("detached");
    client.call_detached(Operation::AbortMultipartUpload, params);
}

/// Upload id returned by the service but not yet owned by a session.
///
/// Built on the worker right after `create_multipart_upload` returns. When
/// the waiting future is gone the guard is dropped still armed and aborts.
struct CreatedUpload<C: BlockingClient + ?Sized> {
    client: AsyncClient<C>,
    params: Option<Params>,
}

impl<C: BlockingClient + ?Sized> CreatedUpload<C> {
    /// Hand the upload id over to the caller
    fn claim(mut self) -> Option<String> {
        self.params
            .take()
            .and_then(|params| params.get_str("UploadId").map(String::from))
    }
}

impl<C: BlockingClient + ?Sized> Drop for CreatedUpload<C> {
    fn drop(&mut self) {
        if let Some(params) = self.params.take() {
            abort_detached(&self.client, params, "caller went away during create");
        }
    }
}

/// An in-progress multipart upload
pub(crate) struct UploadSession<'a, C: BlockingClient + ?Sized> {
    client: &'a AsyncClient<C>,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    state: SessionState,
}

impl<'a, C: BlockingClient + ?Sized> UploadSession<'a, C> {
    /// Initiate the upload. The content type goes here and nowhere else.
    #[tracing::instrument(
        name = "upload.multipart.create",
        skip(client, target),
        fields(s3.bucket = %target.bucket, s3.key = %target.key),
        err
    )]
    pub(crate) async fn create(
        client: &'a AsyncClient<C>,
        target: &Target,
    ) -> Result<Self, UploadError> {
        let owner = client.clone();
        let base = Params::new()
            .with("Bucket", target.bucket.as_str())
            .with("Key", target.key.as_str());

        let (_, created) = client
            .call_then(
                Operation::CreateMultipartUpload,
                target.params(),
                move |response| {
                    response
                        .get_str("UploadId")
                        .filter(|id| !id.is_empty())
                        .map(|id| CreatedUpload {
                            client: owner,
                            params: Some(base.with("UploadId", id)),
                        })
                },
            )
            .await?;
        let upload_id = created
            .and_then(CreatedUpload::claim)
            .ok_or(UploadError::MissingUploadId)?;

        info!(upload_id = %upload_id, "Created multipart upload");

        Ok(Self {
            client,
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            upload_id,
            parts: Vec::new(),
            state: SessionState::Open,
        })
    }

    fn base_params(&self) -> Params {
        Params::new()
            .with("Bucket", self.bucket.as_str())
            .with("Key", self.key.as_str())
            .with("UploadId", self.upload_id.as_str())
    }

    /// Upload the next part, returning its number
    #[tracing::instrument(
        name = "upload.multipart.upload_part",
        skip(self, body),
        fields(
            upload_id = %self.upload_id,
            part_number = self.parts.len() + 1,
            upload.bytes = body.len()
        ),
        err
    )]
    pub async fn upload_part(&mut self, body: Bytes) -> Result<u32, UploadError> {
        let part_number = self.parts.len() as u32 + 1;
        let params = self
            .base_params()
            .with("PartNumber", part_number)
            .with_body(body);

        let response = self.client.upload_part(params).await?;
        let etag = response
            .get_str("ETag")
            .ok_or(UploadError::MissingETag(part_number))?
            .to_string();

        self.parts.push(CompletedPart { part_number, etag });
        Ok(part_number)
    }

    /// Assemble the uploaded parts into the final object
    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self),
        fields(upload_id = %self.upload_id, parts_count = self.parts.len()),
        err
    )]
    pub async fn complete(&mut self) -> Result<Response, UploadError> {
        let parts: Vec<Value> = self.parts.iter().map(CompletedPart::to_value).collect();
        let params = self
            .base_params()
            .with("MultipartUpload", json!({ "Parts": parts }));

        let response = self.client.complete_multipart_upload(params).await?;
        self.state = SessionState::Completed;
        metrics::record_multipart_parts(self.parts.len());
        info!(parts = self.parts.len(), "Completed multipart upload");
        Ok(response)
    }

    /// Abort the upload and wait for the service to acknowledge
    #[tracing::instrument(
        name = "upload.multipart.abort",
        skip(self),
        fields(upload_id = %self.upload_id),
        err
    )]
    pub async fn abort(&mut self) -> Result<(), UploadError> {
        // A failed abort is not retried by the drop guard.
        self.state = SessionState::Aborted;
        match self.client.abort_multipart_upload(self.base_params()).await {
            Ok(_) => {
                metrics::record_multipart_abort("aborted");
                info!("Aborted multipart upload");
                Ok(())
            }
            Err(e) => {
                metrics::record_multipart_abort("failed");
                Err(e.into())
            }
        }
    }

    /// Abort after `cause`; an abort failure is logged and `cause` stays the error
    async fn abort_after(&mut self, cause: &UploadError) {
        if let Err(abort_error) = self.abort().await {
            warn!(
                upload_id = %self.upload_id,
                error = %cause,
                abort_error = %abort_error,
                "Abort after failed multipart upload also failed"
            );
        }
    }
}

impl<C: BlockingClient + ?Sized> Drop for UploadSession<'_, C> {
    fn drop(&mut self) {
        if self.state == SessionState::Open {
            abort_detached(self.client, self.base_params(), "dropped before finishing");
        }
    }
}

async fn send_parts<C: BlockingClient + ?Sized>(
    session: &mut UploadSession<'_, C>,
    path: PathBuf,
    part_size: usize,
) -> Result<(), UploadError> {
    let client = session.client;
    let file = client.run_blocking(move || File::open(path)).await??;
    let mut chunks = ChunkReader::new(client.adapter().clone(), file, part_size);
    while let Some(chunk) = chunks.next_chunk().await? {
        session.upload_part(chunk).await?;
    }
    Ok(())
}

/// Multipart upload of the file at `path`
pub(crate) async fn upload_file<C: BlockingClient + ?Sized>(
    client: &AsyncClient<C>,
    target: &Target,
    path: PathBuf,
    part_size: usize,
) -> Result<Response, UploadError> {
    if part_size < MIN_PART_SIZE {
        warn!(
            part_size,
            "Part size below 5 MiB; services enforcing the minimum will reject the upload"
        );
    }

    let mut session = UploadSession::create(client, target).await?;

    if let Err(e) = send_parts(&mut session, path, part_size).await {
        session.abort_after(&e).await;
        return Err(e);
    }

    if session.parts.is_empty() {
        let e = UploadError::EmptyMultipart {
            upload_id: session.upload_id.clone(),
        };
        session.abort_after(&e).await;
        return Err(e);
    }

    match session.complete().await {
        Ok(response) => Ok(response),
        Err(e) => {
            session.abort_after(&e).await;
            Err(e)
        }
    }
}
