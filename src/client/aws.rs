//! Blocking S3 client over `aws-sdk-s3`
//!
//! The SDK is async, so each [`AwsSession`] owns a small multi-thread tokio
//! runtime parked on a dedicated thread. [`AwsS3Client::invoke`] spawns the
//! SDK future onto that runtime and blocks the calling thread on a plain
//! channel until it resolves, which is safe from dispatcher workers, from
//! `spawn_blocking` threads and from threads with no runtime at all.
//! [`AwsS3Client::open_object`] reads `get_object` bodies the same way, one
//! SDK chunk per blocking read.

use super::{
    BlockingClient, BodyReader, ClientMeta, Credentials, CredentialsProvider, ObjectAttributes,
    Operation, Params, Response, ServiceError, Session, SessionError,
};
use crate::config::ClientConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, ObjectCannedAcl, StorageClass,
};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::{Buf, Bytes};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Read};
use std::sync::{mpsc, Arc};
use std::thread;
use tokio::runtime::{Builder as RuntimeBuilder, Handle};
use tokio::sync::oneshot;
use tracing::debug;

const RUNTIME_THREADS: usize = 2;

/// Apply [`ObjectAttributes`] to a `put_object` or `create_multipart_upload` builder
macro_rules! with_attributes {
    ($builder:expr, $attributes:expr) => {{
        let attributes: ObjectAttributes = $attributes;
        let metadata = (!attributes.metadata.is_empty())
            .then(|| attributes.metadata.into_iter().collect());
        $builder
            .set_content_type(attributes.content_type)
            .set_cache_control(attributes.cache_control)
            .set_content_disposition(attributes.content_disposition)
            .set_content_encoding(attributes.content_encoding)
            .set_content_language(attributes.content_language)
            .set_acl(attributes.acl.as_deref().map(ObjectCannedAcl::from))
            .set_storage_class(attributes.storage_class.as_deref().map(StorageClass::from))
            .set_metadata(metadata)
    }};
}

/// Tokio runtime living on its own thread until dropped
#[derive(Debug)]
struct BackgroundRuntime {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl BackgroundRuntime {
    fn start(worker_threads: usize) -> Result<Self, SessionError> {
        let (handle_tx, handle_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name("cloud-bridge-sdk".to_string())
            .spawn(move || {
                let runtime = match RuntimeBuilder::new_multi_thread()
                    .worker_threads(worker_threads)
                    .thread_name("cloud-bridge-sdk-worker")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("SDK runtime stopped");
            })
            .map_err(|e| SessionError::ClientCreation(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| SessionError::ClientCreation("SDK runtime thread exited".into()))?
            .map_err(SessionError::ClientCreation)?;

        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
        })
    }

    /// Run `fut` on the background runtime, blocking this thread until done
    fn block_on<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.recv().ok()
    }
}

impl Drop for BackgroundRuntime {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Session creating SDK-backed S3 clients with static credentials
#[derive(Debug, Clone)]
pub struct AwsSession {
    credentials: Credentials,
    runtime: Arc<BackgroundRuntime>,
}

impl AwsSession {
    pub fn new(credentials: Credentials) -> Result<Self, SessionError> {
        Ok(Self {
            credentials,
            runtime: Arc::new(BackgroundRuntime::start(RUNTIME_THREADS)?),
        })
    }

    /// Credentials from the client configuration, falling back to the environment
    pub fn from_config(config: &ClientConfig) -> Result<Self, SessionError> {
        let credentials = CredentialsProvider::resolve(config)?;
        Self::new(credentials)
    }
}

impl Session for AwsSession {
    type Client = AwsS3Client;

    fn create_client(&self, meta: ClientMeta) -> Result<AwsS3Client, SessionError> {
        if meta.service_name != "s3" {
            return Err(SessionError::UnsupportedService(meta.service_name));
        }

        let credentials = aws_credential_types::Credentials::new(
            self.credentials.access_key_id(),
            self.credentials.secret_access_key(),
            self.credentials.session_token().map(String::from),
            None,
            "cloud-bridge",
        );

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(meta.region().to_string()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &meta.endpoint_url {
            loader = loader.endpoint_url(endpoint.as_str());
        }

        let sdk_config = self
            .runtime
            .block_on(async move { loader.load().await })
            .ok_or_else(|| SessionError::ClientCreation("SDK runtime is not running".into()))?;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(meta.option_flag("force_path_style"))
            .build();

        debug!(
            region = meta.region(),
            endpoint = %meta.endpoint(),
            "Created S3 SDK client"
        );

        Ok(AwsS3Client {
            client: Client::from_conf(s3_config),
            runtime: Arc::clone(&self.runtime),
            meta,
        })
    }
}

/// Blocking S3 client
#[derive(Debug, Clone)]
pub struct AwsS3Client {
    client: Client,
    runtime: Arc<BackgroundRuntime>,
    meta: ClientMeta,
}

impl BlockingClient for AwsS3Client {
    fn meta(&self) -> &ClientMeta {
        &self.meta
    }

    fn invoke(&self, operation: Operation, params: Params) -> Result<Response, ServiceError> {
        let client = self.client.clone();
        self.runtime
            .block_on(execute(client, operation, params))
            .unwrap_or_else(|| Err(runtime_stopped(operation)))
    }

    fn open_object(&self, params: Params) -> Result<(Response, BodyReader), ServiceError> {
        let client = self.client.clone();
        let (response, stream) = self
            .runtime
            .block_on(async move { get_object(&client, &params).await })
            .unwrap_or_else(|| Err(runtime_stopped(Operation::GetObject)))?;

        let reader = SdkBodyReader {
            runtime: Arc::clone(&self.runtime),
            stream: Some(stream),
            pending: Bytes::new(),
        };
        Ok((response, Box::new(reader)))
    }
}

/// Blocking reader over an SDK body stream
struct SdkBodyReader {
    runtime: Arc<BackgroundRuntime>,
    stream: Option<ByteStream>,
    pending: Bytes,
}

impl Read for SdkBodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            let Some(mut stream) = self.stream.take() else {
                return Ok(0);
            };
            let (stream, next) = self
                .runtime
                .block_on(async move {
                    let next = stream.try_next().await;
                    (stream, next)
                })
                .ok_or_else(|| io::Error::other("SDK runtime stopped while reading the body"))?;

            match next.map_err(io::Error::other)? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.stream = Some(stream);
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

fn runtime_stopped(operation: Operation) -> ServiceError {
    ServiceError::new(
        operation,
        "RuntimeUnavailable",
        "SDK runtime stopped before the call completed",
        0,
    )
}

/// Checked narrowing for SDK integer fields
fn to_i32(operation: Operation, name: &str, value: i64) -> Result<i32, ServiceError> {
    i32::try_from(value).map_err(|_| ServiceError::param_validation(operation, name))
}

fn describe_metadata(response: &mut Response, metadata: Option<&HashMap<String, String>>) {
    if let Some(metadata) = metadata.filter(|metadata| !metadata.is_empty()) {
        response.set("Metadata", json!(metadata));
    }
}

async fn get_object(
    client: &Client,
    params: &Params,
) -> Result<(Response, ByteStream), ServiceError> {
    let op = Operation::GetObject;
    let output = client
        .get_object()
        .bucket(params.require_str(op, "Bucket")?)
        .key(params.require_str(op, "Key")?)
        .set_range(params.get_str("Range").map(String::from))
        .send()
        .await
        .map_err(|e| sdk_error(op, e))?;
    let mut response = Response::new(200);
    set_opt(&mut response, "ContentLength", output.content_length());
    set_opt(&mut response, "ContentType", output.content_type());
    set_opt(&mut response, "CacheControl", output.cache_control());
    set_opt(&mut response, "ETag", output.e_tag());
    describe_metadata(&mut response, output.metadata());
    Ok((response, output.body))
}

async fn execute(
    client: Client,
    op: Operation,
    mut params: Params,
) -> Result<Response, ServiceError> {
    match op {
        Operation::ListBuckets => {
            let output = client
                .list_buckets()
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let buckets: Vec<Value> = output
                .buckets()
                .iter()
                .map(|bucket| json!({ "Name": bucket.name() }))
                .collect();
            Ok(Response::new(200).with("Buckets", buckets))
        }
        Operation::CreateBucket => {
            let output = client
                .create_bucket()
                .bucket(params.require_str(op, "Bucket")?)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let mut response = Response::new(200);
            set_opt(&mut response, "Location", output.location());
            Ok(response)
        }
        Operation::HeadBucket => {
            client
                .head_bucket()
                .bucket(params.require_str(op, "Bucket")?)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            Ok(Response::new(200))
        }
        Operation::DeleteBucket => {
            client
                .delete_bucket()
                .bucket(params.require_str(op, "Bucket")?)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            Ok(Response::new(204))
        }
        Operation::ListObjectsV2 => {
            let output = client
                .list_objects_v2()
                .bucket(params.require_str(op, "Bucket")?)
                .set_prefix(params.get_str("Prefix").map(String::from))
                .set_max_keys(
                    params
                        .get_i64("MaxKeys")
                        .map(|keys| to_i32(op, "MaxKeys", keys))
                        .transpose()?,
                )
                .set_continuation_token(params.get_str("ContinuationToken").map(String::from))
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let contents: Vec<Value> = output
                .contents()
                .iter()
                .map(|object| {
                    json!({ "Key": object.key(), "Size": object.size(), "ETag": object.e_tag() })
                })
                .collect();
            let mut response = Response::new(200)
                .with("KeyCount", contents.len())
                .with("IsTruncated", output.is_truncated().unwrap_or(false))
                .with("Contents", contents);
            set_opt(&mut response, "Name", output.name());
            set_opt(&mut response, "Prefix", output.prefix());
            set_opt(
                &mut response,
                "NextContinuationToken",
                output.next_continuation_token(),
            );
            Ok(response)
        }
        Operation::PutObject => {
            let body = params.take_body().unwrap_or_default();
            let attributes = ObjectAttributes::from_params(op, &params)?;
            let builder = client
                .put_object()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?);
            let output = with_attributes!(builder, attributes)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let mut response = Response::new(200);
            set_opt(&mut response, "ETag", output.e_tag());
            set_opt(&mut response, "VersionId", output.version_id());
            Ok(response)
        }
        Operation::GetObject => {
            let (response, body) = get_object(&client, &params).await?;
            let body = body
                .collect()
                .await
                .map_err(|e| ServiceError::new(op, "BodyReadError", e.to_string(), 0))?
                .into_bytes();
            Ok(response.with_body(body))
        }
        Operation::HeadObject => {
            let output = client
                .head_object()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let mut response = Response::new(200);
            set_opt(&mut response, "ContentLength", output.content_length());
            set_opt(&mut response, "ContentType", output.content_type());
            set_opt(&mut response, "CacheControl", output.cache_control());
            set_opt(&mut response, "ETag", output.e_tag());
            describe_metadata(&mut response, output.metadata());
            Ok(response)
        }
        Operation::DeleteObject => {
            client
                .delete_object()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            Ok(Response::new(204))
        }
        Operation::CreateMultipartUpload => {
            let attributes = ObjectAttributes::from_params(op, &params)?;
            let builder = client
                .create_multipart_upload()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?);
            let output = with_attributes!(builder, attributes)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let mut response = Response::new(200);
            set_opt(&mut response, "Bucket", output.bucket());
            set_opt(&mut response, "Key", output.key());
            set_opt(&mut response, "UploadId", output.upload_id());
            Ok(response)
        }
        Operation::UploadPart => {
            let body = params.take_body().unwrap_or_default();
            let part_number = to_i32(op, "PartNumber", params.require_i64(op, "PartNumber")?)?;
            let output = client
                .upload_part()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?)
                .upload_id(params.require_str(op, "UploadId")?)
                .part_number(part_number)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let mut response = Response::new(200);
            set_opt(&mut response, "ETag", output.e_tag());
            Ok(response)
        }
        Operation::CompleteMultipartUpload => {
            let parts = super::completed_parts(op, &params)?
                .into_iter()
                .map(|(number, etag)| -> Result<CompletedPart, ServiceError> {
                    Ok(CompletedPart::builder()
                        .part_number(to_i32(op, "MultipartUpload.Parts", number)?)
                        .e_tag(etag)
                        .build())
                })
                .collect::<Result<Vec<_>, ServiceError>>()?;
            let output = client
                .complete_multipart_upload()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?)
                .upload_id(params.require_str(op, "UploadId")?)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            let mut response = Response::new(200);
            set_opt(&mut response, "Bucket", output.bucket());
            set_opt(&mut response, "Key", output.key());
            set_opt(&mut response, "ETag", output.e_tag());
            set_opt(&mut response, "Location", output.location());
            Ok(response)
        }
        Operation::AbortMultipartUpload => {
            client
                .abort_multipart_upload()
                .bucket(params.require_str(op, "Bucket")?)
                .key(params.require_str(op, "Key")?)
                .upload_id(params.require_str(op, "UploadId")?)
                .send()
                .await
                .map_err(|e| sdk_error(op, e))?;
            Ok(Response::new(204))
        }
    }
}

fn set_opt<V: Into<Value>>(response: &mut Response, name: &str, value: Option<V>) {
    if let Some(value) = value {
        response.set(name, value);
    }
}

fn sdk_error<E>(operation: Operation, err: SdkError<E, HttpResponse>) -> ServiceError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status_code = err
        .raw_response()
        .map(|response| response.status().as_u16())
        .unwrap_or(0);
    let code = match err.code() {
        Some(code) => code.to_string(),
        None => match &err {
            SdkError::TimeoutError(_) => "Timeout".to_string(),
            SdkError::DispatchFailure(_) => "DispatchFailure".to_string(),
            _ if status_code == 404 => "NotFound".to_string(),
            _ => "Unknown".to_string(),
        },
    };
    let message = err
        .message()
        .map(String::from)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    ServiceError::new(operation, code, message, status_code)
}
