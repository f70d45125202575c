//! Blocking client abstraction
//!
//! Models the synchronous object-storage SDK that the bridge drives. Every
//! service call goes through a single blocking entry point,
//! [`BlockingClient::invoke`], keyed by an allow-listed [`Operation`] and a
//! [`Params`] envelope. Responses come back as a [`Response`] map carrying
//! `ResponseMetadata.HTTPStatusCode` plus operation-specific fields.
//!
//! # Sessions
//!
//! A [`Session`] is the factory for clients:
//!
//! | Session | Client | Backing store |
//! |---------|--------|---------------|
//! | [`MemorySession`] | [`MemoryClient`] | In-process object store |
//! | [`AwsSession`] | [`AwsS3Client`] | `aws-sdk-s3` on a background runtime |
//!
//! # Example
//!
//! ```
//! use cloud_bridge::client::{BlockingClient, ClientMeta, MemorySession, Operation, Params, Session};
//!
//! let session = MemorySession::new();
//! let client = session.create_client(ClientMeta::new("s3")).unwrap();
//!
//! client
//!     .invoke(Operation::CreateBucket, Params::new().with("Bucket", "photos"))
//!     .unwrap();
//! let response = client
//!     .invoke(
//!         Operation::PutObject,
//!         Params::new().with("Bucket", "photos").with("Key", "cat.jpg").with_body("meow"),
//!     )
//!     .unwrap();
//! assert_eq!(response.status_code(), Some(200));
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::str::FromStr;
use thiserror::Error;

pub mod aws;
pub mod credentials;
pub mod memory;

pub use aws::{AwsS3Client, AwsSession};
pub use credentials::{Credentials, CredentialsError, CredentialsProvider};
pub use memory::{CallRecord, MemoryClient, MemorySession};

macro_rules! operations {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Allow-listed object-storage operations
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Operation {
            $($variant),*
        }

        impl Operation {
            /// Every known operation, in declaration order
            pub const ALL: &'static [Operation] = &[$(Operation::$variant),*];

            /// Method-style name, e.g. `put_object`
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Operation::$variant => $name),*
                }
            }

            /// Service API name, e.g. `PutObject`
            pub fn api_name(&self) -> &'static str {
                match self {
                    $(Operation::$variant => stringify!($variant)),*
                }
            }
        }
    };
}

operations! {
    ListBuckets => "list_buckets",
    CreateBucket => "create_bucket",
    HeadBucket => "head_bucket",
    DeleteBucket => "delete_bucket",
    ListObjectsV2 => "list_objects_v2",
    PutObject => "put_object",
    GetObject => "get_object",
    HeadObject => "head_object",
    DeleteObject => "delete_object",
    CreateMultipartUpload => "create_multipart_upload",
    UploadPart => "upload_part",
    CompleteMultipartUpload => "complete_multipart_upload",
    AbortMultipartUpload => "abort_multipart_upload",
}

impl Operation {
    /// Operations belonging to the multipart upload protocol
    pub fn is_multipart(&self) -> bool {
        matches!(
            self,
            Operation::CreateMultipartUpload
                | Operation::UploadPart
                | Operation::CompleteMultipartUpload
                | Operation::AbortMultipartUpload
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name that matched no allow-listed operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    /// Accepts either the method-style or the API name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s || op.api_name() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// Error raised by the service (or by parameter validation before the call)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed with {code} (HTTP {status_code}): {message}")]
pub struct ServiceError {
    pub operation: Operation,
    pub code: String,
    pub message: String,
    pub status_code: u16,
}

impl ServiceError {
    pub fn new(
        operation: Operation,
        code: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            operation,
            code: code.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Missing or mistyped request parameter
    pub fn param_validation(operation: Operation, name: &str) -> Self {
        Self::new(
            operation,
            "ParamValidation",
            format!("Missing or invalid required parameter: {}", name),
            400,
        )
    }

    /// Request field the operation does not accept
    pub fn unknown_parameter(operation: Operation, name: &str) -> Self {
        Self::new(
            operation,
            "ParamValidation",
            format!("Unknown parameter: {}", name),
            400,
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == 404
            || matches!(
                self.code.as_str(),
                "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound"
            )
    }
}

/// Named request parameters plus an optional payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    fields: BTreeMap<String, Value>,
    body: Option<Bytes>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Some(body.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    /// Required string parameter, or a `ParamValidation` error
    pub fn require_str(&self, operation: Operation, name: &str) -> Result<&str, ServiceError> {
        self.get_str(name)
            .ok_or_else(|| ServiceError::param_validation(operation, name))
    }

    /// Required integer parameter, or a `ParamValidation` error
    pub fn require_i64(&self, operation: Operation, name: &str) -> Result<i64, ServiceError> {
        self.get_i64(name)
            .ok_or_else(|| ServiceError::param_validation(operation, name))
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Copy every named field of `other` that is not already set here
    pub fn merge_missing(&mut self, other: &Params) {
        for (name, value) in &other.fields {
            self.fields
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Structured service response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    fields: Map<String, Value>,
    body: Option<Bytes>,
}

impl Response {
    /// Response carrying `ResponseMetadata.HTTPStatusCode`
    pub fn new(status_code: u16) -> Self {
        let mut fields = Map::new();
        fields.insert(
            "ResponseMetadata".to_string(),
            serde_json::json!({ "HTTPStatusCode": status_code }),
        );
        Self { fields, body: None }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Set a field only when the service did not return it
    pub fn set_if_absent(&mut self, name: &str, value: impl Into<Value>) {
        if !self.fields.contains_key(name) {
            self.fields.insert(name.to_string(), value.into());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.fields
            .get("ResponseMetadata")
            .and_then(|meta| meta.get("HTTPStatusCode"))
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// `(PartNumber, ETag)` pairs from `MultipartUpload.Parts`
pub(crate) fn completed_parts(
    operation: Operation,
    params: &Params,
) -> Result<Vec<(i64, String)>, ServiceError> {
    let parts = params
        .get("MultipartUpload")
        .and_then(|upload| upload.get("Parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| ServiceError::param_validation(operation, "MultipartUpload.Parts"))?;

    parts
        .iter()
        .map(|part| {
            let number = part.get("PartNumber").and_then(Value::as_i64);
            let etag = part.get("ETag").and_then(Value::as_str);
            match (number, etag) {
                (Some(number), Some(etag)) => Ok((number, etag.to_string())),
                _ => Err(ServiceError::param_validation(
                    operation,
                    "MultipartUpload.Parts",
                )),
            }
        })
        .collect()
}

/// Optional attributes stored with an object by `put_object` and
/// `create_multipart_upload`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// Canned ACL, e.g. `private`
    pub acl: Option<String>,
    pub storage_class: Option<String>,
    /// User metadata (`x-amz-meta-*`)
    pub metadata: BTreeMap<String, String>,
}

impl ObjectAttributes {
    /// Fields accepted besides `Bucket` and `Key`
    pub const FIELDS: &'static [&'static str] = &[
        "ContentType",
        "CacheControl",
        "ContentDisposition",
        "ContentEncoding",
        "ContentLanguage",
        "ACL",
        "StorageClass",
        "Metadata",
    ];

    /// Attributes named in `params`. Any other field is rejected.
    pub fn from_params(operation: Operation, params: &Params) -> Result<Self, ServiceError> {
        if let Some(unknown) = params
            .fields()
            .keys()
            .find(|name| !matches!(name.as_str(), "Bucket" | "Key") && !Self::FIELDS.contains(&name.as_str()))
        {
            return Err(ServiceError::unknown_parameter(operation, unknown));
        }

        let text = |name: &str| match params.get(name) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(ServiceError::param_validation(operation, name)),
        };

        let metadata = match params.get("Metadata") {
            None => BTreeMap::new(),
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(name, value)| {
                    value
                        .as_str()
                        .map(|value| (name.clone(), value.to_string()))
                        .ok_or_else(|| ServiceError::param_validation(operation, "Metadata"))
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(ServiceError::param_validation(operation, "Metadata")),
        };

        Ok(Self {
            content_type: text("ContentType")?,
            cache_control: text("CacheControl")?,
            content_disposition: text("ContentDisposition")?,
            content_encoding: text("ContentEncoding")?,
            content_language: text("ContentLanguage")?,
            acl: text("ACL")?,
            storage_class: text("StorageClass")?,
            metadata,
        })
    }

    /// Add the attributes `head_object` reports to `response`
    pub fn describe(&self, response: &mut Response) {
        let fields = [
            ("ContentType", &self.content_type),
            ("CacheControl", &self.cache_control),
            ("ContentDisposition", &self.content_disposition),
            ("ContentEncoding", &self.content_encoding),
            ("ContentLanguage", &self.content_language),
            ("StorageClass", &self.storage_class),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                response.set(name, value.as_str());
            }
        }
        if !self.metadata.is_empty() {
            response.set("Metadata", serde_json::json!(self.metadata));
        }
    }
}

/// Unread object body; every read blocks
pub type BodyReader = Box<dyn Read + Send>;

/// Non-callable client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub service_name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Service-specific options, e.g. `force_path_style`
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ClientMeta {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }

    /// Configured endpoint, or the public endpoint for the service and region
    pub fn endpoint(&self) -> String {
        self.endpoint_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}.{}.amazonaws.com",
                self.service_name,
                self.region()
            )
        })
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    /// Boolean service option (`true`, `1`, `yes`, `on`)
    pub fn option_flag(&self, name: &str) -> bool {
        matches!(
            self.option(name).map(str::to_ascii_lowercase).as_deref(),
            Some("true" | "1" | "yes" | "on")
        )
    }
}

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unsupported service: {0}")]
    UnsupportedService(String),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("Client creation error: {0}")]
    ClientCreation(String),
}

/// Synchronous object-storage client
///
/// Implementations block the calling thread for the duration of each call and
/// must be shareable across worker threads (their connection pool included).
pub trait BlockingClient: Send + Sync + 'static {
    /// Client configuration, passed through the proxy unchanged
    fn meta(&self) -> &ClientMeta;

    /// Perform one blocking service call
    fn invoke(&self, operation: Operation, params: Params) -> Result<Response, ServiceError>;

    /// Whether this client implements `operation`
    fn supports(&self, operation: Operation) -> bool {
        let _ = operation;
        true
    }

    /// `get_object` with the body left unread.
    ///
    /// The default buffers the whole body; clients that can read the
    /// payload incrementally override it.
    fn open_object(&self, params: Params) -> Result<(Response, BodyReader), ServiceError> {
        let mut response = self.invoke(Operation::GetObject, params)?;
        let body = response.take_body().unwrap_or_default();
        Ok((response, Box::new(Cursor::new(body))))
    }
}

/// Factory for blocking clients
pub trait Session {
    type Client: BlockingClient;

    fn create_client(&self, meta: ClientMeta) -> Result<Self::Client, SessionError>;
}
