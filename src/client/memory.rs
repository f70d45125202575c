//! In-process object store
//!
//! [`MemoryClient`] implements every allow-listed operation against a shared
//! in-memory store with S3-like semantics and error codes. Clients created
//! from the same [`MemorySession`] see the same buckets. Each client keeps a
//! log of the calls it served, which tests use to assert call sequences.

use super::{
    completed_parts, BlockingClient, ClientMeta, ObjectAttributes, Operation, Params, Response,
    ServiceError, Session, SessionError,
};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Largest part number accepted by `upload_part`
pub const MAX_PART_NUMBER: i64 = 10_000;

const DEFAULT_MAX_KEYS: i64 = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    attributes: ObjectAttributes,
}

#[derive(Debug, Clone)]
struct StoredPart {
    etag: String,
    data: Bytes,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    attributes: ObjectAttributes,
    parts: BTreeMap<i64, StoredPart>,
}

#[derive(Debug, Default)]
struct Store {
    buckets: BTreeMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
}

impl Store {
    fn bucket_mut(
        &mut self,
        operation: Operation,
        name: &str,
        auto_create: bool,
    ) -> Result<&mut BTreeMap<String, StoredObject>, ServiceError> {
        if auto_create {
            return Ok(self.buckets.entry(name.to_string()).or_default());
        }
        self.buckets
            .get_mut(name)
            .ok_or_else(|| no_such_bucket(operation, name))
    }
}

/// One call served by a [`MemoryClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub operation: Operation,
    pub params: BTreeMap<String, Value>,
    pub body_len: Option<usize>,
}

/// Session whose clients share one in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    store: Arc<Mutex<Store>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Session for MemorySession {
    type Client = MemoryClient;

    fn create_client(&self, meta: ClientMeta) -> Result<MemoryClient, SessionError> {
        if meta.service_name != "s3" {
            return Err(SessionError::UnsupportedService(meta.service_name));
        }
        Ok(MemoryClient::with_store(meta, Arc::clone(&self.store)))
    }
}

/// Blocking client over an in-memory store
#[derive(Debug)]
pub struct MemoryClient {
    meta: ClientMeta,
    store: Arc<Mutex<Store>>,
    calls: Mutex<Vec<CallRecord>>,
    auto_create_buckets: bool,
}

impl MemoryClient {
    /// Client with its own private store
    pub fn new(meta: ClientMeta) -> Self {
        Self::with_store(meta, Arc::default())
    }

    fn with_store(meta: ClientMeta, store: Arc<Mutex<Store>>) -> Self {
        let auto_create_buckets = meta.option_flag("auto_create_buckets");
        Self {
            meta,
            store,
            calls: Mutex::new(Vec::new()),
            auto_create_buckets,
        }
    }

    /// Calls served so far, in arrival order
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Number of calls served for `operation`
    pub fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|record| record.operation == operation)
            .count()
    }

    /// Raw stored bytes, bypassing the call log
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.store
            .lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|object| object.data.clone())
    }

    /// Multipart uploads created but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.store.lock().uploads.len()
    }

    fn record(&self, operation: Operation, params: &Params) {
        self.calls.lock().push(CallRecord {
            operation,
            params: params.fields().clone(),
            body_len: params.body().map(Bytes::len),
        });
    }

    fn list_buckets(&self) -> Response {
        let store = self.store.lock();
        let buckets: Vec<Value> = store
            .buckets
            .keys()
            .map(|name| json!({ "Name": name }))
            .collect();
        Response::new(200).with("Buckets", buckets)
    }

    fn create_bucket(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::CreateBucket;
        let bucket = params.require_str(op, "Bucket")?;
        let mut store = self.store.lock();
        if store.buckets.contains_key(bucket) {
            return Err(ServiceError::new(
                op,
                "BucketAlreadyOwnedByYou",
                format!("Bucket {} already exists", bucket),
                409,
            ));
        }
        store.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(Response::new(200).with("Location", format!("/{}", bucket)))
    }

    fn head_bucket(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::HeadBucket;
        let bucket = params.require_str(op, "Bucket")?;
        if self.store.lock().buckets.contains_key(bucket) {
            Ok(Response::new(200))
        } else {
            Err(ServiceError::new(op, "NotFound", "Not Found", 404))
        }
    }

    fn delete_bucket(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::DeleteBucket;
        let bucket = params.require_str(op, "Bucket")?;
        let mut store = self.store.lock();
        match store.buckets.get(bucket) {
            None => Err(no_such_bucket(op, bucket)),
            Some(objects) if !objects.is_empty() => Err(ServiceError::new(
                op,
                "BucketNotEmpty",
                "The bucket you tried to delete is not empty",
                409,
            )),
            Some(_) => {
                store.buckets.remove(bucket);
                Ok(Response::new(204))
            }
        }
    }

    fn list_objects_v2(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::ListObjectsV2;
        let bucket = params.require_str(op, "Bucket")?;
        let prefix = params.get_str("Prefix").unwrap_or("");
        let max_keys = params.get_i64("MaxKeys").unwrap_or(DEFAULT_MAX_KEYS).max(0) as usize;
        let start_after = params.get_str("ContinuationToken").unwrap_or("");

        let store = self.store.lock();
        let objects = store
            .buckets
            .get(bucket)
            .ok_or_else(|| no_such_bucket(op, bucket))?;

        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix) && key.as_str() > start_after);

        let page: Vec<(&String, &StoredObject)> = matching.by_ref().take(max_keys).collect();
        let truncated = matching.next().is_some();

        let contents: Vec<Value> = page
            .iter()
            .map(|(key, object)| {
                json!({ "Key": key, "Size": object.data.len(), "ETag": object.etag })
            })
            .collect();

        let mut response = Response::new(200)
            .with("Name", bucket)
            .with("Prefix", prefix)
            .with("KeyCount", contents.len())
            .with("IsTruncated", truncated)
            .with("Contents", contents);
        if truncated {
            if let Some((last, _)) = page.last() {
                response.set("NextContinuationToken", last.as_str());
            }
        }
        Ok(response)
    }

    fn put_object(&self, mut params: Params) -> Result<Response, ServiceError> {
        let op = Operation::PutObject;
        let bucket = params.require_str(op, "Bucket")?.to_string();
        let key = params.require_str(op, "Key")?.to_string();
        let attributes = ObjectAttributes::from_params(op, &params)?;
        let data = params.take_body().unwrap_or_default();
        let etag = etag_for(&data);

        let mut store = self.store.lock();
        let objects = store.bucket_mut(op, &bucket, self.auto_create_buckets)?;
        objects.insert(
            key,
            StoredObject {
                data,
                etag: etag.clone(),
                attributes,
            },
        );
        Ok(Response::new(200).with("ETag", etag))
    }

    fn lookup(
        &self,
        op: Operation,
        params: &Params,
    ) -> Result<StoredObject, ServiceError> {
        let bucket = params.require_str(op, "Bucket")?;
        let key = params.require_str(op, "Key")?;
        let store = self.store.lock();
        let objects = store
            .buckets
            .get(bucket)
            .ok_or_else(|| no_such_bucket(op, bucket))?;
        objects.get(key).cloned().ok_or_else(|| {
            ServiceError::new(op, "NoSuchKey", "The specified key does not exist.", 404)
        })
    }

    fn get_object(&self, params: &Params) -> Result<Response, ServiceError> {
        let object = self.lookup(Operation::GetObject, params)?;
        Ok(describe(Response::new(200), &object).with_body(object.data))
    }

    fn head_object(&self, params: &Params) -> Result<Response, ServiceError> {
        let object = self.lookup(Operation::HeadObject, params)?;
        Ok(describe(Response::new(200), &object))
    }

    fn delete_object(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::DeleteObject;
        let bucket = params.require_str(op, "Bucket")?;
        let key = params.require_str(op, "Key")?;
        let mut store = self.store.lock();
        let objects = store
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(op, bucket))?;
        objects.remove(key);
        Ok(Response::new(204))
    }

    fn create_multipart_upload(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::CreateMultipartUpload;
        let bucket = params.require_str(op, "Bucket")?;
        let key = params.require_str(op, "Key")?;
        let attributes = ObjectAttributes::from_params(op, params)?;
        let upload_id = uuid::Uuid::new_v4().simple().to_string();

        let mut store = self.store.lock();
        store.bucket_mut(op, bucket, self.auto_create_buckets)?;
        store.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                attributes,
                parts: BTreeMap::new(),
            },
        );
        Ok(Response::new(200)
            .with("Bucket", bucket)
            .with("Key", key)
            .with("UploadId", upload_id))
    }

    fn upload_part(&self, mut params: Params) -> Result<Response, ServiceError> {
        let op = Operation::UploadPart;
        let part_number = params.require_i64(op, "PartNumber")?;
        if !(1..=MAX_PART_NUMBER).contains(&part_number) {
            return Err(ServiceError::new(
                op,
                "InvalidArgument",
                format!("Part number must be an integer between 1 and {}", MAX_PART_NUMBER),
                400,
            ));
        }
        let data = params.take_body().unwrap_or_default();
        let etag = etag_for(&data);

        let mut store = self.store.lock();
        let upload = pending_upload(&mut store, op, &params)?;
        upload.parts.insert(
            part_number,
            StoredPart {
                etag: etag.clone(),
                data,
            },
        );
        Ok(Response::new(200).with("ETag", etag))
    }

    fn complete_multipart_upload(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::CompleteMultipartUpload;
        let requested = completed_parts(op, params)?;
        if requested.is_empty() {
            return Err(ServiceError::new(
                op,
                "MalformedXML",
                "You must specify at least one part",
                400,
            ));
        }
        if requested.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(ServiceError::new(
                op,
                "InvalidPartOrder",
                "The list of parts was not in ascending order.",
                400,
            ));
        }

        let mut store = self.store.lock();
        let upload = pending_upload(&mut store, op, params)?;

        let mut data = BytesMut::new();
        let mut digest = Sha256::new();
        for (number, etag) in &requested {
            let part = upload
                .parts
                .get(number)
                .filter(|part| &part.etag == etag)
                .ok_or_else(|| {
                    ServiceError::new(
                        op,
                        "InvalidPart",
                        format!("Part {} could not be found or its ETag did not match", number),
                        400,
                    )
                })?;
            data.extend_from_slice(&part.data);
            digest.update(part.etag.as_bytes());
        }

        let etag = format!(
            "\"{}-{}\"",
            hex::encode(&digest.finalize()[..16]),
            requested.len()
        );
        let upload_id = params.require_str(op, "UploadId")?;
        let upload = store
            .uploads
            .remove(upload_id)
            .ok_or_else(|| no_such_upload(op))?;

        let objects = store.bucket_mut(op, &upload.bucket, self.auto_create_buckets)?;
        objects.insert(
            upload.key.clone(),
            StoredObject {
                data: data.freeze(),
                etag: etag.clone(),
                attributes: upload.attributes,
            },
        );

        Ok(Response::new(200)
            .with("Bucket", upload.bucket.as_str())
            .with("Key", upload.key.as_str())
            .with("ETag", etag)
            .with("Location", format!("/{}/{}", upload.bucket, upload.key)))
    }

    fn abort_multipart_upload(&self, params: &Params) -> Result<Response, ServiceError> {
        let op = Operation::AbortMultipartUpload;
        let mut store = self.store.lock();
        pending_upload(&mut store, op, params)?;
        let upload_id = params.require_str(op, "UploadId")?;
        store.uploads.remove(upload_id);
        Ok(Response::new(204))
    }
}

impl BlockingClient for MemoryClient {
    fn meta(&self) -> &ClientMeta {
        &self.meta
    }

    fn invoke(&self, operation: Operation, params: Params) -> Result<Response, ServiceError> {
        self.record(operation, &params);
        match operation {
            Operation::ListBuckets => Ok(self.list_buckets()),
            Operation::CreateBucket => self.create_bucket(&params),
            Operation::HeadBucket => self.head_bucket(&params),
            Operation::DeleteBucket => self.delete_bucket(&params),
            Operation::ListObjectsV2 => self.list_objects_v2(&params),
            Operation::PutObject => self.put_object(params),
            Operation::GetObject => self.get_object(&params),
            Operation::HeadObject => self.head_object(&params),
            Operation::DeleteObject => self.delete_object(&params),
            Operation::CreateMultipartUpload => self.create_multipart_upload(&params),
            Operation::UploadPart => self.upload_part(params),
            Operation::CompleteMultipartUpload => self.complete_multipart_upload(&params),
            Operation::AbortMultipartUpload => self.abort_multipart_upload(&params),
        }
    }
}

fn etag_for(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(&Sha256::digest(data)[..16]))
}

fn describe(response: Response, object: &StoredObject) -> Response {
    let mut response = response
        .with("ContentLength", object.data.len())
        .with("ETag", object.etag.as_str());
    object.attributes.describe(&mut response);
    response
}

fn no_such_bucket(operation: Operation, bucket: &str) -> ServiceError {
    ServiceError::new(
        operation,
        "NoSuchBucket",
        format!("The specified bucket does not exist: {}", bucket),
        404,
    )
}

fn no_such_upload(operation: Operation) -> ServiceError {
    ServiceError::new(
        operation,
        "NoSuchUpload",
        "The specified multipart upload does not exist.",
        404,
    )
}

/// Pending upload named by `UploadId`, checked against `Bucket` and `Key`
fn pending_upload<'a>(
    store: &'a mut Store,
    op: Operation,
    params: &Params,
) -> Result<&'a mut PendingUpload, ServiceError> {
    let bucket = params.require_str(op, "Bucket")?;
    let key = params.require_str(op, "Key")?;
    let upload_id = params.require_str(op, "UploadId")?;
    store
        .uploads
        .get_mut(upload_id)
        .filter(|upload| upload.bucket == bucket && upload.key == key)
        .ok_or_else(|| no_such_upload(op))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_bucket(bucket: &str) -> MemoryClient {
        let client = MemoryClient::new(ClientMeta::new("s3"));
        client
            .invoke(Operation::CreateBucket, Params::new().with("Bucket", bucket))
            .unwrap();
        client
    }

    fn object_params(bucket: &str, key: &str) -> Params {
        Params::new().with("Bucket", bucket).with("Key", key)
    }

    #[test]
    fn test_session_rejects_other_services() {
        let result = MemorySession::new().create_client(ClientMeta::new("ec2"));
        assert!(matches!(result, Err(SessionError::UnsupportedService(s)) if s == "ec2"));
    }

    #[test]
    fn test_session_clients_share_store() {
        let session = MemorySession::new();
        let first = session.create_client(ClientMeta::new("s3")).unwrap();
        let second = session.create_client(ClientMeta::new("s3")).unwrap();

        first
            .invoke(Operation::CreateBucket, Params::new().with("Bucket", "shared"))
            .unwrap();
        second
            .invoke(Operation::HeadBucket, Params::new().with("Bucket", "shared"))
            .unwrap();
    }

    #[test]
    fn test_put_get_head_delete() {
        let client = client_with_bucket("b");
        client
            .invoke(
                Operation::PutObject,
                object_params("b", "k")
                    .with("ContentType", "text/plain")
                    .with_body("hello"),
            )
            .unwrap();

        let got = client
            .invoke(Operation::GetObject, object_params("b", "k"))
            .unwrap();
        assert_eq!(got.body().unwrap().as_ref(), b"hello");
        assert_eq!(got.get_i64("ContentLength"), Some(5));
        assert_eq!(got.get_str("ContentType"), Some("text/plain"));

        let head = client
            .invoke(Operation::HeadObject, object_params("b", "k"))
            .unwrap();
        assert!(head.body().is_none());

        let deleted = client
            .invoke(Operation::DeleteObject, object_params("b", "k"))
            .unwrap();
        assert_eq!(deleted.status_code(), Some(204));

        let err = client
            .invoke(Operation::GetObject, object_params("b", "k"))
            .unwrap_err();
        assert_eq!(err.code, "NoSuchKey");
    }

    #[test]
    fn test_put_rejects_unknown_parameter() {
        let client = client_with_bucket("b");
        let err = client
            .invoke(
                Operation::PutObject,
                object_params("b", "k").with("Expires", 60).with_body("x"),
            )
            .unwrap_err();
        assert_eq!(err.code, "ParamValidation");
        assert!(client.object("b", "k").is_none());
    }

    #[test]
    fn test_put_into_missing_bucket() {
        let client = MemoryClient::new(ClientMeta::new("s3"));
        let err = client
            .invoke(Operation::PutObject, object_params("nope", "k"))
            .unwrap_err();
        assert_eq!(err.code, "NoSuchBucket");
        assert_eq!(err.status_code, 404);
    }

    #[test]
    fn test_auto_create_buckets_option() {
        let mut meta = ClientMeta::new("s3");
        meta.options
            .insert("auto_create_buckets".into(), "true".into());
        let client = MemoryClient::new(meta);

        client
            .invoke(Operation::PutObject, object_params("fresh", "k").with_body("x"))
            .unwrap();
        assert_eq!(client.object("fresh", "k"), Some(Bytes::from("x")));
    }

    #[test]
    fn test_delete_bucket_not_empty() {
        let client = client_with_bucket("b");
        client
            .invoke(Operation::PutObject, object_params("b", "k").with_body("x"))
            .unwrap();
        let err = client
            .invoke(Operation::DeleteBucket, Params::new().with("Bucket", "b"))
            .unwrap_err();
        assert_eq!(err.code, "BucketNotEmpty");
    }

    #[test]
    fn test_list_objects_pagination() {
        let client = client_with_bucket("b");
        for key in ["a/1", "a/2", "a/3", "b/1"] {
            client
                .invoke(Operation::PutObject, object_params("b", key).with_body("x"))
                .unwrap();
        }

        let first = client
            .invoke(
                Operation::ListObjectsV2,
                Params::new()
                    .with("Bucket", "b")
                    .with("Prefix", "a/")
                    .with("MaxKeys", 2),
            )
            .unwrap();
        assert_eq!(first.get_i64("KeyCount"), Some(2));
        assert_eq!(first.get("IsTruncated"), Some(&Value::Bool(true)));
        let token = first.get_str("NextContinuationToken").unwrap().to_string();

        let second = client
            .invoke(
                Operation::ListObjectsV2,
                Params::new()
                    .with("Bucket", "b")
                    .with("Prefix", "a/")
                    .with("ContinuationToken", token),
            )
            .unwrap();
        let contents = second.get("Contents").unwrap().as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["Key"], "a/3");
        assert_eq!(second.get("IsTruncated"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_multipart_lifecycle() {
        let client = client_with_bucket("b");
        let created = client
            .invoke(Operation::CreateMultipartUpload, object_params("b", "big"))
            .unwrap();
        let upload_id = created.get_str("UploadId").unwrap().to_string();

        let mut parts = Vec::new();
        for (number, chunk) in [(1, "abc"), (2, "def")] {
            let response = client
                .invoke(
                    Operation::UploadPart,
                    object_params("b", "big")
                        .with("UploadId", upload_id.as_str())
                        .with("PartNumber", number)
                        .with_body(chunk),
                )
                .unwrap();
            parts.push(json!({ "PartNumber": number, "ETag": response.get_str("ETag").unwrap() }));
        }
        assert_eq!(client.pending_uploads(), 1);

        let completed = client
            .invoke(
                Operation::CompleteMultipartUpload,
                object_params("b", "big")
                    .with("UploadId", upload_id.as_str())
                    .with("MultipartUpload", json!({ "Parts": parts })),
            )
            .unwrap();

        assert!(completed.get_str("ETag").unwrap().ends_with("-2\""));
        assert_eq!(client.object("b", "big"), Some(Bytes::from("abcdef")));
        assert_eq!(client.pending_uploads(), 0);
    }

    #[test]
    fn test_complete_rejects_wrong_etag() {
        let client = client_with_bucket("b");
        let created = client
            .invoke(Operation::CreateMultipartUpload, object_params("b", "k"))
            .unwrap();
        let upload_id = created.get_str("UploadId").unwrap().to_string();
        client
            .invoke(
                Operation::UploadPart,
                object_params("b", "k")
                    .with("UploadId", upload_id.as_str())
                    .with("PartNumber", 1)
                    .with_body("x"),
            )
            .unwrap();

        let err = client
            .invoke(
                Operation::CompleteMultipartUpload,
                object_params("b", "k")
                    .with("UploadId", upload_id.as_str())
                    .with(
                        "MultipartUpload",
                        json!({ "Parts": [{ "PartNumber": 1, "ETag": "\"bogus\"" }] }),
                    ),
            )
            .unwrap_err();
        assert_eq!(err.code, "InvalidPart");
    }

    #[test]
    fn test_abort_removes_upload() {
        let client = client_with_bucket("b");
        let created = client
            .invoke(Operation::CreateMultipartUpload, object_params("b", "k"))
            .unwrap();
        let upload_id = created.get_str("UploadId").unwrap().to_string();

        let aborted = client
            .invoke(
                Operation::AbortMultipartUpload,
                object_params("b", "k").with("UploadId", upload_id.as_str()),
            )
            .unwrap();
        assert_eq!(aborted.status_code(), Some(204));
        assert_eq!(client.pending_uploads(), 0);

        let err = client
            .invoke(
                Operation::AbortMultipartUpload,
                object_params("b", "k").with("UploadId", upload_id.as_str()),
            )
            .unwrap_err();
        assert_eq!(err.code, "NoSuchUpload");
    }

    #[test]
    fn test_upload_part_number_bounds() {
        let client = client_with_bucket("b");
        let created = client
            .invoke(Operation::CreateMultipartUpload, object_params("b", "k"))
            .unwrap();
        let upload_id = created.get_str("UploadId").unwrap().to_string();

        let err = client
            .invoke(
                Operation::UploadPart,
                object_params("b", "k")
                    .with("UploadId", upload_id.as_str())
                    .with("PartNumber", 0)
                    .with_body("x"),
            )
            .unwrap_err();
        assert_eq!(err.code, "InvalidArgument");
    }

    #[test]
    fn test_call_log() {
        let client = client_with_bucket("b");
        client
            .invoke(Operation::PutObject, object_params("b", "k").with_body("abcd"))
            .unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].operation, Operation::PutObject);
        assert_eq!(calls[1].body_len, Some(4));
        assert_eq!(client.call_count(Operation::PutObject), 1);
    }
}
