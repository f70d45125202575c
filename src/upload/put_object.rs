//! Single-request upload
//!
//! Used for buffers, readers and files at or below the multipart threshold.

use super::{Target, UploadError};
use crate::client::{BlockingClient, Response};
use crate::proxy::AsyncClient;
use bytes::Bytes;

/// Send `body` as one `put_object` call
#[tracing::instrument(
    name = "upload.put_object",
    skip(client, target, body),
    fields(
        s3.bucket = %target.bucket,
        s3.key = %target.key,
        upload.bytes = body.len(),
        s3.etag = tracing::field::Empty,
    ),
    err
)]
pub(crate) async fn upload<C: BlockingClient + ?Sized>(
    client: &AsyncClient<C>,
    target: &Target,
    body: Bytes,
) -> Result<Response, UploadError> {
    let params = target.params().with_body(body);
    let response = client.put_object(params).await?;

    if let Some(etag) = response.get_str("ETag") {
        tracing::Span::current().record("s3.etag", etag);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemorySession, Operation, Params};
    use crate::dispatch::DispatchMode;

    fn target(bucket: &str, key: &str) -> Target {
        Target {
            bucket: bucket.into(),
            key: key.into(),
            content_type: Some("text/plain".into()),
            extra: Params::new().with("Metadata", serde_json::json!({ "origin": "test" })),
        }
    }

    #[tokio::test]
    async fn test_put_object_sends_single_call() {
        let client = AsyncClient::builder("s3")
            .dispatch_mode(DispatchMode::Executor)
            .option("auto_create_buckets", "true")
            .build(&MemorySession::new())
            .unwrap();

        let response = upload(&client, &target("docs", "a.txt"), Bytes::from("hello"))
            .await
            .unwrap();

        assert!(response.get_str("ETag").is_some());
        assert_eq!(client.inner().call_count(Operation::PutObject), 1);

        let call = &client.inner().calls()[0];
        assert_eq!(call.body_len, Some(5));
        assert_eq!(call.params.get("ContentType").and_then(|v| v.as_str()), Some("text/plain"));
        assert!(call.params.contains_key("Metadata"));
    }

    #[tokio::test]
    async fn test_put_object_missing_bucket_fails() {
        let client = AsyncClient::builder("s3")
            .dispatch_mode(DispatchMode::Executor)
            .build(&MemorySession::new())
            .unwrap();

        let err = upload(&client, &target("nope", "a.txt"), Bytes::from("x"))
            .await
            .unwrap_err();
        assert_eq!(err.service_error().unwrap().code, "NoSuchBucket");
    }
}
