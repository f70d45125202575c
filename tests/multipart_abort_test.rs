//! Multipart Abort Tests
//!
//! Injects failures into a mocked blocking client and checks that every
//! failed multipart upload is aborted exactly once, with the upload id the
//! service handed out, and that the original error reaches the caller.
//! Also covers an upload cancelled while `create_multipart_upload` is still
//! running.

#[cfg(test)]
mod tests {
    use cloud_bridge::client::{
        BlockingClient, BodyReader, ClientMeta, MemoryClient, Operation, Params, Response,
        ServiceError,
    };
    use cloud_bridge::config::UploadConfig;
    use cloud_bridge::upload::{UploadError, UploadRequest};
    use cloud_bridge::{AsyncClient, DispatchMode};
    use mockall::mock;
    use mockall::predicate::eq;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    mock! {
        pub Storage {}

        impl BlockingClient for Storage {
            fn meta(&self) -> &ClientMeta;
            fn invoke(&self, operation: Operation, params: Params) -> Result<Response, ServiceError>;
            fn supports(&self, operation: Operation) -> bool;
            fn open_object(&self, params: Params) -> Result<(Response, BodyReader), ServiceError>;
        }
    }

    const UPLOAD_ID: &str = "upload-7f3a";

    fn storage() -> MockStorage {
        let mut mock = MockStorage::new();
        mock.expect_meta().return_const(ClientMeta::new("s3"));
        mock.expect_supports().return_const(true);
        mock
    }

    fn client(mock: MockStorage, mode: DispatchMode) -> AsyncClient<MockStorage> {
        AsyncClient::builder("s3")
            .dispatch_mode(mode)
            .workers(2)
            .upload_config(UploadConfig {
                multipart_threshold: 10,
                part_size: 10,
            })
            .build_with_client(Arc::new(mock))
            .unwrap()
    }

    /// 25 bytes: three parts of 10, 10 and 5
    fn three_part_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 25]).unwrap();
        file.flush().unwrap();
        file
    }

    fn expect_create(mock: &mut MockStorage) {
        mock.expect_invoke()
            .withf(|op, params| {
                *op == Operation::CreateMultipartUpload
                    && params.get_str("Bucket") == Some("faults")
                    && params.body().is_none()
            })
            .times(1)
            .returning(|_, _| Ok(Response::new(200).with("UploadId", UPLOAD_ID)));
    }

    fn expect_part_ok(mock: &mut MockStorage, number: i64) {
        mock.expect_invoke()
            .withf(move |op, params| {
                *op == Operation::UploadPart
                    && params.get_i64("PartNumber") == Some(number)
                    && params.get_str("UploadId") == Some(UPLOAD_ID)
                    && !params.contains("ContentType")
            })
            .times(1)
            .returning(move |_, _| Ok(Response::new(200).with("ETag", format!("\"etag-{}\"", number))));
    }

    fn expect_abort(mock: &mut MockStorage, result: Result<Response, ServiceError>) {
        mock.expect_invoke()
            .withf(|op, params| {
                *op == Operation::AbortMultipartUpload
                    && params.get_str("UploadId") == Some(UPLOAD_ID)
                    && params.get_str("Key") == Some("object.bin")
            })
            .times(1)
            .return_once(move |_, _| result);
    }

    fn request(file: &NamedTempFile) -> UploadRequest {
        UploadRequest::new("faults", file.path().to_path_buf())
            .key("object.bin")
            .content_type("application/octet-stream")
    }

    // ========================================================================
    // TEST: Part Failure
    // ========================================================================

    #[tokio::test]
    async fn test_part_failure_aborts_once_and_returns_original_error() {
        for mode in [DispatchMode::WorkerPool, DispatchMode::Executor] {
            let mut mock = storage();
            expect_create(&mut mock);
            expect_part_ok(&mut mock, 1);
            mock.expect_invoke()
                .withf(|op, params| {
                    *op == Operation::UploadPart && params.get_i64("PartNumber") == Some(2)
                })
                .times(1)
                .returning(|op, _| Err(ServiceError::new(op, "InternalError", "injected part failure", 500)));
            expect_abort(&mut mock, Ok(Response::new(204)));

            let file = three_part_file();
            let client = client(mock, mode);
            let err = client.upload(request(&file)).await.unwrap_err();

            let service = err.service_error().expect("service error");
            assert_eq!(service.operation, Operation::UploadPart);
            assert_eq!(service.code, "InternalError");
            assert_eq!(service.message, "injected part failure");
        }
    }

    #[tokio::test]
    async fn test_abort_failure_keeps_original_error() {
        let mut mock = storage();
        expect_create(&mut mock);
        mock.expect_invoke()
            .withf(|op, _| *op == Operation::UploadPart)
            .times(1)
            .returning(|op, _| Err(ServiceError::new(op, "SlowDown", "injected", 503)));
        expect_abort(
            &mut mock,
            Err(ServiceError::new(
                Operation::AbortMultipartUpload,
                "AccessDenied",
                "abort denied",
                403,
            )),
        );

        let file = three_part_file();
        let client = client(mock, DispatchMode::WorkerPool);
        let err = client.upload(request(&file)).await.unwrap_err();

        assert_eq!(err.service_error().unwrap().code, "SlowDown");
    }

    // ========================================================================
    // TEST: Complete Failure
    // ========================================================================

    #[tokio::test]
    async fn test_complete_failure_aborts() {
        let mut mock = storage();
        expect_create(&mut mock);
        for number in 1..=3 {
            expect_part_ok(&mut mock, number);
        }
        mock.expect_invoke()
            .withf(|op, params| {
                let parts = params
                    .get("MultipartUpload")
                    .and_then(|u| u.get("Parts"))
                    .and_then(|p| p.as_array())
                    .map(|p| p.len());
                *op == Operation::CompleteMultipartUpload && parts == Some(3)
            })
            .times(1)
            .returning(|op, _| Err(ServiceError::new(op, "InvalidPart", "injected", 400)));
        expect_abort(&mut mock, Ok(Response::new(204)));

        let file = three_part_file();
        let client = client(mock, DispatchMode::Executor);
        let err = client.upload(request(&file)).await.unwrap_err();

        assert_eq!(err.service_error().unwrap().operation, Operation::CompleteMultipartUpload);
    }

    // ========================================================================
    // TEST: Success Path
    // ========================================================================

    #[tokio::test]
    async fn test_success_completes_without_abort() {
        let mut mock = storage();
        expect_create(&mut mock);
        for number in 1..=3 {
            expect_part_ok(&mut mock, number);
        }
        mock.expect_invoke()
            .with(eq(Operation::CompleteMultipartUpload), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(Response::new(200).with("ETag", "\"final-3\"")));
        mock.expect_invoke()
            .withf(|op, _| *op == Operation::AbortMultipartUpload)
            .times(0);

        let file = three_part_file();
        let client = client(mock, DispatchMode::WorkerPool);
        let response = client.upload(request(&file)).await.unwrap();

        assert_eq!(response.get_str("ETag"), Some("\"final-3\""));
        assert_eq!(response.get_str("Key"), Some("object.bin"));
        assert_eq!(response.get_str("Bucket"), Some("faults"));
    }

    // ========================================================================
    // TEST: Create Failure
    // ========================================================================

    #[tokio::test]
    async fn test_missing_upload_id_does_not_abort() {
        let mut mock = storage();
        mock.expect_invoke()
            .withf(|op, _| *op == Operation::CreateMultipartUpload)
            .times(1)
            .returning(|_, _| Ok(Response::new(200)));
        mock.expect_invoke()
            .withf(|op, _| *op != Operation::CreateMultipartUpload)
            .times(0);

        let file = three_part_file();
        let client = client(mock, DispatchMode::Executor);
        let err = client.upload(request(&file)).await.unwrap_err();

        assert!(matches!(err, UploadError::MissingUploadId));
    }

    // ========================================================================
    // TEST: Unsupported Operation
    // ========================================================================

    #[tokio::test]
    async fn test_unsupported_operation_never_dispatched() {
        let mut mock = MockStorage::new();
        mock.expect_meta().return_const(ClientMeta::new("s3"));
        mock.expect_supports()
            .with(eq(Operation::DeleteBucket))
            .return_const(false);
        mock.expect_invoke().times(0);

        let client = client(mock, DispatchMode::WorkerPool);
        let err = client
            .delete_bucket(Params::new().with("Bucket", "b"))
            .await
            .unwrap_err();

        assert!(matches!(err, cloud_bridge::BridgeError::UnsupportedOperation(_)));
    }

    // ========================================================================
    // TEST: Cancellation During Create
    // ========================================================================

    /// In-memory store whose `create_multipart_upload` is slow
    struct SlowCreate {
        store: MemoryClient,
        delay: Duration,
    }

    impl BlockingClient for SlowCreate {
        fn meta(&self) -> &ClientMeta {
            self.store.meta()
        }

        fn invoke(&self, operation: Operation, params: Params) -> Result<Response, ServiceError> {
            if operation == Operation::CreateMultipartUpload {
                std::thread::sleep(self.delay);
            }
            self.store.invoke(operation, params)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_during_create_leaves_no_upload() {
        for mode in [DispatchMode::WorkerPool, DispatchMode::Executor] {
            let mut meta = ClientMeta::new("s3");
            meta.options
                .insert("auto_create_buckets".into(), "true".into());
            let slow = Arc::new(SlowCreate {
                store: MemoryClient::new(meta),
                delay: Duration::from_millis(200),
            });
            let client = AsyncClient::builder("s3")
                .dispatch_mode(mode)
                .workers(2)
                .upload_config(UploadConfig {
                    multipart_threshold: 10,
                    part_size: 10,
                })
                .build_with_client(Arc::clone(&slow))
                .unwrap();

            let file = three_part_file();
            let outcome =
                tokio::time::timeout(Duration::from_millis(50), client.upload(request(&file))).await;
            assert!(outcome.is_err(), "mode {} finished before the timeout", mode);

            let store = &slow.store;
            for _ in 0..200 {
                if store.call_count(Operation::AbortMultipartUpload) == 1
                    && store.pending_uploads() == 0
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            assert_eq!(store.call_count(Operation::CreateMultipartUpload), 1, "mode {}", mode);
            assert_eq!(store.call_count(Operation::AbortMultipartUpload), 1);
            assert_eq!(store.call_count(Operation::UploadPart), 0);
            assert_eq!(store.pending_uploads(), 0);
        }
    }
}
