//! Dispatch Mode Tests
//!
//! Both dispatch modes must produce the same observable results. Blocking
//! code running on a pool worker may call back into the client without
//! deadlocking, even when the pool has a single worker.

#[cfg(test)]
mod tests {
    use cloud_bridge::client::{MemoryClient, MemorySession, Operation, Params, Response};
    use cloud_bridge::config::UploadConfig;
    use cloud_bridge::dispatch::WorkerPool;
    use cloud_bridge::upload::UploadRequest;
    use cloud_bridge::{AsyncClient, BridgeError, DispatchMode};
    use std::io::Write;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn client(mode: DispatchMode, workers: usize) -> AsyncClient<MemoryClient> {
        AsyncClient::builder("s3")
            .dispatch_mode(mode)
            .workers(workers)
            .upload_config(UploadConfig {
                multipart_threshold: 64,
                part_size: 64,
            })
            .build(&MemorySession::new())
            .unwrap()
    }

    /// Run a fixed script of calls and return the normalized outcomes
    async fn script(client: &AsyncClient<MemoryClient>) -> Vec<String> {
        let mut outcomes = Vec::new();
        let mut record = |label: &str, result: Result<Response, BridgeError>| {
            let outcome = match result {
                Ok(response) => format!("{} ok {:?}", label, response.status_code()),
                Err(e) => match e.service_error() {
                    Some(service) => format!("{} err {}", label, service.code),
                    None => format!("{} err {}", label, e),
                },
            };
            outcomes.push(outcome);
        };

        let bucket = || Params::new().with("Bucket", "script");
        let object = || bucket().with("Key", "a.txt");

        record("head-missing-bucket", client.head_bucket(bucket()).await);
        record("create", client.create_bucket(bucket()).await);
        record("create-again", client.create_bucket(bucket()).await);
        record("put", client.put_object(object().with_body("alpha")).await);
        record("get", client.get_object(object()).await);
        record("delete-bucket-not-empty", client.delete_bucket(bucket()).await);
        record("delete", client.delete_object(object()).await);
        record("head-deleted", client.head_object(object()).await);
        record("unknown", client.invoke("select_object_content", bucket()).await);
        outcomes
    }

    // ========================================================================
    // TEST: Mode Equivalence
    // ========================================================================

    #[tokio::test]
    async fn test_modes_produce_identical_outcomes() {
        let pool = script(&client(DispatchMode::WorkerPool, 2)).await;
        let executor = script(&client(DispatchMode::Executor, 2)).await;
        assert_eq!(pool, executor);
        assert_eq!(pool[0], "head-missing-bucket err NotFound");
        assert_eq!(pool[4], "get ok Some(200)");
        assert_eq!(pool[7], "head-deleted err NoSuchKey");
    }

    // ========================================================================
    // TEST: Re-entrancy
    // ========================================================================

    #[tokio::test]
    async fn test_nested_call_on_single_worker_pool() {
        let client = client(DispatchMode::WorkerPool, 1);
        let inner = client.clone();

        let nested = client
            .run_blocking(move || {
                futures::executor::block_on(async {
                    inner
                        .create_bucket(Params::new().with("Bucket", "nested"))
                        .await?;
                    inner.list_buckets(Params::new()).await
                })
            })
            .await
            .unwrap()
            .unwrap();

        let buckets = nested.get("Buckets").unwrap().as_array().unwrap();
        assert_eq!(buckets.len(), 1);
    }

    #[tokio::test]
    async fn test_nested_upload_inside_worker() {
        for mode in [DispatchMode::WorkerPool, DispatchMode::Executor] {
            let client = client(mode, 1);
            client
                .create_bucket(Params::new().with("Bucket", "nested"))
                .await
                .unwrap();

            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&[1u8; 200]).unwrap();
            let path = file.path().to_path_buf();

            let inner = client.clone();
            let response = client
                .run_blocking(move || {
                    futures::executor::block_on(
                        inner.upload(UploadRequest::new("nested", path).key("inner.bin")),
                    )
                })
                .await
                .unwrap()
                .unwrap();

            assert_eq!(response.get_str("Key"), Some("inner.bin"), "mode {}", mode);
            assert_eq!(client.inner().call_count(Operation::UploadPart), 4);
            assert_eq!(client.inner().object("nested", "inner.bin").unwrap().len(), 200);
        }
    }

    #[tokio::test]
    async fn test_deeply_nested_dispatch() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let client = AsyncClient::builder("s3")
            .dispatcher(pool.clone())
            .build(&MemorySession::new())
            .unwrap();
        assert_eq!(client.mode(), DispatchMode::WorkerPool);

        let level1 = client.clone();
        let depth = client
            .run_blocking(move || {
                let level2 = level1.clone();
                futures::executor::block_on(level1.run_blocking(move || {
                    futures::executor::block_on(level2.run_blocking(|| 3)).unwrap()
                }))
                .unwrap()
            })
            .await
            .unwrap();
        assert_eq!(depth, 3);
        assert!(!pool.on_worker());
    }

    // ========================================================================
    // TEST: Caller Is Not Blocked
    // ========================================================================

    #[tokio::test]
    async fn test_other_tasks_progress_during_blocking_call() {
        for mode in [DispatchMode::WorkerPool, DispatchMode::Executor] {
            let client = client(mode, 2);
            let started = Instant::now();

            let slow = client.run_blocking(|| std::thread::sleep(Duration::from_millis(300)));
            let ticker = async {
                let mut ticks = 0;
                while started.elapsed() < Duration::from_millis(250) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks += 1;
                }
                ticks
            };

            // Current-thread runtime: ticks only advance if the slow call yields.
            let (slow, ticks) = tokio::join!(slow, ticker);
            slow.unwrap();
            assert!(ticks > 5, "mode {} starved the runtime ({} ticks)", mode, ticks);
        }
    }

    #[tokio::test]
    async fn test_panicking_job_reports_dispatch_error() {
        for mode in [DispatchMode::WorkerPool, DispatchMode::Executor] {
            let client = client(mode, 1);
            let err = client
                .run_blocking(|| -> u32 { panic!("job failure") })
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Dispatch(_)), "mode {}", mode);

            // Still usable
            assert_eq!(client.run_blocking(|| 5).await.unwrap(), 5);
        }
    }
}
