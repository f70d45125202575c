//! Async proxy over a blocking client
//!
//! [`AsyncClient`] exposes every allow-listed operation as an async method.
//! Each call is handed to the configured dispatcher; the awaiting task
//! suspends while other tasks keep running. Client metadata is passed
//! through without dispatch.
//!
//! # Example
//!
//! ```no_run
//! use cloud_bridge::client::{MemorySession, Params};
//! use cloud_bridge::{AsyncClient, DispatchMode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = AsyncClient::builder("s3")
//!         .dispatch_mode(DispatchMode::Executor)
//!         .build(&MemorySession::new())?;
//!
//!     client.create_bucket(Params::new().with("Bucket", "photos")).await?;
//!     let buckets = client.list_buckets(Params::new()).await?;
//!     println!("{:?}", buckets.get("Buckets"));
//!     Ok(())
//! }
//! ```

use crate::adapter::BlockingAdapter;
use crate::body::{ChunkReader, ObjectBody};
use crate::client::{
    AwsSession, BlockingClient, ClientMeta, MemorySession, Operation, Params, Response, Session,
};
use crate::config::{Config, DispatchConfig, SessionKind, UploadConfig};
use crate::dispatch::{self, DispatchError, DispatchMode, Dispatcher, Executor};
use crate::error::BridgeError;
use crate::metrics;
use crate::upload::{self, UploadError, UploadRequest};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn, Span};

/// Async facade over a [`BlockingClient`]
pub struct AsyncClient<C: BlockingClient + ?Sized = dyn BlockingClient> {
    client: Arc<C>,
    adapter: BlockingAdapter,
    upload: UploadConfig,
}

impl<C: BlockingClient + ?Sized> Clone for AsyncClient<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            adapter: self.adapter.clone(),
            upload: self.upload.clone(),
        }
    }
}

impl<C: BlockingClient + ?Sized> fmt::Debug for AsyncClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncClient")
            .field("meta", self.client.meta())
            .field("mode", &self.adapter.mode())
            .field("upload", &self.upload)
            .finish()
    }
}

impl AsyncClient {
    /// Start building a client for `service`
    pub fn builder(service: impl Into<String>) -> AsyncClientBuilder {
        AsyncClientBuilder::new(service)
    }
}

impl<C: BlockingClient + ?Sized> AsyncClient<C> {
    /// Client metadata, read without dispatch
    pub fn meta(&self) -> &ClientMeta {
        self.client.meta()
    }

    pub fn mode(&self) -> DispatchMode {
        self.adapter.mode()
    }

    pub fn upload_config(&self) -> &UploadConfig {
        &self.upload
    }

    /// The wrapped blocking client
    pub fn inner(&self) -> &Arc<C> {
        &self.client
    }

    pub(crate) fn adapter(&self) -> &BlockingAdapter {
        &self.adapter
    }

    /// Dispatch one allow-listed operation
    pub async fn call(&self, operation: Operation, params: Params) -> Result<Response, BridgeError> {
        let (response, ()) = self.call_then(operation, params, |_| ()).await?;
        Ok(response)
    }

    /// Like [`call`](Self::call), also running `then` on the worker right
    /// after a successful response.
    ///
    /// What `then` returns travels back with the response. If the caller has
    /// stopped waiting by then, it is dropped instead, which lets a guard
    /// value clean up after calls whose result nobody will see.
    #[tracing::instrument(
        name = "bridge.call",
        skip(self, params, then),
        fields(
            operation = %operation,
            dispatch.mode = %self.adapter.mode(),
            http.status_code = tracing::field::Empty,
        ),
        err
    )]
    pub(crate) async fn call_then<F, T>(
        &self,
        operation: Operation,
        params: Params,
        then: F,
    ) -> Result<(Response, T), BridgeError>
    where
        F: FnOnce(&Response) -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.client.supports(operation) {
            return Err(BridgeError::UnsupportedOperation(operation.api_name().to_string()));
        }

        let client = Arc::clone(&self.client);
        let result = self
            .adapter
            .run(move || {
                let response = client.invoke(operation, params);
                metrics::record_operation(operation, response.is_ok());
                response.map(|response| {
                    let extra = then(&response);
                    (response, extra)
                })
            })
            .await?;

        let (response, extra) = result?;
        if let Some(status) = response.status_code() {
            Span::current().record("http.status_code", status);
        }
        Ok((response, extra))
    }

    /// `get_object` with the body read on demand in `chunk_size` pieces.
    ///
    /// A `chunk_size` of 0 returns the whole body as one chunk.
    #[tracing::instrument(
        name = "bridge.stream_object",
        skip(self, params),
        fields(dispatch.mode = %self.adapter.mode()),
        err
    )]
    pub async fn stream_object(
        &self,
        params: Params,
        chunk_size: usize,
    ) -> Result<(Response, ObjectBody), BridgeError> {
        let operation = Operation::GetObject;
        if !self.client.supports(operation) {
            return Err(BridgeError::UnsupportedOperation(operation.api_name().to_string()));
        }

        let client = Arc::clone(&self.client);
        let result = self
            .adapter
            .run(move || client.open_object(params))
            .await?;
        metrics::record_operation(operation, result.is_ok());

        let (response, reader) = result?;
        Ok((response, ChunkReader::new(self.adapter.clone(), reader, chunk_size)))
    }

    /// Dispatch an operation by name (`put_object` or `PutObject`).
    ///
    /// Names outside the allow-list fail with
    /// [`BridgeError::UnsupportedOperation`].
    pub async fn invoke(&self, name: &str, params: Params) -> Result<Response, BridgeError> {
        let operation: Operation = name
            .parse()
            .map_err(|_| BridgeError::UnsupportedOperation(name.to_string()))?;
        self.call(operation, params).await
    }

    /// Fire an operation without waiting; failures are only logged
    pub(crate) fn call_detached(&self, operation: Operation, params: Params) {
        let client = Arc::clone(&self.client);
        self.adapter.detach(move || {
            let result = client.invoke(operation, params);
            metrics::record_operation(operation, result.is_ok());
            if let Err(e) = result {
                warn!(operation = %operation, error = %e, "Detached call failed");
            }
        });
    }

    /// Run any blocking closure on this client's dispatcher
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.adapter.run(f).await?)
    }

    /// Upload a file, buffer or reader. See [`upload`](crate::upload).
    pub async fn upload(&self, request: UploadRequest) -> Result<Response, UploadError> {
        upload::upload(self, request).await
    }
}

impl<C: BlockingClient> AsyncClient<C> {
    /// Erase the concrete client type
    pub fn into_dyn(self) -> AsyncClient {
        let client: Arc<dyn BlockingClient> = self.client;
        AsyncClient {
            client,
            adapter: self.adapter,
            upload: self.upload,
        }
    }
}

macro_rules! proxy_operations {
    ($($method:ident => $variant:ident),* $(,)?) => {
        impl<C: BlockingClient + ?Sized> AsyncClient<C> {
            $(
                #[doc = concat!("Async `", stringify!($variant), "`")]
                pub async fn $method(&self, params: Params) -> Result<Response, BridgeError> {
                    self.call(Operation::$variant, params).await
                }
            )*
        }
    };
}

proxy_operations! {
    list_buckets => ListBuckets,
    create_bucket => CreateBucket,
    head_bucket => HeadBucket,
    delete_bucket => DeleteBucket,
    list_objects_v2 => ListObjectsV2,
    put_object => PutObject,
    get_object => GetObject,
    head_object => HeadObject,
    delete_object => DeleteObject,
    create_multipart_upload => CreateMultipartUpload,
    upload_part => UploadPart,
    complete_multipart_upload => CompleteMultipartUpload,
    abort_multipart_upload => AbortMultipartUpload,
}

/// Builder for [`AsyncClient`]
#[derive(Debug, Clone)]
pub struct AsyncClientBuilder {
    meta: ClientMeta,
    dispatch: DispatchConfig,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    upload: UploadConfig,
}

impl AsyncClientBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            meta: ClientMeta::new(service),
            dispatch: DispatchConfig::default(),
            dispatcher: None,
            upload: UploadConfig::default(),
        }
    }

    /// Replace the whole client metadata
    pub fn meta(mut self, meta: ClientMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.meta.region = Some(region.into());
        self
    }

    pub fn endpoint_url(mut self, endpoint_url: impl Into<String>) -> Self {
        self.meta.endpoint_url = Some(endpoint_url.into());
        self
    }

    /// Service-specific option forwarded to the session
    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.options.insert(name.into(), value.into());
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch.mode = mode;
        self
    }

    /// Worker threads for worker-pool mode
    pub fn workers(mut self, workers: usize) -> Self {
        self.dispatch.workers = workers;
        self
    }

    /// Use an existing dispatcher; overrides the dispatch mode
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Executor mode on an explicit runtime instead of the current one
    pub fn executor_handle(self, handle: Handle) -> Self {
        self.dispatcher(Arc::new(Executor::new(handle)))
    }

    pub fn upload_config(mut self, upload: UploadConfig) -> Self {
        self.upload = upload;
        self
    }

    /// Create the blocking client from `session` and wrap it
    pub fn build<S: Session>(self, session: &S) -> Result<AsyncClient<S::Client>, BridgeError> {
        let adapter = self.adapter()?;
        let client = session.create_client(self.meta)?;
        Ok(AsyncClient {
            client: Arc::new(client),
            adapter,
            upload: self.upload,
        })
    }

    /// Wrap an already constructed blocking client
    pub fn build_with_client<C: BlockingClient + ?Sized>(
        self,
        client: Arc<C>,
    ) -> Result<AsyncClient<C>, BridgeError> {
        let adapter = self.adapter()?;
        Ok(AsyncClient {
            client,
            adapter,
            upload: self.upload,
        })
    }

    fn adapter(&self) -> Result<BlockingAdapter, BridgeError> {
        self.upload.validate()?;

        let dispatcher = match &self.dispatcher {
            Some(dispatcher) => Arc::clone(dispatcher),
            None => dispatch::dispatcher_for(&self.dispatch).map_err(|e| match e {
                e @ (DispatchError::NoRuntime
                | DispatchError::PoolBuild(_)
                | DispatchError::UnknownMode(_)) => BridgeError::Config(e.to_string()),
                other => BridgeError::Dispatch(other),
            })?,
        };

        debug!(
            service = %self.meta.service_name,
            mode = %dispatcher.mode(),
            "Async client configured"
        );
        Ok(BlockingAdapter::new(dispatcher))
    }
}

/// Build an [`AsyncClient`] from a loaded configuration
pub fn connect(config: &Config) -> Result<AsyncClient, BridgeError> {
    let builder = AsyncClient::builder(config.client.service.as_str())
        .meta(config.client.meta())
        .dispatch(config.dispatch.clone())
        .upload_config(config.upload.clone());

    match config.client.session {
        SessionKind::Memory => Ok(builder.build(&MemorySession::new())?.into_dyn()),
        SessionKind::Aws => {
            let session = AwsSession::from_config(&config.client)
                .map_err(|e| BridgeError::Config(e.to_string()))?;
            Ok(builder.build(&session)?.into_dyn())
        }
    }
}
