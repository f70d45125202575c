//! Cloud Bridge Library
//!
//! Drives a blocking object-storage client from async code without stalling
//! the caller's runtime, plus a chunked multipart uploader with
//! all-or-nothing semantics.
//!
//! # Features
//!
//! - **Two dispatch modes**: a bridge-owned worker pool, or tokio's blocking
//!   pool through a runtime handle
//! - **Nested calls**: blocking code already running on a pool worker may
//!   issue further calls without deadlocking
//! - **Allow-listed operations**: every proxied call is one of
//!   [`client::Operation`]
//! - **Uploads**: files, buffers and readers; large files go multipart and
//!   are aborted on any failure
//! - **Streamed downloads**: object bodies read back in fixed-size chunks,
//!   each read dispatched like any other blocking call
//!
//! # Example
//!
//! ```no_run
//! use cloud_bridge::{config::Config, upload::UploadRequest};
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = cloud_bridge::connect(&config)?;
//!
//!     let request = UploadRequest::new("backups", PathBuf::from("/var/tmp/data.bin"))
//!         .upload_path("nightly");
//!     let response = client.upload(request).await?;
//!     println!("stored {:?}", response.get_str("Key"));
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod body;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod upload;

// Re-export commonly used types
pub use adapter::BlockingAdapter;
pub use body::{ChunkReader, ObjectBody};
pub use config::Config;
pub use dispatch::{DispatchMode, Dispatcher};
pub use error::BridgeError;
pub use proxy::{connect, AsyncClient, AsyncClientBuilder};
pub use upload::{UploadError, UploadRequest, UploadSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
