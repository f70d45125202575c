//! Cloud Bridge - command line front end
//!
//! Runs single object-storage operations through the async bridge.

use anyhow::Context;
use clap::{Parser, Subcommand};
use cloud_bridge::client::{Params, Response};
use cloud_bridge::config::{ConfigLoader, SessionKind};
use cloud_bridge::{logging, metrics, AsyncClient, DispatchMode, UploadRequest};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

/// Download chunk size for `get` (1 MiB)
const GET_CHUNK_SIZE: usize = 1 << 20;

/// Cloud Bridge - async bridge over a blocking object-storage client
#[derive(Parser, Debug)]
#[command(name = "cloud-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Dispatch mode (worker_pool, executor), overrides the config file
    #[arg(short, long, global = true)]
    mode: Option<DispatchMode>,

    /// Use the in-process store instead of a remote service
    #[arg(long, global = true)]
    memory: bool,

    /// Print Prometheus metrics after the command
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    Upload {
        bucket: String,
        file: PathBuf,
        /// Object key (defaults to the file name)
        #[arg(short, long)]
        key: Option<String>,
        /// Key prefix
        #[arg(short = 'p', long)]
        upload_path: Option<String>,
        /// Content type (guessed from the file name when omitted)
        #[arg(short = 't', long)]
        content_type: Option<String>,
    },
    /// Download an object into a local file
    Get {
        bucket: String,
        key: String,
        output: PathBuf,
    },
    /// Show object metadata
    Head { bucket: String, key: String },
    /// Delete an object
    Delete { bucket: String, key: String },
    /// List buckets
    ListBuckets,
}

fn object_params(bucket: &str, key: &str) -> Params {
    Params::new().with("Bucket", bucket).with("Key", key)
}

async fn execute(client: &AsyncClient, command: Command) -> anyhow::Result<Response> {
    let response = match command {
        Command::Upload {
            bucket,
            file,
            key,
            upload_path,
            content_type,
        } => {
            let mut request = UploadRequest::new(bucket, file);
            if let Some(key) = key {
                request = request.key(key);
            }
            if let Some(upload_path) = upload_path {
                request = request.upload_path(upload_path);
            }
            if let Some(content_type) = content_type {
                request = request.content_type(content_type);
            }
            client.upload(request).await?
        }
        Command::Get {
            bucket,
            key,
            output,
        } => {
            let (response, mut body) = client
                .stream_object(object_params(&bucket, &key), GET_CHUNK_SIZE)
                .await?;
            let target = output.clone();
            let mut file = client
                .run_blocking(move || std::fs::File::create(target))
                .await?
                .with_context(|| format!("creating {}", output.display()))?;
            while let Some(chunk) = body.next_chunk().await? {
                file = client
                    .run_blocking(move || file.write_all(&chunk).map(|_| file))
                    .await?
                    .with_context(|| format!("writing {}", output.display()))?;
            }
            response
        }
        Command::Head { bucket, key } => client.head_object(object_params(&bucket, &key)).await?,
        Command::Delete { bucket, key } => {
            client.delete_object(object_params(&bucket, &key)).await?
        }
        Command::ListBuckets => client.list_buckets(Params::new()).await?,
    };
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::load_or_default(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(mode) = args.mode {
        config.dispatch.mode = mode;
    }
    if args.memory {
        config.client.session = SessionKind::Memory;
        config
            .client
            .options
            .entry("auto_create_buckets".to_string())
            .or_insert_with(|| "true".to_string());
    }

    logging::init(&config.logging)?;
    info!(
        version = cloud_bridge::VERSION,
        mode = %config.dispatch.mode,
        "Starting cloud-bridge"
    );

    let client = cloud_bridge::connect(&config)?;
    let response = execute(&client, args.command).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(response.fields().clone()))?
    );

    if args.print_metrics {
        print!("{}", metrics::render());
    }

    Ok(())
}
