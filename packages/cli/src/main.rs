#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `supersync`: upload a local file to S3, copying every chunk the
//! content index has seen before instead of sending it again.
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |---|---|
//! | `AWS_PROFILE` / `--profile` | Named profile from `~/.aws/config` |
//! | `AWS_REGION` | Region for S3 and `DynamoDB` |
//! | `AWS_ENDPOINT_URL` | Endpoint override for S3-compatible servers |
//! | `RUST_LOG` | Log filter (default `info`) |

use std::path::PathBuf;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use clap::Parser;
use supersync_cli_utils::IndicatifProgress;
use supersync_fingerprint::HashMode;
use supersync_gateway::{S3Gateway, StorageGateway};
use supersync_index::{ContentIndex, DynamoStore};
use supersync_sync::{PlanningError, SyncError, UploadCoordinator};
use supersync_sync_models::{
    DEFAULT_CONCURRENCY, DEFAULT_TABLE_NAME, Destination, SyncConfig, SyncPhase,
};

#[derive(Parser)]
#[command(
    name = "supersync",
    about = "Deduplicating multipart upload of a local file to S3"
)]
struct Cli {
    /// Local file to upload
    local: PathBuf,

    /// Destination as `s3://bucket/key` or `bucket/key`
    dest: String,

    /// AWS profile to load credentials and region from
    #[arg(short, long)]
    profile: Option<String>,

    /// Number of parts processed in parallel
    #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// `DynamoDB` table holding the content index
    #[arg(short, long, default_value = DEFAULT_TABLE_NAME)]
    table_name: String,

    /// Chunk fingerprint: `default` (SHA3-512 + BLAKE2b-512) or `fast`
    /// (XXH64 only)
    #[arg(long, default_value = "default")]
    hash_mode: HashMode,

    /// Log supersync internals at debug level
    #[arg(short, long)]
    debug: bool,

    /// Abort the multipart upload if the sync fails
    #[arg(long)]
    abort_on_failure: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Use path-style bucket addressing (most S3-compatible servers)
    #[arg(long)]
    path_style: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let multi = supersync_cli_utils::init_logger(cli.debug);

    let destination: Destination = cli.dest.parse().map_err(PlanningError::from)?;

    if cli.hash_mode == HashMode::Fast {
        log::warn!(
            "Fast hash mode fingerprints chunks with XXH64 only; a collision would copy the \
             wrong bytes into {destination}"
        );
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(profile) = &cli.profile {
        loader = loader.profile_name(profile);
    }
    let sdk_config = loader.load().await;

    let mut config = SyncConfig::new(&cli.local, destination);
    config.hash_mode = cli.hash_mode;
    config.concurrency = cli.concurrency;
    config.table_name = cli.table_name;

    let gateway = Arc::new(S3Gateway::from_sdk_config(&sdk_config, cli.path_style));
    check_bucket(&gateway, &config.destination.bucket).await?;

    let store = DynamoStore::new(
        aws_sdk_dynamodb::Client::new(&sdk_config),
        config.table_name.clone(),
    );
    store.ensure_table().await?;
    let index = ContentIndex::new(Arc::new(store)).with_concurrency(config.concurrency.max(1));

    let progress = if cli.json {
        IndicatifProgress::hidden()
    } else {
        IndicatifProgress::parts_bar(&multi, &format!("Planning {}", config.destination))
    };

    let coordinator = UploadCoordinator::new(gateway.clone(), index).with_progress(progress.clone());

    match coordinator.sync(&config).await {
        Ok(report) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{} -> {}", report.local.display(), report.destination);
                println!("  version:  {}", report.version);
                println!(
                    "  parts:    {} x {} bytes",
                    report.part_count, report.chunk_size
                );
                println!("  {report}");
            }
            Ok(())
        }
        Err(e) => {
            progress.finish_and_clear();
            handle_failure(gateway.as_ref(), &config.destination, &e, cli.abort_on_failure).await;
            Err(e.into())
        }
    }
}

/// Fails early when the bucket is missing or unversioned; completed parts
/// are only addressable through the object version.
async fn check_bucket(gateway: &S3Gateway, bucket: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !gateway.bucket_exists(bucket).await? {
        return Err(format!("Bucket {bucket} does not exist or is not accessible").into());
    }
    if !gateway.bucket_versioning_enabled(bucket).await? {
        return Err(format!(
            "Bucket {bucket} does not have versioning enabled; supersync needs object versions \
             to copy from"
        )
        .into());
    }
    Ok(())
}

/// Cleans up or reports the multipart upload a failed sync left behind.
async fn handle_failure(
    gateway: &dyn StorageGateway,
    destination: &Destination,
    error: &SyncError,
    abort: bool,
) {
    let (Some(upload_id), Some(phase)) = (error.upload_id(), error.phase()) else {
        return;
    };

    // Past completion the upload no longer exists.
    if phase > SyncPhase::Completing {
        log::warn!(
            "{destination} was uploaded but not fully indexed; the next sync may upload some \
             chunks again"
        );
        return;
    }

    if !abort {
        log::warn!(
            "Multipart upload {upload_id} to {destination} was left in place (failed during \
             {phase}); pass --abort-on-failure to remove it"
        );
        return;
    }

    if let Err(e) = gateway
        .abort_multipart_upload(&destination.bucket, &destination.key, upload_id)
        .await
    {
        log::error!("{e}");
    }
}
