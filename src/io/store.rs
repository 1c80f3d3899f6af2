//! Object store configuration for S3 and local filesystem access.
//!
//! This module provides the S3 client configuration used for artifact transfer,
//! including connection pool tuning and timeout settings.

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::{ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri.strip_prefix("s3://").ok_or_else(|| {
        PipelineError::config(format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))
    })?;

    without_scheme.split_once('/').ok_or_else(|| {
        PipelineError::config(format!(
            "Invalid S3 URI: expected 's3://bucket/key' format in '{}'",
            uri
        ))
    })
}

/// Create client options for large artifact transfers.
///
/// Timeouts are generous because partition artifacts and raw inputs can be
/// tens of gigabytes.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        .with_timeout(Duration::from_secs(600))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(64)
}

/// Per-request retries inside the client. Whole-operation retries with
/// backoff are layered on top by the storage adapter.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials are loaded from the environment, AWS config files, or the
/// instance profile, in that order.
fn create_s3_store(bucket: &str, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    if let Some(endpoint) = &config.endpoint_url {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(endpoint.starts_with("http://"));
    }

    let store = builder
        .build()
        .map_err(|e| PipelineError::config(format!("cannot create S3 client: {}", e)))?;
    Ok(Arc::new(store))
}

/// Create the artifact store.
/// Uses LocalFileSystem if local_path is set, otherwise S3 with credentials.
pub fn create_object_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&config.local_path, &config.bucket) {
        (Some(local_path), _) => {
            let path = std::path::Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            tracing::info!("Creating LocalFileSystem store at: {}", path.display());
            let store = LocalFileSystem::new_with_prefix(path)
                .map_err(|e| PipelineError::config(format!("cannot open {}: {}", path.display(), e)))?;
            Ok(Arc::new(store))
        }
        (_, Some(bucket)) => create_s3_store(bucket, config),
        _ => Err(PipelineError::config("Invalid config: no storage destination")),
    }
}
