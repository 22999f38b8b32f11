// pg-r2-backup/src/backup/s3_upload.rs
use aws_sdk_s3 as s3;
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use aws_smithy_types::timeout::TimeoutConfig;
use s3::config::{Credentials, Region, SharedHttpClient};
use s3::primitives::ByteStream;
use std::path::Path;
use std::time::Duration;

use crate::config::BackupConfig;
use crate::errors::{BackupError, Result, UploadFailure};

/// Hard bound on a single put-object call, independent of the transport timeout.
pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(10 * 60);

const OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE: usize = 10;

/// A bucket-addressed object store accepting whole-object puts.
pub trait ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> std::result::Result<(), UploadFailure>;
}

/// Builds an [`ObjectStore`] from the run configuration.
///
/// Called only once the dump has been produced and validated.
pub trait StoreConnector {
    type Store: ObjectStore;

    async fn connect(&self, config: &BackupConfig) -> Result<Self::Store>;
}

/// Cloudflare R2 through its S3-compatible API.
#[derive(Debug, Clone)]
pub struct R2Store {
    client: s3::Client,
}

impl R2Store {
    pub fn new(client: s3::Client) -> Self {
        Self { client }
    }
}

impl ObjectStore for R2Store {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> std::result::Result<(), UploadFailure> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| UploadFailure::Service(Box::new(e)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct R2Connector;

impl StoreConnector for R2Connector {
    type Store = R2Store;

    async fn connect(&self, config: &BackupConfig) -> Result<R2Store> {
        let endpoint = r2_endpoint(&config.r2_account_id)?;
        if config.r2_access_key.is_empty() || config.r2_secret_key.is_empty() {
            return Err(BackupError::ClientInit(
                "R2 access key and secret key must both be set".to_string(),
            ));
        }

        let http_client = build_r2_http_client()?;
        let timeouts = TimeoutConfig::builder()
            .operation_timeout(OPERATION_TIMEOUT)
            .build();

        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(endpoint.as_str())
            .region(Region::new(config.r2_region.clone()))
            .credentials_provider(Credentials::new(
                &config.r2_access_key,
                &config.r2_secret_key,
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ))
            .http_client(http_client)
            .timeout_config(timeouts)
            .load()
            .await;

        tracing::debug!(endpoint = %endpoint, region = %config.r2_region, "R2 client ready");
        Ok(R2Store::new(s3::Client::new(&sdk_config)))
    }
}

/// `https://<account_id>.r2.cloudflarestorage.com`
pub fn r2_endpoint(account_id: &str) -> Result<url::Url> {
    if account_id.trim().is_empty() {
        return Err(BackupError::ClientInit(
            "R2 account id is empty, cannot derive endpoint".to_string(),
        ));
    }
    let host = format!("{}.r2.cloudflarestorage.com", account_id);
    let raw = format!("https://{}", host);
    let endpoint = url::Url::parse(&raw)
        .map_err(|e| BackupError::ClientInit(format!("invalid R2 endpoint {}: {}", raw, e)))?;
    let host_matches = endpoint
        .host_str()
        .is_some_and(|parsed| parsed.eq_ignore_ascii_case(&host));
    if !host_matches || endpoint.path() != "/" {
        return Err(BackupError::ClientInit(format!(
            "R2 account id {:?} does not form a valid endpoint host",
            account_id
        )));
    }
    Ok(endpoint)
}

/// HTTPS-only transport: TLS 1.2 or 1.3, at most 10 idle pooled connections
/// kept for 30 seconds. Responses are never requested compressed.
fn build_r2_http_client() -> Result<SharedHttpClient> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let tls_config = rustls::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| BackupError::ClientInit(format!("TLS configuration failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_only()
        .enable_http1()
        .build();

    let mut pool = hyper::Client::builder();
    pool.pool_max_idle_per_host(POOL_MAX_IDLE)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT);

    Ok(HyperClientBuilder::new()
        .hyper_builder(pool)
        .build(https_connector))
}

/// Streams the artifact to `bucket` under its base file name.
///
/// The put is abandoned once `deadline` elapses. Returns the object key.
pub async fn upload_artifact<S: ObjectStore>(
    store: &S,
    bucket: &str,
    artifact: &Path,
    deadline: Duration,
) -> Result<String> {
    let key = artifact
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| BackupError::Upload {
            key: String::new(),
            source: UploadFailure::InvalidKey(artifact.to_path_buf()),
        })?;

    let body = ByteStream::from_path(artifact)
        .await
        .map_err(|e| BackupError::Upload {
            key: key.clone(),
            source: UploadFailure::Body(e),
        })?;

    tracing::info!(bucket, key = %key, "Uploading backup");

    match tokio::time::timeout(deadline, store.put_object(bucket, &key, body)).await {
        Ok(Ok(())) => {
            tracing::info!(bucket, key = %key, "Successfully uploaded backup to R2");
            Ok(key)
        }
        Ok(Err(source)) => Err(BackupError::Upload { key, source }),
        Err(_) => Err(BackupError::Upload {
            key,
            source: UploadFailure::DeadlineExceeded(deadline),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingStore {
        calls: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
    }

    impl ObjectStore for RecordingStore {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            body: ByteStream,
        ) -> std::result::Result<(), UploadFailure> {
            let bytes = body.collect().await?.into_bytes();
            self.calls
                .lock()
                .unwrap()
                .push((bucket.to_string(), key.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    struct StalledStore;

    impl ObjectStore for StalledStore {
        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: ByteStream,
        ) -> std::result::Result<(), UploadFailure> {
            tokio::time::sleep(Duration::from_secs(11 * 60)).await;
            Ok(())
        }
    }

    struct RejectingStore;

    impl ObjectStore for RejectingStore {
        async fn put_object(
            &self,
            _bucket: &str,
            _key: &str,
            _body: ByteStream,
        ) -> std::result::Result<(), UploadFailure> {
            Err(UploadFailure::Service("AccessDenied".into()))
        }
    }

    #[tokio::test]
    async fn test_upload_uses_base_file_name_as_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let artifact = temp.path().join("orders_2024-03-09_07-05-01.sql");
        std::fs::write(&artifact, b"-- dump\nSELECT 1;\n")?;
        let store = RecordingStore::default();

        let key = upload_artifact(&store, "db-backups", &artifact, UPLOAD_DEADLINE).await?;

        assert_eq!(key, "orders_2024-03-09_07-05-01.sql");
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "db-backups");
        assert_eq!(calls[0].1, "orders_2024-03-09_07-05-01.sql");
        assert_eq!(calls[0].2, b"-- dump\nSELECT 1;\n");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_fails_when_deadline_expires() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let artifact = temp.path().join("orders.sql");
        std::fs::write(&artifact, b"-- dump\n")?;

        let err = upload_artifact(&StalledStore, "db-backups", &artifact, UPLOAD_DEADLINE)
            .await
            .expect_err("stalled upload must hit the deadline");

        match err {
            BackupError::Upload {
                key,
                source: UploadFailure::DeadlineExceeded(after),
            } => {
                assert_eq!(key, "orders.sql");
                assert_eq!(after, UPLOAD_DEADLINE);
            }
            other => panic!("expected deadline failure, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_service_error_is_wrapped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let artifact = temp.path().join("orders.sql");
        std::fs::write(&artifact, b"-- dump\n")?;

        let err = upload_artifact(&RejectingStore, "db-backups", &artifact, UPLOAD_DEADLINE)
            .await
            .expect_err("rejected upload must fail");

        assert!(matches!(
            err,
            BackupError::Upload {
                source: UploadFailure::Service(_),
                ..
            }
        ));
        assert!(err.to_string().contains("orders.sql"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_before_put() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RecordingStore::default();

        let err = upload_artifact(&store, "db-backups", &temp.path().join("gone.sql"), UPLOAD_DEADLINE)
            .await
            .expect_err("missing file must fail");

        assert!(matches!(
            err,
            BackupError::Upload {
                source: UploadFailure::Body(_),
                ..
            }
        ));
        assert!(store.calls.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_r2_endpoint_is_account_scoped() -> anyhow::Result<()> {
        let endpoint = r2_endpoint("0123abcd")?;
        assert_eq!(endpoint.as_str(), "https://0123abcd.r2.cloudflarestorage.com/");
        assert_eq!(endpoint.host_str(), Some("0123abcd.r2.cloudflarestorage.com"));
        Ok(())
    }

    #[test]
    fn test_r2_endpoint_rejects_empty_or_invalid_account() {
        assert!(matches!(r2_endpoint(""), Err(BackupError::ClientInit(_))));
        assert!(matches!(r2_endpoint("bad host"), Err(BackupError::ClientInit(_))));
    }

    #[test]
    fn test_r2_endpoint_rejects_account_ids_that_change_the_host() {
        for account_id in ["abc/x", "user@abc", "abc:8443", "abc?x=1", "abc#frag"] {
            assert!(
                matches!(r2_endpoint(account_id), Err(BackupError::ClientInit(_))),
                "{} should be rejected",
                account_id
            );
        }
    }

    #[tokio::test]
    async fn test_connector_requires_credentials() {
        let config = BackupConfig {
            db_host: String::new(),
            db_port: String::new(),
            db_user: String::new(),
            db_password: String::new(),
            db_name: "orders".into(),
            r2_account_id: "0123abcd".into(),
            r2_access_key: String::new(),
            r2_secret_key: String::new(),
            r2_bucket_name: "db-backups".into(),
            r2_region: "auto".into(),
            backup_dir: "/tmp/postgres_backups".into(),
        };

        let result = R2Connector.connect(&config).await;
        assert!(matches!(result, Err(BackupError::ClientInit(_))));
    }

    #[tokio::test]
    async fn test_connector_builds_client_from_static_credentials() {
        let config = BackupConfig {
            db_host: String::new(),
            db_port: String::new(),
            db_user: String::new(),
            db_password: String::new(),
            db_name: "orders".into(),
            r2_account_id: "0123abcd".into(),
            r2_access_key: "AKIA".into(),
            r2_secret_key: "secret".into(),
            r2_bucket_name: "db-backups".into(),
            r2_region: "auto".into(),
            backup_dir: "/tmp/postgres_backups".into(),
        };

        assert!(R2Connector.connect(&config).await.is_ok());
    }
}
