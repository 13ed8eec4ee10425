//! HTTP client for one remote collection on a share server.
//!
//! Reads come in two flavours: `try_*` methods surface every failure,
//! the plain ones log and degrade to `None` so a flaky remote never takes
//! local operation down with it. Writes always fail loudly.

use std::time::Duration;

use cas::Sha1Hash;
use kvstore::{Key, KvOp, ValueRecord};
use mtconfig::RemoteConfig;
use reqwest::header::CONTENT_LENGTH;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::protocol::{KvRecordResponse, KvWriteRequest, KvWriteResponse, BLOB_SIZE_HEADER};

/// Client for one remote collection.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    config: RemoteConfig,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self, ClientError> {
        // Fail on a bad URL now rather than on first use.
        Url::parse(&config.url)
            .map_err(|e| ClientError::Network(format!("invalid remote url {}: {}", config.url, e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClientError::Network(format!("failed to build http client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    pub fn is_readonly(&self) -> bool {
        self.config.is_readonly()
    }

    /// Same server and credentials, different collection.
    pub fn for_collection(&self, collection: impl Into<String>) -> Self {
        let mut config = self.config.clone();
        config.collection = collection.into();
        Self {
            http: self.http.clone(),
            config,
        }
    }

    fn endpoint(&self, kind: &str, id: &str) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| ClientError::Network(format!("invalid remote url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Network(format!("remote url cannot be a base: {}", self.config.url)))?
            .pop_if_empty()
            .extend([kind, self.config.collection.as_str(), id]);
        Ok(url)
    }

    fn with_read_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.read_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn write_token(&self) -> Result<&str, ClientError> {
        self.config.write_token.as_deref().ok_or_else(|| {
            ClientError::Permission(format!(
                "remote collection '{}' is configured readonly",
                self.config.collection
            ))
        })
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        builder
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Key/value
    // ------------------------------------------------------------------

    /// Fetch the record stored under a key hash.
    pub async fn try_pull_record(
        &self,
        key_hash: &Sha1Hash,
    ) -> Result<Option<ValueRecord>, ClientError> {
        let url = self.endpoint("kv", key_hash.as_str())?;
        let response = self.send(self.with_read_auth(self.http.get(url))).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body: KvRecordResponse = response
                    .json()
                    .await
                    .map_err(|e| ClientError::Network(format!("bad record response: {}", e)))?;
                Ok(Some(body.record))
            }
            _ => Err(error_for(response).await),
        }
    }

    /// Like [`try_pull_record`](Self::try_pull_record), but failures read as absent.
    pub async fn pull_record(&self, key_hash: &Sha1Hash) -> Option<ValueRecord> {
        match self.try_pull_record(key_hash).await {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    remote.collection = %self.config.collection,
                    kv.key_hash = %key_hash,
                    error = %e,
                    "remote record read failed"
                );
                None
            }
        }
    }

    /// Apply a write on the server. Returns whether it took effect.
    pub async fn push_op(&self, key: &Key, op: KvOp) -> Result<bool, ClientError> {
        let token = self.write_token()?;
        let key_hash = key.hash();
        let url = self.endpoint("kv", key_hash.as_str())?;
        let request = KvWriteRequest {
            key: key.clone(),
            op,
        };

        let response = self
            .send(self.http.post(url).bearer_auth(token).json(&request))
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }

        let body: KvWriteResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Network(format!("bad write response: {}", e)))?;
        debug!(
            remote.collection = %self.config.collection,
            kv.key_hash = %key_hash,
            applied = body.applied,
            "remote write"
        );
        Ok(body.applied)
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Size of a remote blob, `None` if absent or unreachable.
    pub async fn find_blob(&self, hash: &Sha1Hash) -> Option<u64> {
        let url = self.endpoint("blobs", hash.as_str()).ok()?;
        let response = match self.send(self.with_read_auth(self.http.head(url))).await {
            Ok(r) => r,
            Err(e) => {
                warn!(cas.hash = %hash, error = %e, "remote blob lookup failed");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        response
            .headers()
            .get(BLOB_SIZE_HEADER)
            .or_else(|| response.headers().get(CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Download a blob and check it hashes to `hash`.
    pub async fn try_pull_blob(&self, hash: &Sha1Hash) -> Result<Option<Vec<u8>>, ClientError> {
        let url = self.endpoint("blobs", hash.as_str())?;
        let response = self.send(self.with_read_auth(self.http.get(url))).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ClientError::Network(e.to_string()))?;
                let actual = Sha1Hash::from_data(&bytes);
                if &actual != hash {
                    return Err(ClientError::Cas(cas::CasError::HashMismatch {
                        expected: hash.clone(),
                        actual,
                    }));
                }
                Ok(Some(bytes.to_vec()))
            }
            _ => Err(error_for(response).await),
        }
    }

    pub async fn pull_blob(&self, hash: &Sha1Hash) -> Option<Vec<u8>> {
        match self.try_pull_blob(hash).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    remote.collection = %self.config.collection,
                    cas.hash = %hash,
                    error = %e,
                    "remote blob read failed"
                );
                None
            }
        }
    }

    /// Upload a blob unless the server already has it.
    pub async fn push_blob(&self, hash: &Sha1Hash, data: Vec<u8>) -> Result<(), ClientError> {
        let token = self.write_token()?;
        if self.find_blob(hash).await.is_some() {
            debug!(cas.hash = %hash, "remote already has blob");
            return Ok(());
        }

        let url = self.endpoint("blobs", hash.as_str())?;
        let size = data.len();
        let response = self
            .send(self.http.put(url).bearer_auth(token).body(data))
            .await?;
        if !response.status().is_success() {
            return Err(error_for(response).await);
        }
        debug!(cas.hash = %hash, size, "pushed blob");
        Ok(())
    }
}

async fn error_for(response: Response) -> ClientError {
    let status = response.status();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Permission(message),
        _ => ClientError::Remote {
            status: status.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> RemoteConfig {
        RemoteConfig {
            url: url.to_string(),
            collection: "lab".to_string(),
            share: None,
            read_token: None,
            write_token: None,
            timeout_ms: 1000,
        }
    }

    #[test]
    fn test_endpoint_joins_segments() {
        let client = RemoteClient::new(config("http://localhost:8090/")).unwrap();
        let url = client.endpoint("kv", "abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8090/kv/lab/abc");

        let nested = RemoteClient::new(config("http://localhost:8090/share")).unwrap();
        let url = nested.for_collection("other").endpoint("blobs", "abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8090/share/blobs/other/abc");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RemoteClient::new(config("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_readonly_push_fails_fast() {
        // Nothing listens here; the permission check must win before any I/O.
        let client = RemoteClient::new(config("http://127.0.0.1:9")).unwrap();
        let err = client
            .push_op(&Key::from("k"), KvOp::Set { record: None })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Permission(_)));

        let err = client
            .push_blob(&Sha1Hash::from_data(b"x"), b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Permission(_)));
    }

    #[tokio::test]
    async fn test_unreachable_reads_degrade() {
        let client = RemoteClient::new(config("http://127.0.0.1:9")).unwrap();
        let hash = Sha1Hash::from_data(b"x");
        assert!(client.pull_record(&hash).await.is_none());
        assert!(client.pull_blob(&hash).await.is_none());
        assert!(client.find_blob(&hash).await.is_none());
        assert!(matches!(
            client.try_pull_record(&hash).await,
            Err(ClientError::Network(_))
        ));
    }
}
