//! Cursor-based listing of rdir contents: a lazy stream over the chunks of
//! a rawx volume, and single-page plus depaginated fetches of a meta2
//! container index.
//!
//! The cursor never leaves the request parameters, so two concurrent
//! fetches over the same volume do not interfere. Retries are scoped to a
//! single page, never to the whole sequence; already-yielded records are
//! not re-delivered.

use crate::client::{RdirClient, RequestSpec};
use crate::cluster::{ServiceType, directory::Directory};
use crate::error::RdirError;
use futures::stream::{self, Stream, TryStreamExt};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::time::Duration;

/// Pages a fetch may retry on network-level failure before giving up.
const FETCH_ATTEMPTS: u32 = 3;

/// One chunk referenced by a volume's reverse index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub container_id: String,
    pub content_id: String,
    pub chunk_id: String,
    pub payload: Value,
}

/// One container handled by a meta2 volume.
#[derive(Debug, Clone, Deserialize)]
pub struct Meta2Record {
    pub container_url: String,
    pub container_id: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct Meta2Page {
    #[serde(default)]
    pub records: Vec<Meta2Record>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkFetchOptions {
    pub limit: usize,
    pub rebuild: bool,
    /// Restrict the listing to chunks of one container.
    pub container_id: Option<String>,
}

impl Default for ChunkFetchOptions {
    fn default() -> Self {
        Self {
            limit: 100,
            rebuild: false,
            container_id: None,
        }
    }
}

fn parse_chunk_record(key: &str, payload: Value) -> Result<ChunkRecord, RdirError> {
    let mut parts = key.split('|');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(container), Some(content), Some(chunk), None) => Ok(ChunkRecord {
            container_id: container.to_string(),
            content_id: content.to_string(),
            chunk_id: chunk.to_string(),
            payload,
        }),
        _ => Err(RdirError::Incoherent(format!("malformed chunk key: {key}"))),
    }
}

impl<D: Directory> RdirClient<D> {
    /// Issues `spec`, retrying on network-level failure only, with a
    /// monotonically increasing linear backoff starting at 0 seconds.
    /// Application errors abort immediately.
    async fn request_with_retry(
        &self,
        volume_id: &str,
        spec: RequestSpec,
    ) -> Result<Value, RdirError> {
        let mut attempt = 0;
        loop {
            match self.rdir_request(volume_id, spec.clone()).await {
                Ok((_, body)) => return Ok(body),
                Err(RdirError::Network(_)) if attempt + 1 < FETCH_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Lazy sequence of the chunks indexed for `volume_id`, one page at a
    /// time. Every invocation starts a fresh cursor; the sequence ends when
    /// the rdir answers an empty page.
    pub fn chunk_fetch(
        &self,
        volume_id: &str,
        options: ChunkFetchOptions,
    ) -> impl Stream<Item = Result<ChunkRecord, RdirError>> + '_ {
        let volume_id = volume_id.to_string();
        let mut request_body = Map::new();
        request_body.insert("limit".to_string(), json!(options.limit));
        if options.rebuild {
            request_body.insert("rebuild".to_string(), json!(true));
        }
        if let Some(container_id) = options.container_id {
            request_body.insert("container_id".to_string(), json!(container_id));
        }

        stream::try_unfold(request_body, move |mut request_body| {
            let volume_id = volume_id.clone();
            async move {
                let spec = RequestSpec::new(Method::POST, "fetch")
                    .body(Value::Object(request_body.clone()));
                let body = self.request_with_retry(&volume_id, spec).await?;

                let page: Vec<(String, Value)> = serde_json::from_value(body)
                    .map_err(|err| RdirError::Incoherent(format!("invalid fetch page: {err}")))?;
                if page.is_empty() {
                    return Ok::<_, RdirError>(None);
                }

                let mut records = Vec::with_capacity(page.len());
                let mut last_key = String::new();
                for (key, payload) in page {
                    records.push(parse_chunk_record(&key, payload)?);
                    last_key = key;
                }
                request_body.insert("start_after".to_string(), json!(last_key));

                Ok(Some((
                    stream::iter(records.into_iter().map(Ok::<ChunkRecord, RdirError>)),
                    request_body,
                )))
            }
        })
        .try_flatten()
    }

    /// One page of the meta2 container index of `volume_id`, bounded by
    /// `marker` and capped at `limit` records (4096 when unspecified).
    pub async fn meta2_index_fetch(
        &self,
        volume_id: &str,
        prefix: Option<&str>,
        marker: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Meta2Page, RdirError> {
        let mut params = Map::new();
        params.insert("limit".to_string(), json!(limit.unwrap_or(4096)));
        if let Some(marker) = marker {
            params.insert("marker".to_string(), json!(marker));
        }
        if let Some(prefix) = prefix {
            params.insert("prefix".to_string(), json!(prefix));
        }

        let spec = RequestSpec::new(Method::POST, "fetch")
            .service_type(ServiceType::Meta2)
            .body(Value::Object(params));
        let body = self.request_with_retry(volume_id, spec).await?;

        serde_json::from_value(body)
            .map_err(|err| RdirError::Incoherent(format!("invalid meta2 fetch page: {err}")))
    }

    /// Every record of a meta2 index, depaginating on the last record's
    /// container url until the answer is no longer truncated.
    ///
    /// The whole index is accumulated in memory; meant for bulk checks and
    /// tests, not for production-scale volumes.
    pub async fn meta2_index_fetch_all(
        &self,
        volume_id: &str,
    ) -> Result<Vec<Meta2Record>, RdirError> {
        let mut all_records = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .meta2_index_fetch(volume_id, None, marker.as_deref(), None)
                .await?;
            if !page.truncated {
                all_records.extend(page.records);
                return Ok(all_records);
            }

            // The marker must come from the page just fetched: a truncated
            // page with no records would otherwise re-issue the same
            // request forever.
            marker = match page.records.last() {
                Some(record) => Some(record.container_url.clone()),
                None => {
                    return Err(RdirError::Incoherent(
                        "truncated meta2 page with no records".to_string(),
                    ));
                }
            };
            all_records.extend(page.records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::cache::AddressCache;
    use crate::config::Config;
    use crate::testing::MockDirectory;
    use futures::StreamExt;
    use httpmock::prelude::*;

    fn client_for(server: &MockServer, volume: &str) -> RdirClient<MockDirectory> {
        let config = Config::new("OPENIO", "127.0.0.1:1");
        let directory = MockDirectory::with_link(volume, &server.address().to_string());
        RdirClient::with_gateway(&config, directory, AddressCache::new())
    }

    #[tokio::test]
    async fn test_chunk_fetch_terminates_on_empty_page() {
        let server = MockServer::start();
        // Three pages: 2 records, 2 records, then empty. The cursor lives in
        // the request body, so each page is matched by its exact body.
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/fetch")
                .body(r#"{"limit":100}"#);
            then.status(200).json_body(serde_json::json!([
                ["C1|content1|chunk1", {"mtime": 1}],
                ["C1|content1|chunk2", {"mtime": 2}],
            ]));
        });
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/fetch")
                .body(r#"{"limit":100,"start_after":"C1|content1|chunk2"}"#);
            then.status(200).json_body(serde_json::json!([
                ["C2|content2|chunk3", {"mtime": 3}],
                ["C2|content2|chunk4", {"mtime": 4}],
            ]));
        });
        let third = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/fetch")
                .body(r#"{"limit":100,"start_after":"C2|content2|chunk4"}"#);
            then.status(200).json_body(serde_json::json!([]));
        });

        let client = client_for(&server, "rawx-1");
        let records: Vec<ChunkRecord> = client
            .chunk_fetch("rawx-1", ChunkFetchOptions::default())
            .map(|record| record.unwrap())
            .collect()
            .await;

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].container_id, "C1");
        assert_eq!(records[0].chunk_id, "chunk1");
        assert_eq!(records[3].container_id, "C2");
        assert_eq!(records[3].chunk_id, "chunk4");
        first.assert();
        second.assert();
        third.assert();
    }

    #[tokio::test]
    async fn test_chunk_fetch_aborts_on_application_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/rdir/fetch");
            then.status(500).body("corrupted database");
        });

        let client = client_for(&server, "rawx-1");
        let mut fetch = std::pin::pin!(client.chunk_fetch("rawx-1", ChunkFetchOptions::default()));

        let err = fetch.next().await.unwrap().unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(fetch.next().await.is_none());
        // No retry for application-level errors
        mock.assert();
    }

    #[tokio::test]
    async fn test_chunk_fetch_rejects_malformed_key() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/rdir/fetch");
            then.status(200)
                .json_body(serde_json::json!([["only-two|parts", {}]]));
        });

        let client = client_for(&server, "rawx-1");
        let mut fetch = std::pin::pin!(client.chunk_fetch("rawx-1", ChunkFetchOptions::default()));

        let err = fetch.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RdirError::Incoherent(_)));
    }

    #[tokio::test]
    async fn test_meta2_index_fetch_all_depaginates() -> anyhow::Result<()> {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/meta2/fetch")
                .body(r#"{"limit":4096}"#);
            then.status(200).json_body(serde_json::json!({
                "records": [
                    {"container_url": "NS/acct/ct1", "container_id": "CID1", "mtime": 10},
                    {"container_url": "NS/acct/ct2", "container_id": "CID2", "mtime": 20},
                ],
                "truncated": true
            }));
        });
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/meta2/fetch")
                .body(r#"{"limit":4096,"marker":"NS/acct/ct2"}"#);
            then.status(200).json_body(serde_json::json!({
                "records": [
                    {"container_url": "NS/acct/ct3", "container_id": "CID3", "mtime": 30},
                ],
                "truncated": false
            }));
        });

        let client = client_for(&server, "meta2-1");
        let records = client.meta2_index_fetch_all("meta2-1").await?;

        assert_eq!(records.len(), 3);
        assert_eq!(records[2].container_url, "NS/acct/ct3");
        first.assert();
        second.assert();
        Ok(())
    }

    #[tokio::test]
    async fn test_meta2_truncated_empty_page_aborts() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/meta2/fetch")
                .body(r#"{"limit":4096}"#);
            then.status(200).json_body(serde_json::json!({
                "records": [
                    {"container_url": "NS/acct/ct1", "container_id": "CID1"},
                ],
                "truncated": true
            }));
        });
        // A broken rdir keeps claiming truncation but hands back nothing;
        // the depagination must fail instead of re-asking indefinitely.
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/meta2/fetch")
                .body(r#"{"limit":4096,"marker":"NS/acct/ct1"}"#);
            then.status(200)
                .json_body(serde_json::json!({"records": [], "truncated": true}));
        });

        let client = client_for(&server, "meta2-1");
        let err = client.meta2_index_fetch_all("meta2-1").await.unwrap_err();

        assert!(matches!(err, RdirError::Incoherent(_)));
        first.assert();
        second.assert();
    }

    #[tokio::test]
    async fn test_meta2_index_fetch_single_page() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/rdir/meta2/fetch")
                .body(r#"{"limit":2,"prefix":"NS/acct"}"#);
            then.status(200).json_body(serde_json::json!({
                "records": [
                    {"container_url": "NS/acct/ct1", "container_id": "CID1"},
                ],
                "truncated": false
            }));
        });

        let client = client_for(&server, "meta2-1");
        let page = client
            .meta2_index_fetch("meta2-1", Some("NS/acct"), None, Some(2))
            .await
            .unwrap();

        assert_eq!(page.records.len(), 1);
        assert!(!page.truncated);
        assert_eq!(page.records[0].mtime, 0);
        mock.assert();
    }

    #[test]
    fn test_parse_chunk_record() {
        let record =
            parse_chunk_record("container|content|chunk", serde_json::json!({"mtime": 5}))
                .unwrap();
        assert_eq!(record.container_id, "container");
        assert_eq!(record.content_id, "content");
        assert_eq!(record.chunk_id, "chunk");

        assert!(parse_chunk_record("a|b", Value::Null).is_err());
        assert!(parse_chunk_record("a|b|c|d", Value::Null).is_err());
    }
}
