//! Client for rdir services: resolves the rdir linked to a volume through
//! the directory (with a process-local address cache), then talks to it
//! over HTTP. Every operation flows through [`RdirClient::rdir_request`].

pub mod cache;
pub mod fetch;

use crate::cluster::directory::{Directory, HttpDirectory, filter_rdir_host};
use crate::cluster::{RDIR_ACCOUNT, ServiceType};
use crate::config::Config;
use crate::error::RdirError;
use crate::utils::{REQUEST_ID_HEADER, check_status, request_id};
use cache::AddressCache;
use chrono::{DateTime, Utc};
use log::info;
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};

/// One rdir call: method, action path, and the optional knobs every
/// operation shares.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    action: &'static str,
    create: bool,
    params: Vec<(&'static str, String)>,
    body: Option<Value>,
    service_type: ServiceType,
    reqid: Option<String>,
}

impl RequestSpec {
    pub fn new(method: Method, action: &'static str) -> Self {
        Self {
            method,
            action,
            create: false,
            params: Vec::new(),
            body: None,
            service_type: ServiceType::Rawx,
            reqid: None,
        }
    }

    /// Adds `create=1` to the parameter set.
    pub fn create(mut self) -> Self {
        self.create = true;
        self
    }

    pub fn param(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.params.push((key, value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    /// Overrides the generated request-correlation id.
    pub fn reqid(mut self, reqid: impl Into<String>) -> Self {
        self.reqid = Some(reqid.into());
        self
    }
}

pub struct RdirClient<D: Directory> {
    directory: D,
    http: reqwest::Client,
    cache: AddressCache,
}

impl RdirClient<HttpDirectory> {
    pub fn new(config: &Config) -> Self {
        Self::with_gateway(config, HttpDirectory::new(config), AddressCache::new())
    }
}

impl<D: Directory> RdirClient<D> {
    pub fn with_gateway(config: &Config, directory: D, cache: AddressCache) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            directory,
            http,
            cache,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Resolves the rdir host serving `volume_id`, going through the cache.
    /// The cached entry is advisory: it is dropped on any network-level
    /// failure and the next call performs a fresh directory lookup. The
    /// lookup carries the correlation id of the operation that needed it.
    async fn get_rdir_addr(&self, volume_id: &str, reqid: &str) -> Result<String, RdirError> {
        if let Some(host) = self.cache.get(volume_id) {
            return Ok(host);
        }

        let services = self
            .directory
            .list(RDIR_ACCOUNT, volume_id, "rdir", reqid)
            .await
            .map_err(|err| match err {
                RdirError::Status { status: 404, .. } => {
                    RdirError::NotLinked(volume_id.to_string())
                }
                other => other,
            })?;

        let host = filter_rdir_host(&services)
            .ok_or_else(|| RdirError::NotLinked(volume_id.to_string()))?
            .to_string();
        self.cache.insert(volume_id, &host);
        Ok(host)
    }

    /// Executes one rdir call for `volume_id`. Always attaches
    /// `vol=<volume_id>` and the request-correlation header. On a
    /// network-level failure the cached address is evicted before the error
    /// propagates; application-level statuses are returned unchanged.
    pub async fn rdir_request(
        &self,
        volume_id: &str,
        spec: RequestSpec,
    ) -> Result<(StatusCode, Value), RdirError> {
        match self.rdir_request_inner(volume_id, spec).await {
            Err(err @ RdirError::Network(_)) => {
                self.cache.invalidate(volume_id);
                Err(err)
            }
            other => other,
        }
    }

    async fn rdir_request_inner(
        &self,
        volume_id: &str,
        spec: RequestSpec,
    ) -> Result<(StatusCode, Value), RdirError> {
        let reqid = spec.reqid.unwrap_or_else(request_id);
        let host = self.get_rdir_addr(volume_id, &reqid).await?;
        let url = format!(
            "http://{}/v1/{}/{}",
            host,
            spec.service_type.rdir_prefix(),
            spec.action
        );

        let mut params: Vec<(&str, String)> = spec.params;
        params.push(("vol", volume_id.to_string()));
        if spec.create {
            params.push(("create", "1".to_string()));
        }

        let mut request = self
            .http
            .request(spec.method, &url)
            .query(&params)
            .header(REQUEST_ID_HEADER, reqid);
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        let response = check_status(request.send().await?).await?;
        let status = response.status();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|err| RdirError::Incoherent(format!("invalid rdir answer: {err}")))?
        };

        Ok((status, body))
    }

    /// Creates the rdir database for `volume_id` on the linked rdir.
    pub async fn create(
        &self,
        volume_id: &str,
        service_type: ServiceType,
    ) -> Result<(), RdirError> {
        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::POST, "create").service_type(service_type),
        )
        .await?;
        Ok(())
    }

    /// References a chunk in the reverse directory.
    pub async fn chunk_push(
        &self,
        volume_id: &str,
        container_id: &str,
        content_id: &str,
        chunk_id: &str,
        mtime: Option<i64>,
    ) -> Result<(), RdirError> {
        let mut body = json!({
            "container_id": container_id,
            "content_id": content_id,
            "chunk_id": chunk_id,
        });
        if let Some(mtime) = mtime {
            body["mtime"] = json!(mtime);
        }

        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::POST, "push").create().body(body),
        )
        .await?;
        Ok(())
    }

    /// Unreferences a chunk from the reverse directory.
    pub async fn chunk_delete(
        &self,
        volume_id: &str,
        container_id: &str,
        content_id: &str,
        chunk_id: &str,
    ) -> Result<(), RdirError> {
        let body = json!({
            "container_id": container_id,
            "content_id": content_id,
            "chunk_id": chunk_id,
        });

        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::DELETE, "delete").body(body),
        )
        .await?;
        Ok(())
    }

    pub async fn status(&self, volume_id: &str) -> Result<Value, RdirError> {
        let (_, body) = self
            .rdir_request(volume_id, RequestSpec::new(Method::GET, "status"))
            .await?;
        Ok(body)
    }

    pub async fn admin_incident_set(
        &self,
        volume_id: &str,
        date: DateTime<Utc>,
    ) -> Result<(), RdirError> {
        let body = json!({ "date": date.timestamp() });
        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::POST, "admin/incident").body(body),
        )
        .await?;
        Ok(())
    }

    pub async fn admin_incident_get(
        &self,
        volume_id: &str,
    ) -> Result<Option<DateTime<Utc>>, RdirError> {
        let (_, body) = self
            .rdir_request(volume_id, RequestSpec::new(Method::GET, "admin/incident"))
            .await?;
        let date = body
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        Ok(date)
    }

    pub async fn admin_lock(&self, volume_id: &str, who: &str) -> Result<(), RdirError> {
        let body = json!({ "who": who });
        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::POST, "admin/lock").body(body),
        )
        .await?;
        Ok(())
    }

    pub async fn admin_unlock(&self, volume_id: &str) -> Result<(), RdirError> {
        self.rdir_request(volume_id, RequestSpec::new(Method::POST, "admin/unlock"))
            .await?;
        Ok(())
    }

    pub async fn admin_show(&self, volume_id: &str) -> Result<Value, RdirError> {
        let (_, body) = self
            .rdir_request(volume_id, RequestSpec::new(Method::GET, "admin/show"))
            .await?;
        Ok(body)
    }

    pub async fn admin_clear(
        &self,
        volume_id: &str,
        clear_all: bool,
        before_incident: bool,
        repair: bool,
    ) -> Result<Value, RdirError> {
        let spec = RequestSpec::new(Method::POST, "admin/clear")
            .param("all", if clear_all { "true" } else { "false" })
            .param(
                "before_incident",
                if before_incident { "true" } else { "false" },
            )
            .param("repair", if repair { "true" } else { "false" });
        let (_, body) = self.rdir_request(volume_id, spec).await?;
        Ok(body)
    }

    /// Creates a meta2 rdir database for `volume_id`.
    pub async fn meta2_index_create(&self, volume_id: &str) -> Result<(), RdirError> {
        self.create(volume_id, ServiceType::Meta2).await
    }

    /// Adds a container to the index of the meta2 volume hosting it.
    pub async fn meta2_index_push(
        &self,
        volume_id: &str,
        container_url: &str,
        container_id: &str,
        mtime: i64,
    ) -> Result<(), RdirError> {
        let body = json!({
            "container_id": container_id,
            "container_url": container_url,
            "mtime": mtime,
        });

        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::POST, "push")
                .create()
                .service_type(ServiceType::Meta2)
                .body(body),
        )
        .await?;
        Ok(())
    }

    /// Removes a container record from the meta2 index.
    pub async fn meta2_index_delete(
        &self,
        volume_id: &str,
        container_url: &str,
        container_id: &str,
    ) -> Result<(), RdirError> {
        let body = json!({
            "container_id": container_id,
            "container_url": container_url,
        });

        self.rdir_request(
            volume_id,
            RequestSpec::new(Method::POST, "delete")
                .service_type(ServiceType::Meta2)
                .body(body),
        )
        .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cached_addr(&self, volume_id: &str) -> Option<String> {
        self.cache.get(volume_id)
    }
}

// Keep the two "already linked" translations next to their consumer; the
// directory has no structured idempotent-conflict code, so these message
// prefixes are the only signal a concurrent actor created the same link.
const ALREADY_LINKED_MESSAGES: [&str; 2] = [
    "META1 error: (SQLITE_CONSTRAINT) UNIQUE constraint failed",
    "META1 error: (SQLITE_CONSTRAINT) columns cid, srvtype, seq are not unique",
];

/// True when a directory `force` failure actually means the link already
/// exists (concurrent duplication, an idempotent success).
pub(crate) fn is_already_linked(err: &RdirError) -> bool {
    match err {
        RdirError::Status { status: 455, .. } => true,
        RdirError::Status { message, .. } => {
            let known = ALREADY_LINKED_MESSAGES
                .iter()
                .any(|prefix| message.starts_with(prefix));
            if known {
                info!("ignoring benign directory conflict: {message}");
            }
            known
        }
        _ => false,
    }
}
