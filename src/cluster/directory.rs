//! Service directory gateway: maps `(account, reference, service_type)` to
//! linked service records. Consumed through the [`Directory`] trait so the
//! dispatcher and client can be tested against an in-memory double.

use crate::config::Config;
use crate::error::RdirError;
use crate::utils::{REQUEST_ID_HEADER, check_status};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// One entry of a directory `list` answer.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkedService {
    #[serde(rename = "type")]
    pub service_type: String,
    pub host: String,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub args: String,
}

/// The record written by a directory `force`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceLink {
    pub host: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub seq: u64,
    pub args: String,
    pub id: String,
}

impl ServiceLink {
    pub fn rdir(host: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service_type: "rdir".to_string(),
            seq: 1,
            args: String::new(),
            id: id.into(),
        }
    }
}

/// First rdir entry of a directory answer, if any.
pub(crate) fn filter_rdir_host(services: &[LinkedService]) -> Option<&str> {
    services
        .iter()
        .find(|service| service.service_type == "rdir")
        .map(|service| service.host.as_str())
}

pub trait Directory {
    /// Lists the services of `service_type` linked to `reference` under
    /// `account`. A reference with no such link answers status 404. `reqid`
    /// is the caller's correlation id, so the lookup traces under the same
    /// id as the operation embedding it.
    fn list(
        &self,
        account: &str,
        reference: &str,
        service_type: &str,
        reqid: &str,
    ) -> impl Future<Output = Result<Vec<LinkedService>, RdirError>> + Send;

    /// Creates or replaces the link, optionally auto-creating the
    /// reference. The write is atomic on the directory side.
    fn force(
        &self,
        account: &str,
        reference: &str,
        service_type: &str,
        link: &ServiceLink,
        autocreate: bool,
        reqid: &str,
    ) -> impl Future<Output = Result<(), RdirError>> + Send;
}

impl<T: Directory + Send + Sync> Directory for std::sync::Arc<T> {
    async fn list(
        &self,
        account: &str,
        reference: &str,
        service_type: &str,
        reqid: &str,
    ) -> Result<Vec<LinkedService>, RdirError> {
        (**self).list(account, reference, service_type, reqid).await
    }

    async fn force(
        &self,
        account: &str,
        reference: &str,
        service_type: &str,
        link: &ServiceLink,
        autocreate: bool,
        reqid: &str,
    ) -> Result<(), RdirError> {
        (**self)
            .force(account, reference, service_type, link, autocreate, reqid)
            .await
    }
}

/// Directory gateway backed by the cluster proxy REST API.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ReferenceShow {
    #[serde(default)]
    srv: Vec<LinkedService>,
}

impl HttpDirectory {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            endpoint: format!("http://{}/v1/{}/reference", config.proxy, config.namespace),
        }
    }
}

impl Directory for HttpDirectory {
    async fn list(
        &self,
        account: &str,
        reference: &str,
        service_type: &str,
        reqid: &str,
    ) -> Result<Vec<LinkedService>, RdirError> {
        let url = format!("{}/show", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[("acct", account), ("ref", reference), ("type", service_type)])
            .header(REQUEST_ID_HEADER, reqid)
            .send()
            .await?;

        let body: ReferenceShow = check_status(response).await?.json().await?;
        Ok(body.srv)
    }

    async fn force(
        &self,
        account: &str,
        reference: &str,
        service_type: &str,
        link: &ServiceLink,
        autocreate: bool,
        reqid: &str,
    ) -> Result<(), RdirError> {
        let url = format!("{}/force", self.endpoint);
        let mut query = vec![
            ("acct", account),
            ("ref", reference),
            ("type", service_type),
        ];
        if autocreate {
            query.push(("autocreate", "1"));
        }

        let response = self
            .client
            .post(&url)
            .query(&query)
            .header(REQUEST_ID_HEADER, reqid)
            .json(link)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}
