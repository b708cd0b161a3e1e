//! Cluster membership ("conscience") gateway: service discovery with scores
//! and tags, plus access to named load-balancing pools.

use crate::cluster::ServiceRecord;
use crate::config::Config;
use crate::error::RdirError;
use crate::utils::{REQUEST_ID_HEADER, check_status, request_id};
use serde::Deserialize;
use std::future::Future;

/// One candidate returned by a pool poll. The id embeds the service type
/// (`{ns}|{type}|{addr}`), which is how callers tell candidates apart.
#[derive(Debug, Clone, Deserialize)]
pub struct PolledService {
    pub id: String,
    pub addr: String,
}

pub trait Conscience {
    /// All known services of `service_type`; `include_down` keeps services
    /// with a non-positive score.
    fn all_services(
        &self,
        service_type: &str,
        include_down: bool,
    ) -> impl Future<Output = Result<Vec<ServiceRecord>, RdirError>> + Send;

    /// Polls a named pool for candidates, avoiding `avoid` and treating
    /// `known` as already assigned. Answers status 400 when the pool does
    /// not exist and status 481 when the constraints are infeasible.
    fn poll(
        &self,
        pool: &str,
        avoid: &[String],
        known: &[String],
    ) -> impl Future<Output = Result<Vec<PolledService>, RdirError>> + Send;

    /// Creates a pool from `(weight, target-class)` pairs.
    fn create_pool(
        &self,
        pool: &str,
        targets: &[(u32, &str)],
    ) -> impl Future<Output = Result<(), RdirError>> + Send;
}

impl<T: Conscience + Send + Sync> Conscience for std::sync::Arc<T> {
    async fn all_services(
        &self,
        service_type: &str,
        include_down: bool,
    ) -> Result<Vec<ServiceRecord>, RdirError> {
        (**self).all_services(service_type, include_down).await
    }

    async fn poll(
        &self,
        pool: &str,
        avoid: &[String],
        known: &[String],
    ) -> Result<Vec<PolledService>, RdirError> {
        (**self).poll(pool, avoid, known).await
    }

    async fn create_pool(&self, pool: &str, targets: &[(u32, &str)]) -> Result<(), RdirError> {
        (**self).create_pool(pool, targets).await
    }
}

/// Conscience gateway backed by the cluster proxy REST API.
#[derive(Debug, Clone)]
pub struct HttpConscience {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpConscience {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            endpoint: format!("http://{}/v1/{}", config.proxy, config.namespace),
        }
    }
}

impl Conscience for HttpConscience {
    async fn all_services(
        &self,
        service_type: &str,
        include_down: bool,
    ) -> Result<Vec<ServiceRecord>, RdirError> {
        let url = format!("{}/conscience/list", self.endpoint);
        let mut query = vec![("type", service_type)];
        if include_down {
            query.push(("full", "1"));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .header(REQUEST_ID_HEADER, request_id())
            .send()
            .await?;

        let services: Vec<ServiceRecord> = check_status(response).await?.json().await?;
        Ok(services)
    }

    async fn poll(
        &self,
        pool: &str,
        avoid: &[String],
        known: &[String],
    ) -> Result<Vec<PolledService>, RdirError> {
        let url = format!("{}/lb/poll", self.endpoint);
        let body = serde_json::json!({
            "avoid": avoid,
            "known": known,
        });

        let response = self
            .client
            .post(&url)
            .query(&[("pool", pool)])
            .header(REQUEST_ID_HEADER, request_id())
            .json(&body)
            .send()
            .await?;

        let candidates: Vec<PolledService> = check_status(response).await?.json().await?;
        Ok(candidates)
    }

    async fn create_pool(&self, pool: &str, targets: &[(u32, &str)]) -> Result<(), RdirError> {
        let url = format!("{}/lb/create_pool", self.endpoint);
        let targets: Vec<serde_json::Value> = targets
            .iter()
            .map(|(weight, class)| serde_json::json!([weight, class]))
            .collect();

        let response = self
            .client
            .post(&url)
            .query(&[("pool", pool)])
            .header(REQUEST_ID_HEADER, request_id())
            .json(&targets)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}
