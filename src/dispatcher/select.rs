//! Load-aware selection of an rdir for one volume, and the idempotent
//! directory write that materializes the link.

use crate::client::{RequestSpec, is_already_linked};
use crate::cluster::conscience::{Conscience, PolledService};
use crate::cluster::directory::{Directory, ServiceLink};
use crate::cluster::{RDIR_ACCOUNT, ServiceRecord, ServiceType, service_id};
use crate::dispatcher::RdirDispatcher;
use crate::error::RdirError;
use log::warn;
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;

/// Pool polled for rdir candidates, created lazily on first use.
pub const RDIR_POOL: &str = "__rawx_rdir";

/// Special pool target matching any service from the "known" list.
pub const JOKER_SVC_TARGET: &str = "__any_slot";

const RDIR_POOL_TARGETS: [(u32, &str); 2] = [(1, JOKER_SVC_TARGET), (1, "rdir")];

/// Times a directory `force` is attempted before surfacing the last error.
const LINK_ATTEMPTS: u32 = 7;

/// Transient directory statuses: request timeout, stale resource, service
/// unavailable, gateway timeout.
const RETRIABLE_LINK_STATUSES: [u16; 4] = [406, 450, 503, 504];

/// Distinguished conscience status for an infeasible poll (the avoid-set
/// left no candidate).
const STATUS_NO_CANDIDATE: u16 = 481;

/// Distinguished conscience status for an undefined pool.
const STATUS_UNKNOWN_POOL: u16 = 400;

/// Service ids of the healthy rdirs loaded strictly above the threshold:
/// the fleet's mean load, or `cap - 1` when an explicit cap is given.
/// `Unavailable` when no healthy rdir exists.
pub(crate) fn overloaded_rdirs(
    by_id: &HashMap<String, ServiceRecord>,
    max_per_rdir: Option<u64>,
) -> Result<Vec<String>, RdirError> {
    let loads: Vec<u64> = by_id
        .values()
        .filter(|record| record.is_up())
        .map(ServiceRecord::opened_db_count)
        .collect();
    if loads.is_empty() {
        return Err(RdirError::Unavailable(
            "no valid rdir service found".to_string(),
        ));
    }

    let upper_limit = match max_per_rdir {
        Some(cap) => cap as f64 - 1.0,
        None => loads.iter().sum::<u64>() as f64 / loads.len() as f64,
    };

    Ok(by_id
        .iter()
        .filter(|(_, record)| record.is_up() && record.opened_db_count() as f64 > upper_limit)
        .map(|(id, _)| id.clone())
        .collect())
}

fn is_retriable_link_error(err: &RdirError) -> bool {
    match err {
        RdirError::Network(_) => true,
        RdirError::Status { status, .. } => RETRIABLE_LINK_STATUSES.contains(status),
        _ => false,
    }
}

impl<D, C> RdirDispatcher<D, C>
where
    D: Directory + Send + Sync,
    C: Conscience + Send + Sync,
{
    /// Selects an rdir for `volume_id` while steering the balancer away
    /// from rdirs hosting more databases than the threshold, then forces
    /// the link into the directory. Returns the chosen rdir's service id.
    pub(crate) async fn smart_link_rdir(
        &self,
        volume_id: &str,
        by_id: &mut HashMap<String, ServiceRecord>,
        service_type: ServiceType,
        max_per_rdir: Option<u64>,
        reqid: &str,
    ) -> Result<String, RdirError> {
        let avoid = overloaded_rdirs(by_id, max_per_rdir)?;
        let known = vec![service_id(
            &self.namespace,
            service_type.as_str(),
            volume_id,
        )];

        let polled = match self.poll_rdir(&avoid, &known).await {
            // Without an explicit cap the avoid-set is advisory: retry
            // unconstrained and let a later pass rebalance. A cap is a hard
            // constraint the caller opted into.
            Err(err)
                if err.status() == Some(STATUS_NO_CANDIDATE) && max_per_rdir.is_none() =>
            {
                self.poll_rdir(&[], &known).await?
            }
            other => other?,
        };

        let link = ServiceLink::rdir(&polled.addr, &polled.id);
        self.force_link(volume_id, &link, reqid).await?;

        // Best effort: the link exists even if the rdir database lags
        // behind, and can be created later.
        let create = RequestSpec::new(Method::POST, "create")
            .service_type(service_type)
            .reqid(reqid);
        if let Err(err) = self.rdir.rdir_request(volume_id, create).await {
            warn!(
                "failed to create database for {} on {}: {}",
                volume_id, polled.addr, err
            );
        }

        Ok(polled.id)
    }

    /// Polls the rdir pool, creating it first when the conscience does not
    /// know it yet, and keeps the first rdir candidate.
    pub(crate) async fn poll_rdir(
        &self,
        avoid: &[String],
        known: &[String],
    ) -> Result<PolledService, RdirError> {
        let candidates = match self.conscience.poll(RDIR_POOL, avoid, known).await {
            Err(err) if err.status() == Some(STATUS_UNKNOWN_POOL) => {
                self.conscience
                    .create_pool(RDIR_POOL, &RDIR_POOL_TARGETS)
                    .await?;
                self.conscience.poll(RDIR_POOL, avoid, known).await?
            }
            other => other?,
        };

        candidates
            .into_iter()
            .find(|candidate| candidate.id.contains("rdir"))
            .ok_or_else(|| {
                RdirError::Incoherent("load balancer answered with no rdir candidate".to_string())
            })
    }

    /// Writes the link, retrying transient failures with linear backoff and
    /// treating a concurrent identical link as success.
    async fn force_link(
        &self,
        volume_id: &str,
        link: &ServiceLink,
        reqid: &str,
    ) -> Result<(), RdirError> {
        let mut attempt = 0;
        loop {
            match self
                .rdir
                .directory()
                .force(RDIR_ACCOUNT, volume_id, "rdir", link, true, reqid)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if is_already_linked(&err) => return Ok(()),
                Err(err) => {
                    if !is_retriable_link_error(&err) || attempt + 1 >= LINK_ATTEMPTS {
                        return Err(err);
                    }
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    attempt += 1;
                }
            }
        }
    }
}
