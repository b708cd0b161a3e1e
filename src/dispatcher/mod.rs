//! Assignment dispatcher: discovers which rdir serves each volume of a
//! fleet (read path) and links an rdir to every volume lacking one (write
//! path), balancing load across the rdir fleet.

pub mod select;

use crate::client::RdirClient;
use crate::client::cache::AddressCache;
use crate::cluster::conscience::{Conscience, HttpConscience};
use crate::cluster::directory::{Directory, HttpDirectory, filter_rdir_host};
use crate::cluster::{
    Assignment, RDIR_ACCOUNT, ServiceRecord, ServiceType, service_id,
};
use crate::config::Config;
use crate::error::{RdirError, group_batch_errors};
use crate::utils::request_id;
use log::{info, warn};
use std::collections::HashMap;

pub struct RdirDispatcher<D: Directory, C: Conscience> {
    pub(crate) namespace: String,
    pub(crate) conscience: C,
    pub(crate) rdir: RdirClient<D>,
}

impl RdirDispatcher<HttpDirectory, HttpConscience> {
    pub fn new(config: &Config) -> Self {
        Self::with_gateways(
            &config.namespace,
            HttpConscience::new(config),
            RdirClient::with_gateway(config, HttpDirectory::new(config), AddressCache::new()),
        )
    }
}

impl<D, C> RdirDispatcher<D, C>
where
    D: Directory + Send + Sync,
    C: Conscience + Send + Sync,
{
    pub fn with_gateways(namespace: &str, conscience: C, rdir: RdirClient<D>) -> Self {
        Self {
            namespace: namespace.to_string(),
            conscience,
            rdir,
        }
    }

    pub fn rdir(&self) -> &RdirClient<D> {
        &self.rdir
    }

    /// Looks up the rdir linked to `volume_id` in the directory. Answers
    /// `NotLinked` when the reference or the link does not exist.
    async fn linked_rdir_host(&self, volume_id: &str, reqid: &str) -> Result<String, RdirError> {
        let services = self
            .rdir
            .directory()
            .list(RDIR_ACCOUNT, volume_id, "rdir", reqid)
            .await
            .map_err(|err| match err {
                RdirError::Status { status: 404, .. } => {
                    RdirError::NotLinked(volume_id.to_string())
                }
                other => other,
            })?;

        filter_rdir_host(&services)
            .map(str::to_string)
            .ok_or_else(|| RdirError::NotLinked(volume_id.to_string()))
    }

    /// Attaches the rdir at `host` from the known fleet, or synthesizes a
    /// down placeholder when the linked rdir is absent from the conscience
    /// answer, remembering it for the rest of the batch.
    fn attach_known_rdir(
        &self,
        by_id: &mut HashMap<String, ServiceRecord>,
        host: &str,
        service_type: ServiceType,
        volume_id: &str,
    ) -> ServiceRecord {
        let id = service_id(&self.namespace, "rdir", host);
        if let Some(record) = by_id.get(&id) {
            return record.clone();
        }

        warn!(
            "rdir {} linked to {} {} seems down",
            host,
            service_type.as_str(),
            volume_id
        );
        let placeholder = ServiceRecord::down_placeholder(host);
        by_id.insert(id, placeholder.clone());
        placeholder
    }

    fn rdir_fleet_by_id(&self, all_rdir: &[ServiceRecord]) -> HashMap<String, ServiceRecord> {
        all_rdir
            .iter()
            .map(|record| {
                (
                    service_id(&self.namespace, "rdir", &record.addr),
                    record.clone(),
                )
            })
            .collect()
    }

    /// Read path: discovers the rdir linked to every service of
    /// `service_type`. Per-service failures never abort the batch: a
    /// missing link leaves the service unattached, a linked-but-unknown
    /// rdir is attached as a down placeholder, anything else is logged and
    /// skipped.
    ///
    /// Returns every service (with its possible attachment) and the full
    /// rdir fleet.
    pub async fn get_assignments(
        &self,
        service_type: ServiceType,
    ) -> Result<(Vec<Assignment>, Vec<ServiceRecord>), RdirError> {
        let reqid = request_id();
        let all_services = self
            .conscience
            .all_services(service_type.as_str(), false)
            .await?;
        let all_rdir = self.conscience.all_services("rdir", true).await?;
        let mut by_id = self.rdir_fleet_by_id(&all_rdir);

        let mut assignments = Vec::with_capacity(all_services.len());
        for service in all_services {
            let volume_id = service.volume_id().to_string();
            let rdir = match self.linked_rdir_host(&volume_id, &reqid).await {
                Ok(host) => {
                    Some(self.attach_known_rdir(&mut by_id, &host, service_type, &volume_id))
                }
                Err(RdirError::NotLinked(_)) => {
                    info!("no rdir linked to {volume_id}");
                    None
                }
                Err(err) => {
                    warn!("failed to get rdir linked to {volume_id}: {err}");
                    None
                }
            };
            assignments.push(Assignment { service, rdir });
        }

        Ok((assignments, all_rdir))
    }

    /// Write path: links an rdir to every service of `service_type` that
    /// lacks one. Per-service failures are collected; after the batch they
    /// are re-raised once, grouped by error kind, so a single systemic
    /// failure is not reported N times.
    pub async fn assign_services(
        &self,
        service_type: ServiceType,
        max_per_rdir: Option<u64>,
    ) -> Result<Vec<Assignment>, RdirError> {
        let reqid = request_id();
        let all_services = self
            .conscience
            .all_services(service_type.as_str(), false)
            .await?;
        let all_rdir = self.conscience.all_services("rdir", true).await?;
        if all_rdir.is_empty() {
            return Err(RdirError::Unavailable(format!(
                "no rdir service found in {}",
                self.namespace
            )));
        }

        let mut by_id = self.rdir_fleet_by_id(&all_rdir);
        let mut errors: Vec<(String, RdirError)> = Vec::new();

        let mut assignments = Vec::with_capacity(all_services.len());
        for service in all_services {
            let volume_id = service.volume_id().to_string();
            let rdir = match self.linked_rdir_host(&volume_id, &reqid).await {
                Ok(host) => {
                    Some(self.attach_known_rdir(&mut by_id, &host, service_type, &volume_id))
                }
                Err(RdirError::NotLinked(_)) => {
                    match self
                        .smart_link_rdir(&volume_id, &mut by_id, service_type, max_per_rdir, &reqid)
                        .await
                    {
                        Ok(rdir_id) => {
                            // Keep the in-memory census balanced for the
                            // rest of the batch without waiting for the
                            // conscience to refresh.
                            match by_id.get_mut(&rdir_id) {
                                Some(record) => {
                                    record.tags.opened_db_count =
                                        Some(record.opened_db_count() + 1);
                                    Some(record.clone())
                                }
                                None => None,
                            }
                        }
                        Err(err) => {
                            warn!(
                                "failed to link an rdir to {} {}: {}",
                                service_type.as_str(),
                                volume_id,
                                err
                            );
                            errors.push((volume_id, err));
                            None
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        "failed to check rdir linked to {} {} (thus won't try to make \
                         the link): {}",
                        service_type.as_str(),
                        volume_id,
                        err
                    );
                    errors.push((volume_id, err));
                    None
                }
            };
            assignments.push(Assignment { service, rdir });
        }

        match group_batch_errors(errors) {
            Some(err) => Err(err),
            None => Ok(assignments),
        }
    }

    /// Links an rdir to every rawx volume that lacks one.
    pub async fn assign_all_rawx(
        &self,
        max_per_rdir: Option<u64>,
    ) -> Result<Vec<Assignment>, RdirError> {
        self.assign_services(ServiceType::Rawx, max_per_rdir).await
    }

    /// Links an rdir to every meta2 volume that lacks one.
    pub async fn assign_all_meta2(
        &self,
        max_per_rdir: Option<u64>,
    ) -> Result<Vec<Assignment>, RdirError> {
        self.assign_services(ServiceType::Meta2, max_per_rdir).await
    }
}
