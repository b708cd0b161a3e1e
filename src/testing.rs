//! In-memory gateway doubles used across the test suite.

use crate::cluster::conscience::{Conscience, PolledService};
use crate::cluster::directory::{Directory, LinkedService, ServiceLink};
use crate::cluster::{ServiceRecord, service_id};
use crate::error::RdirError;
use std::collections::HashMap;
use std::sync::Mutex;

fn status_error(status: u16, message: &str) -> RdirError {
    RdirError::Status {
        status,
        message: message.to_string(),
    }
}

/// Directory double: serves `list` from an in-memory link table, records
/// call counts, and fails `force` on demand.
#[derive(Default)]
pub(crate) struct MockDirectory {
    links: Mutex<HashMap<String, String>>,
    list_calls: Mutex<u32>,
    force_calls: Mutex<u32>,
    reqids: Mutex<Vec<String>>,
    force_error: Mutex<Option<(u16, String)>>,
    force_error_once: Mutex<Option<(u16, String)>>,
    list_errors: Mutex<HashMap<String, (u16, String)>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_link(volume_id: &str, host: &str) -> Self {
        let directory = Self::default();
        directory.link(volume_id, host);
        directory
    }

    pub fn link(&self, volume_id: &str, host: &str) {
        self.links
            .lock()
            .unwrap()
            .insert(volume_id.to_string(), host.to_string());
    }

    pub fn linked_host(&self, volume_id: &str) -> Option<String> {
        self.links.lock().unwrap().get(volume_id).cloned()
    }

    /// Every `force` answers this status until cleared.
    pub fn fail_force(&self, status: u16, message: &str) {
        *self.force_error.lock().unwrap() = Some((status, message.to_string()));
    }

    /// Only the next `force` fails; later ones succeed.
    pub fn fail_force_once(&self, status: u16, message: &str) {
        *self.force_error_once.lock().unwrap() = Some((status, message.to_string()));
    }

    /// `list` for this reference answers this status instead of the table.
    pub fn fail_list(&self, volume_id: &str, status: u16, message: &str) {
        self.list_errors
            .lock()
            .unwrap()
            .insert(volume_id.to_string(), (status, message.to_string()));
    }

    pub fn list_count(&self) -> u32 {
        *self.list_calls.lock().unwrap()
    }

    pub fn force_count(&self) -> u32 {
        *self.force_calls.lock().unwrap()
    }

    /// Correlation ids seen by `list` and `force`, in call order.
    pub fn recorded_reqids(&self) -> Vec<String> {
        self.reqids.lock().unwrap().clone()
    }
}

impl Directory for MockDirectory {
    async fn list(
        &self,
        _account: &str,
        reference: &str,
        _service_type: &str,
        reqid: &str,
    ) -> Result<Vec<LinkedService>, RdirError> {
        *self.list_calls.lock().unwrap() += 1;
        self.reqids.lock().unwrap().push(reqid.to_string());

        if let Some((status, message)) = self.list_errors.lock().unwrap().get(reference) {
            return Err(status_error(*status, message));
        }

        match self.links.lock().unwrap().get(reference) {
            Some(host) => Ok(vec![LinkedService {
                service_type: "rdir".to_string(),
                host: host.clone(),
                seq: 1,
                args: String::new(),
            }]),
            None => Err(status_error(404, "no such reference")),
        }
    }

    async fn force(
        &self,
        _account: &str,
        reference: &str,
        _service_type: &str,
        link: &ServiceLink,
        _autocreate: bool,
        reqid: &str,
    ) -> Result<(), RdirError> {
        *self.force_calls.lock().unwrap() += 1;
        self.reqids.lock().unwrap().push(reqid.to_string());

        if let Some((status, message)) = self.force_error_once.lock().unwrap().take() {
            return Err(status_error(status, &message));
        }
        if let Some((status, message)) = self.force_error.lock().unwrap().clone() {
            return Err(status_error(status, &message));
        }

        self.link(reference, &link.host);
        Ok(())
    }
}

/// Conscience double: fixed service lists per type, recorded polls, and
/// switchable pool behaviors.
pub(crate) struct MockConscience {
    namespace: String,
    services: Mutex<HashMap<String, Vec<ServiceRecord>>>,
    polls: Mutex<Vec<(Vec<String>, Vec<String>)>>,
    pool_exists: Mutex<bool>,
    created_pools: Mutex<Vec<String>>,
    reject_avoid: Mutex<bool>,
    candidates_override: Mutex<Option<Vec<PolledService>>>,
}

impl MockConscience {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            services: Mutex::new(HashMap::new()),
            polls: Mutex::new(Vec::new()),
            pool_exists: Mutex::new(true),
            created_pools: Mutex::new(Vec::new()),
            reject_avoid: Mutex::new(false),
            candidates_override: Mutex::new(None),
        }
    }

    pub fn add_service(&self, service_type: &str, record: ServiceRecord) {
        self.services
            .lock()
            .unwrap()
            .entry(service_type.to_string())
            .or_default()
            .push(record);
    }

    /// The pool does not exist until `create_pool` is called.
    pub fn without_pool(&self) {
        *self.pool_exists.lock().unwrap() = false;
    }

    /// Polls with a non-empty avoid-set answer status 481.
    pub fn reject_avoided_polls(&self) {
        *self.reject_avoid.lock().unwrap() = true;
    }

    /// Forces the candidate list of every poll.
    pub fn answer_polls_with(&self, candidates: Vec<PolledService>) {
        *self.candidates_override.lock().unwrap() = Some(candidates);
    }

    pub fn recorded_polls(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.polls.lock().unwrap().clone()
    }

    pub fn created_pools(&self) -> Vec<String> {
        self.created_pools.lock().unwrap().clone()
    }
}

impl Conscience for MockConscience {
    async fn all_services(
        &self,
        service_type: &str,
        include_down: bool,
    ) -> Result<Vec<ServiceRecord>, RdirError> {
        let services = self.services.lock().unwrap();
        let records = services.get(service_type).cloned().unwrap_or_default();
        Ok(records
            .into_iter()
            .filter(|record| include_down || record.is_up())
            .collect())
    }

    async fn poll(
        &self,
        _pool: &str,
        avoid: &[String],
        known: &[String],
    ) -> Result<Vec<PolledService>, RdirError> {
        self.polls
            .lock()
            .unwrap()
            .push((avoid.to_vec(), known.to_vec()));

        if !*self.pool_exists.lock().unwrap() {
            return Err(status_error(400, "no such pool"));
        }
        if *self.reject_avoid.lock().unwrap() && !avoid.is_empty() {
            return Err(status_error(481, "no candidate matching the request"));
        }
        if let Some(candidates) = self.candidates_override.lock().unwrap().clone() {
            return Ok(candidates);
        }

        let services = self.services.lock().unwrap();
        let candidates: Vec<PolledService> = services
            .get("rdir")
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.is_up())
                    .map(|record| PolledService {
                        id: service_id(&self.namespace, "rdir", &record.addr),
                        addr: record.addr.clone(),
                    })
                    .filter(|candidate| !avoid.contains(&candidate.id))
                    .collect()
            })
            .unwrap_or_default();

        if candidates.is_empty() {
            return Err(status_error(481, "no candidate matching the request"));
        }
        Ok(candidates)
    }

    async fn create_pool(&self, pool: &str, _targets: &[(u32, &str)]) -> Result<(), RdirError> {
        self.created_pools.lock().unwrap().push(pool.to_string());
        *self.pool_exists.lock().unwrap() = true;
        Ok(())
    }
}
