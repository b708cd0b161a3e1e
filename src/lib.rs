//! Control-plane client for reverse-directory (rdir) services.
//!
//! Every storage volume of a cluster (a rawx or meta2 instance) is linked
//! to exactly one rdir service holding the reverse index of the chunks or
//! containers it hosts. This crate discovers those links, assigns missing
//! ones under load-balancing constraints, and talks to the resolved rdir
//! over HTTP with address caching, retries, and cursor-based pagination.
//!
//! The two entry points are [`RdirDispatcher`] (fleet-wide discovery and
//! assignment) and [`RdirClient`] (per-volume rdir operations). Both reach
//! the cluster through the [`cluster::directory::Directory`] and
//! [`cluster::conscience::Conscience`] gateway traits, with HTTP
//! implementations provided for a real cluster proxy.

pub mod client;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use client::cache::AddressCache;
pub use client::fetch::{ChunkFetchOptions, ChunkRecord, Meta2Page, Meta2Record};
pub use client::{RdirClient, RequestSpec};
pub use cluster::{Assignment, ServiceRecord, ServiceTags, ServiceType};
pub use config::{Config, ConfigError};
pub use dispatcher::RdirDispatcher;
pub use error::{ErrorGroup, RdirError};
