//! Network-to-broker ingestion gateway library.
//!
//! Listeners accept bytes over TCP/UDP/HTTP, hand them to a per-listener
//! [`decoder::Decoder`], and the resulting [`decoder::DecodedMessage`]s are
//! routed through [`dispatch::Dispatcher`] to a [`broker::Publisher`].
//! Configuration, sensor/organization/topic state, and partitioner/warning
//! helpers are shared, hot-reloadable building blocks used by all three.

pub mod accounting;
pub mod broker;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod partition;
pub mod registry;
pub mod topic;
pub mod warn_limit;
