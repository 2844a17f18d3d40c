//! onionhost: host static websites as Tor hidden services.
//!
//! The crate orchestrates a local publishing pipeline: nginx serves a
//! content directory on a loopback port and a Tor hidden service forwards
//! onion connections to it. The pieces:
//!
//! - [`platform`]: capability queries (install/service commands, paths,
//!   privilege state) behind a trait, with host and mock implementations
//! - [`command`]: privileged shell execution with a shared, in-memory
//!   elevation credential
//! - [`siteconf`]: nginx vhost and Tor stanza synthesis and idempotent
//!   application
//! - [`bootstrap`]: launching the daemon and narrowing its unstructured
//!   progress stream to a monotonic callback plus a completion event
//! - [`watcher`]: mirroring content-directory changes into the served root
//! - [`config`]: persisted settings and lifecycle history
//! - [`service`]: the lifecycle orchestrator tying it all together

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod service;
pub mod siteconf;
pub mod watcher;

pub use command::{ElevationCredential, PrivilegedRunner};
pub use error::{ServiceError, ServiceResult};
pub use service::{OnionService, ServiceStatus, StartOutcome};
