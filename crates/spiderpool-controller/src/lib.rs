//! Spiderpool Controller - the cluster-singleton side of the IPAM system.
//!
//! This crate provides:
//! - Admission validation webhooks for SpiderIPPool and SpiderSubnet
//! - Lease-based leader election gating all singleton work
//! - The IP garbage collector reclaiming addresses stranded by missed
//!   release calls or lost pods

pub mod gc;
pub mod leader;
pub mod tls;
pub mod webhook;

pub use gc::{GcConfig, IpGc};
pub use leader::{LeaderConfig, LeaderElector};
pub use tls::{resolve_tls, TlsMaterial, TlsMode};
pub use webhook::{WebhookConfig, WebhookServer, WebhookState};
