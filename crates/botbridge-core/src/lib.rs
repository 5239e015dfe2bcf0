mod config;
mod connection;
mod correlator;
mod error;
mod idempotency;
mod registry;
mod router;
mod server;
mod upstream;

pub use config::GatewayConfig;
pub use correlator::ReplyCorrelator;
pub use error::GatewayError;
pub use idempotency::{CacheOutcome, IdempotencyCache, StoredResponse};
pub use registry::{ConnHandle, Outbound, SessionInfo, SessionRegistry};
pub use router::{GatewayRouter, GatewayStatus};
pub use server::build_router;
pub use upstream::{spawn_upstream, UpstreamHandle, UpstreamStatus};
