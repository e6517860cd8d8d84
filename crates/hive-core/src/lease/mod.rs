//! Lease coordination: the claim table, its HTTP surface, and a client.

pub mod auth;
pub mod client;
pub mod server;
pub mod store;

pub use self::auth::{AuthDecision, AuthPolicy};
pub use self::client::CoordinatorClient;
pub use self::server::{CoordinatorState, router, serve};
pub use self::store::{LeaseSettings, LeaseStore};
