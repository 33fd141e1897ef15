//! The registry protocol state machines: HTTP transport, bearer-token
//! authentication, credential resolution, and the concrete v2 distribution
//! client built on top of them.

pub mod auth;
pub mod client;
pub mod credential;
pub mod streaming;
pub mod transport;

pub use auth::{AuthChallenge, Authenticator};
pub use client::{PushOutcome, RegistryClient};
pub use credential::{CredentialChain, CredentialSource};
pub use transport::RegistryClientConfig;
