//! Credential pools and token acquisition for the OAuth providers.

mod pool;
mod tokens;

pub use pool::CredentialPools;
pub use tokens::TokenBroker;
