//! Provider dispatch.
//!
//! A [`Provider`](agentrun_core::Provider) maps to one of three strategies:
//! a CLI child process, an OAuth HTTP session with credential failover, or an
//! HTTP session against a user-configured API. HTTP strategies share one SSE
//! streaming path and differ only in how the request is built.

mod api;
mod cli_args;
mod http;
mod oauth;
mod one_shot;

pub use cli_args::cli_args;
pub use one_shot::{AgentSpec, OneShotOptions, OneShotResult};

pub(crate) use api::ApiRequest;
pub(crate) use oauth::OAuthRequest;
pub(crate) use one_shot::run_one_shot;
