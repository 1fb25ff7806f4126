//! OpenStack transport
//!
//! Keystone v3 authentication, service-catalog lookup and a `reqwest`
//! client implementing the container-infra, orchestration and compute
//! collaborators the adapters are written against.

pub mod auth;
pub mod client;
pub mod config;

pub use auth::{KeystoneAuth, ServiceCatalog};
pub use client::OpenStackClient;
pub use config::{CloudConfig, Credentials};

use crate::error::ProviderError;
use reqwest::StatusCode;

/// Maps an unsuccessful HTTP status to the provider error kind.
pub(crate) fn error_for_status(status: StatusCode, context: &str, body: &str) -> ProviderError {
    let detail = if body.is_empty() {
        format!("{}: HTTP {}", context, status.as_u16())
    } else {
        format!("{}: HTTP {}: {}", context, status.as_u16(), truncate(body, 512))
    };
    if status == StatusCode::NOT_FOUND {
        ProviderError::NotFound(detail)
    } else if status.is_server_error() {
        ProviderError::Unavailable(detail)
    } else {
        ProviderError::Rejected(detail)
    }
}

pub(crate) fn transport_error(context: &str, err: reqwest::Error) -> ProviderError {
    if err.is_decode() {
        ProviderError::Rejected(format!("{}: invalid response: {}", context, err))
    } else {
        ProviderError::Unavailable(format!("{}: {}", context, err))
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((index, _)) => &body[..index],
        None => body,
    }
}
