//! HTTP transport factory.
//!
//! The only place a `reqwest::Client` is built. Every fetch attempt gets
//! its own client, built from the policy the rule engine resolved for
//! that attempt's host — this is deliberately cheap per spec's call
//! pattern (one fetch attempt per retry/mirror switch, not per chunk).

use crate::error::EngineError;
use crate::rules::RulesSnapshot;
use reqwest::{Client, Proxy};
use std::time::Duration;

const MAX_REDIRECTS: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = concat!("z-dmr/", env!("CARGO_PKG_VERSION"));

/// The policy resolved for one fetch attempt against one host.
#[derive(Debug, Clone, Default)]
pub struct TransportPolicy {
    pub proxy_url: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

impl TransportPolicy {
    pub fn resolve(snapshot: &RulesSnapshot, host: &str) -> Self {
        Self {
            proxy_url: snapshot.resolve_proxy(host),
            extra_headers: snapshot.resolve_headers(host),
        }
    }
}

/// Build a client for one fetch attempt. No overall response timeout is
/// set (large files can legitimately take longer than any fixed cap);
/// `READ_TIMEOUT` bounds idle time between chunks instead.
pub fn build_client(policy: &TransportPolicy) -> Result<Client, EngineError> {
    let mut headers = reqwest::header::HeaderMap::new();
    let mut user_agent_overridden = false;
    for (name, value) in &policy.extra_headers {
        if name.eq_ignore_ascii_case("user-agent") {
            user_agent_overridden = true;
        }
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| EngineError::InvalidOperation(format!("invalid header name: {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| EngineError::InvalidOperation(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }

    let mut builder = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .default_headers(headers)
        .tls_built_in_root_certs(true);

    if !user_agent_overridden {
        builder = builder.user_agent(DEFAULT_USER_AGENT);
    }

    builder = match &policy.proxy_url {
        Some(url) => {
            let proxy = Proxy::all(url)
                .map_err(|e| EngineError::InvalidOperation(format!("invalid proxy url: {e}")))?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| EngineError::InvalidOperation(format!("failed to build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_no_policy() {
        let client = build_client(&TransportPolicy::default());
        assert!(client.is_ok());
    }

    #[test]
    fn rejects_malformed_proxy_url() {
        let policy = TransportPolicy {
            proxy_url: Some("not a url".to_string()),
            extra_headers: Vec::new(),
        };
        assert!(build_client(&policy).is_err());
    }
}
