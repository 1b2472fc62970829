//! Single-shot service discovery probe (spec.md §4.7, §6). Issues one HTTPS
//! request against the configured discovery URL and parses the candidate
//! cloud endpoint list; callers retry by calling [`discover`] again.

use std::time::Duration;

use cm_ore::error::CmError;
use serde::Deserialize;
use url::Url;

/// Result of a successful discovery probe: a retry hint and the first usable
/// candidate URL (spec §4.7 "returns the first URL whose scheme is
/// wss/https").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub next_request_delay: Duration,
    pub cloud_url: Url,
}

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    #[serde(rename = "nextRequestDelay")]
    next_request_delay: u64,
    #[serde(rename = "connectionInfo")]
    connection_info: Vec<String>,
}

/// Issues the discovery request and returns the first candidate whose
/// scheme is `wss` or `https`. Malformed or unsupported candidate URLs are
/// skipped, not fatal (spec §4.7 "invalid URLs are skipped").
pub async fn discover(client: &reqwest::Client, discovery_url: &Url) -> Result<DiscoveryResult, CmError> {
    let body: DiscoveryResponse = client
        .post(discovery_url.clone())
        .send()
        .await
        .map_err(|e| CmError::unavailable(format!("discovery request failed: {e}")))?
        .json()
        .await
        .map_err(|e| CmError::bad_message(format!("discovery response was not valid JSON: {e}")))?;

    let next_request_delay = Duration::from_secs(body.next_request_delay);

    let cloud_url = body
        .connection_info
        .iter()
        .filter_map(|candidate| Url::parse(candidate).ok())
        .find(|url| matches!(url.scheme(), "wss" | "https"))
        .ok_or_else(|| CmError::not_found("discovery returned no usable wss/https candidate"))?;

    Ok(DiscoveryResult { next_request_delay, cloud_url })
}
