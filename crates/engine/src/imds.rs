//! Minimal IMDSv2 client.
//!
//! Used both by the termination monitor (spot/rebalance/asg-lifecycle
//! probing) and by the lifecycle manager (capacity-type/instance-type
//! lookup at registration time). No crate in this codebase's dependency tree
//! wraps IMDS directly, so this talks to it over plain `reqwest`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Url;

const IMDS_BASE: &str = "http://169.254.169.254/latest/";
const TOKEN_TTL_SECONDS: u64 = 30;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// An IMDSv2 client that lazily fetches and caches the session token.
///
/// Every method degrades to `Ok(None)` / `Ok(false)` on any transport error:
/// IMDS is only reachable when the process is actually running on the target
/// cloud, so "unreachable" is an expected, non-fatal outcome everywhere this
/// is used.
pub(crate) struct ImdsClient {
    http: reqwest::Client,
    base: Url,
    token: Mutex<Option<CachedToken>>,
}

impl ImdsClient {
    pub(crate) fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base: Url::parse(IMDS_BASE).expect("IMDS_BASE is a valid URL"),
            token: Mutex::new(None),
        }
    }

    async fn token(&self) -> Option<String> {
        {
            let guard = self.token.lock().unwrap();
            if let Some(cached) = guard.as_ref() {
                if cached.expires_at > Instant::now() {
                    return Some(cached.value.clone());
                }
            }
        }

        let url = self.base.join("api/token").ok()?;
        let res = self
            .http
            .put(url)
            .timeout(REQUEST_TIMEOUT)
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECONDS.to_string())
            .send()
            .await
            .ok()?;
        if !res.status().is_success() {
            return None;
        }
        let value = res.text().await.ok()?;
        let value = value.trim().to_string();
        if value.is_empty() {
            return None;
        }

        let mut guard = self.token.lock().unwrap();
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(TOKEN_TTL_SECONDS.saturating_sub(5)),
        });
        Some(value)
    }

    /// Fetches `meta-data/<path>`, returning `None` on any failure (not
    /// running on this cloud, token fetch failed, non-2xx, network error).
    pub(crate) async fn get(&self, path: &str) -> Option<String> {
        let token = self.token().await?;
        let url = self.base.join(path).ok()?;
        let res = self
            .http
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .ok()?;
        if !res.status().is_success() {
            return None;
        }
        res.text().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_with_valid_base_url() {
        let client = ImdsClient::new(reqwest::Client::new());
        assert_eq!(client.base.as_str(), IMDS_BASE);
    }
}
