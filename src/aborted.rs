//! Aborted checks — cached lookup of checks that must not be started.
//!
//! The set of aborted check ids lives on a remote service. Lookups hit the
//! local copy first; a miss refreshes the whole set and checks again.

use std::collections::HashSet;

use reqwest::{StatusCode, Url};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AbortedError;
use crate::retry::Retryer;

/// Cached set of aborted check ids.
pub struct AbortedChecks {
    addr: Url,
    client: reqwest::Client,
    aborted: RwLock<HashSet<String>>,
    retryer: Retryer,
}

impl AbortedChecks {
    /// Create a cache backed by the service at `addr`.
    pub fn new(addr: &str, retryer: Retryer) -> Result<Self, AbortedError> {
        let addr = Url::parse(addr).map_err(|e| AbortedError::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            addr,
            client: reqwest::Client::new(),
            aborted: RwLock::new(HashSet::new()),
            retryer,
        })
    }

    /// Whether `check_id` has been aborted.
    ///
    /// A failed refresh leaves the cached set untouched.
    pub async fn is_aborted(&self, check_id: &str) -> Result<bool, AbortedError> {
        if self.aborted.read().await.contains(check_id) {
            return Ok(true);
        }

        let snapshot = self.fetch().await?;
        let aborted = snapshot.contains(check_id);
        debug!(count = snapshot.len(), check_id, aborted, "Refreshed aborted checks");
        *self.aborted.write().await = snapshot;
        Ok(aborted)
    }

    async fn fetch(&self) -> Result<HashSet<String>, AbortedError> {
        self.retryer
            .with_retries("GetAbortedChecks", || async {
                let resp = self.client.get(self.addr.clone()).send().await?;
                let status = resp.status();
                if status != StatusCode::OK {
                    return Err(AbortedError::UnexpectedStatus {
                        status: status.as_u16(),
                    });
                }
                let ids: Vec<String> = resp.json().await.map_err(|e| AbortedError::Decode {
                    reason: e.to_string(),
                })?;
                Ok::<_, AbortedError>(ids.into_iter().collect())
            })
            .await
    }
}
