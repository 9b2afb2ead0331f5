// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Engine parameters

use concurrency::RetryPolicy;
use derive_builder::Builder;
use std::fmt::Display;
use std::time::Duration;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_MAX_JOB_RETRIES: u32 = 3;
const DEFAULT_VPN_TAG_RANGE: (u32, u32) = (70_000, 100_000);
const DEFAULT_ELAN_TAG_RANGE: (u32, u32) = (5_000, 69_999);

/// Engine parameters. N.B. every field has a default, so that `EngineConfigBuilder::default()`
/// only needs to be told what differs.
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// How long a bounded lock acquisition waits before failing
    #[builder(default = DEFAULT_LOCK_TIMEOUT)]
    pub lock_timeout: Duration,

    #[builder(default = DEFAULT_MAX_JOB_RETRIES)]
    pub max_job_retries: u32,

    #[builder(default = DEFAULT_RETRY_BACKOFF)]
    pub retry_backoff: Duration,

    /// Persist pending port associations in the operational store
    #[builder(default = true)]
    pub pending_cache_persist: bool,

    #[builder(default = DEFAULT_VPN_TAG_RANGE)]
    pub vpn_tag_range: (u32, u32),

    #[builder(default = DEFAULT_ELAN_TAG_RANGE)]
    pub elan_tag_range: (u32, u32),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_job_retries: DEFAULT_MAX_JOB_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            pending_cache_persist: true,
            vpn_tag_range: DEFAULT_VPN_TAG_RANGE,
            elan_tag_range: DEFAULT_ELAN_TAG_RANGE,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_job_retries,
            backoff: self.retry_backoff,
        }
    }
}

impl Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Engine config")?;
        writeln!(f, "  lock timeout    : {:?}", self.lock_timeout)?;
        writeln!(f, "  job retries     : {}", self.max_job_retries)?;
        writeln!(f, "  retry backoff   : {:?}", self.retry_backoff)?;
        writeln!(f, "  persist pending : {}", self.pending_cache_persist)?;
        writeln!(f, "  vpn tags        : {:?}", self.vpn_tag_range)?;
        write!(f, "  elan tags       : {:?}", self.elan_tag_range)
    }
}
