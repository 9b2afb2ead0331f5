// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub use clap::Parser;
use engine::{EngineConfig, EngineConfigBuilder};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Inclusive range of tags, given as `LOW-HIGH`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRange {
    low: u32,
    high: u32,
}
impl FromStr for TagRange {
    type Err = String;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let Some((low, high)) = input.split_once('-') else {
            return Err(format!("Bad tag range '{input}': expected LOW-HIGH"));
        };
        let low = low
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("Bad lower bound in '{input}': {e}"))?;
        let high = high
            .trim()
            .parse::<u32>()
            .map_err(|e| format!("Bad upper bound in '{input}': {e}"))?;
        if low > high {
            return Err(format!("Empty tag range '{input}'"));
        }
        Ok(TagRange { low, high })
    }
}
impl From<TagRange> for (u32, u32) {
    fn from(range: TagRange) -> Self {
        (range.low, range.high)
    }
}

#[derive(Parser)]
#[command(name = "vpnsync")]
#[command(version = "0.1")]
#[command(about = "Replays Neutron changes and L3VPN requests through the VPN reconciliation engine", long_about = None)]
pub struct CmdArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "YAML script of Neutron changes and L3VPN requests to replay"
    )]
    script: Option<PathBuf>,

    #[arg(
        long,
        value_name = "MILLISECONDS",
        default_value_t = 5000,
        help = "How long to wait for a lock before failing an operation"
    )]
    lock_timeout_ms: u64,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(0..=100),
        help = "Number of times a failed job is retried in [0..100]"
    )]
    job_retries: u32,

    #[arg(
        long,
        value_name = "MILLISECONDS",
        default_value_t = 50,
        help = "Delay before the first retry of a failed job, doubled on every retry"
    )]
    retry_backoff_ms: u64,

    #[arg(
        long,
        default_value_t = false,
        help = "Keep pending port associations in memory only"
    )]
    no_persist_pending: bool,

    #[arg(long, value_name = "LOW-HIGH", help = "Range of VPN tags")]
    vpn_tags: Option<TagRange>,

    #[arg(long, value_name = "LOW-HIGH", help = "Range of ELAN tags")]
    elan_tags: Option<TagRange>,

    #[arg(
        long,
        default_value_t = false,
        help = "Show the available tracing tags and exit"
    )]
    show_tracing_tags: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Show configurable tracing targets and exit"
    )]
    show_tracing_targets: bool,

    #[arg(
        long,
        value_name = "tracing configuration",
        help = "Tracing config string as comma-separated sequence of tag=level, with level one in [off,error,warn,info,debug,trace].
Passing default=level sets the default log-level.
Passing all=level allows setting the log-level of all targets to level.
E.g. default=error,all=info,vpn=debug will set the default target to error, and all the registered targets to info, but enable debug for vpn"
    )]
    tracing: Option<String>,
}

impl CmdArgs {
    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    pub fn show_tracing_tags(&self) -> bool {
        self.show_tracing_tags
    }
    pub fn show_tracing_targets(&self) -> bool {
        self.show_tracing_targets
    }
    pub fn tracing(&self) -> Option<&String> {
        self.tracing.as_ref()
    }

    /// Engine parameters from the command line. Unset ones keep their default.
    pub fn engine_config(&self) -> Result<EngineConfig, String> {
        let mut builder = EngineConfigBuilder::default();
        builder
            .lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .max_job_retries(self.job_retries)
            .retry_backoff(Duration::from_millis(self.retry_backoff_ms))
            .pending_cache_persist(!self.no_persist_pending);
        if let Some(range) = self.vpn_tags {
            builder.vpn_tag_range(range.into());
        }
        if let Some(range) = self.elan_tags {
            builder.elan_tag_range(range.into());
        }
        let config = builder
            .build()
            .map_err(|e| format!("Bad engine configuration: {e}"))?;
        debug!("Engine configuration from command line: {config:?}");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use crate::{CmdArgs, Parser, TagRange};
    use engine::EngineConfig;
    use std::str::FromStr;
    use std::time::Duration;

    #[test]
    fn test_parse_tag_range() {
        let range = TagRange::from_str("100-200").unwrap();
        assert_eq!(<(u32, u32)>::from(range), (100, 200));

        // single tag
        let range = TagRange::from_str("7-7").unwrap();
        assert_eq!(<(u32, u32)>::from(range), (7, 7));

        assert!(TagRange::from_str("200-100").is_err());
        assert!(TagRange::from_str("100").is_err());
        assert!(TagRange::from_str("a-100").is_err());
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let args = CmdArgs::try_parse_from(["vpnsync"]).unwrap();
        assert_eq!(args.script(), None);
        assert_eq!(args.engine_config().unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_engine_config_from_args() {
        let args = CmdArgs::try_parse_from([
            "vpnsync",
            "--script",
            "/tmp/changes.yaml",
            "--lock-timeout-ms",
            "250",
            "--job-retries",
            "0",
            "--no-persist-pending",
            "--vpn-tags",
            "10-20",
        ])
        .unwrap();
        assert!(args.script().is_some());
        let config = args.engine_config().unwrap();
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.max_job_retries, 0);
        assert!(!config.pending_cache_persist);
        assert_eq!(config.vpn_tag_range, (10, 20));
        assert_eq!(config.elan_tag_range, EngineConfig::default().elan_tag_range);
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        assert!(CmdArgs::try_parse_from(["vpnsync", "--job-retries", "1000"]).is_err());
        assert!(CmdArgs::try_parse_from(["vpnsync", "--elan-tags", "9-1"]).is_err());
    }
}
