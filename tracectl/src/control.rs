// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-tag tracing levels, applied through a reloadable [`EnvFilter`].

use crate::LevelFilter;
use crate::targets::DECLARED_TARGETS;
use ordermap::{OrderMap, OrderSet};
use parking_lot::Mutex;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceCtlError {
    #[error("Invalid tracing directive '{0}': it should be tag=level")]
    Syntax(String),
    #[error("Invalid level '{0}'")]
    Level(String),
}

#[derive(Debug, Clone)]
pub struct TargetCfg {
    pub target: &'static str,
    pub name: &'static str,
    pub level: LevelFilter,
    pub tags: Vec<&'static str>,
}

#[derive(Debug)]
struct TargetDb {
    level: LevelFilter,
    targets: OrderMap<&'static str, TargetCfg>,
    tags: OrderMap<&'static str, OrderSet<&'static str>>,
}

impl TargetDb {
    fn load(level: LevelFilter) -> Self {
        let mut db = Self {
            level,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for decl in DECLARED_TARGETS {
            let tags = decl.tags();
            for tag in &tags {
                db.tags.entry(tag).or_default().insert(decl.target);
            }
            let cfg = TargetCfg {
                target: decl.target,
                name: decl.name,
                level: decl.level,
                tags,
            };
            if db.targets.insert(decl.target, cfg).is_some() {
                warn!("Tracing target {} declared more than once", decl.target);
            }
        }
        db
    }

    fn env_filter(&self) -> EnvFilter {
        self.targets
            .values()
            .filter_map(|t| format!("{}={}", t.target, t.level).parse::<Directive>().ok())
            .fold(EnvFilter::new(self.level.to_string()), EnvFilter::add_directive)
    }

    fn set_tag_level(&mut self, tag: &str, level: LevelFilter) -> usize {
        let Some(members) = self.tags.get(tag) else {
            return 0;
        };
        let mut changed = 0;
        for target in members {
            if let Some(cfg) = self.targets.get_mut(target)
                && cfg.level != level
            {
                cfg.level = level;
                changed += 1;
            }
        }
        changed
    }
}

impl Display for TargetDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>40} │ {:>6} │ TAGS", "TARGET", "LEVEL")?;
        for t in self.targets.values() {
            writeln!(f, "{:>40} │ {:>6} │ {}", t.target, t.level, t.tags.join(","))?;
        }
        write!(f, "{:>40} │ {:>6} │ --", "(default)", self.level)
    }
}

pub struct TracingControl {
    db: Mutex<TargetDb>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

static TRACING_CTL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], installing the subscriber on first use.
/// If some other subscriber was installed before, levels are still tracked but not applied.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACING_CTL.get_or_init(TracingControl::new)
}

impl TracingControl {
    fn new() -> Self {
        let db = TargetDb::load(LevelFilter::INFO);
        let (filter, handle) = reload::Layer::new(db.env_filter());
        let fmt = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true)
            .with_thread_names(true);
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(fmt)
            .with(ErrorLayer::default())
            .try_init()
            .is_ok();
        Self {
            db: Mutex::new(db),
            reload: installed.then_some(handle),
        }
    }

    fn apply(&self, db: &TargetDb) {
        if let Some(handle) = &self.reload
            && let Err(e) = handle.reload(db.env_filter())
        {
            warn!("Failed to reload tracing filter: {e}");
        }
    }

    pub fn init() {
        get_trace_ctl();
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        let mut db = self.db.lock();
        if db.level != level {
            db.level = level;
            self.apply(&db);
        }
    }

    #[must_use]
    pub fn default_level(&self) -> LevelFilter {
        self.db.lock().level
    }

    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) {
        let mut db = self.db.lock();
        let changed = db.set_tag_level(tag, level);
        if changed > 0 {
            self.apply(&db);
        }
        info!("Log level for tag '{tag}' set to {level} ({changed} targets changed)");
    }

    pub fn set_level_all(&self, level: LevelFilter) {
        let mut db = self.db.lock();
        for cfg in db.targets.values_mut() {
            cfg.level = level;
        }
        self.apply(&db);
    }

    fn parse(input: &str) -> Result<Vec<(String, LevelFilter)>, TraceCtlError> {
        input
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| {
                let (tag, level) = item
                    .split_once('=')
                    .ok_or_else(|| TraceCtlError::Syntax(item.to_string()))?;
                let level = LevelFilter::from_str(level.trim())
                    .map_err(|_| TraceCtlError::Level(level.trim().to_string()))?;
                Ok((tag.trim().to_string(), level))
            })
            .collect()
    }

    /// Configure levels from a string like `default=warn,all=info,subnet=debug`.
    /// `default` sets the level of undeclared targets, `all` that of every declared target
    /// and other keys are tags. Later directives override earlier ones.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        for (tag, level) in Self::parse(input)? {
            match tag.as_str() {
                "default" => self.set_default_level(level),
                "all" => self.set_level_all(level),
                _ => self.set_tag_level(&tag, level),
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get_target(&self, target: &str) -> Option<TargetCfg> {
        self.db.lock().targets.get(target).cloned()
    }

    #[must_use]
    pub fn get_targets_by_tag(&self, tag: &str) -> Vec<TargetCfg> {
        let db = self.db.lock();
        db.tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|t| db.targets.get(t).cloned())
            .collect()
    }

    #[must_use]
    pub fn tags(&self) -> Vec<&'static str> {
        self.db.lock().tags.keys().copied().collect()
    }

    pub fn dump(&self) {
        info!("Tracing targets:\n{}", *self.db.lock());
    }

    pub fn dump_targets_by_tag(&self) {
        let db = self.db.lock();
        let mut out = String::new();
        for (tag, targets) in &db.tags {
            out += &format!(" {tag}:");
            for t in targets {
                out += &format!(" {t}");
            }
            out.push('\n');
        }
        info!("Tracing tags:\n{out}");
    }
}

#[cfg(test)]
mod tests {
    use super::{TraceCtlError, get_trace_ctl};
    use crate::{LevelFilter, custom_target};

    custom_target!("tctl-a", LevelFilter::DEBUG, &["tctl-common"]);
    custom_target!("tctl-b", LevelFilter::ERROR, &["tctl-common"]);
    custom_target!("tctl-c", LevelFilter::INFO, &[]);

    #[test]
    fn declared_targets_are_loaded() {
        let tctl = get_trace_ctl();
        let a = tctl.get_target("tctl-a").expect("Should be declared");
        assert_eq!(a.level, LevelFilter::DEBUG);
        assert!(a.tags.contains(&"tctl-a"));
        assert!(tctl.tags().contains(&"tctl-common"));
    }

    #[test]
    fn tag_level_applies_to_all_members() {
        let tctl = get_trace_ctl();
        tctl.set_tag_level("tctl-common", LevelFilter::WARN);
        let members = tctl.get_targets_by_tag("tctl-common");
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|t| t.level == LevelFilter::WARN));
    }

    #[test]
    fn setup_from_string() {
        let tctl = get_trace_ctl();
        tctl.setup_from_string("tctl-c=trace, default=info")
            .expect("Should succeed");
        assert_eq!(
            tctl.get_target("tctl-c").map(|t| t.level),
            Some(LevelFilter::TRACE)
        );
        assert_eq!(
            tctl.setup_from_string("tctl-c=loud"),
            Err(TraceCtlError::Level("loud".to_string()))
        );
        assert_eq!(
            tctl.setup_from_string("tctl-c"),
            Err(TraceCtlError::Syntax("tctl-c".to_string()))
        );
    }
}
