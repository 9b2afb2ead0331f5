// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing targets declared by the linked crates, gathered at link time.
//!
//! A target is either a module of this workspace, declared with [`trace_target!`] from within
//! the module, or any other target string, typically a dependency's, declared with
//! [`custom_target!`]. Declaring crates depend on `linkme`.

use crate::LevelFilter;

/// A tracing target with its default level and tags
pub struct TargetDecl {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    tags: &'static [&'static str],
}

impl TargetDecl {
    /// The module at `path`, tagged by `name` among others
    #[must_use]
    pub const fn module(
        path: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target: path,
            name,
            level,
            tags,
        }
    }

    /// A target that is its own name
    #[must_use]
    pub const fn external(target: &'static str, level: LevelFilter, tags: &'static [&'static str]) -> Self {
        Self::module(target, target, level, tags)
    }

    /// Tags of the target. The name is always one of them.
    pub(crate) fn tags(&self) -> Vec<&'static str> {
        let mut tags = self.tags.to_vec();
        if !tags.contains(&self.name) {
            tags.push(self.name);
        }
        tags
    }
}

#[linkme::distributed_slice]
pub static DECLARED_TARGETS: [TargetDecl];

/// Register a [`TargetDecl`] built by `$decl`, with [`LevelFilter`] in scope. The anonymous
/// const scope keeps the static distinct when a crate declares several targets.
#[doc(hidden)]
#[macro_export]
macro_rules! declare_target {
    ($decl:expr) => {
        const _: () = {
            use linkme::distributed_slice;
            use $crate::LevelFilter;
            use $crate::targets::{DECLARED_TARGETS, TargetDecl};

            #[distributed_slice(DECLARED_TARGETS)]
            static DECLARED: TargetDecl = $decl;
        };
    };
}

/// Declare the enclosing module as a tracing target, with a name, a default level and tags
#[macro_export]
macro_rules! trace_target {
    ($name:expr, $level:expr, $tags:expr) => {
        $crate::declare_target!($crate::targets::TargetDecl::module(module_path!(), $name, $level, $tags));
    };
}

/// Declare a target that is not a module of the workspace
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        $crate::declare_target!($crate::targets::TargetDecl::external($target, $level, $tags));
    };
}

#[cfg(test)]
mod tests {
    use super::{DECLARED_TARGETS, TargetDecl};
    use crate::LevelFilter;

    crate::trace_target!("tctl-module", LevelFilter::WARN, &["tctl-module", "tctl-x"]);

    #[test]
    fn module_targets_are_keyed_by_path() {
        let decl = DECLARED_TARGETS
            .iter()
            .find(|d| d.name == "tctl-module")
            .expect("Should be declared");
        assert_eq!(decl.target, module_path!());
        assert_eq!(decl.level, LevelFilter::WARN);
        assert_eq!(decl.tags(), vec!["tctl-module", "tctl-x"]);
    }

    #[test]
    fn external_target_is_tagged_by_itself() {
        let decl = TargetDecl::external("hyper", LevelFilter::ERROR, &["deps"]);
        assert_eq!(decl.name, "hyper");
        assert_eq!(decl.tags(), vec!["deps", "hyper"]);
    }
}
