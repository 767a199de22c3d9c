/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

use std::fs::File;
use std::io::Read;

use toml;

use resource::Resource;
use task::Task;
use tc::{TcChildArgs, TcId, TrafficClassBuilder, DEFAULT_PRIORITY};

/// Server configuration, read from a TOML file at startup.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The core the worker thread is pinned to.
    pub core: Option<usize>,

    /// Overrides the measured cycle-counter frequency. Meant for
    /// simulations driving the scheduler with a synthetic clock.
    pub tsc_hz: Option<u64>,

    /// The scheduling tree the worker drives.
    pub tree: TreeConfig,
}

/// One traffic class in the configured tree. `kind` selects the policy;
/// the remaining fields apply only to some kinds, mirroring the
/// per-policy child parameters of the builder surface.
#[derive(Clone, Debug, Deserialize)]
pub struct TreeConfig {
    /// Registry name for this class. Must be unique.
    pub name: String,

    /// One of "priority", "weighted_fair", "round_robin", "rate_limit",
    /// or "leaf".
    pub kind: String,

    /// The accounted resource, for weighted-fair and rate-limit
    /// classes: "count", "cycle", "packet", or "bit".
    pub resource: Option<String>,

    /// Sustained rate in resource units per second, for rate limits.
    /// Zero means unlimited.
    pub limit: Option<u64>,

    /// Burst cap in resource units per second, for rate limits.
    /// Defaults to the limit.
    pub max_burst: Option<u64>,

    /// This class's priority under a priority parent. Smaller runs
    /// first; defaults to the lowest priority.
    pub priority: Option<u32>,

    /// This class's share under a weighted-fair parent.
    pub share: Option<u32>,

    /// The task to hang off a leaf, resolved by the caller's factory.
    pub task: Option<String>,

    #[serde(default)]
    pub children: Vec<TreeConfig>,
}

/// Reads and parses a configuration file.
pub fn load(path: &str) -> Result<Config, String> {
    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;
    parse(&contents)
}

/// Parses a configuration from TOML text.
pub fn parse(contents: &str) -> Result<Config, String> {
    toml::from_str(contents).map_err(|e| format!("Malformed config: {}", e))
}

/// Builds the subtree described by `cfg`, registering every class with
/// the builder.
///
/// # Arguments
///
/// * `tcs`:   The builder that will own the new classes.
/// * `cfg`:   The tree description, usually parsed from TOML.
/// * `tasks`: Resolves a leaf's `task` string to a runnable task, so
///            the scheduler core stays ignorant of concrete task types.
///
/// # Return
///
/// The root of the new subtree, or a message describing the first
/// configuration error.
pub fn build_tree<F>(
    tcs: &mut TrafficClassBuilder,
    cfg: &TreeConfig,
    tasks: &mut F,
) -> Result<TcId, String>
where
    F: FnMut(&TreeConfig) -> Result<Box<Task>, String>,
{
    match cfg.kind.as_str() {
        "priority" => {
            let root = create(tcs.create_priority(&cfg.name), cfg)?;
            for child_cfg in &cfg.children {
                let child = build_tree(tcs, child_cfg, tasks)?;
                let priority = child_cfg.priority.unwrap_or(DEFAULT_PRIORITY);
                attach(tcs, root, TcChildArgs::Priority(priority, child), cfg, child_cfg)?;
            }
            Ok(root)
        }
        "weighted_fair" => {
            let resource = resource_of(cfg)?;
            let root = create(tcs.create_weighted_fair(&cfg.name, resource), cfg)?;
            for child_cfg in &cfg.children {
                let child = build_tree(tcs, child_cfg, tasks)?;
                let share = child_cfg
                    .share
                    .ok_or_else(|| format!("Child {} of {} needs a share", child_cfg.name, cfg.name))?;
                attach(tcs, root, TcChildArgs::WeightedFair(share, child), cfg, child_cfg)?;
            }
            Ok(root)
        }
        "round_robin" => {
            let root = create(tcs.create_round_robin(&cfg.name), cfg)?;
            for child_cfg in &cfg.children {
                let child = build_tree(tcs, child_cfg, tasks)?;
                attach(tcs, root, TcChildArgs::RoundRobin(child), cfg, child_cfg)?;
            }
            Ok(root)
        }
        "rate_limit" => {
            let resource = resource_of(cfg)?;
            let limit = cfg.limit
                .ok_or_else(|| format!("Rate limit {} needs a limit", cfg.name))?;
            let max_burst = cfg.max_burst.unwrap_or(limit);
            if cfg.children.len() != 1 {
                return Err(format!("Rate limit {} takes exactly one child", cfg.name));
            }
            let root = create(
                tcs.create_rate_limit(&cfg.name, resource, limit, max_burst),
                cfg,
            )?;
            let child = build_tree(tcs, &cfg.children[0], tasks)?;
            attach(tcs, root, TcChildArgs::RateLimit(child), cfg, &cfg.children[0])?;
            Ok(root)
        }
        "leaf" => {
            if !cfg.children.is_empty() {
                return Err(format!("Leaf {} takes no children", cfg.name));
            }
            let task = tasks(cfg)?;
            create(tcs.create_leaf(&cfg.name, task), cfg)
        }
        other => Err(format!("Unknown policy {} on {}", other, cfg.name)),
    }
}

fn create(id: Option<TcId>, cfg: &TreeConfig) -> Result<TcId, String> {
    id.ok_or_else(|| format!("Duplicate traffic class name {}", cfg.name))
}

fn attach(
    tcs: &mut TrafficClassBuilder,
    parent: TcId,
    args: TcChildArgs,
    parent_cfg: &TreeConfig,
    child_cfg: &TreeConfig,
) -> Result<(), String> {
    if tcs.add_child(parent, args) {
        Ok(())
    } else {
        Err(format!(
            "Failed to attach {} under {}",
            child_cfg.name, parent_cfg.name
        ))
    }
}

fn resource_of(cfg: &TreeConfig) -> Result<Resource, String> {
    let name = cfg.resource
        .as_ref()
        .ok_or_else(|| format!("Traffic class {} needs a resource", cfg.name))?;
    Resource::from_name(name).ok_or_else(|| format!("Unknown resource {} on {}", name, cfg.name))
}

#[cfg(test)]
mod test {
    use super::*;
    use resource::ResourceArr;
    use task::TaskState;
    use tc::{Policy, TcChildArgs};

    struct NullTask;

    impl Task for NullTask {
        fn attach(&mut self, _tc: TcId) {}
        fn detach(&mut self) {}
        fn run(&mut self) -> (TaskState, ResourceArr) {
            (TaskState::Ready, ResourceArr::new())
        }
    }

    fn null_factory(_cfg: &TreeConfig) -> Result<Box<Task>, String> {
        Ok(Box::new(NullTask))
    }

    const SAMPLE: &'static str = r#"
        core = 2
        tsc_hz = 1073741824

        [tree]
        name = "root"
        kind = "priority"

        [[tree.children]]
        name = "interactive"
        kind = "leaf"
        task = "source"
        priority = 0

        [[tree.children]]
        name = "bulk"
        kind = "rate_limit"
        resource = "bit"
        limit = 1000000000
        priority = 10

        [[tree.children.children]]
        name = "flows"
        kind = "weighted_fair"
        resource = "packet"

        [[tree.children.children.children]]
        name = "a"
        kind = "leaf"
        task = "source"
        share = 3

        [[tree.children.children.children]]
        name = "b"
        kind = "leaf"
        task = "source"
        share = 1
    "#;

    #[test]
    fn parses_and_builds_a_tree() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.core, Some(2));
        assert_eq!(cfg.tsc_hz, Some(1 << 30));

        let mut tcs = TrafficClassBuilder::with_tsc_hz(cfg.tsc_hz.unwrap());
        let root = build_tree(&mut tcs, &cfg.tree, &mut null_factory).unwrap();

        assert_eq!(tcs.find("root"), Some(root));
        assert_eq!(tcs.size_of(root), 6);
        assert_eq!(tcs.get(root).unwrap().policy(), Policy::Priority);

        let interactive = tcs.find("interactive").unwrap();
        let bulk = tcs.find("bulk").unwrap();
        let mut edges = Vec::new();
        tcs.traverse_children(root, &mut |args| edges.push(args));
        assert_eq!(
            edges,
            vec![
                TcChildArgs::Priority(0, interactive),
                TcChildArgs::Priority(10, bulk),
            ]
        );

        // The burst defaults to the limit.
        assert_eq!(tcs.get(bulk).unwrap().max_burst_arg(), Some(1_000_000_000));
    }

    #[test]
    fn rejects_malformed_trees() {
        let mut tcs = TrafficClassBuilder::with_tsc_hz(1 << 30);

        let cfg = TreeConfig {
            name: "x".to_string(),
            kind: "bogus".to_string(),
            resource: None,
            limit: None,
            max_burst: None,
            priority: None,
            share: None,
            task: None,
            children: Vec::new(),
        };
        assert!(build_tree(&mut tcs, &cfg, &mut null_factory).is_err());

        // A weighted-fair child without a share is rejected.
        let cfg = TreeConfig {
            name: "wf".to_string(),
            kind: "weighted_fair".to_string(),
            resource: Some("packet".to_string()),
            limit: None,
            max_burst: None,
            priority: None,
            share: None,
            task: None,
            children: vec![TreeConfig {
                name: "leafless".to_string(),
                kind: "leaf".to_string(),
                resource: None,
                limit: None,
                max_burst: None,
                priority: None,
                share: None,
                task: None,
                children: Vec::new(),
            }],
        };
        assert!(build_tree(&mut tcs, &cfg, &mut null_factory).is_err());
    }
}
