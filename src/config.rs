//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Session/database/instance configuration model backing §4.4's
//! "Config operations" and the `auto_rebuild_query_cache*` settings from
//! §6. **[AMBIENT]** — not named as its own module in spec.md, but every
//! operation that reads or writes config needs a concrete value type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single configuration value. Kept deliberately small: the core only
/// needs to hash, compare and fold these, never interpret their domain
/// meaning (that's the config subsystem's value parser, per §1 Non-goals).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Duration(i64),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_duration_millis(&self) -> Option<i64> {
        match self {
            ConfigValue::Duration(d) => Some(*d),
            _ => None,
        }
    }
}

/// A config snapshot. `BTreeMap` keeps key order deterministic so that
/// hashing and serialization never depend on insertion order (§9 design note).
pub type ConfigSnapshot = BTreeMap<String, ConfigValue>;

/// The scope an incoming `CONFIGURE` operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigScope {
    Instance,
    Database,
    Session,
    Global,
}

/// Which of the four config-change hooks (§4.5, §6:
/// `_on_system_config_{add,rem,set,reset}`) an `Instance`-scoped op maps to.
/// Scalar settings only ever produce `Set`/`Reset`; `Add`/`Rem` are for
/// multi-valued settings the compiler marks explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOpKind {
    Add,
    Rem,
    Set,
    Reset,
}

/// A single config mutation, as produced by a compiled unit's config ops.
#[derive(Debug, Clone)]
pub struct ConfigOp {
    pub scope: ConfigScope,
    pub name: String,
    pub value: Option<ConfigValue>,
    pub kind: ConfigOpKind,
}

/// The system spec plus the branch's user config spec, chained so a value
/// lookup checks the user spec first and falls back to the system default.
/// Value validation (is this name known, is this value the right shape)
/// belongs to the config subsystem; `ChainedSpec` only knows defaults.
#[derive(Debug, Clone, Default)]
pub struct ChainedSpec {
    defaults: ConfigSnapshot,
}

impl ChainedSpec {
    pub fn new(defaults: ConfigSnapshot) -> Self {
        ChainedSpec { defaults }
    }

    pub fn default_for(&self, name: &str) -> Option<&ConfigValue> {
        self.defaults.get(name)
    }

    /// Fold a single op into an existing snapshot, returning the updated one.
    pub fn fold(&self, mut snapshot: ConfigSnapshot, op: &ConfigOp) -> ConfigSnapshot {
        match &op.value {
            Some(v) => {
                snapshot.insert(op.name.clone(), v.clone());
            }
            None => {
                // RESET: fall back to the default, or drop the override entirely.
                match self.default_for(&op.name) {
                    Some(d) => {
                        snapshot.insert(op.name.clone(), d.clone());
                    }
                    None => {
                        snapshot.remove(&op.name);
                    }
                }
            }
        }
        snapshot
    }
}

/// The two settings consumed from the combined spec (§6 "Configuration inputs").
#[derive(Debug, Clone, Copy)]
pub struct RebuildCacheConfig {
    pub auto_rebuild_query_cache: bool,
    pub auto_rebuild_query_cache_timeout: Option<std::time::Duration>,
}

impl Default for RebuildCacheConfig {
    fn default() -> Self {
        RebuildCacheConfig {
            auto_rebuild_query_cache: false,
            auto_rebuild_query_cache_timeout: None,
        }
    }
}

impl RebuildCacheConfig {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Self {
        let auto_rebuild_query_cache = snapshot
            .get("auto_rebuild_query_cache")
            .and_then(ConfigValue::as_bool)
            .unwrap_or(false);
        let auto_rebuild_query_cache_timeout = snapshot
            .get("auto_rebuild_query_cache_timeout")
            .and_then(ConfigValue::as_duration_millis)
            .map(|ms| std::time::Duration::from_millis(ms.max(0) as u64));
        RebuildCacheConfig {
            auto_rebuild_query_cache,
            auto_rebuild_query_cache_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_set_overrides_value() {
        let spec = ChainedSpec::default();
        let snap = ConfigSnapshot::new();
        let op = ConfigOp {
            scope: ConfigScope::Session,
            name: "work_mem".into(),
            value: Some(ConfigValue::Int(64)),
            kind: ConfigOpKind::Set,
        };
        let snap = spec.fold(snap, &op);
        assert_eq!(snap.get("work_mem"), Some(&ConfigValue::Int(64)));
    }

    #[test]
    fn fold_reset_falls_back_to_default() {
        let mut defaults = ConfigSnapshot::new();
        defaults.insert("work_mem".into(), ConfigValue::Int(4));
        let spec = ChainedSpec::new(defaults);
        let mut snap = ConfigSnapshot::new();
        snap.insert("work_mem".into(), ConfigValue::Int(64));
        let op = ConfigOp {
            scope: ConfigScope::Session,
            name: "work_mem".into(),
            value: None,
            kind: ConfigOpKind::Reset,
        };
        let snap = spec.fold(snap, &op);
        assert_eq!(snap.get("work_mem"), Some(&ConfigValue::Int(4)));
    }

    #[test]
    fn rebuild_cache_config_reads_from_snapshot() {
        let mut snap = ConfigSnapshot::new();
        snap.insert("auto_rebuild_query_cache".into(), ConfigValue::Bool(true));
        snap.insert(
            "auto_rebuild_query_cache_timeout".into(),
            ConfigValue::Duration(5000),
        );
        let cfg = RebuildCacheConfig::from_snapshot(&snap);
        assert!(cfg.auto_rebuild_query_cache);
        assert_eq!(
            cfg.auto_rebuild_query_cache_timeout,
            Some(std::time::Duration::from_millis(5000))
        );
    }
}
