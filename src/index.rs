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

//! `BranchIndex`: the server-wide registry of `Branch`es plus the global
//! schema/system-config state shared by all of them (spec §4.5).

use crate::branch::Branch;
use crate::config::{ChainedSpec, ConfigOp, ConfigOpKind, ConfigScope, ConfigSnapshot};
use crate::error::DbViewError;
use crate::external::{CompilerPool, Server, Tenant};
use crate::metrics::MetricsSink;
use crate::session::SessionView;
use crate::unit::Capabilities;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use uuid::Uuid;

/// A compile-cache shared across every branch for requests the compiler
/// marks cacheable at the system level (e.g. introspection queries run by
/// every connection regardless of branch). Structurally the same
/// lookup/lock shape as a branch's own cache (§6: "Server consumed: system
/// compile cache and its lock table"), kept separate because it is not
/// subject to any single branch's schema version.
pub struct GlobalCompileCache {
    entries: Mutex<crate::lru::Lru<u64, crate::unit::QueryUnitGroup>>,
    locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
}

impl GlobalCompileCache {
    pub fn new(capacity: usize) -> Self {
        GlobalCompileCache {
            entries: Mutex::new(crate::lru::Lru::new(capacity)),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, fingerprint: u64) -> Option<crate::unit::QueryUnitGroup> {
        self.entries.lock().get(&fingerprint).cloned()
    }

    pub fn insert(&self, fingerprint: u64, group: crate::unit::QueryUnitGroup) {
        self.entries.lock().put(fingerprint, group);
    }

    pub async fn acquire_lock(&self, fingerprint: u64) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(fingerprint).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

struct GlobalState {
    global_schema_pickle: Vec<u8>,
    system_config: ConfigSnapshot,
    system_config_spec: ChainedSpec,
    default_query_cache_capacity: usize,
    default_sql_cache_capacity: usize,
}

/// The server-wide registry of live branches. Owns the global schema
/// pickle and system config that every branch's compiles read, and is the
/// collaborator `SessionView::apply_config_ops` reaches for `Instance`
/// scoped operations (§4.4, §4.5).
pub struct BranchIndex {
    branches: Mutex<HashMap<String, Arc<Branch>>>,
    global: Mutex<GlobalState>,
    global_cache: Arc<GlobalCompileCache>,
    tenant: Arc<dyn Tenant>,
    compiler: Arc<dyn CompilerPool>,
    server: Arc<dyn Server>,
    metrics: MetricsSink,
}

impl BranchIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant: Arc<dyn Tenant>,
        compiler: Arc<dyn CompilerPool>,
        server: Arc<dyn Server>,
        metrics: MetricsSink,
        default_query_cache_capacity: usize,
        default_sql_cache_capacity: usize,
        global_cache_capacity: usize,
    ) -> Self {
        BranchIndex {
            branches: Mutex::new(HashMap::new()),
            global: Mutex::new(GlobalState {
                global_schema_pickle: Vec::new(),
                system_config: ConfigSnapshot::new(),
                system_config_spec: ChainedSpec::default(),
                default_query_cache_capacity,
                default_sql_cache_capacity,
            }),
            global_cache: Arc::new(GlobalCompileCache::new(global_cache_capacity)),
            tenant,
            compiler,
            server,
            metrics,
        }
    }

    pub fn global_cache(&self) -> &Arc<GlobalCompileCache> {
        &self.global_cache
    }

    pub fn get(&self, name: &str) -> Option<Arc<Branch>> {
        self.branches.lock().get(name).cloned()
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branches.lock().keys().cloned().collect()
    }

    /// Register a newly-introspected branch and spawn its background
    /// tasks. Replaces any existing branch of the same name, stopping the
    /// old one first so its tasks don't race with the new one's.
    #[allow(clippy::too_many_arguments)]
    pub fn register_db(
        &self,
        name: impl Into<String>,
        user_schema_pickle: Vec<u8>,
        schema_version: Uuid,
        db_config: ConfigSnapshot,
        read_only: bool,
    ) -> Arc<Branch> {
        let name = name.into();
        let (qcap, scap) = {
            let global = self.global.lock();
            (global.default_query_cache_capacity, global.default_sql_cache_capacity)
        };
        let branch = Branch::new(
            name.clone(),
            user_schema_pickle,
            schema_version,
            db_config,
            self.tenant.clone(),
            self.compiler.clone(),
            self.metrics.clone(),
            qcap,
            scap,
            read_only,
        );
        let previous = self.branches.lock().insert(name, branch.clone());
        if let Some(old) = previous {
            old.stop();
        }
        self.metrics.current_branches(self.branches.lock().len());
        branch
    }

    /// Stop a branch's background tasks and drop it from the registry
    /// (§4.3 "Branch::stop is the unregister_db collaborator").
    pub fn unregister_db(&self, name: &str) -> Option<Arc<Branch>> {
        let removed = self.branches.lock().remove(name);
        if let Some(branch) = &removed {
            branch.stop();
        }
        self.metrics.current_branches(self.branches.lock().len());
        removed
    }

    /// Update the server-wide global schema pickle and propagate it to
    /// every registered branch (§4.5).
    pub fn update_global_schema(&self, pickle: Vec<u8>) {
        self.global.lock().global_schema_pickle = pickle.clone();
        for branch in self.branches.lock().values() {
            branch.update_global_schema(pickle.clone());
        }
    }

    pub fn global_schema_pickle(&self) -> Vec<u8> {
        self.global.lock().global_schema_pickle.clone()
    }

    pub fn system_config(&self) -> ConfigSnapshot {
        self.global.lock().system_config.clone()
    }

    /// Apply an `Instance`-scoped config op: coerce and fold the value into
    /// the system config snapshot, persist it via the tenant's backend
    /// connection inside a DDL-style block, call the server's before-hook,
    /// publish the folded snapshot, signal the change, then call the
    /// after-hook (§4.4, §4.5). The before-persist-overrides update
    /// happens before the before-hook because the hook itself may drop the
    /// backend connection (e.g. an extension restart); a failed persist
    /// never leaves the in-memory snapshot ahead of what's durable, and a
    /// failed before-hook aborts before the snapshot is updated.
    pub async fn apply_system_config_op(&self, op: ConfigOp) -> Result<(), DbViewError> {
        if op.scope != ConfigScope::Instance {
            return Err(DbViewError::UnsupportedFeature("apply_system_config_op called with a non-instance scope".into()));
        }

        let folded = {
            let global = self.global.lock();
            global.system_config_spec.fold(global.system_config.clone(), &op)
        };

        let guard = self.tenant.acquire_backend_connection("__system__").await?;
        let sql = format!("-- system config op: {}", op.name).into_bytes();
        guard.conn().sql_execute(&sql).await?;
        drop(guard);

        let value = || op.value.clone().ok_or_else(|| DbViewError::UnsupportedFeature(format!("config op {} missing a value", op.name)));
        match op.kind {
            ConfigOpKind::Add => self.server.on_system_config_add(&op.name, &value()?).await?,
            ConfigOpKind::Rem => self.server.on_system_config_rem(&op.name, &value()?).await?,
            ConfigOpKind::Set => self.server.on_system_config_set(&op.name, &value()?).await?,
            ConfigOpKind::Reset => self.server.on_system_config_reset(&op.name).await?,
        }

        self.global.lock().system_config = folded;
        self.tenant.signal_sysevent("system-config-changed", "__system__", &[op.name.clone()]).await;

        match op.kind {
            ConfigOpKind::Add => self.server.after_system_config_add(&op.name, &value()?).await,
            ConfigOpKind::Rem => self.server.after_system_config_rem(&op.name, &value()?).await,
            ConfigOpKind::Set => self.server.after_system_config_set(&op.name, &value()?).await,
            ConfigOpKind::Reset => self.server.after_system_config_reset(&op.name).await,
        }
        Ok(())
    }

    /// Build a fresh `SessionView` bound to `branch`, wiring its
    /// `Instance`-scoped config ops back through this index (§4.5 "new_view").
    pub fn new_view(self: &Arc<Self>, branch: Arc<Branch>, query_cache_enabled: bool, protocol_version: (u16, u16), capability_mask: Capabilities) -> SessionView {
        let index = self.clone();
        let sink: Arc<dyn Fn(ConfigOp) -> Pin<Box<dyn Future<Output = Result<(), DbViewError>> + Send>> + Send + Sync> = Arc::new(move |op: ConfigOp| {
            let index = index.clone();
            Box::pin(async move { index.apply_system_config_op(op).await })
        });
        SessionView::new(branch, query_cache_enabled, protocol_version, capability_mask, Some(sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_compile_cache_round_trips() {
        let cache = GlobalCompileCache::new(4);
        assert!(cache.lookup(1).is_none());
    }
}
