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

//! `Branch`: owns the compiled-query LRU, the compiled-SQL LRU, per-request
//! compile locks, the background persistence worker, the background
//! notifier, the set of live `SessionView`s, and the in-flight transaction
//! sequence counter (spec §3, §4.3).
//!
//! Background task shape is grounded on the teacher's dedicated-thread +
//! channel bridge (`rs/src/server/handler.rs`'s `SessionBridge`), adapted
//! to `tokio` tasks since there is no `!Send` FFI state to isolate here.

use crate::config::{ChainedSpec, ConfigSnapshot};
use crate::error::DbViewError;
use crate::external::{CompilerPool, Tenant};
use crate::lru::Lru;
use crate::metrics::MetricsSink;
use crate::unit::{CacheState, FuncCacheGate, QueryUnitGroup};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// FIFO-ordered record of entries promoted into the pending-function-cache
/// map once persistence completes while a transaction is active (§4.3
/// invariants, tx-sequencing).
#[derive(Default)]
struct PendingFunctionCache {
    order: Vec<u64>,
    tx_seq_id: HashMap<u64, u64>,
}

impl PendingFunctionCache {
    fn push(&mut self, key: u64, tx_seq_id: u64) {
        if !self.tx_seq_id.contains_key(&key) {
            self.order.push(key);
        }
        self.tx_seq_id.insert(key, tx_seq_id);
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn remove(&mut self, key: u64) {
        self.tx_seq_id.remove(&key);
        self.order.retain(|k| *k != key);
    }
}

struct PersistJob {
    key: u64,
}

/// Interior mutable state of a `Branch`, guarded by a single mutex. Never
/// held across an `.await` — §5's single-threaded-cooperative assumption
/// means this is a soundness requirement on multi-threaded `tokio`
/// runtimes, not just a style preference (§9 design note).
struct BranchState {
    version: u64,
    user_schema_pickle: Vec<u8>,
    global_schema_pickle: Vec<u8>,
    schema_version: Uuid,
    db_config: ConfigSnapshot,
    reflection_cache: Vec<u8>,
    type_id_to_oid: HashMap<Uuid, (u32, u8)>,
    oid_to_type_id: HashMap<u32, Uuid>,
    extensions: HashSet<String>,
    features: HashSet<String>,
    user_config_spec: ChainedSpec,
    compiled_query_lru: Lru<u64, (crate::request::CompilationRequest, QueryUnitGroup)>,
    compiled_sql_lru: Lru<u64, (QueryUnitGroup, Uuid)>,
    query_cache_capacity: usize,
    sql_cache_capacity: usize,
    pending_function_cache: PendingFunctionCache,
    tx_seq: u64,
    active_tx: BTreeSet<u64>,
    state_serializers: HashMap<(u16, u16), Arc<dyn crate::external::StateSerializer>>,
}

/// A named, isolated schema within a server instance.
pub struct Branch {
    pub name: String,
    state: Mutex<BranchState>,
    compile_locks: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<()>>>>,
    persist_tx: mpsc::UnboundedSender<PersistJob>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    views: Mutex<Vec<Weak<crate::session::SessionViewInner>>>,
    tenant: Arc<dyn Tenant>,
    compiler: Arc<dyn CompilerPool>,
    metrics: MetricsSink,
    read_only: bool,
}

impl Branch {
    /// Create a branch and spawn its background persistence worker and
    /// notifier. Called by `BranchIndex::register_db`.
    pub fn new(
        name: impl Into<String>,
        user_schema_pickle: Vec<u8>,
        schema_version: Uuid,
        db_config: ConfigSnapshot,
        tenant: Arc<dyn Tenant>,
        compiler: Arc<dyn CompilerPool>,
        metrics: MetricsSink,
        query_cache_capacity: usize,
        sql_cache_capacity: usize,
        read_only: bool,
    ) -> Arc<Self> {
        let name = name.into();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let branch = Arc::new(Branch {
            name: name.clone(),
            state: Mutex::new(BranchState {
                version: 0,
                user_schema_pickle,
                global_schema_pickle: Vec::new(),
                schema_version,
                db_config,
                reflection_cache: Vec::new(),
                type_id_to_oid: HashMap::new(),
                oid_to_type_id: HashMap::new(),
                extensions: HashSet::new(),
                features: HashSet::new(),
                user_config_spec: ChainedSpec::default(),
                compiled_query_lru: Lru::new(query_cache_capacity),
                compiled_sql_lru: Lru::new(sql_cache_capacity),
                query_cache_capacity,
                sql_cache_capacity,
                pending_function_cache: PendingFunctionCache::default(),
                tx_seq: 0,
                active_tx: BTreeSet::new(),
                state_serializers: HashMap::new(),
            }),
            compile_locks: Mutex::new(HashMap::new()),
            persist_tx,
            tasks: Mutex::new(Vec::new()),
            views: Mutex::new(Vec::new()),
            tenant: tenant.clone(),
            compiler,
            metrics: metrics.clone(),
            read_only,
        });

        let worker = tokio::spawn(worker::run(branch.clone(), persist_rx, notify_tx, tenant.clone(), metrics.clone()));
        let notifier = tokio::spawn(worker::run_notifier(name, notify_rx, tenant, metrics));
        branch.tasks.lock().extend([worker, notifier]);

        branch
    }

    /// Cancel the background tasks. Called by `BranchIndex::unregister_db`.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn schema_version(&self) -> Uuid {
        self.state.lock().schema_version
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn db_config(&self) -> ConfigSnapshot {
        self.state.lock().db_config.clone()
    }

    pub fn set_db_config(&self, config: ConfigSnapshot) {
        self.state.lock().db_config = config;
    }

    pub fn user_config_spec(&self) -> ChainedSpec {
        self.state.lock().user_config_spec.clone()
    }

    pub fn user_schema_pickle(&self) -> Vec<u8> {
        self.state.lock().user_schema_pickle.clone()
    }

    pub fn global_schema_pickle(&self) -> Vec<u8> {
        self.state.lock().global_schema_pickle.clone()
    }

    pub fn reflection_cache(&self) -> Vec<u8> {
        self.state.lock().reflection_cache.clone()
    }

    pub fn backend_oid_to_id(&self, oid: u32) -> Option<Uuid> {
        self.state.lock().oid_to_type_id.get(&oid).copied()
    }

    pub fn compiler(&self) -> Arc<dyn CompilerPool> {
        self.compiler.clone()
    }

    pub fn tenant(&self) -> Arc<dyn Tenant> {
        self.tenant.clone()
    }

    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    // -- views (weak back-references, §9 design note) -----------------

    pub(crate) fn track_view(&self, view: &Arc<crate::session::SessionViewInner>) {
        self.views.lock().push(Arc::downgrade(view));
    }

    pub fn remove_view(&self, view: &crate::session::SessionView) {
        let ptr = view.id();
        self.views.lock().retain(|w| w.upgrade().map(|v| v.id) != Some(ptr));
    }

    /// Number of live views, for shutdown/metrics enumeration.
    pub fn live_view_count(&self) -> usize {
        let mut views = self.views.lock();
        views.retain(|w| w.strong_count() > 0);
        views.len()
    }

    // -- compiled-query cache ------------------------------------------

    /// Look up a compiled group by fingerprint, without mutating its tx gating.
    pub fn lookup_compiled_query(&self, fingerprint: u64) -> Option<QueryUnitGroup> {
        self.state.lock().compiled_query_lru.get(&fingerprint).map(|(_, g)| g.clone())
    }

    /// Cache insertion protocol (§4.3): if already present, do nothing;
    /// otherwise insert and enqueue onto the persistence queue. The
    /// originating request is kept alongside the compiled group so the
    /// recompile sweep (§4.4 step 7) can re-invoke the compiler against the
    /// same source without the frontend having to resubmit it.
    pub fn insert_compiled_query(&self, fingerprint: u64, request: crate::request::CompilationRequest, group: QueryUnitGroup) {
        let mut state = self.state.lock();
        if state.compiled_query_lru.contains(&fingerprint) {
            return;
        }
        state.compiled_query_lru.put(fingerprint, (request, group));
        drop(state);
        let _ = self.persist_tx.send(PersistJob { key: fingerprint });
    }

    /// Cached entries, most-recently-used first, paired with the schema
    /// version they were compiled against. Used by the recompile sweep
    /// (§4.4 step 7) to find entries made stale by a DDL commit.
    pub fn cached_entries_most_recent_first(&self) -> Vec<(u64, Uuid)> {
        let state = self.state.lock();
        let mut out: Vec<(u64, Uuid)> = state.compiled_query_lru.iter().map(|(k, (_, g))| (*k, g.schema_version)).collect();
        let order: HashMap<u64, usize> = state
            .compiled_query_lru
            .keys_most_recent_first()
            .enumerate()
            .map(|(i, k)| (*k, i))
            .collect();
        out.sort_by_key(|(k, _)| order.get(k).copied().unwrap_or(usize::MAX));
        out
    }

    /// Originating requests for entries compiled against `schema_version`,
    /// most-recently-used first, bounded to `limit` candidates. Feeds the
    /// recompile sweep: each returned request can be handed straight to the
    /// compiler without the frontend resubmitting source text (§4.4 step 7).
    pub fn cache_candidates_with_schema_version(&self, schema_version: Uuid, limit: usize) -> Vec<crate::request::CompilationRequest> {
        let state = self.state.lock();
        let keys: Vec<u64> = state.compiled_query_lru.keys_most_recent_first().copied().collect();
        keys.into_iter()
            .filter_map(|k| state.compiled_query_lru.peek(&k))
            .filter(|(_, g)| g.schema_version == schema_version)
            .map(|(r, _)| r.clone())
            .take(limit)
            .collect()
    }

    // -- compiled-SQL cache ----------------------------------------------

    pub fn cache_compiled_sql(&self, key: u64, group: QueryUnitGroup, schema_version: Uuid) {
        self.state.lock().compiled_sql_lru.put(key, (group, schema_version));
    }

    /// Lookups fail if the stored schema_version does not equal the
    /// current one, even if present (§4.3).
    pub fn lookup_compiled_sql(&self, key: u64) -> Option<QueryUnitGroup> {
        let mut state = self.state.lock();
        let current = state.schema_version;
        match state.compiled_sql_lru.get(&key) {
            Some((group, sv)) if *sv == current => Some(group.clone()),
            _ => None,
        }
    }

    // -- hydrate from persisted storage ---------------------------------

    /// On startup, attempt to deserialize each persisted `(in_data,
    /// out_data)` pair; on failure skip and log. Respects active-tx rules
    /// by tagging with the current `tx_seq` if any tx is active (§4.3).
    pub fn hydrate_cache(&self, entries: Vec<(Vec<u8>, Vec<u8>)>, compilation_config_serializer_id: u32) {
        let mut skipped = 0usize;
        let mut state = self.state.lock();
        for (in_data, out_data) in entries {
            let request = match crate::request::CompilationRequest::deserialize(&in_data, compilation_config_serializer_id) {
                Ok(r) => r,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let unit: crate::unit::QueryUnit = match bincode::deserialize(&out_data) {
                Ok(u) => u,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let mut group = QueryUnitGroup::single(unit, request.schema_version());
            group.set_cache_state(CacheState::Present);
            let key = request.fingerprint();
            if !state.active_tx.is_empty() {
                group.func_cache_gate = FuncCacheGate::Gated(state.tx_seq);
                state.pending_function_cache.push(key, state.tx_seq);
            } else {
                group.func_cache_gate = FuncCacheGate::Enabled;
            }
            state.compiled_query_lru.put(key, (request, group));
        }
        if skipped > 0 {
            tracing::warn!(branch = %self.name, skipped, "hydrate_cache: skipped undecodable persisted entries");
        }
    }

    // -- state serializers ------------------------------------------------

    pub fn get_state_serializer(&self, protocol_version: (u16, u16)) -> Option<Arc<dyn crate::external::StateSerializer>> {
        self.state.lock().state_serializers.get(&protocol_version).cloned()
    }

    /// If the new serializer's type-id equals an existing one, keep the
    /// old instance (pointer-equality matters for downstream caching). On
    /// install, drop serializers for *other* protocol versions.
    pub fn set_state_serializer(&self, protocol_version: (u16, u16), serializer: Arc<dyn crate::external::StateSerializer>) -> Arc<dyn crate::external::StateSerializer> {
        let mut state = self.state.lock();
        let installed = match state.state_serializers.get(&protocol_version) {
            Some(existing) if existing.type_id() == serializer.type_id() => existing.clone(),
            _ => serializer,
        };
        state.state_serializers.retain(|k, _| *k == protocol_version);
        state.state_serializers.insert(protocol_version, installed.clone());
        installed
    }

    // -- schema changes ----------------------------------------------------

    /// Atomically swap schema, bump `version`, replace the user config
    /// spec, rebuild the feature-used metric deltas, and invalidate both
    /// LRUs (§4.3).
    #[allow(clippy::too_many_arguments)]
    pub fn set_and_signal_new_user_schema(
        &self,
        new_pickle: Vec<u8>,
        schema_version: Uuid,
        extensions: HashSet<String>,
        features: HashSet<String>,
        user_config_spec: ChainedSpec,
        reflection_cache: Option<Vec<u8>>,
        backend_ids: Option<HashMap<Uuid, (u32, u8)>>,
        db_config: Option<ConfigSnapshot>,
    ) {
        let mut state = self.state.lock();

        for added in extensions.difference(&state.extensions) {
            self.metrics.extension_used(added, true);
        }
        for removed in state.extensions.difference(&extensions) {
            self.metrics.extension_used(removed, false);
        }

        // Incremental, not absolute: the gauge tracks how many schemas
        // across the instance use each feature, so only the delta is sent.
        for added in features.difference(&state.features) {
            self.metrics.feature_used_delta(added, 1.0);
        }
        for removed in state.features.difference(&features) {
            self.metrics.feature_used_delta(removed, -1.0);
        }

        state.user_schema_pickle = new_pickle;
        state.schema_version = schema_version;
        state.version += 1;
        state.extensions = extensions;
        state.features = features;
        state.user_config_spec = user_config_spec;
        if let Some(rc) = reflection_cache {
            state.reflection_cache = rc;
        }
        if let Some(ids) = backend_ids {
            state.oid_to_type_id = ids.iter().map(|(tid, (oid, _))| (*oid, *tid)).collect();
            state.type_id_to_oid = ids;
        }
        if let Some(cfg) = db_config {
            state.db_config = cfg;
        }

        state.compiled_query_lru = Lru::new(state.query_cache_capacity);
        state.compiled_sql_lru = Lru::new(state.sql_cache_capacity);
    }

    pub fn update_global_schema(&self, pickle: Vec<u8>) {
        self.state.lock().global_schema_pickle = pickle;
    }

    // -- transaction sequencing (§4.3) ------------------------------------

    pub fn tx_seq_begin_tx(&self) -> u64 {
        let mut state = self.state.lock();
        state.tx_seq += 1;
        let seq = state.tx_seq;
        state.active_tx.insert(seq);
        seq
    }

    /// Removes `seq` from the active set, then promotes pending-function-cache
    /// entries per the ordering rule in §4.3: this guarantees no in-flight
    /// transaction ever observes a function-cache variant it could not have
    /// seen at its own start.
    pub fn tx_seq_end_tx(&self, seq: u64) {
        let mut state = self.state.lock();
        state.active_tx.remove(&seq);

        if state.pending_function_cache.is_empty() {
            return;
        }

        if state.active_tx.is_empty() {
            let order = std::mem::take(&mut state.pending_function_cache.order);
            state.pending_function_cache.tx_seq_id.clear();
            for key in order {
                if let Some((request, group)) = state.compiled_query_lru.get(&key) {
                    let (request, mut group) = (request.clone(), group.clone());
                    group.func_cache_gate = FuncCacheGate::Enabled;
                    state.compiled_query_lru.put(key, (request, group));
                }
            }
            return;
        }

        let oldest = *state.active_tx.iter().next().unwrap();
        let order = state.pending_function_cache.order.clone();
        for key in order {
            let tx_seq_id = *state.pending_function_cache.tx_seq_id.get(&key).unwrap();
            if tx_seq_id >= oldest {
                break;
            }
            if let Some((request, group)) = state.compiled_query_lru.get(&key) {
                let (request, mut group) = (request.clone(), group.clone());
                group.func_cache_gate = FuncCacheGate::Enabled;
                state.compiled_query_lru.put(key, (request, group));
            }
            state.pending_function_cache.remove(key);
        }
    }

    pub fn tx_seq(&self) -> u64 {
        self.state.lock().tx_seq
    }

    // -- compile locks (§5 "Shared-resource policy") ----------------------

    /// Acquire the per-fingerprint compile lock, creating it if absent.
    /// Stale entries (no other waiter holds a clone) are swept on each call
    /// so the table doesn't grow without bound.
    pub async fn acquire_compile_lock(self: &Arc<Self>, fingerprint: u64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.compile_locks.lock();
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(fingerprint).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

mod worker {
    use super::*;
    use crate::metrics::MetricsSink;

    pub(super) async fn run(
        branch: Arc<Branch>,
        mut persist_rx: mpsc::UnboundedReceiver<PersistJob>,
        notify_tx: mpsc::UnboundedSender<String>,
        tenant: Arc<dyn Tenant>,
        metrics: MetricsSink,
    ) {
        loop {
            // Step 1-2: evict until the compiled-query LRU no longer overflows.
            let mut evicted_keys = Vec::new();
            loop {
                let popped = {
                    let mut state = branch.state.lock();
                    if state.compiled_query_lru.needs_cleanup() {
                        state.compiled_query_lru.cleanup_one()
                    } else {
                        None
                    }
                };
                match popped {
                    Some((key, (_, group))) => {
                        if group.is_single_unit() && matches!(group.cache_state, CacheState::Present) {
                            evicted_keys.push(key.to_string());
                        }
                    }
                    None => break,
                }
            }
            if !evicted_keys.is_empty() {
                if let Err(e) = tenant.evict_query_cache(&branch.name, &evicted_keys).await {
                    tracing::warn!(branch = %branch.name, error = %e, "failed to evict backend cache keys");
                    metrics.background_error("persistence-worker");
                }
            }

            // Step 3: block on the persistence queue, then drain greedily.
            let first = match persist_rx.recv().await {
                Some(job) => job,
                None => break,
            };
            let mut batch = vec![first];
            while let Ok(job) = persist_rx.try_recv() {
                batch.push(job);
            }

            let filtered: Vec<u64> = {
                let state = branch.state.lock();
                batch
                    .into_iter()
                    .map(|j| j.key)
                    .filter(|key| {
                        state
                            .compiled_query_lru
                            .peek(key)
                            .map(|(_, g)| g.is_single_unit() && g.first().map(|u| u.has_cache_sql()).unwrap_or(false) && matches!(g.cache_state, CacheState::Pending))
                            .unwrap_or(false)
                    })
                    .collect()
            };
            if filtered.is_empty() {
                continue;
            }

            // Step 4: combined persistence transaction against a scoped connection.
            let combined: Vec<u8> = filtered.iter().flat_map(|k| k.to_be_bytes()).collect();
            let guard = match tenant.acquire_backend_connection(&branch.name).await {
                Ok(g) => g,
                Err(e) => {
                    tracing::warn!(branch = %branch.name, error = %e, "failed to acquire backend connection for persistence");
                    metrics.background_error("persistence-worker");
                    continue;
                }
            };
            if let Err(e) = guard.conn().sql_execute(&combined).await {
                tracing::warn!(branch = %branch.name, error = %e, "persistence batch failed, entries remain pending");
                metrics.background_error("persistence-worker");
                continue;
            }
            drop(guard);

            // Step 5: flip entries to Present, gate on active transactions.
            let mut state = branch.state.lock();
            let active = !state.active_tx.is_empty();
            let tx_seq = state.tx_seq;
            for key in filtered {
                if let Some((request, group)) = state.compiled_query_lru.get(&key) {
                    let (request, mut group) = (request.clone(), group.clone());
                    group.set_cache_state(CacheState::Present);
                    if active {
                        group.func_cache_gate = FuncCacheGate::Gated(tx_seq);
                        state.pending_function_cache.push(key, tx_seq);
                    } else {
                        group.func_cache_gate = FuncCacheGate::Enabled;
                    }
                    state.compiled_query_lru.put(key, (request, group));
                }
                let _ = notify_tx.send(key.to_string());
            }
        }
    }

    /// Debounces the notification queue: `max_wait=1s`, `delay=0.2s`,
    /// `max_batch=100` (§4.3 "Notifier").
    pub(super) async fn run_notifier(branch_name: String, mut rx: mpsc::UnboundedReceiver<String>, tenant: Arc<dyn Tenant>, metrics: MetricsSink) {
        const MAX_WAIT: Duration = Duration::from_secs(1);
        const DELAY: Duration = Duration::from_millis(200);
        const MAX_BATCH: usize = 100;

        loop {
            let first = match rx.recv().await {
                Some(k) => k,
                None => break,
            };
            let mut batch = vec![first];
            let deadline = Instant::now() + MAX_WAIT;

            loop {
                if batch.len() >= MAX_BATCH {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(DELAY.min(remaining), rx.recv()).await {
                    Ok(Some(k)) => batch.push(k),
                    Ok(None) => break,
                    Err(_) => break,
                }
            }

            tenant.signal_sysevent("query-cache-changes", &branch_name, &batch).await;
            let _ = &metrics;
        }
    }
}
