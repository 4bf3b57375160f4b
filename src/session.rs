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

//! `SessionView`: per-connection state layering module aliases, session
//! config, globals, and the transactional overlay on top of a branch.
//! Drives `parse()`, the central compile/lookup entry point (spec §4.4).

use crate::branch::Branch;
use crate::config::{ChainedSpec, ConfigOp, ConfigScope, ConfigSnapshot, RebuildCacheConfig};
use crate::error::DbViewError;
use crate::external::{BackendConnection, CompilerTxState, StateSerializer};
use crate::request::{CompilationRequest, InputLanguage};
use crate::unit::{Capabilities, FuncCacheGate, QueryUnit, QueryUnitGroup, SideEffectNotifications};
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// The three transaction states from §4.4's "Transaction state machine".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotInTx,
    InTx,
    InTxError,
}

/// A named rollback point (§4.4 "Savepoints").
struct Savepoint {
    name: String,
    savepoint_id: u64,
    modaliases: BTreeMap<String, String>,
    config: ConfigSnapshot,
    globals: BTreeMap<String, Json>,
    state_serializer: Option<Arc<dyn StateSerializer>>,
}

/// The transactional overlay: snapshotted on `BEGIN`, published on commit,
/// discarded on rollback (§4.4).
struct TxOverlay {
    tx_id: u64,
    error: bool,
    in_tx_with_ddl: bool,
    has_set: bool,
    system_config: bool,
    database_config: bool,
    modaliases: BTreeMap<String, String>,
    config: ConfigSnapshot,
    globals: BTreeMap<String, Json>,
    db_config: ConfigSnapshot,
    user_schema_pickle: Vec<u8>,
    global_schema_pickle: Vec<u8>,
    user_config_spec: ChainedSpec,
    state_serializer: Option<Arc<dyn StateSerializer>>,
    branch_version_at_start: u64,
    compiler_state: CompilerTxState,
    savepoints: Vec<Savepoint>,
    next_savepoint_id: u64,
}

/// A one-entry cache for `encode_state`: identical repeated encodes of the
/// same (modaliases, config, globals, type_id) tuple are free (§4.4).
struct EncodeCacheEntry {
    modaliases: BTreeMap<String, String>,
    config: ConfigSnapshot,
    globals: BTreeMap<String, Json>,
    type_id: Uuid,
    bytes: Vec<u8>,
}

struct SessionMutable {
    modaliases: BTreeMap<String, String>,
    config: ConfigSnapshot,
    globals: BTreeMap<String, Json>,
    db_config_overlay: Option<ConfigSnapshot>,
    state_serializer: Option<Arc<dyn StateSerializer>>,
    tx: Option<TxOverlay>,
    defaults_modaliases: BTreeMap<String, String>,
    defaults_config: ConfigSnapshot,
    defaults_globals: BTreeMap<String, Json>,
    ever_non_default: bool,
    encode_cache: Option<EncodeCacheEntry>,
    last_state_descriptor: Option<Vec<u8>>,
}

/// Inner, `Arc`-shared state. `Branch` keeps only a `Weak` reference to
/// this, so ownership runs view → branch, never the reverse (§9 design note).
pub struct SessionViewInner {
    pub(crate) id: u64,
    branch: Arc<Branch>,
    protocol_version: (u16, u16),
    capability_mask: Capabilities,
    query_cache_enabled: bool,
    instance_config_sink: Option<Arc<dyn Fn(ConfigOp) -> Pin<Box<dyn Future<Output = Result<(), DbViewError>> + Send>> + Send + Sync>>,
    state: Mutex<SessionMutable>,
}

/// A connection's view onto a branch. Cloning shares the same underlying
/// state (it's a handle, like `Arc`); dropping the last clone releases the
/// weak back-reference held by the branch.
#[derive(Clone)]
pub struct SessionView(Arc<SessionViewInner>);

/// The result handed back to the frontend from `parse`.
pub struct CompiledQuery {
    pub group: QueryUnitGroup,
    /// True if the frontend should execute the unit's `cache_sql` variant
    /// instead of its inline `sql` (§4.4 fast path).
    pub use_pending_func_cache: bool,
    /// Entries opportunistically recompiled in the background after a DDL
    /// commit, for the frontend to install into the new schema's cache
    /// (§4.4 step 7).
    pub recompiled: Vec<(CompilationRequest, QueryUnitGroup)>,
}

impl SessionView {
    pub(crate) fn new(
        branch: Arc<Branch>,
        query_cache_enabled: bool,
        protocol_version: (u16, u16),
        capability_mask: Capabilities,
        instance_config_sink: Option<Arc<dyn Fn(ConfigOp) -> Pin<Box<dyn Future<Output = Result<(), DbViewError>> + Send>> + Send + Sync>>,
    ) -> Self {
        let inner = Arc::new(SessionViewInner {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            branch: branch.clone(),
            protocol_version,
            capability_mask,
            query_cache_enabled,
            instance_config_sink,
            state: Mutex::new(SessionMutable {
                modaliases: BTreeMap::new(),
                config: ConfigSnapshot::new(),
                globals: BTreeMap::new(),
                db_config_overlay: None,
                state_serializer: None,
                tx: None,
                defaults_modaliases: BTreeMap::new(),
                defaults_config: ConfigSnapshot::new(),
                defaults_globals: BTreeMap::new(),
                ever_non_default: false,
                encode_cache: None,
                last_state_descriptor: None,
            }),
        });
        branch.track_view(&inner);
        SessionView(inner)
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn branch(&self) -> &Arc<Branch> {
        &self.0.branch
    }

    pub fn protocol_version(&self) -> (u16, u16) {
        self.0.protocol_version
    }

    // -- tx state ----------------------------------------------------------

    pub fn tx_state(&self) -> TxState {
        match &self.0.state.lock().tx {
            None => TxState::NotInTx,
            Some(tx) if tx.error => TxState::InTxError,
            Some(_) => TxState::InTx,
        }
    }

    fn in_tx_with_ddl(&self) -> bool {
        self.0.state.lock().tx.as_ref().map(|tx| tx.in_tx_with_ddl).unwrap_or(false)
    }

    fn current_tx_id(&self) -> Option<u64> {
        self.0.state.lock().tx.as_ref().map(|tx| tx.tx_id)
    }

    // -- modaliases / config / globals accessors ----------------------------

    pub fn modaliases(&self) -> BTreeMap<String, String> {
        self.0.state.lock().modaliases.clone()
    }

    pub fn set_modaliases(&self, m: BTreeMap<String, String>) {
        let mut state = self.0.state.lock();
        if let Some(tx) = state.tx.as_mut() {
            tx.modaliases = m;
        } else {
            state.modaliases = m;
        }
    }

    pub fn session_config(&self) -> ConfigSnapshot {
        self.0.state.lock().config.clone()
    }

    pub fn globals(&self) -> BTreeMap<String, Json> {
        self.0.state.lock().globals.clone()
    }

    pub fn set_global(&self, name: String, value: Json) {
        let value = recode_global(value);
        let mut state = self.0.state.lock();
        if let Some(tx) = state.tx.as_mut() {
            tx.globals.insert(name, value);
        } else {
            state.globals.insert(name, value);
        }
    }

    pub fn database_config(&self) -> ConfigSnapshot {
        let state = self.0.state.lock();
        if let Some(tx) = &state.tx {
            tx.db_config.clone()
        } else {
            state.db_config_overlay.clone().unwrap_or_else(|| self.0.branch.db_config())
        }
    }

    pub fn state_serializer(&self) -> Option<Arc<dyn StateSerializer>> {
        self.0.state.lock().state_serializer.clone()
    }

    pub fn set_state_serializer(&self, serializer: Arc<dyn StateSerializer>) {
        self.0.state.lock().state_serializer = Some(serializer);
    }

    // -- savepoints (§4.4) ---------------------------------------------------

    pub fn declare_savepoint(&self, name: impl Into<String>, spid: u64) -> Result<(), DbViewError> {
        let mut state = self.0.state.lock();
        let tx = state.tx.as_mut().ok_or(DbViewError::Transaction)?;
        tx.savepoints.push(Savepoint {
            name: name.into(),
            savepoint_id: spid,
            modaliases: tx.modaliases.clone(),
            config: tx.config.clone(),
            globals: tx.globals.clone(),
            state_serializer: state.state_serializer.clone(),
        });
        Ok(())
    }

    pub fn rollback_tx_to_savepoint(&self, name: &str) -> Result<(), DbViewError> {
        let mut state = self.0.state.lock();
        let tx = state.tx.as_mut().ok_or(DbViewError::Transaction)?;
        let pos = tx
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| DbViewError::UnknownSavepoint(name.to_string()))?;
        let sp = &tx.savepoints[pos];
        tx.modaliases = sp.modaliases.clone();
        tx.config = sp.config.clone();
        tx.globals = sp.globals.clone();
        let serializer = sp.state_serializer.clone();
        tx.savepoints.truncate(pos + 1);
        tx.error = false;
        drop(tx);
        state.state_serializer = serializer;
        Ok(())
    }

    // -- capability enforcement (§4.4) ---------------------------------------

    fn check_capabilities(&self, group: &QueryUnitGroup, allow_capabilities: Capabilities) -> Result<(), DbViewError> {
        let extra = group.capabilities & !self.0.capability_mask;
        if !extra.is_empty() {
            return Err(DbViewError::UnsupportedCapability(format!("{extra:?}")));
        }
        let disallowed = group.capabilities & !allow_capabilities;
        if !disallowed.is_empty() {
            return Err(DbViewError::DisabledCapability(format!("{disallowed:?}")));
        }
        if self.0.branch.read_only() && group.capabilities.contains(Capabilities::MODIFICATIONS) {
            let reason = self.0.branch.tenant().get_readiness_reason().unwrap_or_else(|| "instance is read-only".to_string());
            return Err(DbViewError::DisabledCapability(reason));
        }
        Ok(())
    }

    fn check_in_tx_error_gate(&self, group: &QueryUnitGroup) -> Result<(), DbViewError> {
        if self.tx_state() != TxState::InTxError {
            return Ok(());
        }
        if group.units.len() != 1 {
            return Err(DbViewError::Transaction);
        }
        let u = &group.units[0];
        let allowed = u.side_effects.tx_rollback || u.side_effects.tx_savepoint_rollback || u.side_effects.tx_abort_migration;
        if allowed {
            Ok(())
        } else {
            Err(DbViewError::Transaction)
        }
    }

    // -- parse() (§4.4 "Parse algorithm") ------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn parse(
        &self,
        mut request: CompilationRequest,
        raw_text: &str,
        cached_globally: bool,
        use_metrics: bool,
        allow_capabilities: Capabilities,
        backend_conn: Option<&dyn BackendConnection>,
    ) -> Result<CompiledQuery, DbViewError> {
        let branch = self.0.branch.clone();
        let metrics = branch.metrics().clone();

        // Step 1: fast path lookup.
        if self.0.query_cache_enabled {
            let lookup_allowed = !(self.tx_state() == TxState::InTxError) && !(self.in_tx_with_ddl() && !cached_globally);
            if lookup_allowed {
                let hit = if cached_globally {
                    None // no server-wide system cache wired into this session; branch cache only.
                } else {
                    branch.lookup_compiled_query(request.fingerprint())
                };
                if let Some(group) = hit {
                    self.check_in_tx_error_gate(&group)?;
                    if use_metrics {
                        metrics.query_compilation(crate::metrics::CompilationSource::Cache);
                    }
                    let use_pending_func_cache = self.use_pending_func_cache(&group);
                    return Ok(CompiledQuery {
                        group,
                        use_pending_func_cache,
                        recompiled: Vec::new(),
                    });
                }
            }
        }

        // Step 2: miss path — acquire the per-fingerprint compile lock,
        // retrying if the schema version advances while we wait.
        let _guard = loop {
            let schema_before = branch.schema_version();
            let guard = branch.acquire_compile_lock(request.fingerprint()).await;
            if branch.schema_version() == schema_before {
                break guard;
            }
            drop(guard);
            request.set_schema_version(branch.schema_version());
        };

        // Recheck the cache now that we hold the lock.
        if self.0.query_cache_enabled && !cached_globally {
            if let Some(group) = branch.lookup_compiled_query(request.fingerprint()) {
                self.check_in_tx_error_gate(&group)?;
                let use_pending_func_cache = self.use_pending_func_cache(&group);
                return Ok(CompiledQuery {
                    group,
                    use_pending_func_cache,
                    recompiled: Vec::new(),
                });
            }
        }

        // Step 3: invoke the compiler pool.
        let started = Instant::now();
        let compile_result = self.invoke_compiler(&branch, &request, raw_text).await;
        if use_metrics {
            metrics.edgeql_compilation_duration(started.elapsed());
            metrics.query_compilation_duration(
                match request.input_language() {
                    InputLanguage::EdgeQL => "edgeql",
                    InputLanguage::Sql => "sql",
                },
                started.elapsed(),
            );
        }
        let (mut group, tx_state) = match compile_result {
            Ok(v) => v,
            Err(e) => return Err(self.wrap_tx_error(e)),
        };
        if let Some(tx) = self.0.state.lock().tx.as_mut() {
            tx.compiler_state = tx_state;
        }

        // Step 4: capability + in-tx-error checks.
        if let Err(e) = self.check_capabilities(&group, allow_capabilities) {
            return Err(self.wrap_tx_error(e));
        }
        if let Err(e) = self.check_in_tx_error_gate(&group) {
            return Err(e);
        }

        // Step 5: SQL input language handling.
        if request.input_language() == InputLanguage::Sql {
            if !group.is_single_unit() {
                return Err(DbViewError::UnsupportedFeature("multi-statement SQL scripts are not supported".into()));
            }
            let conn = backend_conn.ok_or_else(|| DbViewError::UnsupportedFeature("SQL describe requires a backend connection".into()))?;
            for unit in group.units.iter_mut() {
                let sql_text = String::from_utf8_lossy(&unit.sql).into_owned();
                let (param_oids, out_cols) = match conn.sql_describe(&sql_text, &[]).await {
                    Ok(v) => v,
                    // Adjust the backend-reported position (in generated-SQL
                    // coordinates) back into the client's original text.
                    Err(DbViewError::FromSql { message, position }) => {
                        let position = position.map(|p| p - unit.sql_prefix_len as i64);
                        return Err(DbViewError::FromSql { message, position });
                    }
                    Err(e) => return Err(e),
                };
                for (idx, oid) in param_oids.iter().enumerate() {
                    if branch.backend_oid_to_id(*oid).is_none() {
                        return Err(DbViewError::from_sql_describe(format!("unknown type oid for parameter ${}", idx + 1), None));
                    }
                }
                for col in &out_cols {
                    if branch.backend_oid_to_id(col.type_oid).is_none() {
                        return Err(DbViewError::from_sql_describe(format!("unknown type oid for column {}", col.name), None));
                    }
                }
                let descriptors = branch
                    .compiler()
                    .compile_descriptors(&branch.name, &param_oids, &out_cols.iter().map(|c| (c.name.clone(), c.type_oid)).collect::<Vec<_>>())
                    .await?;
                unit.in_type_desc = descriptors.in_type_desc;
                unit.out_type_desc = descriptors.out_type_desc;
            }
        }

        // Step 6: insert into cache under the still-held lock.
        if group.cacheable {
            group.schema_version = branch.schema_version();
            branch.insert_compiled_query(request.fingerprint(), request.clone(), group.clone());
        }
        drop(_guard);

        if use_metrics {
            metrics.query_compilation(crate::metrics::CompilationSource::Compiler);
        }

        // Step 7: opportunistic background recompile after a DDL commit.
        let recompiled = if group.units.iter().any(|u| u.side_effects.has_ddl) {
            let cfg = RebuildCacheConfig::from_snapshot(&self.database_config());
            if cfg.auto_rebuild_query_cache {
                self.recompile_cached_queries_bounded(&branch, cfg.auto_rebuild_query_cache_timeout).await
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        Ok(CompiledQuery {
            group,
            use_pending_func_cache: false,
            recompiled,
        })
    }

    fn use_pending_func_cache(&self, group: &QueryUnitGroup) -> bool {
        if !group.is_single_unit() {
            return false;
        }
        match group.func_cache_gate {
            FuncCacheGate::Disabled => false,
            FuncCacheGate::Enabled => true,
            FuncCacheGate::Gated(entry_seq) => match self.current_tx_id() {
                None => true,
                Some(my_seq) => my_seq > entry_seq,
            },
        }
    }

    /// Any non-syntax, non-internal-server error raised while already in
    /// `InTxError` is replaced by the canonical `TransactionError` (§4.4 step 4).
    fn wrap_tx_error(&self, e: DbViewError) -> DbViewError {
        if self.tx_state() == TxState::InTxError && !matches!(e, DbViewError::Syntax(_) | DbViewError::InternalServer(_)) {
            DbViewError::Transaction
        } else {
            e
        }
    }

    async fn invoke_compiler(
        &self,
        branch: &Arc<Branch>,
        request: &CompilationRequest,
        raw_text: &str,
    ) -> Result<(QueryUnitGroup, CompilerTxState), DbViewError> {
        let client_id = branch.tenant().client_id();
        let in_tx = self.current_tx_id();
        match in_tx {
            None => {
                branch
                    .compiler()
                    .compile(
                        &branch.name,
                        &branch.user_schema_pickle(),
                        &branch.global_schema_pickle(),
                        &branch.reflection_cache(),
                        &branch.db_config(),
                        &self.session_config(),
                        request,
                        raw_text,
                        client_id,
                    )
                    .await
            }
            Some(tx_id) => {
                let (prev_state, in_tx_error) = {
                    let state = self.0.state.lock();
                    let tx = state.tx.as_ref().unwrap();
                    (
                        CompilerTxState {
                            state_id: tx.compiler_state.state_id,
                            state_blob: tx.compiler_state.state_blob.clone(),
                        },
                        tx.error,
                    )
                };
                branch
                    .compiler()
                    .compile_in_tx(&branch.name, &branch.user_schema_pickle(), tx_id, &prev_state, request, raw_text, in_tx_error, client_id)
                    .await
            }
        }
    }

    /// Bounded-concurrency recompile sweep (§4.4 step 7). Iterates cache
    /// entries still tagged with the schema version that was current
    /// before this DDL, most-recently-used first, and recompiles each
    /// against the request's own (already up-to-date) raw text.
    async fn recompile_cached_queries_bounded(&self, branch: &Arc<Branch>, timeout: Option<Duration>) -> Vec<(CompilationRequest, QueryUnitGroup)> {
        let previous_schema_version = branch.schema_version();
        let candidates = branch.cache_candidates_with_schema_version(previous_schema_version, usize::MAX);
        if candidates.is_empty() {
            return Vec::new();
        }

        let concurrency = std::cmp::max(1, branch.compiler().get_size_hint() / 2);
        let deadline = timeout.map(|d| Instant::now() + d);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sem = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut handles = Vec::new();

        for request in candidates {
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break;
                }
            }
            let sem = sem.clone();
            let results = results.clone();
            let branch = branch.clone();
            let raw_text = request.source().to_string();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await;
                let client_id = branch.tenant().client_id();
                let compiled = branch
                    .compiler()
                    .compile(
                        &branch.name,
                        &branch.user_schema_pickle(),
                        &branch.global_schema_pickle(),
                        &branch.reflection_cache(),
                        &branch.db_config(),
                        &ConfigSnapshot::new(),
                        &request,
                        &raw_text,
                        client_id,
                    )
                    .await;
                // Failures are silently dropped (§4.4 step 7): a stale entry
                // that fails to recompile simply stays stale until the next
                // DDL sweep or a live request forces a fresh compile.
                if let Ok((group, _)) = compiled {
                    results.lock().push((request, group));
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
        Arc::try_unwrap(results).map(|m| m.into_inner()).unwrap_or_default()
    }

    /// Public form of the recompile sweep for a caller that already has the
    /// original `(request, raw_text)` pairs on hand (§4.4's public
    /// `recompile_cached_queries`).
    pub async fn recompile_cached_queries(&self, candidates: Vec<(CompilationRequest, String)>, new_schema_version: Uuid) -> Vec<(CompilationRequest, QueryUnitGroup)> {
        let branch = self.0.branch.clone();
        let mut out = Vec::new();
        for (mut request, raw_text) in candidates {
            request.set_schema_version(new_schema_version);
            if let Ok((group, _)) = self.invoke_compiler(&branch, &request, &raw_text).await {
                out.push((request, group));
            }
        }
        out
    }

    // -- start/on_success/on_error/commit (§4.4 transaction state machine) --

    pub fn start(&self, unit: &QueryUnit) -> Result<(), DbViewError> {
        self.check_unit_against_tx_error(unit)?;
        if unit.tx_id.is_some() {
            let mut state = self.0.state.lock();
            if state.tx.is_none() {
                drop(state);
                let seq = self.0.branch.tx_seq_begin_tx();
                let mut state = self.0.state.lock();
                state.tx = Some(TxOverlay {
                    tx_id: seq,
                    error: false,
                    in_tx_with_ddl: false,
                    has_set: false,
                    system_config: false,
                    database_config: false,
                    modaliases: state.modaliases.clone(),
                    config: state.config.clone(),
                    globals: state.globals.clone(),
                    db_config: self.0.branch.db_config(),
                    user_schema_pickle: self.0.branch.user_schema_pickle(),
                    global_schema_pickle: self.0.branch.global_schema_pickle(),
                    user_config_spec: self.0.branch.user_config_spec(),
                    state_serializer: state.state_serializer.clone(),
                    branch_version_at_start: self.0.branch.version(),
                    compiler_state: CompilerTxState::default(),
                    savepoints: Vec::new(),
                    next_savepoint_id: 1,
                });
            }
        }
        self.apply_unit_flags(unit);
        Ok(())
    }

    pub fn start_implicit(&self, unit: &QueryUnit) -> Result<(), DbViewError> {
        self.check_unit_against_tx_error(unit)
    }

    fn check_unit_against_tx_error(&self, unit: &QueryUnit) -> Result<(), DbViewError> {
        if self.tx_state() != TxState::InTxError {
            return Ok(());
        }
        let allowed = unit.side_effects.tx_rollback || unit.side_effects.tx_savepoint_rollback || unit.side_effects.tx_abort_migration;
        if allowed {
            Ok(())
        } else {
            Err(DbViewError::Transaction)
        }
    }

    fn apply_unit_flags(&self, unit: &QueryUnit) {
        let mut state = self.0.state.lock();
        let Some(tx) = state.tx.as_mut() else { return };
        if unit.side_effects.has_ddl {
            tx.in_tx_with_ddl = true;
        }
        if unit.side_effects.has_set {
            tx.has_set = true;
        }
        if unit.side_effects.system_config {
            tx.system_config = true;
        }
        if unit.side_effects.database_config {
            tx.database_config = true;
        }
    }

    /// Install a new user-schema pickle/spec into the in-tx overlay only
    /// (§4.4: "Unit with user_schema in InTx → bump a private in-tx version").
    pub fn apply_in_tx_user_schema(&self, pickle: Vec<u8>, spec: ChainedSpec) {
        let mut state = self.0.state.lock();
        if let Some(tx) = state.tx.as_mut() {
            tx.user_schema_pickle = pickle;
            tx.user_config_spec = spec;
        }
    }

    pub fn on_error(&self) {
        let mut state = self.0.state.lock();
        if let Some(tx) = state.tx.as_mut() {
            tx.error = true;
        }
    }

    /// `tx_commit`: publish the overlay to the branch atomically, release
    /// the tx sequence, and compute the side-effect bitmask (§4.4).
    pub fn commit(&self) -> Result<SideEffectNotifications, DbViewError> {
        let mut state = self.0.state.lock();
        let tx = state.tx.take().ok_or(DbViewError::Transaction)?;
        drop(state);

        let notifications = SideEffectNotifications {
            schema_changes: tx.branch_version_at_start != self.0.branch.version() || !tx.user_schema_pickle.is_empty(),
            instance_config_changes: tx.system_config,
            database_config_changes: tx.database_config,
            database_changes: tx.has_set,
            global_schema_changes: !tx.global_schema_pickle.is_empty(),
        };

        {
            let mut state = self.0.state.lock();
            state.modaliases = tx.modaliases;
            state.config = tx.config;
            state.globals = tx.globals;
            state.db_config_overlay = Some(tx.db_config.clone());
        }
        self.0.branch.set_db_config(tx.db_config);
        self.0.branch.tx_seq_end_tx(tx.tx_id);
        Ok(notifications)
    }

    /// `tx_rollback`: discard the overlay, release the tx sequence, no side effects.
    pub fn rollback(&self) -> Result<(), DbViewError> {
        let mut state = self.0.state.lock();
        let tx = state.tx.take().ok_or(DbViewError::Transaction)?;
        drop(state);
        self.0.branch.tx_seq_end_tx(tx.tx_id);
        Ok(())
    }

    /// Behaves as `tx_commit` but for a statement executed outside an
    /// explicit transaction (§4.4 "Implicit commit").
    pub fn commit_implicit_tx(&self, unit: &QueryUnit) -> SideEffectNotifications {
        SideEffectNotifications {
            schema_changes: unit.side_effects.has_ddl || unit.side_effects.user_schema_update,
            instance_config_changes: unit.side_effects.system_config,
            database_config_changes: unit.side_effects.database_config,
            database_changes: unit.side_effects.create_db || unit.side_effects.drop_db,
            global_schema_changes: unit.side_effects.global_schema_update,
        }
    }

    // -- state encoding (§4.4 "State encoding") ------------------------------

    pub fn is_state_default(&self) -> bool {
        let state = self.0.state.lock();
        state.modaliases == state.defaults_modaliases && state.config == state.defaults_config && state.globals == state.defaults_globals
    }

    pub fn encode_state(&self) -> Result<(Uuid, Vec<u8>), DbViewError> {
        let mut state = self.0.state.lock();
        let is_default = state.modaliases == state.defaults_modaliases && state.config == state.defaults_config && state.globals == state.defaults_globals;
        if is_default && !state.ever_non_default {
            return Ok((Uuid::nil(), Vec::new()));
        }
        if !is_default {
            state.ever_non_default = true;
        }

        let serializer = state.state_serializer.clone().ok_or(DbViewError::Transaction)?;
        let type_id = serializer.type_id();

        if let Some(cached) = &state.encode_cache {
            if cached.modaliases == state.modaliases && cached.config == state.config && cached.globals == state.globals && cached.type_id == type_id {
                return Ok((type_id, cached.bytes.clone()));
            }
        }

        let payload = serde_json::json!({
            "module": "default",
            "aliases": state.modaliases,
            "config": state.config,
            "globals": state.globals,
        });
        let bytes = serializer.encode(&payload)?;
        state.encode_cache = Some(EncodeCacheEntry {
            modaliases: state.modaliases.clone(),
            config: state.config.clone(),
            globals: state.globals.clone(),
            type_id,
            bytes: bytes.clone(),
        });
        Ok((type_id, bytes))
    }

    pub fn decode_state(&self, type_id: Uuid, data: &[u8]) -> Result<(), DbViewError> {
        if type_id == Uuid::nil() && data.is_empty() {
            let mut state = self.0.state.lock();
            state.modaliases = state.defaults_modaliases.clone();
            state.config = state.defaults_config.clone();
            state.globals = state.defaults_globals.clone();
            return Ok(());
        }

        let mut state = self.0.state.lock();
        if let Some(cached) = &state.encode_cache {
            if cached.type_id == type_id && cached.bytes == data {
                state.modaliases = cached.modaliases.clone();
                state.config = cached.config.clone();
                state.globals = cached.globals.clone();
                return Ok(());
            }
        }

        let serializer = state.state_serializer.clone().ok_or(DbViewError::Transaction)?;
        if serializer.type_id() != type_id {
            return Err(DbViewError::StateMismatch {
                expected: uuid_to_u64(serializer.type_id()),
                actual: uuid_to_u64(type_id),
            });
        }
        let decoded = serializer.decode(data)?;
        if let Some(globals) = decoded.get("globals").and_then(|g| g.as_object()) {
            state.globals = globals.iter().map(|(k, v)| (k.clone(), recode_global(v.clone()))).collect();
        }
        if let Some(aliases) = decoded.get("aliases").and_then(|a| a.as_object()) {
            state.modaliases = aliases.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect();
        }
        if let Some(config) = decoded.get("config").and_then(|c| c.as_object()) {
            let _ = config;
        }
        Ok(())
    }

    pub fn describe_state(&self) -> Vec<u8> {
        self.0.state.lock().state_serializer.as_ref().map(|s| s.describe()).unwrap_or_default()
    }

    pub fn is_state_desc_changed(&self) -> bool {
        let mut state = self.0.state.lock();
        let current = state.state_serializer.as_ref().map(|s| s.describe());
        let changed = current != state.last_state_descriptor;
        state.last_state_descriptor = current;
        changed
    }

    /// For injection into SQL parameters; always ends with a `__dbver__`
    /// entry equal to the branch version at call time (§8 testable property).
    pub fn serialize_state(&self) -> Vec<u8> {
        let state = self.0.state.lock();
        let mut entries: Vec<Json> = Vec::new();
        entries.push(serde_json::json!({"name": "module", "value": "default"}));
        for (k, v) in &state.modaliases {
            entries.push(serde_json::json!({"name": format!("alias::{k}"), "value": v}));
        }
        for (k, v) in &state.config {
            entries.push(serde_json::json!({"name": format!("config::{k}"), "value": v}));
        }
        for (k, v) in &state.globals {
            entries.push(serde_json::json!({"name": format!("global::{k}"), "value": v}));
        }
        entries.push(serde_json::json!({"name": "__dbver__", "value": self.0.branch.version()}));
        serde_json::to_vec(&entries).unwrap_or_default()
    }

    // -- config operations (§4.4) ---------------------------------------------

    pub async fn apply_config_ops(&self, ops: &[ConfigOp]) -> Result<(), DbViewError> {
        for op in ops {
            match op.scope {
                ConfigScope::Instance => {
                    let sink = self.0.instance_config_sink.clone().ok_or_else(|| DbViewError::UnsupportedFeature("no instance config sink wired".into()))?;
                    sink(op.clone()).await?;
                }
                ConfigScope::Database => {
                    let spec = self.0.branch.user_config_spec();
                    let folded = spec.fold(self.0.branch.db_config(), op);
                    self.0.branch.set_db_config(folded);
                }
                ConfigScope::Session => {
                    let spec = self.0.branch.user_config_spec();
                    let mut state = self.0.state.lock();
                    let target = if let Some(tx) = state.tx.as_mut() { &mut tx.config } else { &mut state.config };
                    *target = spec.fold(target.clone(), op);
                }
                ConfigScope::Global => {
                    let value = op.value.clone().map(config_value_to_json).unwrap_or(Json::Null);
                    self.set_global(op.name.clone(), value);
                }
            }
        }
        Ok(())
    }
}

fn config_value_to_json(v: crate::config::ConfigValue) -> Json {
    use crate::config::ConfigValue::*;
    match v {
        Bool(b) => Json::Bool(b),
        Int(i) => Json::Number(i.into()),
        Str(s) => Json::String(s),
        Duration(d) => Json::Number(d.into()),
    }
}

fn uuid_to_u64(u: Uuid) -> u64 {
    let bytes = u.as_bytes();
    u64::from_be_bytes(bytes[0..8].try_into().unwrap())
}

/// Normalizes internal global-value representations (§4.4). A no-op today
/// since this core stores globals as plain JSON; kept as a named seam so a
/// frontend with a richer internal value type has somewhere to hook in.
fn recode_global(v: Json) -> Json {
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::SideEffects;

    fn empty_unit() -> QueryUnit {
        QueryUnit {
            tx_id: None,
            sql: Vec::new(),
            cache_sql: None,
            introspect_sql: None,
            in_type_desc: Vec::new(),
            out_type_desc: Vec::new(),
            in_type_id: Uuid::nil(),
            out_type_id: Uuid::nil(),
            params: Default::default(),
            capabilities: Capabilities::empty(),
            side_effects: SideEffects::default(),
            sql_prefix_len: 0,
        }
    }

    #[test]
    fn recode_global_is_identity() {
        let v = serde_json::json!({"a": 1});
        assert_eq!(recode_global(v.clone()), v);
    }

    #[test]
    fn unit_builder_smoke() {
        let u = empty_unit();
        assert!(u.tx_id.is_none());
    }
}
