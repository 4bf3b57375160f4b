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

//! External collaborators consumed by this core, per spec §6. Everything
//! here is a trait: query planning, SQL execution, the backend connection
//! pool, schema introspection and the extension lifecycle are out of
//! scope (§1 Non-goals) and live on the other side of these seams.

use crate::config::{ConfigSnapshot, ConfigValue};
use crate::error::DbViewError;
use crate::request::CompilationRequest;
use crate::unit::QueryUnitGroup;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque compiler-side continuation state threaded through an in-flight
/// transaction's compiles (§4.3 "compile_in_tx").
#[derive(Debug, Clone, Default)]
pub struct CompilerTxState {
    pub state_id: u64,
    pub state_blob: Vec<u8>,
}

/// The external EdgeQL compiler pool (§6).
#[async_trait]
pub trait CompilerPool: Send + Sync {
    /// Compile outside of a transaction.
    async fn compile(
        &self,
        branch_name: &str,
        user_schema_pickle: &[u8],
        global_schema_pickle: &[u8],
        reflection_cache: &[u8],
        db_config: &ConfigSnapshot,
        sys_config: &ConfigSnapshot,
        request: &CompilationRequest,
        raw_text: &str,
        client_id: u64,
    ) -> Result<(QueryUnitGroup, CompilerTxState), DbViewError>;

    /// Compile inside an already-open transaction.
    #[allow(clippy::too_many_arguments)]
    async fn compile_in_tx(
        &self,
        branch_name: &str,
        root_user_schema_pickle: &[u8],
        tx_id: u64,
        prev_state: &CompilerTxState,
        request: &CompilationRequest,
        raw_text: &str,
        in_tx_error: bool,
        client_id: u64,
    ) -> Result<(QueryUnitGroup, CompilerTxState), DbViewError>;

    /// Synthesize typed in/out descriptors for a SQL-input-language unit
    /// from backend-reported oids (§4.4 step 5).
    async fn compile_descriptors(
        &self,
        branch_name: &str,
        param_oids: &[u32],
        out_columns: &[(String, u32)],
    ) -> Result<DescriptorSet, DbViewError>;

    /// Build a state serializer for a protocol version and schema pair.
    async fn make_state_serializer(
        &self,
        protocol_version: (u16, u16),
        user_schema_pickle: &[u8],
        global_schema_pickle: &[u8],
    ) -> Result<std::sync::Arc<dyn StateSerializer>, DbViewError>;

    /// Used to bound recompile concurrency (§4.4 step 7).
    fn get_size_hint(&self) -> usize;
}

/// Typed parameter/result descriptors synthesized for a SQL unit.
#[derive(Debug, Clone, Default)]
pub struct DescriptorSet {
    pub in_type_desc: Vec<u8>,
    pub out_type_desc: Vec<u8>,
}

/// A single SQL-describe result column.
#[derive(Debug, Clone)]
pub struct DescribedColumn {
    pub name: String,
    pub type_oid: u32,
}

/// The external backend SQL connection (§6).
#[async_trait]
pub trait BackendConnection: Send + Sync {
    async fn sql_execute(&self, sql: &[u8]) -> Result<(), DbViewError>;

    async fn sql_describe(
        &self,
        sql: &str,
        type_oid_hints: &[u32],
    ) -> Result<(Vec<u32>, Vec<DescribedColumn>), DbViewError>;
}

/// RAII guard around a backend connection, released on drop so an
/// acquisition is guaranteed to release on every exit path (including
/// failure), per §6's "scoped acquisition" requirement.
pub struct ConnectionGuard {
    conn: Option<std::sync::Arc<dyn BackendConnection>>,
    release: Box<dyn FnOnce(std::sync::Arc<dyn BackendConnection>) + Send>,
}

impl ConnectionGuard {
    pub fn new(
        conn: std::sync::Arc<dyn BackendConnection>,
        release: impl FnOnce(std::sync::Arc<dyn BackendConnection>) + Send + 'static,
    ) -> Self {
        ConnectionGuard {
            conn: Some(conn),
            release: Box::new(release),
        }
    }

    pub fn conn(&self) -> &std::sync::Arc<dyn BackendConnection> {
        self.conn.as_ref().expect("connection guard used after release")
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // release is a FnOnce; swap in a no-op so Drop can call it once.
            let release = std::mem::replace(&mut self.release, Box::new(|_| {}));
            release(conn);
        }
    }
}

/// The tenant (per-branch host process) collaborator (§6).
#[async_trait]
pub trait Tenant: Send + Sync {
    async fn acquire_backend_connection(&self, branch: &str) -> Result<ConnectionGuard, DbViewError>;

    async fn evict_query_cache(&self, branch: &str, keys: &[String]) -> Result<(), DbViewError>;

    async fn signal_sysevent(&self, event_name: &str, branch: &str, keys: &[String]);

    async fn introspect_db(&self, branch: &str) -> Result<(), DbViewError>;

    fn is_readonly(&self) -> bool;

    fn get_readiness_reason(&self) -> Option<String>;

    fn client_id(&self) -> u64;

    fn get_instance_name(&self) -> String;
}

/// The host server process (§6): the system-wide config-change hook
/// surface and the handle back to the compiler pool. The system compile
/// cache itself is modeled directly as `index::GlobalCompileCache` rather
/// than through this trait, since it is owned in-process by `BranchIndex`.
#[async_trait]
pub trait Server: Send + Sync {
    /// Called once the instance override has been persisted but before the
    /// in-memory system config snapshot is updated (§4.5: "before-persist-
    /// overrides update happens before the before-hook, because config
    /// changes may drop the backend connection"). An error here aborts the
    /// op before the in-memory snapshot changes.
    async fn on_system_config_add(&self, name: &str, value: &ConfigValue) -> Result<(), DbViewError>;
    async fn on_system_config_rem(&self, name: &str, value: &ConfigValue) -> Result<(), DbViewError>;
    async fn on_system_config_set(&self, name: &str, value: &ConfigValue) -> Result<(), DbViewError>;
    async fn on_system_config_reset(&self, name: &str) -> Result<(), DbViewError>;

    /// Called after the in-memory system config snapshot has been updated.
    async fn after_system_config_add(&self, name: &str, value: &ConfigValue);
    async fn after_system_config_rem(&self, name: &str, value: &ConfigValue);
    async fn after_system_config_set(&self, name: &str, value: &ConfigValue);
    async fn after_system_config_reset(&self, name: &str);

    fn get_compiler_pool(&self) -> Arc<dyn CompilerPool>;
}

/// The external helper that turns session state into a typed binary blob
/// (§6, GLOSSARY "State serializer").
pub trait StateSerializer: Send + Sync {
    fn type_id(&self) -> Uuid;

    fn encode(&self, state: &serde_json::Value) -> Result<Vec<u8>, DbViewError>;

    fn decode(&self, data: &[u8]) -> Result<serde_json::Value, DbViewError>;

    /// A type descriptor for the client, used by `SessionView::describe_state`.
    fn describe(&self) -> Vec<u8>;
}
