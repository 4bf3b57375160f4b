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

//! Compiled query output, per spec §3/§4.2 (QueryUnit / QueryUnitGroup).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

bitflags! {
    /// Capability bits a unit may require (DDL, write, session config, …).
    /// The system branch's capability mask excludes `DDL` and `MODIFICATIONS` (§4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const DDL           = 1 << 0;
        const MODIFICATIONS = 1 << 1;
        const SESSION_CONFIG = 1 << 2;
        const TRANSACTION   = 1 << 3;
        const PERSISTENT_CONFIG = 1 << 4;
    }
}

/// Transactional side-effect flags carried by a unit (§3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffects {
    pub has_ddl: bool,
    pub has_set: bool,
    pub system_config: bool,
    pub database_config: bool,
    pub create_db: bool,
    pub drop_db: bool,
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_rollback: bool,
    pub tx_abort_migration: bool,
    pub user_schema_update: bool,
    pub global_schema_update: bool,
    pub modaliases_override: bool,
}

/// The bitmask returned from `on_success`, naming which server-wide
/// notifications the frontend must fan out (§4.4 "tx_commit").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SideEffectNotifications {
    pub schema_changes: bool,
    pub instance_config_changes: bool,
    pub database_config_changes: bool,
    pub database_changes: bool,
    pub global_schema_changes: bool,
}

/// Parameter layout for a single unit: positional parameter names in
/// declaration order, opaque to this core beyond ordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamLayout {
    pub names: Vec<String>,
}

/// A single compiled unit (one statement's worth of generated SQL plus metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryUnit {
    /// `Some(_)` marks this unit as a transaction-starting statement (e.g.
    /// `START TRANSACTION`); the branch assigns the actual sequence number
    /// when `SessionView::start` runs, so the wrapped value itself carries
    /// no meaning beyond "not None".
    pub tx_id: Option<u64>,
    /// Generated SQL to execute against the backend.
    pub sql: Vec<u8>,
    /// Alternate SQL form assuming a persisted server-side helper routine exists.
    pub cache_sql: Option<Vec<u8>>,
    /// Introspection SQL, if the compiler attached one.
    pub introspect_sql: Option<Vec<u8>>,
    pub in_type_desc: Vec<u8>,
    pub out_type_desc: Vec<u8>,
    pub in_type_id: Uuid,
    pub out_type_id: Uuid,
    pub params: ParamLayout,
    pub capabilities: Capabilities,
    pub side_effects: SideEffects,
    /// Byte length of the compiler-generated wrapper prefixed onto the raw
    /// client SQL text inside `sql`. A `from_sql`-marked backend error's
    /// position is reported in the wrapper's coordinates; subtracting this
    /// maps it back into the client's original SQL text (§7).
    pub sql_prefix_len: u32,
}

impl QueryUnit {
    /// Whether this unit may be served by its function-cache SQL variant.
    pub fn has_cache_sql(&self) -> bool {
        self.cache_sql.is_some()
    }
}

/// Lifecycle tag for a cached entry, per §3 invariants: transitions
/// `Pending -> Present`, `Pending -> Evicted`, `Present -> Evicted` only.
/// `Evicted` is terminal and removes the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheState {
    Pending,
    Present,
    Evicted,
}

impl CacheState {
    /// Attempt a transition, returning the new state or `None` if the
    /// transition is not one of the three legal ones.
    pub fn transition(self, to: CacheState) -> Option<CacheState> {
        use CacheState::*;
        match (self, to) {
            (Pending, Present) | (Pending, Evicted) | (Present, Evicted) => Some(to),
            _ => None,
        }
    }
}

/// Gating state for a cached entry's function-cache SQL variant (§4.3
/// invariants). `Option<u64>` can't carry this: a freshly-inserted, not yet
/// persisted entry and a persisted-with-no-gating-transaction entry are
/// both "no sequence number attached" but must behave oppositely — the
/// former is never usable, the latter is unconditionally usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncCacheGate {
    /// Not yet persisted: the function-cache SQL variant may not exist
    /// server-side yet, so no session may use it.
    Disabled,
    /// Persisted while transactions up to and including sequence
    /// `gating_seq` were active; only sessions with no active tx, or whose
    /// own tx sequence is strictly greater than `gating_seq`, may use it.
    Gated(u64),
    /// Persisted with no gating transaction (or promoted once every
    /// gating transaction ended): usable unconditionally.
    Enabled,
}

/// The result of compilation: an ordered list of units plus group-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryUnitGroup {
    pub units: Vec<QueryUnit>,
    pub cacheable: bool,
    pub capabilities: Capabilities,
    pub cache_state: CacheState,
    /// Set once persistence completes and the entry is gated into (or
    /// released from) the pending-function-cache map (§4.3 invariants).
    pub func_cache_gate: FuncCacheGate,
    /// The schema version this group was compiled against; used by the
    /// recompile sweep (§4.4 step 7) to find stale entries.
    pub schema_version: Uuid,
}

impl QueryUnitGroup {
    pub fn single(unit: QueryUnit, schema_version: Uuid) -> Self {
        let cacheable = unit.has_cache_sql() || !unit.side_effects.has_ddl;
        QueryUnitGroup {
            capabilities: unit.capabilities,
            units: vec![unit],
            cacheable,
            cache_state: CacheState::Pending,
            func_cache_gate: FuncCacheGate::Disabled,
            schema_version,
        }
    }

    pub fn is_single_unit(&self) -> bool {
        self.units.len() == 1
    }

    pub fn first(&self) -> Option<&QueryUnit> {
        self.units.first()
    }

    /// Try to move this group's cache_state forward; panics (in debug) on
    /// an illegal transition since that indicates a bug in the caller, not
    /// recoverable input.
    pub fn set_cache_state(&mut self, to: CacheState) {
        match self.cache_state.transition(to) {
            Some(s) => self.cache_state = s,
            None => debug_assert!(false, "illegal cache-state transition {:?} -> {:?}", self.cache_state, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_state_pending_to_present_is_legal() {
        assert_eq!(
            CacheState::Pending.transition(CacheState::Present),
            Some(CacheState::Present)
        );
    }

    #[test]
    fn cache_state_present_to_pending_is_illegal() {
        assert_eq!(CacheState::Present.transition(CacheState::Pending), None);
    }

    #[test]
    fn cache_state_evicted_is_terminal() {
        assert_eq!(CacheState::Evicted.transition(CacheState::Present), None);
        assert_eq!(CacheState::Evicted.transition(CacheState::Pending), None);
    }
}
