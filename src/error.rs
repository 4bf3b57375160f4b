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

//! Error kinds surfaced to the frontend, per spec §7.

use thiserror::Error;

/// Errors raised by [`crate::session::SessionView`] and [`crate::index::BranchIndex`].
#[derive(Debug, Error)]
pub enum DbViewError {
    /// Propagated unchanged from the compiler.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Propagated unchanged from the compiler.
    #[error("internal server error: {0}")]
    InternalServer(String),

    /// Raised by any non-rollback operation on a view in `InTxError`.
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    Transaction,

    /// The query's capability set is not a subset of the view's capability mask.
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// The query's capability set is not a subset of the caller-permitted
    /// capabilities, or the tenant is read-only and the query writes.
    #[error("disabled capability: {0}")]
    DisabledCapability(String),

    /// Multi-statement SQL scripts, unknown oids, or unknown config opcodes.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Client-supplied state type-id does not match the current state serializer.
    #[error("state mismatch: expected type id {expected}, got {actual}")]
    StateMismatch {
        /// The state serializer's current type id.
        expected: u64,
        /// The type id the client supplied.
        actual: u64,
    },

    /// The named branch is not registered.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    /// A savepoint name was not found on the stack.
    #[error("savepoint \"{0}\" does not exist")]
    UnknownSavepoint(String),

    /// A persisted cache entry or a serialized request could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialize(String),

    /// Raised by backend SQL-describe failures (§7). `position`, when
    /// present, is expressed in the coordinates of whatever SQL text the
    /// error was raised against; `parse()` subtracts the unit's SQL prefix
    /// length before this reaches the frontend so it points into the
    /// client's original text rather than the generated wrapper.
    #[error("from_sql: {message}")]
    FromSql { message: String, position: Option<i64> },
}

impl DbViewError {
    /// Build a `from_sql`-marked error. `position` is `None` when no source
    /// map is available for this failure (e.g. the synthetic unknown-oid
    /// checks in `parse()` step 5, which have no backend-reported offset).
    pub fn from_sql_describe(message: impl Into<String>, position: Option<i64>) -> Self {
        DbViewError::FromSql {
            message: message.into(),
            position,
        }
    }
}
