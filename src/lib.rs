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

//! dbview-core: the per-branch query cache and session/transaction state
//! manager that sits between a database server's wire-protocol frontends
//! and its compiler and storage backends.
//!
//! Given an incoming query plus the session's effective configuration and
//! the branch's current schema version, [`SessionView::parse`] returns a
//! previously-compiled plan if one exists; otherwise it compiles exactly
//! once (coalescing duplicate in-flight compiles), caches the result,
//! enqueues it for persistence, and — on schema change — recompiles
//! still-relevant entries in the background.
//!
//! This crate does not plan queries, execute SQL, speak a wire protocol,
//! or define a migration system; those are external collaborators reached
//! through the traits in [`external`].

pub mod branch;
pub mod config;
pub mod error;
pub mod external;
pub mod index;
pub mod lru;
pub mod metrics;
pub mod request;
pub mod session;
pub mod telemetry;
pub mod unit;

pub use branch::Branch;
pub use error::DbViewError;
pub use index::BranchIndex;
pub use request::CompilationRequest;
pub use session::SessionView;
pub use unit::{QueryUnit, QueryUnitGroup};
