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

//! Metric facade over the `metrics` crate, exposing exactly the names
//! listed in spec §6 ("Metrics emitted"). **[AMBIENT]** — the spec names
//! the metrics but not a Rust API; this module is the boilerplate every
//! call site would otherwise repeat, the way `weavegraph`'s optional
//! `metrics` feature centralizes its label sets.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Thin wrapper so call sites don't repeat label boilerplate. Cheap to
/// clone/hold — `metrics` recorders are globally registered, this struct
/// just carries the instance name label.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    instance: String,
}

impl MetricsSink {
    pub fn new(instance: impl Into<String>) -> Self {
        MetricsSink {
            instance: instance.into(),
        }
    }

    pub fn query_compilation(&self, source: CompilationSource) {
        counter!(
            "edgeql_query_compilations",
            "instance" => self.instance.clone(),
            "source" => source.as_str(),
        )
        .increment(1);
    }

    pub fn edgeql_compilation_duration(&self, d: Duration) {
        histogram!(
            "edgeql_query_compilation_duration",
            "instance" => self.instance.clone(),
        )
        .record(d.as_secs_f64());
    }

    pub fn query_compilation_duration(&self, language: &str, d: Duration) {
        histogram!(
            "query_compilation_duration",
            "instance" => self.instance.clone(),
            "language" => language.to_string(),
        )
        .record(d.as_secs_f64());
    }

    pub fn background_error(&self, component: &str) {
        counter!(
            "background_errors",
            "instance" => self.instance.clone(),
            "component" => component.to_string(),
        )
        .increment(1);
    }

    pub fn current_branches(&self, count: usize) {
        gauge!("current_branches", "instance" => self.instance.clone()).set(count as f64);
    }

    pub fn extension_used(&self, extension: &str, active: bool) {
        gauge!(
            "extension_used",
            "instance" => self.instance.clone(),
            "extension" => extension.to_string(),
        )
        .set(if active { 1.0 } else { 0.0 });
    }

    pub fn feature_used_delta(&self, feature: &str, delta: f64) {
        gauge!(
            "feature_used",
            "instance" => self.instance.clone(),
            "feature" => feature.to_string(),
        )
        .increment(delta);
    }

    pub fn auth_providers(&self, branch: &str, count: usize) {
        gauge!(
            "auth_providers",
            "instance" => self.instance.clone(),
            "branch" => branch.to_string(),
        )
        .set(count as f64);
    }
}

/// Label for `edgeql_query_compilations{source=...}`.
#[derive(Debug, Clone, Copy)]
pub enum CompilationSource {
    Cache,
    Compiler,
}

impl CompilationSource {
    fn as_str(self) -> &'static str {
        match self {
            CompilationSource::Cache => "cache",
            CompilationSource::Compiler => "compiler",
        }
    }
}
