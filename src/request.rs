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

//! The compilation fingerprint, per spec §3/§4.2.

use crate::config::ConfigSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputLanguage {
    EdgeQL,
    Sql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    Binary,
    Json,
    JsonElements,
    None,
}

/// The semantic fields of a `CompilationRequest`. Split out from the
/// wrapper so the precomputed hash can be invalidated without recomputing
/// field storage layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Fields {
    source: String,
    input_language: InputLanguage,
    output_format: OutputFormat,
    expect_one: bool,
    implicit_limit: Option<u64>,
    inline_type_ids: bool,
    inline_object_ids: bool,
    protocol_version: (u16, u16),
    schema_version: Uuid,
    database_config: ConfigSnapshot,
    system_config: ConfigSnapshot,
    compilation_config_serializer_id: u32,
}

/// Canonical fingerprint identifying what is to be compiled: normalized
/// source plus protocol version, schema version, output/input modes, and
/// config snapshot. Two requests are equal iff all fields compare equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationRequest {
    fields: Fields,
    #[serde(skip)]
    cached_hash: Option<u64>,
}

impl PartialEq for CompilationRequest {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}
impl Eq for CompilationRequest {}

impl Hash for CompilationRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint());
    }
}

#[allow(clippy::too_many_arguments)]
impl CompilationRequest {
    pub fn new(
        source: String,
        input_language: InputLanguage,
        output_format: OutputFormat,
        expect_one: bool,
        implicit_limit: Option<u64>,
        inline_type_ids: bool,
        inline_object_ids: bool,
        protocol_version: (u16, u16),
        schema_version: Uuid,
        database_config: ConfigSnapshot,
        system_config: ConfigSnapshot,
        compilation_config_serializer_id: u32,
    ) -> Self {
        CompilationRequest {
            fields: Fields {
                source,
                input_language,
                output_format,
                expect_one,
                implicit_limit,
                inline_type_ids,
                inline_object_ids,
                protocol_version,
                schema_version,
                database_config,
                system_config,
                compilation_config_serializer_id,
            },
            cached_hash: None,
        }
    }

    pub fn source(&self) -> &str {
        &self.fields.source
    }

    pub fn schema_version(&self) -> Uuid {
        self.fields.schema_version
    }

    pub fn input_language(&self) -> InputLanguage {
        self.fields.input_language
    }

    /// The structural hash, computed once and cached. Every mutator below
    /// invalidates this.
    pub fn fingerprint(&self) -> u64 {
        if let Some(h) = self.cached_hash {
            return h;
        }
        let mut hasher = DefaultHasher::new();
        self.fields.source.hash(&mut hasher);
        (self.fields.input_language as u8).hash(&mut hasher);
        (self.fields.output_format as u8).hash(&mut hasher);
        self.fields.expect_one.hash(&mut hasher);
        self.fields.implicit_limit.hash(&mut hasher);
        self.fields.inline_type_ids.hash(&mut hasher);
        self.fields.inline_object_ids.hash(&mut hasher);
        self.fields.protocol_version.hash(&mut hasher);
        self.fields.schema_version.hash(&mut hasher);
        for (k, v) in &self.fields.database_config {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        for (k, v) in &self.fields.system_config {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        self.fields.compilation_config_serializer_id.hash(&mut hasher);
        hasher.finish()
    }

    /// Recompute and cache the fingerprint; callers that mutate fields
    /// directly (the setters below) already do this, this is for
    /// read-mostly callers that want to warm the cache once up front.
    pub fn warm_fingerprint(&mut self) {
        self.cached_hash = None;
        self.cached_hash = Some(self.fingerprint());
    }

    pub fn set_schema_version(&mut self, schema_version: Uuid) {
        self.fields.schema_version = schema_version;
        self.cached_hash = None;
    }

    pub fn set_database_config(&mut self, config: ConfigSnapshot) {
        self.fields.database_config = config;
        self.cached_hash = None;
    }

    pub fn set_system_config(&mut self, config: ConfigSnapshot) {
        self.fields.system_config = config;
        self.cached_hash = None;
    }

    /// Stable serialized form, suitable for persistence across processes
    /// of the same server version (§4.2, §6 "Persisted cache entry format").
    pub fn serialize(&self) -> Result<Vec<u8>, crate::error::DbViewError> {
        bincode::serialize(&self.fields).map_err(|e| crate::error::DbViewError::Deserialize(e.to_string()))
    }

    /// Reconstruct a request given the server's current compilation-config
    /// serializer id. Rejects an encoding from an incompatible serializer;
    /// the caller treats rejection as "skip this entry" (§4.2).
    pub fn deserialize(
        bytes: &[u8],
        current_serializer_id: u32,
    ) -> Result<Self, crate::error::DbViewError> {
        let fields: Fields = bincode::deserialize(bytes)
            .map_err(|e| crate::error::DbViewError::Deserialize(e.to_string()))?;
        if fields.compilation_config_serializer_id != current_serializer_id {
            return Err(crate::error::DbViewError::Deserialize(
                "compilation config serializer id mismatch".to_string(),
            ));
        }
        Ok(CompilationRequest {
            fields,
            cached_hash: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(schema_version: Uuid) -> CompilationRequest {
        CompilationRequest::new(
            "select 1".into(),
            InputLanguage::EdgeQL,
            OutputFormat::Binary,
            false,
            None,
            false,
            false,
            (2, 0),
            schema_version,
            ConfigSnapshot::new(),
            ConfigSnapshot::new(),
            1,
        )
    }

    #[test]
    fn equal_requests_have_equal_fingerprints() {
        let v = Uuid::new_v4();
        let a = sample(v);
        let b = sample(v);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn schema_version_change_changes_fingerprint() {
        let mut a = sample(Uuid::new_v4());
        let before = a.fingerprint();
        a.set_schema_version(Uuid::new_v4());
        assert_ne!(before, a.fingerprint());
    }

    #[test]
    fn config_snapshot_order_does_not_affect_hash() {
        let v = Uuid::new_v4();
        let mut cfg_a = ConfigSnapshot::new();
        cfg_a.insert("b".into(), crate::config::ConfigValue::Int(2));
        cfg_a.insert("a".into(), crate::config::ConfigValue::Int(1));

        let mut cfg_b = ConfigSnapshot::new();
        cfg_b.insert("a".into(), crate::config::ConfigValue::Int(1));
        cfg_b.insert("b".into(), crate::config::ConfigValue::Int(2));

        let mut a = sample(v);
        a.set_database_config(cfg_a);
        let mut b = sample(v);
        b.set_database_config(cfg_b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn serialize_deserialize_round_trips() {
        let req = sample(Uuid::new_v4());
        let bytes = req.serialize().unwrap();
        let back = CompilationRequest::deserialize(&bytes, 1).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn deserialize_rejects_incompatible_serializer_id() {
        let req = sample(Uuid::new_v4());
        let bytes = req.serialize().unwrap();
        assert!(CompilationRequest::deserialize(&bytes, 999).is_err());
    }
}
