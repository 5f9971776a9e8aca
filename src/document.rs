//! Document — the federated result record: a schema-driven map of backend
//! field name to scalar, plus the fixed `coll` and `img` attributes.
//!
//! Grounded on the per-document post-processing in `SpecifyApi._query`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One attachment/image record parsed out of a document's `img` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Value,
    pub name: Value,
    pub title: Value,
    pub coll: String,
}

/// A federated document. Field order is not semantically meaningful, so an
/// ordered `BTreeMap` is used purely so serialized output and tests are
/// deterministic (the design note in spec.md §9 asks for an ordered map).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    pub fields: BTreeMap<String, Value>,
    pub coll: String,
    pub img: Vec<Attachment>,
}

impl Document {
    pub fn spid(&self) -> Option<String> {
        self.fields.get("spid").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}
