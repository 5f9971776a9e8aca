//! Query Translator — recursive translation of a nested logical query term
//! into the backend's textual query language, plus the stable `deephash`
//! used for cache keys.
//!
//! Grounded on `_query_builder`/`deephash` in `app/specify/api.py`.

use serde_json::Value;

use crate::column::{FieldModel, COLLECTION_SOLRNAME};
use crate::error::ProxyError;

pub const OR: i64 = 1;
pub const AND: i64 = 2;

/// A parsed query term, named per the design note in spec.md §9.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTerm {
    Leaf(Value),
    Combinator(Combinator, Vec<QueryTerm>),
    Field(String, Box<QueryTerm>),
    Range(String, Value, Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    Or,
    And,
}

impl QueryTerm {
    /// Parse a `serde_json::Value` array into a `QueryTerm` by arity, per
    /// the shapes in the data model section of the design.
    pub fn parse(value: &Value) -> Result<QueryTerm, ProxyError> {
        match value {
            Value::String(_) | Value::Number(_) => Ok(QueryTerm::Leaf(value.clone())),
            Value::Array(items) => Self::parse_array(items),
            _ => Err(ProxyError::invalid_query(format!(
                "unsupported query term shape: {value}"
            ))),
        }
    }

    pub(crate) fn parse_array(items: &[Value]) -> Result<QueryTerm, ProxyError> {
        if items.is_empty() {
            return Err(ProxyError::invalid_query("empty query term"));
        }

        if items.len() == 1 {
            return Self::parse(&items[0]);
        }

        if let Some(tag) = items[0].as_i64() {
            if tag == OR || tag == AND {
                let children = items[1..]
                    .iter()
                    .map(Self::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                let comb = if tag == OR { Combinator::Or } else { Combinator::And };
                return Ok(QueryTerm::Combinator(comb, children));
            }
        }

        let field = items[0]
            .as_str()
            .ok_or_else(|| ProxyError::invalid_query("field name must be a string"))?
            .to_string();

        match items.len() {
            2 => {
                let child = Self::parse(&items[1])?;
                Ok(QueryTerm::Field(field, Box::new(child)))
            }
            3 => Ok(QueryTerm::Range(field, items[1].clone(), items[2].clone())),
            _ => Err(ProxyError::invalid_query(
                "range search must be between only 2 values",
            )),
        }
    }

    /// Translate to the backend's text query language, resolving field
    /// names through `schema`. A field lookup failure is either surfaced as
    /// an error or, when `ignore_missing` is set, falls back to the raw
    /// field name so the clause still reaches the backend unchanged.
    pub fn translate(&self, schema: &FieldModel, ignore_missing: bool) -> Result<String, ProxyError> {
        match self {
            QueryTerm::Leaf(v) => Ok(format!("({})", leaf_text(v))),
            QueryTerm::Combinator(comb, children) => {
                let joiner = match comb {
                    Combinator::Or => " OR ",
                    Combinator::And => " AND ",
                };
                let parts = children
                    .iter()
                    .map(|c| c.translate(schema, ignore_missing))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", parts.join(joiner)))
            }
            QueryTerm::Field(field, child) => {
                let prefix = resolve_prefix(schema, field, ignore_missing)?;
                if prefix == "*" {
                    Ok("*".to_string())
                } else {
                    Ok(format!("{prefix}{}", child.translate(schema, ignore_missing)?))
                }
            }
            QueryTerm::Range(field, from, to) => {
                let prefix = resolve_prefix(schema, field, ignore_missing)?;
                if prefix == "*" {
                    Ok("*".to_string())
                } else {
                    Ok(format!("{prefix}[{} TO {}]", leaf_raw(from), leaf_raw(to)))
                }
            }
        }
    }
}

/// Resolve `field` to a `"solrname:"` prefix, or `"*"` for the synthetic
/// collection field. When the field is missing and `ignore_missing` is set,
/// falls back to the raw field name as the prefix, matching `_query_builder`
/// (api.py), which always appends the same suffix regardless of whether
/// resolution succeeded — only the prefix itself (raw name vs. solrname)
/// differs on failure.
fn resolve_prefix(schema: &FieldModel, field: &str, ignore_missing: bool) -> Result<String, ProxyError> {
    match schema.resolve_solrname(field) {
        Ok(solrname) if solrname == COLLECTION_SOLRNAME => Ok("*".to_string()),
        Ok(solrname) => Ok(format!("{solrname}:")),
        Err(_) if ignore_missing => Ok(format!("{field}:")),
        Err(e) => Err(e.into()),
    }
}

fn leaf_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn leaf_raw(v: &Value) -> String {
    leaf_text(v)
}

/// Canonicalize a query term by sorting sibling terms by their string form,
/// recursively. Used only for cache-key hashing; the on-wire query
/// preserves the user's order. This is the *intended* behavior the design
/// calls for (the source's `deephash` has an `enumerate`-variable-swap bug
/// that makes its recursive branch dead code; we do not reproduce it).
pub fn deephash(terms: &[Value]) -> Value {
    fn canonical(v: &Value) -> Value {
        match v {
            Value::Array(items) => {
                let mut canon: Vec<Value> = items.iter().map(canonical).collect();
                canon.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
                Value::Array(canon)
            }
            other => other.clone(),
        }
    }
    let mut canon: Vec<Value> = terms.iter().map(canonical).collect();
    canon.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    Value::Array(canon)
}

/// Stable string cache key for a `(asc, sort, queryTerms)` tuple, per §4.3.
pub fn query_cache_key(query_terms: &[Value], sort: Option<&str>, asc: bool) -> String {
    let hashed = deephash(query_terms);
    format!(
        "[{}, \"{}\", {}]",
        if asc { 0 } else { 1 },
        sort.unwrap_or(""),
        hashed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{Column, ColumnSpec, FieldModel, SolrType};
    use serde_json::json;

    fn identity_field(name: &str) -> Column {
        Column::new(ColumnSpec {
            colname: name.to_string(),
            solrname: name.to_string(),
            solrtype: SolrType::String,
            ..Default::default()
        })
    }

    #[test]
    fn worked_example_translates_combinator_leading_array_as_one_term() {
        let schema = FieldModel::new(vec![identity_field("2_latitude1"), identity_field("10_startDate")]);

        let raw = json!([2, "david", [1, "sch*", "fer*"], ["2_latitude1", -180, 5], ["10_startDate", 2020]]);
        let term = QueryTerm::parse(&raw).unwrap();
        let text = term.translate(&schema, true).unwrap();

        assert_eq!(
            text,
            "((david) AND ((sch*) OR (fer*)) AND 2_latitude1:[-180 TO 5] AND 10_startDate:(2020))"
        );
    }

    #[test]
    fn parse_array_rejects_a_leading_combinator_tag_as_a_leaf() {
        // A bare top-level array with a leading AND/OR tag must be parsed as
        // ONE term, not as independent leaves `map`ped and re-wrapped — that
        // would leak the tag itself in as a spurious `(2)` clause.
        let raw = json!([2, "david", "emma"]);
        let term = QueryTerm::parse(&raw).unwrap();
        let schema = FieldModel::new(vec![]);
        assert_eq!(term.translate(&schema, true).unwrap(), "((david) AND (emma))");
    }

    #[test]
    fn missing_field_with_ignore_missing_falls_back_to_raw_name() {
        let schema = FieldModel::new(vec![]);
        let term = QueryTerm::parse(&json!(["nosuchfield", "x"])).unwrap();
        assert_eq!(term.translate(&schema, true).unwrap(), "nosuchfield:(x)");
    }

    #[test]
    fn missing_field_without_ignore_missing_errors() {
        let schema = FieldModel::new(vec![]);
        let term = QueryTerm::parse(&json!(["nosuchfield", "x"])).unwrap();
        assert!(term.translate(&schema, false).is_err());
    }

    #[test]
    fn collection_field_resolves_to_wildcard() {
        let schema = FieldModel::new(vec![]);
        let term = QueryTerm::parse(&json!(["collection", "herps"])).unwrap();
        assert_eq!(term.translate(&schema, true).unwrap(), "*");
    }

    #[test]
    fn deephash_is_order_independent_between_sibling_permutations() {
        let a = vec![json!("x"), json!("y")];
        let b = vec![json!("y"), json!("x")];
        assert_eq!(deephash(&a), deephash(&b));
    }
}
