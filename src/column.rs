//! Column & FieldModel — per-backend schema representation, type hierarchy,
//! and lookup by human name or backend name.
//!
//! Grounded on `Column`/`FieldModel` in `app/specify/api.py`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LookupError;

pub const COLLECTION_SOLRNAME: &str = "coll";
pub const COLLECTION_COLNAME: &str = "collection";

/// Backend field type, most specific first. Used both for display and to
/// pick the more specific type when two columns disagree during merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolrType {
    String,
    #[serde(rename = "tdouble")]
    TDouble,
    Int,
    List,
}

impl SolrType {
    const HIERARCHY: [SolrType; 4] = [SolrType::String, SolrType::TDouble, SolrType::Int, SolrType::List];

    fn specificity(self) -> usize {
        Self::HIERARCHY.iter().position(|t| *t == self).unwrap()
    }

    /// The more specific of two types, per the hierarchy string < tdouble < int < list.
    pub fn more_specific(self, other: SolrType) -> SolrType {
        if self.specificity() <= other.specificity() {
            self
        } else {
            other
        }
    }
}

/// A richer, Java-flavored type category derived from `solrtype`/`title`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "java.util.Calendar")]
    Calendar,
    #[serde(rename = "java.lang.String")]
    JString,
    #[serde(rename = "java.math.BigDecimal")]
    BigDecimal,
    #[serde(rename = "java.util.Arrays")]
    Arrays,
}

fn determine_type(title: &str, solrtype: SolrType) -> ColumnType {
    if title.ends_with("Date") && solrtype == SolrType::Int {
        return ColumnType::Calendar;
    }
    match solrtype {
        SolrType::Int | SolrType::String => ColumnType::JString,
        SolrType::TDouble => ColumnType::BigDecimal,
        SolrType::List => ColumnType::Arrays,
    }
}

/// A single backend column/field descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub colname: String,
    pub solrname: String,
    pub solrtype: SolrType,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub col_type: Option<ColumnType>,
    pub width: Option<i64>,
    pub sptable: Option<String>,
    pub sptabletitle: Option<String>,
    pub spfld: Option<String>,
    pub spfldtitle: Option<String>,
    pub treeid: Option<String>,
    pub treerank: Option<i64>,
    pub colidx: Option<i64>,
    #[serde(default)]
    pub advancedsearch: Option<String>,
    pub displaycolidx: Option<i64>,
}

/// Raw construction fields; only `colname`/`solrname`/`solrtype` are
/// required, everything else defaults per the rules in the design.
#[derive(Debug, Clone, Default)]
pub struct ColumnSpec {
    pub colname: String,
    pub solrname: String,
    pub solrtype: SolrType,
    pub title: Option<String>,
    pub width: Option<i64>,
    pub sptable: Option<String>,
    pub sptabletitle: Option<String>,
    pub spfld: Option<String>,
    pub spfldtitle: Option<String>,
    pub treeid: Option<String>,
    pub treerank: Option<i64>,
    pub colidx: Option<i64>,
    pub advancedsearch: Option<String>,
    pub displaycolidx: Option<i64>,
}

impl Default for SolrType {
    fn default() -> Self {
        SolrType::String
    }
}

impl Column {
    pub fn new(mut spec: ColumnSpec) -> Column {
        if spec.solrname == "img" {
            spec.solrtype = SolrType::List;
        }
        let title = spec.title.unwrap_or_else(|| spec.colname.clone());
        let col_type = determine_type(&title, spec.solrtype);
        Column {
            colname: spec.colname,
            solrname: spec.solrname,
            solrtype: spec.solrtype,
            title: Some(title),
            col_type: Some(col_type),
            width: spec.width,
            sptable: spec.sptable,
            sptabletitle: spec.sptabletitle,
            spfld: spec.spfld,
            spfldtitle: spec.spfldtitle,
            treeid: spec.treeid,
            treerank: spec.treerank,
            colidx: spec.colidx,
            advancedsearch: spec.advancedsearch.or_else(|| Some("false".to_string())),
            displaycolidx: spec.displaycolidx,
        }
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.colname)
    }

    /// Merge this column with `other` per the per-field rules in the design
    /// (§4.2 Step 3). Errors when a must-equal field disagrees.
    pub fn merged_with(&self, other: &Column) -> Result<Column, crate::error::ProxyError> {
        fn assert_eq_field<T: PartialEq + Clone + std::fmt::Debug>(
            name: &str,
            a: &T,
            b: &T,
        ) -> Result<T, crate::error::ProxyError> {
            if a == b {
                Ok(a.clone())
            } else {
                Err(crate::error::ProxyError::schema_mismatch(
                    name,
                    format!("{a:?} != {b:?}"),
                ))
            }
        }

        fn max_with_none(a: Option<i64>, b: Option<i64>) -> Option<i64> {
            match (a, b) {
                (None, x) => x,
                (x, None) => x,
                (Some(a), Some(b)) => Some(a.max(b)),
            }
        }

        let colname = assert_eq_field("colname", &self.colname, &other.colname)?;
        let title = assert_eq_field("title", &self.title, &other.title)?;
        let col_type = assert_eq_field("type", &self.col_type, &other.col_type)?;
        let sptable = assert_eq_field("sptable", &self.sptable, &other.sptable)?;
        let spfld = assert_eq_field("spfld", &self.spfld, &other.spfld)?;
        let spfldtitle = assert_eq_field("spfldtitle", &self.spfldtitle, &other.spfldtitle)?;
        let treeid = assert_eq_field("treeid", &self.treeid, &other.treeid)?;
        let treerank = assert_eq_field("treerank", &self.treerank, &other.treerank)?;

        let solrname = std::cmp::max(self.solrname.clone(), other.solrname.clone());
        let solrtype = self.solrtype.more_specific(other.solrtype);
        let width = max_with_none(self.width, other.width);
        let sptabletitle = max_str_with_none(&self.sptabletitle, &other.sptabletitle);
        let colidx = max_with_none(self.colidx, other.colidx);
        let displaycolidx = max_with_none(self.displaycolidx, other.displaycolidx);

        let advancedsearch = match (self.advancedsearch.as_deref(), other.advancedsearch.as_deref()) {
            (Some("true"), _) | (_, Some("true")) => "true".to_string(),
            (a, b) if a == b => a.unwrap_or_default().to_string(),
            _ => {
                return Err(crate::error::ProxyError::schema_mismatch(
                    "advancedsearch",
                    format!("{:?} != {:?}", self.advancedsearch, other.advancedsearch),
                ))
            }
        };

        Ok(Column {
            colname,
            solrname,
            solrtype,
            title,
            col_type,
            width,
            sptable,
            sptabletitle,
            spfld,
            spfldtitle,
            treeid,
            treerank,
            colidx,
            advancedsearch: Some(advancedsearch),
            displaycolidx,
        })
    }
}

fn max_str_with_none(a: &Option<String>, b: &Option<String>) -> Option<String> {
    match (a, b) {
        (None, x) => x.clone(),
        (x, None) => x.clone(),
        (Some(a), Some(b)) => Some(std::cmp::max(a.clone(), b.clone())),
    }
}

/// Transform applied to a raw backend value based on the merged `solrtype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCast {
    Str,
    Float,
    Int,
    List,
}

impl TypeCast {
    pub fn for_solrtype(t: SolrType) -> TypeCast {
        match t {
            SolrType::String => TypeCast::Str,
            SolrType::TDouble => TypeCast::Float,
            SolrType::Int => TypeCast::Int,
            SolrType::List => TypeCast::List,
        }
    }

    /// Coerce a raw JSON value the way the Python driver's `SOLRTYPE_TRANSFORMS` would.
    pub fn apply(self, value: serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match (self, &value) {
            (TypeCast::Str, Value::String(_)) => value,
            (TypeCast::Str, _) => Value::String(value.to_string()),
            (TypeCast::Float, Value::Number(n)) => {
                Value::from(n.as_f64().unwrap_or_default())
            }
            (TypeCast::Float, Value::String(s)) => {
                Value::from(s.parse::<f64>().unwrap_or_default())
            }
            (TypeCast::Int, Value::Number(n)) => Value::from(n.as_i64().unwrap_or_default()),
            (TypeCast::Int, Value::String(s)) => Value::from(s.parse::<i64>().unwrap_or_default()),
            (TypeCast::List, Value::Array(_)) => value,
            (TypeCast::List, Value::Null) => Value::Array(vec![]),
            (TypeCast::List, other) => Value::Array(vec![other.clone()]),
            _ => value,
        }
    }
}

/// Ordered sequence of columns for one backend (or the merged, combined
/// schema). Always carries a synthetic leading `collection` column.
#[derive(Debug, Clone)]
pub struct FieldModel {
    pub columns: Vec<Column>,
    by_colname: HashMap<String, usize>,
    by_solrname: HashMap<String, usize>,
    pub changed_solrnames: HashMap<String, String>,
    pub type_casts: HashMap<String, TypeCast>,
    follow_model: Option<Arc<FieldModel>>,
}

impl FieldModel {
    pub fn new(mut columns: Vec<Column>) -> FieldModel {
        let needs_synthetic = columns
            .first()
            .map(|c| c.colname != COLLECTION_COLNAME)
            .unwrap_or(true);

        if needs_synthetic {
            for c in &mut columns {
                if let Some(i) = c.colidx.as_mut() {
                    *i += 1;
                }
                if let Some(i) = c.displaycolidx.as_mut() {
                    *i += 1;
                }
            }
            let synthetic = Column::new(ColumnSpec {
                colname: COLLECTION_COLNAME.to_string(),
                solrname: COLLECTION_SOLRNAME.to_string(),
                solrtype: SolrType::String,
                advancedsearch: Some("true".to_string()),
                colidx: Some(0),
                displaycolidx: Some(0),
                ..Default::default()
            });
            columns.insert(0, synthetic);
        }

        let by_colname = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.colname.clone(), i))
            .collect();
        let by_solrname = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.solrname.clone(), i))
            .collect();

        FieldModel {
            columns,
            by_colname,
            by_solrname,
            changed_solrnames: HashMap::new(),
            type_casts: HashMap::new(),
            follow_model: None,
        }
    }

    pub fn from_json(columns: Vec<Column>) -> FieldModel {
        FieldModel::new(columns)
    }

    pub fn get(&self, colname: &str) -> Option<&Column> {
        self.by_colname.get(colname).map(|&i| &self.columns[i])
    }

    pub fn get_or_err(&self, colname: &str) -> Result<&Column, LookupError> {
        self.get(colname).ok_or_else(|| LookupError {
            field: colname.to_string(),
        })
    }

    pub fn get_by_solrname(&self, solrname: &str) -> Option<&Column> {
        self.by_solrname.get(solrname).map(|&i| &self.columns[i])
    }

    /// Resolve `field` first as a `solrname`, then as a `colname`.
    pub fn resolve(&self, field: &str) -> Result<&Column, LookupError> {
        self.get_by_solrname(field)
            .or_else(|| self.get(field))
            .ok_or_else(|| LookupError {
                field: field.to_string(),
            })
    }

    /// Resolve `field` to its effective solrname (post-rebind), as the
    /// translator and sort resolution do.
    pub fn resolve_solrname(&self, field: &str) -> Result<String, LookupError> {
        self.resolve(field).map(|c| c.solrname.clone())
    }

    pub fn premerge_repr(&self) -> Vec<(String, Option<i64>)> {
        self.columns
            .iter()
            .map(|c| (c.colname.clone(), c.displaycolidx))
            .collect()
    }

    /// Rebind this (backend-owned) model to the combined, merged model.
    /// Populates `changed_solrnames` and `type_casts`, per §4.1.
    pub fn rebind(&mut self, follow: &Arc<FieldModel>) {
        let mut changed = HashMap::new();
        let mut casts = HashMap::new();
        let mut by_solrname = HashMap::new();

        for (i, c) in self.columns.iter().enumerate() {
            let merged = match follow.get(&c.colname) {
                Some(m) => m,
                None => {
                    by_solrname.insert(c.solrname.clone(), i);
                    continue;
                }
            };
            let old_solrname = c.solrname.clone();
            let effective = merged.solrname.clone();
            if effective != old_solrname {
                changed.insert(old_solrname, effective.clone());
            }
            casts.insert(c.solrname.clone(), TypeCast::for_solrtype(merged.solrtype));
            by_solrname.insert(effective, i);
        }

        self.by_solrname = by_solrname;
        self.changed_solrnames = changed;
        self.type_casts = casts;
        self.follow_model = Some(Arc::clone(follow));
    }

    pub fn is_bound(&self) -> bool {
        self.follow_model.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(colname: &str, solrname: &str, solrtype: SolrType) -> Column {
        Column::new(ColumnSpec {
            colname: colname.to_string(),
            solrname: solrname.to_string(),
            solrtype,
            ..Default::default()
        })
    }

    #[test]
    fn img_column_is_forced_to_list_type() {
        let c = col("attachments", "img", SolrType::String);
        assert_eq!(c.solrtype, SolrType::List);
    }

    #[test]
    fn merged_with_picks_lower_hierarchy_type_and_max_indices() {
        // Both `String` and `Int` resolve to the same `col_type` (JString),
        // so the must-match `type` rule doesn't reject this pairing (unlike
        // e.g. String vs. TDouble, which *should* fail to merge).
        let a = Column { colidx: Some(3), displaycolidx: Some(1), ..col("name", "a_name", SolrType::String) };
        let b = Column { colidx: Some(1), displaycolidx: Some(4), ..col("name", "a_name", SolrType::Int) };
        let merged = a.merged_with(&b).unwrap();
        assert_eq!(merged.solrtype, SolrType::String);
        assert_eq!(merged.colidx, Some(3));
        assert_eq!(merged.displaycolidx, Some(4));
    }

    #[test]
    fn merged_with_errors_on_type_category_mismatch() {
        let a = col("name", "a_name", SolrType::String);
        let b = col("name", "a_name", SolrType::TDouble);
        assert!(a.merged_with(&b).is_err());
    }

    #[test]
    fn merged_with_errors_on_colname_mismatch() {
        let a = col("name", "a_name", SolrType::String);
        let b = col("other", "a_name", SolrType::String);
        assert!(a.merged_with(&b).is_err());
    }

    #[test]
    fn type_cast_coerces_numeric_strings() {
        assert_eq!(TypeCast::Int.apply(json!("42")), json!(42));
        assert_eq!(TypeCast::Float.apply(json!("1.5")), json!(1.5));
        assert_eq!(TypeCast::List.apply(Value::Null), json!([]));
        assert_eq!(TypeCast::List.apply(json!("x")), json!(["x"]));
    }

    #[test]
    fn field_model_resolves_by_solrname_or_colname_and_adds_synthetic_collection() {
        let model = FieldModel::new(vec![col("name", "a_name", SolrType::String)]);
        assert_eq!(model.resolve("a_name").unwrap().colname, "name");
        assert_eq!(model.resolve("name").unwrap().colname, "name");
        assert!(model.resolve("missing").is_err());
        assert_eq!(model.resolve(COLLECTION_SOLRNAME).unwrap().colname, COLLECTION_COLNAME);
    }

    #[test]
    fn rebind_tracks_renamed_solrnames_and_casts() {
        let backend = FieldModel::new(vec![col("name", "a_name", SolrType::String)]);
        let combined = Arc::new(FieldModel::new(vec![col("name", "name", SolrType::TDouble)]));

        let mut backend = backend;
        backend.rebind(&combined);

        assert_eq!(backend.changed_solrnames.get("a_name"), Some(&"name".to_string()));
        assert_eq!(backend.type_casts.get("a_name"), Some(&TypeCast::Float));
        assert!(backend.is_bound());
        // `by_solrname` is now keyed by the *effective* (combined) name, so
        // looking up the effective name returns this backend's local solrname.
        assert_eq!(backend.resolve_solrname("name").unwrap(), "a_name");
    }
}
