//! Backend Client — single-backend operations: settings, model fetch, and
//! querying with type/name remap and attachment parsing.
//!
//! Grounded on `SpecifyApi` in `app/specify/api.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::column::{Column, ColumnSpec, FieldModel, TypeCast, COLLECTION_SOLRNAME};
use crate::document::{Attachment, Document};
use crate::error::ProxyError;
use crate::http::HttpClient;
use crate::query::QueryTerm;

pub const DEFAULT_QUERY_ROWS: usize = 50;

static IMG_BARE_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(\w+)(:(".*?"|.))"#).unwrap());

/// Result of one backend query, after doc post-processing.
#[derive(Debug, Clone, Default)]
pub struct BackendQueryResult {
    pub docs: Vec<Document>,
    pub facet_counts: Option<HashMap<String, i64>>,
    pub last_page: i64,
    pub total: i64,
}

/// The cache entry this client keeps per `(asc, sort, deephash(queryTerms))`.
#[derive(Debug, Clone)]
struct BackendCacheEntry {
    facet_counts: HashMap<String, i64>,
    pages: HashMap<i64, Vec<Document>>,
    last_page: i64,
    total: i64,
}

/// A single backend (collection) endpoint.
pub struct BackendClient {
    pub short_name: String,
    base_url: String,
    http: HttpClient,
    settings_json: Option<Value>,
    pub column_model: Option<FieldModel>,
    follow_model: Option<Arc<FieldModel>>,
    pub ready: bool,
    pub stale: bool,
    cache: QueryCache<String, BackendCacheEntry>,
    /// per-document identity cache, keyed by `spid`
    identity_cache: QueryCache<String, Document>,
    pub default_query_rows: usize,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, collection: impl Into<String>, query_rows: usize, ttl: Duration) -> Self {
        let collection = collection.into();
        let short_name = collection.replace("vouchers", "");
        let base = base_url.into();
        let url = format!("{}/{}", base.trim_end_matches('/'), collection.trim_matches('/'));
        BackendClient {
            short_name,
            base_url: url,
            http: HttpClient::new(),
            settings_json: None,
            column_model: None,
            follow_model: None,
            ready: false,
            stale: true,
            cache: QueryCache::new(ttl),
            identity_cache: QueryCache::new(ttl),
            default_query_rows: query_rows,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Fetches `settings.json` and the field model once and marks ready.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        self.fetch_settings().await?;
        self.fetch_model().await?;
        self.ready = true;
        Ok(())
    }

    /// Merges `{shortName}` into the backend's settings JSON and returns it.
    pub async fn settings(&mut self) -> Result<Value, ProxyError> {
        let settings = self.fetch_settings().await?;
        let mut merged = serde_json::Map::new();
        merged.insert("shortName".to_string(), Value::String(self.short_name.clone()));
        if let Value::Object(map) = settings {
            merged.extend(map);
        }
        Ok(Value::Object(merged))
    }

    async fn fetch_settings(&mut self) -> Result<Value, ProxyError> {
        let raw = self
            .http
            .get_json(&self.url("resources/config/settings.json"))
            .await?;
        let first = raw
            .as_array()
            .and_then(|a| a.first())
            .cloned()
            .ok_or_else(|| ProxyError::Upstream {
                status: 0,
                detail: Some(Value::String("settings.json did not contain an array".into())),
            })?;
        if Some(&first) != self.settings_json.as_ref() {
            self.settings_json = Some(first.clone());
        }
        Ok(first)
    }

    async fn fetch_model(&mut self) -> Result<(), ProxyError> {
        let raw = self
            .http
            .get_json(&self.url("resources/config/fldmodel.json"))
            .await?;
        let cols: Vec<Value> = raw
            .as_array()
            .cloned()
            .ok_or_else(|| ProxyError::Upstream {
                status: 0,
                detail: Some(Value::String("fldmodel.json was not an array".into())),
            })?;
        let columns = cols
            .into_iter()
            .map(parse_column)
            .collect::<Result<Vec<_>, _>>()?;
        let new_model = FieldModel::from_json(columns);

        let changed = match &self.column_model {
            None => true,
            Some(old) => old.columns.len() != new_model.columns.len()
                || old
                    .columns
                    .iter()
                    .zip(new_model.columns.iter())
                    .any(|(a, b)| a.colname != b.colname || a.solrname != b.solrname || a.solrtype != b.solrtype),
        };
        if changed {
            self.stale = true;
            self.column_model = Some(new_model);
        }
        Ok(())
    }

    /// Refetches the field model; marks `stale` if it changed.
    pub async fn check_if_stale(&mut self) -> Result<bool, ProxyError> {
        self.fetch_model().await?;
        Ok(self.stale)
    }

    /// Binds this client to the combined, merged schema.
    pub fn set_follow_model(&mut self, combined: &Arc<FieldModel>) {
        if let Some(model) = self.column_model.as_mut() {
            model.rebind(combined);
        }
        self.follow_model = Some(Arc::clone(combined));
        self.stale = false;
    }

    fn column_model(&self) -> Result<&FieldModel, ProxyError> {
        self.column_model
            .as_ref()
            .ok_or_else(|| ProxyError::invalid_query("backend schema not loaded yet"))
    }

    fn follow_model(&self) -> Result<&FieldModel, ProxyError> {
        self.follow_model
            .as_deref()
            .ok_or_else(|| ProxyError::invalid_query("backend not bound to a combined schema yet"))
    }

    /// Resolve `sort`, dropping it on lookup failure when `ignore_missing`.
    fn resolve_sort(&self, sort: Option<&str>, ignore_missing: bool) -> Result<Option<String>, ProxyError> {
        let Some(sort) = sort else { return Ok(None) };
        match self.column_model()?.resolve_solrname(sort) {
            Ok(solrname) => Ok(Some(solrname)),
            Err(e) if ignore_missing => {
                debug!(field = sort, "dropping unknown sort field");
                let _ = e;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The raw, uncached backend query: one HTTP request, with full doc
    /// post-processing. `geo_count` requests the facet fan-out.
    async fn raw_query(
        &mut self,
        query_terms: &[Value],
        ignore_missing: bool,
        geo_count: bool,
        sort: Option<&str>,
        asc: bool,
        page: i64,
    ) -> Result<BackendQueryResult, ProxyError> {
        let rows = self.default_query_rows as i64;
        let start = page * rows;

        let term = QueryTerm::parse_array(query_terms)?;
        let q_text = term.translate(self.column_model()?, ignore_missing)?;

        let mut params = vec![
            ("wt".to_string(), "json".to_string()),
            ("rows".to_string(), rows.to_string()),
            ("start".to_string(), start.to_string()),
            ("q".to_string(), q_text),
        ];

        if geo_count {
            params.push(("facet".to_string(), "on".to_string()));
            params.push(("facet.field".to_string(), "geoc".to_string()));
            params.push(("facet.limit".to_string(), "-1".to_string()));
            params.push(("facet.mincount".to_string(), "1".to_string()));
        }

        // `sort` has already been resolved to this backend's local solrname
        // by the caller (`query`); the synthetic `coll` field has no wire
        // representation to sort by, so it's simply omitted here.
        if let Some(solrname) = sort {
            if solrname != COLLECTION_SOLRNAME {
                params.push((
                    "sort".to_string(),
                    format!("{} {}", solrname, if asc { "asc" } else { "desc" }),
                ));
            }
        }

        let query_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let resp = self.http.get_json(&self.url(&format!("select?{query_string}"))).await?;

        let raw_docs = resp["response"]["docs"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let num_found = resp["response"]["numFound"].as_i64().unwrap_or(0);

        let mut docs = Vec::with_capacity(raw_docs.len());
        for raw in raw_docs {
            docs.push(self.post_process_doc(raw)?);
        }

        let facet_counts = if geo_count {
            Some(parse_facet_counts(&resp))
        } else {
            None
        };

        let last_page = ceil_div(num_found, rows) - 1;

        Ok(BackendQueryResult {
            docs,
            facet_counts,
            last_page,
            total: num_found,
        })
    }

    fn post_process_doc(&self, mut raw: Value) -> Result<Document, ProxyError> {
        let model = self.column_model()?;
        if let Value::Object(map) = &mut raw {
            map.remove("contents");

            let img_raw = map.remove("img");

            let mut renamed = serde_json::Map::new();
            for (k, v) in map.drain() {
                let cast = model.type_casts.get(&k).copied().unwrap_or(TypeCast::Str);
                let v = cast.apply(v);
                let k = model.changed_solrnames.get(&k).cloned().unwrap_or(k);
                renamed.insert(k, v);
            }

            let mut fields = std::collections::BTreeMap::new();
            for (k, v) in renamed {
                fields.insert(k, v);
            }

            let img = match img_raw {
                Some(Value::String(s)) => parse_img(&s, &self.short_name)?,
                Some(Value::Array(items)) => items
                    .into_iter()
                    .map(|v| attachment_from_value(&v, &self.short_name))
                    .collect(),
                _ => Vec::new(),
            };

            Ok(Document {
                fields,
                coll: self.short_name.clone(),
                img,
            })
        } else {
            Err(ProxyError::Upstream {
                status: 0,
                detail: Some(Value::String("backend returned a non-object document".into())),
            })
        }
    }

    /// Replaces documents in `items` with their previously-cached instance
    /// (deduplicating identical `spid`s), or inserts them if `deep`.
    pub fn rinse_cache_items(&mut self, items: &mut [Document], deep: bool) {
        for item in items.iter_mut() {
            let Some(spid) = item.spid() else { continue };
            if deep {
                if let Some(cached) = self.identity_cache.get(&spid) {
                    *item = cached;
                } else {
                    self.identity_cache.set(spid, item.clone());
                }
            } else {
                self.identity_cache.get(&spid);
            }
        }
    }

    fn cache_key(&self, query_terms: &[Value], sort: Option<&str>, asc: bool) -> String {
        crate::query::query_cache_key(query_terms, sort, asc)
    }

    /// Cached, paginated query, per §4.4.
    pub async fn query(
        &mut self,
        query_terms: &[Value],
        ignore_missing: bool,
        sort: Option<&str>,
        asc: bool,
        page: i64,
        cache: bool,
    ) -> Result<BackendQueryResult, ProxyError> {
        let sort = self.resolve_sort(sort, ignore_missing)?;

        if !cache {
            return self
                .raw_query(query_terms, ignore_missing, true, sort.as_deref(), asc, page)
                .await;
        }

        let key = self.cache_key(query_terms, sort.as_deref(), asc);

        let existing = self.cache.get(&key);
        let (mut entry, docs, fresh) = match existing {
            Some(mut entry) => {
                if page > entry.last_page {
                    (entry, Vec::new(), false)
                } else if let Some(docs) = entry.pages.get(&page).cloned() {
                    (entry, docs, false)
                } else {
                    let raw = self
                        .raw_query(query_terms, ignore_missing, false, sort.as_deref(), asc, page)
                        .await?;
                    entry.pages.insert(page, raw.docs.clone());
                    (entry, raw.docs, true)
                }
            }
            None => {
                let raw = self
                    .raw_query(query_terms, ignore_missing, true, sort.as_deref(), asc, page)
                    .await?;
                let mut pages = HashMap::new();
                pages.insert(page, raw.docs.clone());
                let entry = BackendCacheEntry {
                    facet_counts: raw.facet_counts.unwrap_or_default(),
                    pages,
                    last_page: raw.last_page,
                    total: raw.total,
                };
                (entry, raw.docs, true)
            }
        };

        let mut docs = docs;
        self.rinse_cache_items(&mut docs, fresh);
        if fresh {
            entry.pages.insert(page, docs.clone());
        }

        let result = BackendQueryResult {
            docs,
            facet_counts: Some(entry.facet_counts.clone()),
            last_page: entry.last_page,
            total: entry.total,
        };
        self.cache.set(key, entry);
        Ok(result)
    }
}

fn parse_column(v: Value) -> Result<Column, ProxyError> {
    let colname = v["colname"]
        .as_str()
        .ok_or_else(|| ProxyError::invalid_query("column missing colname"))?
        .to_string();
    let solrname = v["solrname"]
        .as_str()
        .ok_or_else(|| ProxyError::invalid_query("column missing solrname"))?
        .to_string();
    let solrtype = match v["solrtype"].as_str() {
        Some("string") => crate::column::SolrType::String,
        Some("tdouble") => crate::column::SolrType::TDouble,
        Some("int") => crate::column::SolrType::Int,
        Some("list") => crate::column::SolrType::List,
        _ => return Err(ProxyError::invalid_query(format!("unknown solrtype for {colname}"))),
    };
    Ok(Column::new(ColumnSpec {
        colname,
        solrname,
        solrtype,
        title: v["title"].as_str().map(str::to_string),
        width: v["width"].as_i64(),
        sptable: v["sptable"].as_str().map(str::to_string),
        sptabletitle: v["sptabletitle"].as_str().map(str::to_string),
        spfld: v["spfld"].as_str().map(str::to_string),
        spfldtitle: v["spfldtitle"].as_str().map(str::to_string),
        treeid: v["treeid"].as_str().map(str::to_string),
        treerank: v["treerank"].as_i64(),
        colidx: v["colidx"].as_i64(),
        advancedsearch: v["advancedsearch"].as_str().map(str::to_string),
        displaycolidx: v["displaycolidx"].as_i64(),
    }))
}

fn parse_facet_counts(resp: &Value) -> HashMap<String, i64> {
    let flat = resp["facet_counts"]["facet_fields"]["geoc"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let mut out = HashMap::new();
    let mut i = 0;
    while i + 1 < flat.len() {
        if let Some(k) = flat[i].as_str() {
            let count = flat[i + 1].as_i64().unwrap_or(0);
            out.insert(k.to_string(), count);
        }
        i += 2;
    }
    out
}

/// Re-quote bare identifier keys in the backend's quasi-JSON `img` blob
/// before parsing it, per §4.4 / §6.
fn parse_img(raw: &str, short_name: &str) -> Result<Vec<Attachment>, ProxyError> {
    let quoted = IMG_BARE_KEY.replace_all(raw, "\"$1\"$2");
    let value: Value = match serde_json::from_str(&quoted) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse img attachment blob");
            return Ok(Vec::new());
        }
    };
    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => Vec::new(),
    };
    Ok(items.iter().map(|v| attachment_from_value(v, short_name)).collect())
}

fn attachment_from_value(v: &Value, short_name: &str) -> Attachment {
    Attachment {
        id: v.get("AttachmentID").cloned().unwrap_or(Value::Null),
        name: v.get("AttachmentLocation").cloned().unwrap_or(Value::Null),
        title: v.get("Title").cloned().unwrap_or(Value::Null),
        coll: short_name.to_string(),
    }
}

pub(crate) fn ceil_div(a: i64, b: i64) -> i64 {
    if b == 0 {
        0
    } else {
        -(-a / b)
    }
}

/// Minimal query-parameter percent-encoding (kept unreserved: `A-Za-z0-9-_.~`).
fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::SolrType;
    use serde_json::json;

    #[test]
    fn ceil_div_rounds_up_and_handles_zero_total() {
        assert_eq!(ceil_div(0, 50), -1);
        assert_eq!(ceil_div(1, 50), 0);
        assert_eq!(ceil_div(50, 50), 0);
        assert_eq!(ceil_div(51, 50), 1);
        assert_eq!(ceil_div(10, 0), 0);
    }

    #[test]
    fn urlencoding_encode_escapes_reserved_bytes_only() {
        assert_eq!(urlencoding_encode("a_b-c.d~e"), "a_b-c.d~e");
        assert_eq!(urlencoding_encode("name asc"), "name%20asc");
        assert_eq!(urlencoding_encode("a:b"), "a%3Ab");
    }

    #[test]
    fn parse_column_reads_known_solrtypes() {
        let raw = json!({"colname": "Name", "solrname": "1_name", "solrtype": "tdouble"});
        let col = parse_column(raw).unwrap();
        assert_eq!(col.colname, "Name");
        assert_eq!(col.solrtype, SolrType::TDouble);
    }

    #[test]
    fn parse_column_rejects_unknown_solrtype() {
        let raw = json!({"colname": "Name", "solrname": "1_name", "solrtype": "bogus"});
        assert!(parse_column(raw).is_err());
    }

    #[test]
    fn parse_facet_counts_pairs_up_flat_list() {
        let resp = json!({"facet_counts": {"facet_fields": {"geoc": ["US", 3, "CZ", 1]}}});
        let counts = parse_facet_counts(&resp);
        assert_eq!(counts.get("US"), Some(&3));
        assert_eq!(counts.get("CZ"), Some(&1));
    }

    #[test]
    fn parse_img_requotes_bare_keys_before_parsing() {
        // The backend's `img` blob uses bare (unquoted) keys; a single
        // attachment still comes back wrapped in a one-element list.
        let raw = r#"{AttachmentID:1,AttachmentLocation:"a.jpg",Title:"A"}"#;
        let atts = parse_img(raw, "herps").unwrap();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].id, json!(1));
        assert_eq!(atts[0].name, json!("a.jpg"));
        assert_eq!(atts[0].coll, "herps");
    }

    #[test]
    fn parse_img_returns_empty_on_unparseable_blob() {
        assert_eq!(parse_img("not json at all {{{", "herps").unwrap(), Vec::new());
    }

    fn client_with_model(columns: Vec<Column>) -> BackendClient {
        let mut client = BackendClient::new("http://localhost:8983/solr", "herpsvouchers", DEFAULT_QUERY_ROWS, Duration::from_secs(60));
        client.column_model = Some(FieldModel::from_json(columns));
        client
    }

    #[test]
    fn post_process_doc_casts_renames_and_splits_off_img() {
        let model_col = Column::new(ColumnSpec {
            colname: "Name".to_string(),
            solrname: "1_name".to_string(),
            solrtype: SolrType::String,
            ..Default::default()
        });
        let mut client = client_with_model(vec![model_col]);
        client.column_model.as_mut().unwrap().type_casts.insert("1_name".to_string(), TypeCast::Str);
        client.column_model.as_mut().unwrap().changed_solrnames.insert("1_name".to_string(), "name".to_string());

        let raw = json!({"1_name": "Rex", "contents": "drop me", "spid": "herps.1", "img": []});
        let doc = client.post_process_doc(raw).unwrap();

        assert_eq!(doc.fields.get("name"), Some(&json!("Rex")));
        assert!(!doc.fields.contains_key("contents"));
        assert!(!doc.fields.contains_key("1_name"));
        assert_eq!(doc.coll, "herps");
        assert!(doc.img.is_empty());
    }

    #[test]
    fn rinse_cache_items_deduplicates_by_spid_on_deep_pass() {
        let mut client = client_with_model(vec![]);
        let mut first = vec![Document { fields: Default::default(), coll: "herps".to_string(), img: vec![] }];
        first[0].fields.insert("spid".to_string(), json!("herps.1"));
        client.rinse_cache_items(&mut first, true);

        let mut second = vec![Document { fields: Default::default(), coll: "herps".to_string(), img: vec![] }];
        second[0].fields.insert("spid".to_string(), json!("herps.1"));
        second[0].fields.insert("extra".to_string(), json!("should be discarded"));
        client.rinse_cache_items(&mut second, true);

        // The second document is replaced by the identity-cached first one.
        assert!(!second[0].fields.contains_key("extra"));
    }
}
