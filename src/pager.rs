//! Federating Pager — stable global pagination over N parallel backend
//! result streams: fan-out, drip interleaving, and the combined cache.
//!
//! Grounded on `CombinedApi.query` in `app/specify/controller.py`.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::cache::QueryCache;
use crate::client::{ceil_div, BackendClient, BackendQueryResult};
use crate::column::{FieldModel, COLLECTION_SOLRNAME};
use crate::document::Document;
use crate::drip::{self, Cursors};
use crate::error::ProxyError;
use crate::query::query_cache_key;

/// One global, cross-backend cache entry, keyed by
/// `(sorted collections, asc, sort, deephash(queryTerms))`.
#[derive(Debug, Clone, Default)]
pub struct GlobalCacheEntry {
    pages: HashMap<i64, Vec<Document>>,
    ending_cursors: Cursors,
    last_trickle: Vec<Document>,
    facet_counts: HashMap<String, i64>,
    total: i64,
    last_page: i64,
}

#[derive(Debug, Clone)]
pub struct PagerResult {
    pub docs: Vec<Document>,
    pub facet_counts: HashMap<String, i64>,
    pub total: i64,
    pub last_page: i64,
}

pub struct Pager {
    cache: QueryCache<String, GlobalCacheEntry>,
    rows: i64,
}

impl Pager {
    pub fn new(ttl: Duration, rows: i64) -> Self {
        Pager {
            cache: QueryCache::new(ttl),
            rows,
        }
    }

    pub fn invalidate(&mut self, ttl: Duration) {
        self.cache = QueryCache::new(ttl);
    }

    fn cache_key(&self, collections: &[String], sort: Option<&str>, asc: bool, query_terms: &[Value]) -> String {
        let mut sorted = collections.to_vec();
        sorted.sort();
        format!("[{:?}, {}]", sorted, query_cache_key(query_terms, sort, asc))
    }

    /// Runs one federated, paginated query across `collections`.
    ///
    /// `clients` is keyed by the same (long, discovery) collection name used
    /// in `collections`; `short_to_long` maps each client's short name back
    /// to that key, needed to route identity-cache rinsing by `doc.coll`.
    pub async fn query(
        &mut self,
        clients: &mut HashMap<String, BackendClient>,
        short_to_long: &HashMap<String, String>,
        schema: &FieldModel,
        query_terms: &[Value],
        collections: &[String],
        sort: Option<&str>,
        asc: bool,
        page: i64,
        cache_enabled: bool,
    ) -> Result<PagerResult, ProxyError> {
        if page < 0 {
            return Err(ProxyError::invalid_query("page must be positive"));
        }

        let sort_solrname = match sort {
            None => None,
            Some(s) => match schema.resolve_solrname(s) {
                Ok(sn) => Some(sn),
                Err(_) if s == COLLECTION_SOLRNAME => Some(s.to_string()),
                Err(_) => return Err(ProxyError::invalid_query(format!("column {s} does not exist"))),
            },
        };

        let key = self.cache_key(collections, sort_solrname.as_deref(), asc, query_terms);

        if let Some(entry) = self.cache.get(&key) {
            if let Some(docs) = entry.pages.get(&page) {
                let mut needed: Vec<Document> = (0..=page)
                    .flat_map(|i| entry.pages.get(&i).cloned().unwrap_or_default())
                    .collect();
                rinse_docs(&mut needed, clients, short_to_long, true);
                return Ok(PagerResult {
                    docs: docs.clone(),
                    facet_counts: entry.facet_counts.clone(),
                    total: entry.total,
                    last_page: entry.last_page,
                });
            }
        }

        let mut entry = self.cache.get(&key);

        let (mut cursors, mut current_page): (Cursors, i64) = match &entry {
            Some(e) => {
                let mut needed: Vec<Document> = (0..e.pages.len() as i64)
                    .flat_map(|i| e.pages.get(&i).cloned().unwrap_or_default())
                    .collect();
                rinse_docs(&mut needed, clients, short_to_long, true);
                (e.ending_cursors.clone(), e.pages.len() as i64)
            }
            None => (
                collections.iter().map(|c| (c.clone(), (0i64, 0usize))).collect(),
                0,
            ),
        };

        let mut results: HashMap<String, BackendQueryResult> = HashMap::new();
        for c in collections {
            let backend_page = cursors.get(c).map(|x| x.0).unwrap_or(0);
            let client = clients
                .get_mut(c)
                .ok_or_else(|| ProxyError::invalid_query(format!("unknown collection {c}")))?;
            let r = client
                .query(query_terms, true, sort_solrname.as_deref(), asc, backend_page, cache_enabled)
                .await?;
            results.insert(c.clone(), r);
        }

        if entry.is_none() {
            let mut facet_counts: HashMap<String, i64> = HashMap::new();
            for r in results.values() {
                if let Some(fc) = &r.facet_counts {
                    for (k, v) in fc {
                        *facet_counts.entry(k.clone()).or_insert(0) += v;
                    }
                }
            }
            let total: i64 = results.values().map(|r| r.total).sum();
            entry = Some(GlobalCacheEntry {
                pages: HashMap::new(),
                ending_cursors: cursors.clone(),
                last_trickle: Vec::new(),
                facet_counts,
                total,
                last_page: ceil_div(total, self.rows) - 1,
            });
        }
        let mut entry = entry.unwrap();

        if page > entry.last_page {
            return Err(ProxyError::invalid_query(format!(
                "last page is {}, requested page was {page}",
                entry.last_page
            )));
        }

        let mut docs = std::mem::take(&mut entry.last_trickle);

        loop {
            if results.is_empty() {
                break;
            }

            let drip_out = match sort_solrname.as_deref() {
                None => drip::rand_drip(&results, &mut cursors, asc),
                Some(s) if s == COLLECTION_SOLRNAME => drip::collection_drip(&results, &mut cursors, asc),
                Some(field) => drip::field_drip(&results, &mut cursors, asc, field),
            };
            docs.extend(drip_out);

            let at_end: Vec<String> = results
                .keys()
                .filter(|c| {
                    let off = cursors.get(*c).map(|x| x.1).unwrap_or(0);
                    off >= results[*c].docs.len()
                })
                .cloned()
                .collect();
            let end_and_more: Vec<String> = at_end
                .iter()
                .filter(|c| cursors[*c].0 < results[*c].last_page)
                .cloned()
                .collect();

            rinse_docs(&mut docs, clients, short_to_long, true);

            let mut pages_out: Vec<Vec<Document>> = docs.chunks(self.rows as usize).map(|c| c.to_vec()).collect();
            docs = match pages_out.last() {
                Some(last) if (last.len() as i64) < self.rows => pages_out.pop().unwrap(),
                _ => Vec::new(),
            };

            for p in pages_out {
                entry.pages.insert(current_page, p);
                current_page += 1;
            }

            if at_end.len() == results.len() && end_and_more.is_empty() {
                if !docs.is_empty() {
                    entry.pages.insert(current_page, docs.clone());
                    current_page += 1;
                    entry.last_trickle = Vec::new();
                }
                break;
            }

            if current_page > page {
                entry.last_trickle = docs.clone();
                break;
            }

            for c in &end_and_more {
                let (backend_page, _) = cursors[c];
                cursors.insert(c.clone(), (backend_page + 1, 0));
                let client = clients
                    .get_mut(c)
                    .ok_or_else(|| ProxyError::invalid_query(format!("unknown collection {c}")))?;
                let r = client
                    .query(query_terms, true, sort_solrname.as_deref(), asc, backend_page + 1, cache_enabled)
                    .await?;
                results.insert(c.clone(), r);
            }
            for c in &at_end {
                if !end_and_more.contains(c) {
                    results.remove(c);
                }
            }
        }

        entry.ending_cursors = cursors;
        let result = PagerResult {
            docs: entry.pages.get(&page).cloned().unwrap_or_default(),
            facet_counts: entry.facet_counts.clone(),
            total: entry.total,
            last_page: entry.last_page,
        };
        self.cache.set(key, entry);
        Ok(result)
    }
}

fn rinse_docs(docs: &mut [Document], clients: &mut HashMap<String, BackendClient>, short_to_long: &HashMap<String, String>, deep: bool) {
    for doc in docs.iter_mut() {
        let Some(long) = short_to_long.get(&doc.coll) else { continue };
        let Some(client) = clients.get_mut(long) else { continue };
        client.rinse_cache_items(std::slice::from_mut(doc), deep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::FieldModel;
    use serde_json::json;

    fn doc(spid: &str, coll: &str) -> Document {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("spid".to_string(), Value::String(spid.to_string()));
        Document { fields, coll: coll.to_string(), img: vec![] }
    }

    #[tokio::test]
    async fn query_serves_a_later_page_straight_from_the_global_cache() {
        let mut pager = Pager::new(Duration::from_secs(60), 2);
        let schema = FieldModel::new(vec![]);
        let collections = vec!["herps".to_string()];
        let query_terms = vec![json!("*")];

        let key = pager.cache_key(&collections, None, true, &query_terms);
        let mut pages = HashMap::new();
        pages.insert(0, vec![doc("1", "herps"), doc("2", "herps")]);
        pages.insert(1, vec![doc("3", "herps")]);
        let entry = GlobalCacheEntry {
            pages,
            ending_cursors: HashMap::new(),
            last_trickle: Vec::new(),
            facet_counts: HashMap::new(),
            total: 3,
            last_page: 1,
        };
        pager.cache.set(key, entry);

        let mut clients: HashMap<String, BackendClient> = HashMap::new();
        let short_to_long: HashMap<String, String> = HashMap::new();
        let result = pager
            .query(&mut clients, &short_to_long, &schema, &query_terms, &collections, None, true, 1, true)
            .await
            .unwrap();

        assert_eq!(result.docs.len(), 1);
        assert_eq!(result.docs[0].coll, "herps");
        assert_eq!(result.total, 3);
        assert_eq!(result.last_page, 1);
    }

    #[tokio::test]
    async fn query_rejects_a_negative_page_before_touching_any_backend() {
        let mut pager = Pager::new(Duration::from_secs(60), 50);
        let schema = FieldModel::new(vec![]);
        let mut clients: HashMap<String, BackendClient> = HashMap::new();
        let short_to_long: HashMap<String, String> = HashMap::new();
        let query_terms: Vec<Value> = Vec::new();
        let collections: Vec<String> = Vec::new();

        let err = pager
            .query(&mut clients, &short_to_long, &schema, &query_terms, &collections, None, true, -1, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidQuery(_)));
    }
}
