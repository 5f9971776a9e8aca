//! Coordinator — backend discovery, schema sync, lifecycle, and the public
//! operations (`settings`, `model`, `query`, `querydump`) an outer HTTP layer
//! (out of scope here) would call.
//!
//! Grounded on `CombinedApi` in `app/specify/controller.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::client::BackendClient;
use crate::column::FieldModel;
use crate::error::ProxyError;
use crate::http::HttpClient;
use crate::merge::fold_models;
use crate::pager::{Pager, PagerResult};

static COLLECTION_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<a href="(.*?)""#).unwrap());

pub const OR_TAG: i64 = crate::query::OR;
pub const AND_TAG: i64 = crate::query::AND;

struct Inner {
    clients: HashMap<String, BackendClient>,
    schema: Arc<FieldModel>,
    collections: Vec<String>,
    short_names: HashMap<String, String>,
    pager: Pager,
}

/// A read-only federation over every backend discovered at `base_url`.
pub struct Coordinator {
    base_url: String,
    http: HttpClient,
    query_rows: usize,
    ttl: Duration,
    inner: RwLock<Option<Inner>>,
}

impl Coordinator {
    pub fn new(base_url: impl Into<String>, query_rows: usize, ttl: Duration) -> Self {
        Coordinator {
            base_url: base_url.into(),
            http: HttpClient::new(),
            query_rows,
            ttl,
            inner: RwLock::new(None),
        }
    }

    pub async fn ready(&self) -> bool {
        self.inner.read().await.is_some()
    }

    async fn discover(&self) -> Result<Vec<String>, ProxyError> {
        let text = self.http.get_text(&self.base_url).await?;
        Ok(COLLECTION_LINK.captures_iter(&text).map(|c| c[1].to_string()).collect())
    }

    /// Constructs and starts every `BackendClient`, merges their schemas,
    /// and rebinds each client to the combined model.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let collections = self.discover().await?;

        let mut clients: HashMap<String, BackendClient> = HashMap::new();
        for c in &collections {
            let mut client = BackendClient::new(&self.base_url, c, self.query_rows, self.ttl);
            client.start().await?;
            clients.insert(c.clone(), client);
        }

        let short_names: HashMap<String, String> = collections
            .iter()
            .map(|c| (c.replace("vouchers", ""), c.clone()))
            .collect();

        let schema = self.merge_and_rebind(&mut clients, &collections)?;

        let mut guard = self.inner.write().await;
        *guard = Some(Inner {
            clients,
            schema,
            collections,
            short_names,
            pager: Pager::new(self.ttl, self.query_rows as i64),
        });
        info!("coordinator started");
        Ok(())
    }

    fn merge_and_rebind(
        &self,
        clients: &mut HashMap<String, BackendClient>,
        collections: &[String],
    ) -> Result<Arc<FieldModel>, ProxyError> {
        let models: Vec<FieldModel> = collections
            .iter()
            .map(|c| clients[c].column_model.clone().expect("client started"))
            .collect();
        let combined = Arc::new(fold_models(&models)?);

        for c in collections {
            if let Some(client) = clients.get_mut(c) {
                client.set_follow_model(&combined);
            }
        }
        Ok(combined)
    }

    /// Re-checks the discovered collection set; if changed, schedules a
    /// fresh `start()` and returns the (short-named) list regardless.
    pub async fn list_collections(&self) -> Result<Vec<String>, ProxyError> {
        let discovered = self.discover().await?;

        let changed = {
            let guard = self.inner.read().await;
            match &*guard {
                Some(inner) => {
                    let mut a = inner.collections.clone();
                    let mut b = discovered.clone();
                    a.sort();
                    b.sort();
                    a != b
                }
                None => true,
            }
        };

        if changed {
            debug!("collection set changed, refreshing");
            let _ = self.start().await;
        }

        let mut out: Vec<String> = discovered.iter().map(|c| c.replace("vouchers", "")).collect();
        out.sort();
        Ok(out)
    }

    /// `{search_syntax, collections: {shortName -> settings}}`.
    pub async fn settings(&self) -> Result<Value, ProxyError> {
        self.list_collections().await?;

        // `BackendClient::settings` takes `&mut self`; fetch concurrently
        // over disjoint mutable borrows of the map's values.
        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or_else(|| ProxyError::invalid_query("coordinator not started"))?;

        let futures = inner.clients.values_mut().map(|c| c.settings());
        let results = join_all(futures).await;

        let mut collections = serde_json::Map::new();
        for r in results {
            let settings = r?;
            if let Some(short) = settings.get("shortName").and_then(Value::as_str) {
                collections.insert(short.to_string(), settings.clone());
            }
        }

        Ok(serde_json::json!({
            "search_syntax": {"OR": OR_TAG, "AND": AND_TAG},
            "collections": collections,
        }))
    }

    /// Returns the combined schema's columns, re-merging if any backend
    /// reports a stale model (when `poke`).
    pub async fn model(&self, poke: bool) -> Result<Vec<crate::column::Column>, ProxyError> {
        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or_else(|| ProxyError::invalid_query("coordinator not started"))?;

        let mut stale = false;
        if poke {
            for client in inner.clients.values_mut() {
                if client.check_if_stale().await? {
                    stale = true;
                }
            }
        }
        stale = stale || inner.clients.values().any(|c| c.stale);

        if stale {
            debug!("schema stale, re-merging");
            let collections = inner.collections.clone();
            let models: Vec<FieldModel> = collections
                .iter()
                .map(|c| inner.clients[c].column_model.clone().expect("started"))
                .collect();
            let combined = Arc::new(fold_models(&models)?);
            for c in &collections {
                if let Some(client) = inner.clients.get_mut(c) {
                    client.set_follow_model(&combined);
                }
            }
            inner.schema = combined;
            inner.pager.invalidate(self.ttl);
        }

        Ok(inner.schema.columns.clone())
    }

    /// Maps user-facing short collection names (or empty = all) to the
    /// discovered long names, validating each.
    fn resolve_collections(&self, inner: &Inner, colls: &[String]) -> Result<Vec<String>, ProxyError> {
        if colls.is_empty() {
            let mut all = inner.collections.clone();
            all.sort();
            return Ok(all);
        }
        colls
            .iter()
            .map(|k| {
                let long = inner.short_names.get(k).cloned().unwrap_or_else(|| k.clone());
                if inner.collections.contains(&long) {
                    Ok(long)
                } else {
                    Err(ProxyError::invalid_query(format!("{k} is not a collection")))
                }
            })
            .collect()
    }

    async fn run_query(
        &self,
        query_terms: &[Value],
        colls: &[String],
        sort: Option<&str>,
        asc: bool,
        page: i64,
        cache: bool,
    ) -> Result<PagerResult, ProxyError> {
        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or_else(|| ProxyError::invalid_query("coordinator not started"))?;

        let collections = self.resolve_collections(&*inner, colls)?;
        let schema = Arc::clone(&inner.schema);

        inner
            .pager
            .query(
                &mut inner.clients,
                &inner.short_names,
                &schema,
                query_terms,
                &collections,
                sort,
                asc,
                page,
                cache,
            )
            .await
    }

    /// The `query` operation: validated collection filter, requested page.
    pub async fn query(
        &self,
        query_terms: &[Value],
        colls: &[String],
        sort: Option<&str>,
        asc: bool,
        page: i64,
    ) -> Result<PagerResult, ProxyError> {
        self.run_query(query_terms, colls, sort, asc, page, true).await
    }

    /// Like `query`, but ignores collection-filter validation (any unknown
    /// token is dropped rather than erroring) and always returns page 0.
    pub async fn querydump(
        &self,
        query_terms: &[Value],
        colls: &[String],
        sort: Option<&str>,
        asc: bool,
    ) -> Result<PagerResult, ProxyError> {
        let guard = self.inner.read().await;
        let inner = guard.as_ref().ok_or_else(|| ProxyError::invalid_query("coordinator not started"))?;
        let collections: Vec<String> = if colls.is_empty() {
            let mut all = inner.collections.clone();
            all.sort();
            all
        } else {
            colls
                .iter()
                .map(|k| inner.short_names.get(k).cloned().unwrap_or_else(|| k.clone()))
                .filter(|c| inner.collections.contains(c))
                .collect()
        };
        drop(guard);
        self.run_query_with_resolved(query_terms, &collections, sort, asc, 0, true).await
    }

    async fn run_query_with_resolved(
        &self,
        query_terms: &[Value],
        collections: &[String],
        sort: Option<&str>,
        asc: bool,
        page: i64,
        cache: bool,
    ) -> Result<PagerResult, ProxyError> {
        let mut guard = self.inner.write().await;
        let inner = guard.as_mut().ok_or_else(|| ProxyError::invalid_query("coordinator not started"))?;
        let schema = Arc::clone(&inner.schema);
        inner
            .pager
            .query(
                &mut inner.clients,
                &inner.short_names,
                &schema,
                query_terms,
                collections,
                sort,
                asc,
                page,
                cache,
            )
            .await
    }
}
