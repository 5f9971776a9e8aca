//! Drippers — the three interleaving strategies that decide, for one fan-out
//! round, in what order buffered per-collection documents get appended to
//! the combined result trickle.
//!
//! Each dripper consumes a snapshot of the collections that started this
//! round with a non-empty buffer, and stops as soon as *any one* of them
//! runs out — even if the others still have buffered documents. The Pager
//! refills the exhausted backend and calls the dripper again next round.
//!
//! Grounded on `_rand_drip`/`_collection_drip`/`_field_drip_maker` in
//! `app/specify/controller.py`.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use crate::client::BackendQueryResult;
use crate::document::Document;

/// Per-collection `(backend_page, offset_within_backend_page)` cursor.
pub type Cursors = HashMap<String, (i64, usize)>;

fn seed_from(spid: Option<&String>) -> u64 {
    let Some(spid) = spid else { return 0 };
    spid.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
}

/// Collections whose buffer was non-empty at the start of this round, in
/// ascending name order.
fn nonempty_order(results: &HashMap<String, BackendQueryResult>) -> Vec<String> {
    let mut order: Vec<String> = results
        .iter()
        .filter(|(_, r)| !r.docs.is_empty())
        .map(|(c, _)| c.clone())
        .collect();
    order.sort();
    order
}

/// Randomly weighted drip: each step draws one of the collections that
/// started this round non-empty, weighted by its whole-query `total`.
pub fn rand_drip(results: &HashMap<String, BackendQueryResult>, cursors: &mut Cursors, _asc: bool) -> Vec<Document> {
    let order = nonempty_order(results);
    if order.is_empty() {
        return Vec::new();
    }

    let first_spid = results[&order[0]].docs[0].spid();
    let mut rng = StdRng::seed_from_u64(seed_from(first_spid.as_ref()));
    let weights: Vec<i64> = order.iter().map(|c| results[c].total.max(1)).collect();
    let total_weight: i64 = weights.iter().sum();

    let mut out = Vec::new();
    loop {
        // Stop as soon as any collection in `order` is exhausted.
        if order.iter().any(|c| {
            let (_, off) = cursors.get(c).copied().unwrap_or((0, 0));
            off >= results[c].docs.len()
        }) {
            return out;
        }

        let mut draw = rng.gen_range(0..total_weight.max(1));
        let mut idx = 0;
        for (i, w) in weights.iter().enumerate() {
            if draw < *w {
                idx = i;
                break;
            }
            draw -= w;
        }
        let chosen = &order[idx];
        let (page, off) = cursors.entry(chosen.clone()).or_insert((0, 0)).clone();
        out.push(results[chosen].docs[off].clone());
        cursors.insert(chosen.clone(), (page, off + 1));
    }
}

/// By-collection drip: yields every buffered doc of the single
/// alphabetically-first (or, if descending, -last) non-empty collection,
/// then stops.
pub fn collection_drip(results: &HashMap<String, BackendQueryResult>, cursors: &mut Cursors, asc: bool) -> Vec<Document> {
    let mut order = nonempty_order(results);
    if !asc {
        order.reverse();
    }
    let Some(c) = order.first() else { return Vec::new() };

    let mut out = Vec::new();
    loop {
        let (page, off) = cursors.entry(c.clone()).or_insert((0, 0)).clone();
        if off >= results[c].docs.len() {
            break;
        }
        out.push(results[c].docs[off].clone());
        cursors.insert(c.clone(), (page, off + 1));
    }
    out
}

/// By-field drip: at each step, compares the current head of every
/// collection that started this round non-empty, and emits whichever
/// compares minimum (`asc`) or maximum (otherwise) on `field`.
pub fn field_drip(
    results: &HashMap<String, BackendQueryResult>,
    cursors: &mut Cursors,
    asc: bool,
    field: &str,
) -> Vec<Document> {
    let order = nonempty_order(results);
    let mut out = Vec::new();
    loop {
        let mut chosen: Option<(&String, &Value)> = None;
        let mut exhausted = false;
        for c in &order {
            let (_, off) = cursors.get(c).copied().unwrap_or((0, 0));
            let Some(doc) = results[c].docs.get(off) else {
                exhausted = true;
                break;
            };
            let Some(v) = doc.get(field) else { continue };
            chosen = match chosen {
                None => Some((c, v)),
                Some((_, cur)) => {
                    let better = if asc { cmp_value(v, cur).is_lt() } else { cmp_value(v, cur).is_gt() };
                    if better { Some((c, v)) } else { chosen }
                }
            };
        }
        if exhausted {
            return out;
        }
        let Some((c, _)) = chosen else { return out };
        let c = c.clone();
        let (page, off) = cursors.entry(c.clone()).or_insert((0, 0)).clone();
        out.push(results[&c].docs[off].clone());
        cursors.insert(c, (page, off + 1));
    }
}

fn cmp_value(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .unwrap_or(0.0)
            .partial_cmp(&b.as_f64().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
