//! Schema Merger — order-preserving merge of two display-indexed schemas.
//!
//! A direct transcription of `sort_place`/`merge` in `app/specify/merge.py`,
//! generalized from the "list of single-key dicts" shape used there to a
//! `Vec<(String, Option<i64>)>` here, and from `FieldModel.merged_model` for
//! the column-combination step.

use std::sync::Arc;

use crate::column::{Column, FieldModel};
use crate::error::ProxyError;

/// One `{colname: displaycolidx}` entry, `None` standing in for Python's `None`.
pub type PlaceEntry = (String, Option<i64>);

/// Stable-sorts entries with a known `displaycolidx` by that index, while
/// re-inserting `None`-valued entries back at their original positional
/// index. Mirrors `sort_place` exactly, including the documented quirk that
/// `displaycolidx == Some(0)` counts as "numbered" (checked with
/// `is_none()`, not truthiness).
pub fn sort_place(entries: &[PlaceEntry]) -> Vec<PlaceEntry> {
    let mut numbered_with_pos: Vec<(usize, PlaceEntry)> = Vec::new();
    let mut none_with_pos: Vec<(usize, PlaceEntry)> = Vec::new();

    for (i, e) in entries.iter().enumerate() {
        if e.1.is_none() {
            none_with_pos.push((i, e.clone()));
        } else {
            numbered_with_pos.push((i, e.clone()));
        }
    }

    // stable sort by displaycolidx
    let mut numbered = numbered_with_pos;
    numbered.sort_by_key(|(_, e)| e.1);

    let mut out: Vec<PlaceEntry> = numbered.into_iter().map(|(_, e)| e).collect();
    for (original_pos, e) in none_with_pos {
        let idx = original_pos.min(out.len());
        out.insert(idx, e);
    }
    out
}

/// Interleave two already-`sort_place`d sequences into one combined display
/// order, per §4.2 Step 2.
pub fn interleave(a: &[PlaceEntry], b: &[PlaceEntry]) -> Vec<PlaceEntry> {
    let a = sort_place(a);
    let b = sort_place(b);

    let mut ai = 0usize;
    let mut bi = 0usize;
    let mut d: Option<i64> = None;
    let mut ret: Vec<PlaceEntry> = Vec::new();

    let mut conflict = false;
    let mut wina: Vec<String> = Vec::new();
    let mut winb: Vec<String> = Vec::new();
    let mut bk: std::collections::HashMap<String, Option<i64>> = std::collections::HashMap::new();

    loop {
        let x: Option<PlaceEntry> = a.get(ai).cloned();
        let y: Option<PlaceEntry> = b.get(bi).cloned();

        let xk = x.as_ref().map(|e| e.0.clone());
        let yk = y.as_ref().map(|e| e.0.clone());
        let xv = x.as_ref().and_then(|e| e.1);
        let yv = y.as_ref().and_then(|e| e.1);

        if xk.is_none() && yk.is_none() && !conflict {
            break;
        }

        if !conflict {
            if xk == yk {
                let xk = xk.unwrap();
                if xv == yv {
                    d = match (xv, d) {
                        (None, _) | (_, None) => xv,
                        (Some(xv), Some(d)) if d < xv => Some(xv),
                        (_, d) => d,
                    };
                    ret.push((xk, d));
                    if let Some(dd) = d {
                        d = Some(dd + 1);
                    }
                } else {
                    let candidates = [xv, yv, d];
                    let mx = candidates.into_iter().flatten().max();
                    d = mx;
                    ret.push((xk, d));
                    if let Some(dd) = d {
                        d = Some(dd + 1);
                    }
                }
                ai += 1;
                bi += 1;
            } else {
                conflict = true;
                wina = vec![xk.clone().unwrap_or_default()];
                winb = vec![yk.clone().unwrap_or_default()];
                bk.clear();
                if let Some(k) = &xk {
                    bk.insert(k.clone(), xv);
                }
                if let Some(k) = &yk {
                    bk.insert(k.clone(), yv);
                }
                if xk.is_some() {
                    ai += 1;
                }
                if yk.is_some() {
                    bi += 1;
                }
            }
        } else {
            if let Some(k) = &xk {
                wina.push(k.clone());
                ai += 1;
            }
            if let Some(k) = &yk {
                winb.push(k.clone());
                bi += 1;
            }

            let mut found: Option<String> = None;
            let mut foundv: Option<i64> = None;

            if let Some(k) = &xk {
                if winb.contains(k) {
                    found = Some(k.clone());
                    foundv = xv;
                }
            }
            if let Some(k) = &yk {
                if wina.contains(k) {
                    found = Some(k.clone());
                    foundv = yv;
                }
            }
            if found.is_none() {
                if let Some(k) = &xk {
                    bk.insert(k.clone(), xv);
                }
                if let Some(k) = &yk {
                    bk.insert(k.clone(), yv);
                }
            }

            let out = xk.is_none() && yk.is_none() && found.is_none();

            if found.is_some() || out {
                let mut posa = Vec::new();
                for k in &wina {
                    if Some(k.clone()) == found {
                        break;
                    }
                    posa.push(k.clone());
                }
                let mut posb = Vec::new();
                for k in &winb {
                    if Some(k.clone()) == found {
                        break;
                    }
                    posb.push(k.clone());
                }
                wina = wina[(posa.len() + 1).min(wina.len())..].to_vec();
                winb = winb[(posb.len() + 1).min(winb.len())..].to_vec();

                // sort the two cropped windows by first element's lexical order
                let key = |w: &Vec<String>| w.first().cloned().unwrap_or_default();
                let (first_win, second_win) = if key(&posa) <= key(&posb) {
                    (posa, posb)
                } else {
                    (posb, posa)
                };

                for k in first_win.iter().chain(second_win.iter()) {
                    let v = bk.get(k).copied().flatten();
                    d = match (v, d) {
                        (None, dd) => dd,
                        (Some(v), None) => Some(v),
                        (Some(v), Some(dd)) if dd < v => Some(v),
                        (_, dd) => dd,
                    };
                    ret.push((k.clone(), d));
                    if let Some(dd) = d {
                        d = Some(dd + 1);
                    }
                }

                if !out {
                    let found_key = found.clone().unwrap();
                    d = match (foundv, d) {
                        (None, dd) => dd,
                        (Some(v), None) => Some(v),
                        (Some(v), Some(dd)) if dd < v => Some(v),
                        (_, dd) => dd,
                    };
                    ret.push((found_key, d));
                    if let Some(dd) = d {
                        d = Some(dd + 1);
                    }
                }

                ai -= wina.len();
                bi -= winb.len();
                wina.clear();
                winb.clear();
                conflict = false;
            }
        }
    }

    ret
}

/// Merge two `FieldModel`s into a combined one (§4.2).
pub fn merge_field_models(a: &FieldModel, b: &FieldModel) -> Result<FieldModel, ProxyError> {
    let a_repr = a.premerge_repr();
    let b_repr = b.premerge_repr();

    let merged_order = interleave(&a_repr, &b_repr);

    let mut merged_cols: Vec<Column> = Vec::with_capacity(merged_order.len());
    for (colname, displaycolidx) in merged_order {
        let ca = a.get(&colname);
        let cb = b.get(&colname);
        let mut merged = match (ca, cb) {
            (Some(ca), Some(cb)) => ca.merged_with(cb)?,
            (Some(ca), None) => ca.clone(),
            (None, Some(cb)) => cb.clone(),
            (None, None) => unreachable!("merged order only contains known colnames"),
        };
        merged.displaycolidx = displaycolidx;
        merged_cols.push(merged);
    }

    Ok(FieldModel::new(merged_cols))
}

/// Fold a sequence of backend field models into one combined model,
/// left-to-right (the order in which `Coordinator::start` discovers
/// backends).
pub fn fold_models(models: &[FieldModel]) -> Result<FieldModel, ProxyError> {
    let mut iter = models.iter();
    let first = iter
        .next()
        .cloned()
        .ok_or_else(|| ProxyError::invalid_query("no backend collections were discovered"))?;
    iter.try_fold(first, |acc, next| merge_field_models(&acc, next))
}

/// Rebind every client model to the newly merged one.
pub fn rebind_all(models: &mut [FieldModel], combined: &Arc<FieldModel>) {
    for m in models.iter_mut() {
        m.rebind(combined);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(pairs: &[(&str, Option<i64>)]) -> Vec<PlaceEntry> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn sort_place_keeps_nones_in_place_and_orders_numbered() {
        let a = entries(&[
            ("bob", None),
            ("aob", None),
            ("john", Some(0)),
            ("jen", Some(2)),
            ("asd", None),
            ("andy", Some(1)),
            ("tum", Some(10)),
            ("tim", Some(3)),
            ("work", Some(6)),
            ("no", Some(4)),
            ("gum", Some(8)),
            ("go", Some(5)),
            ("pen", Some(7)),
            ("mug", Some(9)),
            ("hit", None),
            ("aja", Some(11)),
            ("mm", None),
            ("nn", None),
        ]);

        let expected = entries(&[
            ("bob", None),
            ("aob", None),
            ("john", Some(0)),
            ("andy", Some(1)),
            ("asd", None),
            ("jen", Some(2)),
            ("tim", Some(3)),
            ("no", Some(4)),
            ("go", Some(5)),
            ("work", Some(6)),
            ("pen", Some(7)),
            ("gum", Some(8)),
            ("mug", Some(9)),
            ("tum", Some(10)),
            ("hit", None),
            ("aja", Some(11)),
            ("mm", None),
            ("nn", None),
        ]);

        assert_eq!(sort_place(&a), expected);
    }

    #[test]
    fn interleave_matches_worked_example() {
        let a = entries(&[
            ("bob", None),
            ("john", Some(0)),
            ("andy", Some(1)),
            ("dome", None),
            ("jen", Some(2)),
            ("tim", Some(3)),
            ("no", Some(4)),
            ("go", Some(5)),
            ("work", Some(6)),
            ("pen", Some(7)),
            ("gum", Some(8)),
            ("mug", Some(9)),
            ("tum", Some(10)),
            ("hit", None),
            ("mm", None),
            ("nn", None),
        ]);
        let b = entries(&[
            ("bob", None),
            ("john", Some(0)),
            ("andy", Some(2)),
            ("k", Some(1)),
            ("dome", None),
            ("foam", None),
            ("dog", Some(3)),
            ("tim", Some(4)),
            ("work", Some(5)),
            ("mun", Some(6)),
            ("hit", None),
            ("bit", None),
        ]);

        let expected = entries(&[
            ("bob", None),
            ("john", Some(0)),
            ("k", Some(1)),
            ("andy", Some(2)),
            ("dome", None),
            ("foam", None),
            ("dog", Some(3)),
            ("jen", Some(4)),
            ("tim", Some(5)),
            ("no", Some(6)),
            ("go", Some(7)),
            ("work", Some(8)),
            ("mun", Some(9)),
            ("pen", Some(10)),
            ("gum", Some(11)),
            ("mug", Some(12)),
            ("tum", Some(13)),
            ("hit", None),
            ("bit", None),
            ("mm", None),
            ("nn", None),
        ]);

        assert_eq!(interleave(&a, &b), expected);
    }

    #[test]
    fn merge_with_self_is_identity_on_colnames() {
        use crate::column::{Column, ColumnSpec, SolrType};

        let a = FieldModel::new(vec![Column::new(ColumnSpec {
            colname: "title".to_string(),
            solrname: "title".to_string(),
            solrtype: SolrType::String,
            displaycolidx: Some(1),
            ..Default::default()
        })]);

        let merged = merge_field_models(&a, &a).unwrap();
        let mut names: Vec<_> = merged.columns.iter().map(|c| c.colname.clone()).collect();
        names.sort();
        let mut expected: Vec<_> = a.columns.iter().map(|c| c.colname.clone()).collect();
        expected.sort();
        assert_eq!(names, expected);
    }
}
