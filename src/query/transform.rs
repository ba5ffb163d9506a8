//! Row transforms applied to a grouped batch before accumulation.
//!
//! Map, filter and concat_map rewrite rows inside their groups and never
//! reorder them. Group is the only transform that introduces new keys.
//! A failing closure aborts the whole batch.

use super::datum::Datum;
use super::env::Env;
use super::error::QueryError;
use super::func::{GroupFunc, WireFunc};
use super::grouped::{GroupedMap, UNGROUPED_KEY};
use std::collections::BTreeSet;

/// Rows bucketed by grouping key.
pub type Groups = GroupedMap<Vec<Datum>>;

#[derive(Debug, Clone)]
pub enum RowTransform {
    Map(WireFunc),
    Filter(WireFunc),
    ConcatMap(WireFunc),
    Group(GroupFunc),
}

impl RowTransform {
    pub fn name(&self) -> &'static str {
        match self {
            RowTransform::Map(_) => "map",
            RowTransform::Filter(_) => "filter",
            RowTransform::ConcatMap(_) => "concat_map",
            RowTransform::Group(_) => "group",
        }
    }

    /// Rewrite `groups` in place. `sindex` is the secondary-index value of the
    /// row(s) being transformed, when the scan runs over an index.
    pub fn apply(
        &self,
        env: &Env,
        groups: &mut Groups,
        sindex: Option<&Datum>,
    ) -> Result<(), QueryError> {
        env.check_interrupted()?;
        match self {
            RowTransform::Map(f) => {
                for (_, rows) in groups.iter_mut() {
                    for row in rows.iter_mut() {
                        *row = f.call(row)?;
                    }
                }
            }
            RowTransform::Filter(f) => {
                for (_, rows) in groups.iter_mut() {
                    let mut kept = Vec::with_capacity(rows.len());
                    for row in rows.drain(..) {
                        if f.call(&row)?.is_truthy() {
                            kept.push(row);
                        }
                    }
                    *rows = kept;
                }
                groups.retain(|_, rows| !rows.is_empty());
            }
            RowTransform::ConcatMap(f) => {
                for (_, rows) in groups.iter_mut() {
                    let mut expanded = Vec::with_capacity(rows.len());
                    for row in rows.iter() {
                        expanded.extend(f.call(row)?.into_array()?);
                    }
                    *rows = expanded;
                }
                groups.retain(|_, rows| !rows.is_empty());
            }
            RowTransform::Group(g) => regroup(g, groups, sindex)?,
        }
        Ok(())
    }
}

fn regroup(g: &GroupFunc, groups: &mut Groups, sindex: Option<&Datum>) -> Result<(), QueryError> {
    if groups.is_empty() {
        return Ok(());
    }
    if groups.len() != 1 || !groups.contains_key(&UNGROUPED_KEY) {
        return Err(QueryError::generic(
            "Cannot call `group` on the output of `group` (did you mean to `ungroup`?).",
        ));
    }
    let rows = groups.remove(&UNGROUPED_KEY).unwrap_or_default();

    for row in rows {
        let mut parts = Vec::with_capacity(g.funcs.len() + 1);
        for f in &g.funcs {
            parts.push(f.call(&row)?);
        }
        if g.append_index {
            let index_val = sindex.ok_or_else(|| {
                QueryError::generic("Cannot group by an index on a read without an index value.")
            })?;
            parts.push(index_val.clone());
        }
        if parts.is_empty() {
            return Err(QueryError::generic("Cannot group by nothing."));
        }
        for key in group_keys(parts, g.multi) {
            groups.slot(key).push(row.clone());
        }
    }
    Ok(())
}

/// Keys a row belongs to. With `multi`, every array-valued part fans out into
/// its distinct elements and the row joins each combination.
fn group_keys(parts: Vec<Datum>, multi: bool) -> Vec<Datum> {
    if !multi {
        return vec![collapse(parts)];
    }
    let mut combos: Vec<Vec<Datum>> = vec![Vec::new()];
    for part in parts {
        let choices: Vec<Datum> = match part {
            Datum::Array(items) => items.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            other => vec![other],
        };
        let mut next = Vec::with_capacity(combos.len() * choices.len());
        for combo in &combos {
            for choice in &choices {
                let mut c = combo.clone();
                c.push(choice.clone());
                next.push(c);
            }
        }
        combos = next;
    }
    combos.into_iter().map(collapse).collect()
}

fn collapse(mut parts: Vec<Datum>) -> Datum {
    if parts.len() == 1 {
        parts.pop().unwrap_or(Datum::Null)
    } else {
        Datum::Array(parts)
    }
}

/// Put a batch of rows under the implicit ungrouped key.
pub fn ungrouped_batch(rows: Vec<Datum>) -> Groups {
    if rows.is_empty() {
        Groups::new()
    } else {
        Groups::ungrouped(rows)
    }
}
