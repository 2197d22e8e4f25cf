//! Structural three-way merge patch. Like the JSON merge patch in
//! [`crate::merge`], except that lists with a schema merge key are merged
//! element by element and elements are deleted with a `$patch: delete`
//! directive. Set lists of scalars only ever grow through the list itself;
//! elements leave through a `$deleteFromPrimitiveList/<field>` directive.

use serde_json::{Map, Value as Json};
use tidepool_schema::StructuralSchema;

use crate::merge::is_empty_object;

const PATCH_DIRECTIVE: &str = "$patch";
const DIRECTIVE_DELETE: &str = "delete";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";

pub fn three_way(previous: &Json, modified: &Json, current: &Json, schema: &StructuralSchema) -> Json {
    let deltas = deltas(current, modified, schema, "");
    let deletions = deletions(previous, modified, current, schema, "");
    merge_keyed(deletions, deltas, schema, "")
}

fn child(base: &str, key: &str) -> String {
    if base.is_empty() { key.to_string() } else { format!("{}.{}", base, key) }
}

/// Merge key for `path` when every list given is a list of objects carrying it.
fn keyed<'s>(schema: &'s StructuralSchema, path: &str, lists: &[&Json]) -> Option<&'s str> {
    let key = schema.merge_key(path)?;
    let ok = lists.iter().all(|l| match l.as_array() {
        Some(items) => items.iter().all(|i| i.get(key).is_some()),
        None => false,
    });
    ok.then_some(key)
}

/// Elements of `modified` the live set list is missing.
fn set_additions(current: &Json, modified: &Json) -> Vec<Json> {
    let cur = current.as_array().map(Vec::as_slice).unwrap_or_default();
    let mut out: Vec<Json> = Vec::new();
    for me in modified.as_array().into_iter().flatten() {
        if !cur.contains(me) && !out.contains(me) {
            out.push(me.clone());
        }
    }
    out
}

/// Elements we applied before, no longer declare, and the live set still holds.
fn set_removals(previous: &Json, modified: &Json, current: &Json) -> Vec<Json> {
    let modi = modified.as_array().map(Vec::as_slice).unwrap_or_default();
    let cur = current.as_array().map(Vec::as_slice).unwrap_or_default();
    let mut out: Vec<Json> = Vec::new();
    for pe in previous.as_array().into_iter().flatten() {
        if !modi.contains(pe) && cur.contains(pe) && !out.contains(pe) {
            out.push(pe.clone());
        }
    }
    out
}

fn is_set_list(schema: &StructuralSchema, path: &str, lists: &[&Json]) -> bool {
    schema.is_set_list(path) && lists.iter().all(|l| l.is_array())
}

fn find_by_key<'a>(items: &'a [Json], key: &str, value: &Json) -> Option<&'a Json> {
    items.iter().find(|i| i.get(key) == Some(value))
}

fn deltas(current: &Json, modified: &Json, schema: &StructuralSchema, path: &str) -> Json {
    let mut out = Map::new();
    let Some(m) = modified.as_object() else { return Json::Object(out) };
    let cur = current.as_object();
    for (k, mv) in m.iter() {
        let p = child(path, k);
        match cur.and_then(|c| c.get(k)) {
            None => { out.insert(k.clone(), mv.clone()); }
            Some(cv) if cv == mv => {}
            Some(cv) if cv.is_object() && mv.is_object() => {
                let sub = deltas(cv, mv, schema, &p);
                if !is_empty_object(&sub) { out.insert(k.clone(), sub); }
            }
            Some(cv) => match keyed(schema, &p, &[cv, mv]) {
                Some(key) => {
                    let items = list_deltas(cv, mv, key, schema, &p);
                    if !items.is_empty() { out.insert(k.clone(), Json::Array(items)); }
                }
                None if is_set_list(schema, &p, &[cv, mv]) => {
                    let added = set_additions(cv, mv);
                    if !added.is_empty() { out.insert(k.clone(), Json::Array(added)); }
                }
                None => { out.insert(k.clone(), mv.clone()); }
            },
        }
    }
    Json::Object(out)
}

fn list_deltas(current: &Json, modified: &Json, key: &str, schema: &StructuralSchema, path: &str) -> Vec<Json> {
    let cur = current.as_array().map(Vec::as_slice).unwrap_or_default();
    let mut out = Vec::new();
    for me in modified.as_array().into_iter().flatten() {
        let Some(kv) = me.get(key) else { continue };
        match find_by_key(cur, key, kv) {
            None => out.push(me.clone()),
            Some(ce) if ce == me => {}
            Some(ce) => {
                let mut sub = deltas(ce, me, schema, path);
                if let Some(obj) = sub.as_object_mut() {
                    if !obj.is_empty() {
                        obj.insert(key.to_string(), kv.clone());
                        out.push(sub);
                    }
                }
            }
        }
    }
    out
}

fn deletions(previous: &Json, modified: &Json, current: &Json, schema: &StructuralSchema, path: &str) -> Json {
    let mut out = Map::new();
    let (Some(p), Some(c)) = (previous.as_object(), current.as_object()) else { return Json::Object(out) };
    let m = modified.as_object();
    for (k, pv) in p.iter() {
        let Some(cv) = c.get(k) else { continue };
        let sub_path = child(path, k);
        match m.and_then(|m| m.get(k)) {
            None => { out.insert(k.clone(), Json::Null); }
            Some(mv) if pv.is_object() && mv.is_object() && cv.is_object() => {
                let sub = deletions(pv, mv, cv, schema, &sub_path);
                if !is_empty_object(&sub) { out.insert(k.clone(), sub); }
            }
            Some(mv) => {
                if let Some(key) = keyed(schema, &sub_path, &[pv, mv, cv]) {
                    let items = list_deletions(pv, mv, cv, key, schema, &sub_path);
                    if !items.is_empty() { out.insert(k.clone(), Json::Array(items)); }
                } else if is_set_list(schema, &sub_path, &[pv, mv, cv]) {
                    let removed = set_removals(pv, mv, cv);
                    if !removed.is_empty() {
                        out.insert(format!("{}{}", DELETE_FROM_PRIMITIVE_LIST, k), Json::Array(removed));
                    }
                }
            }
        }
    }
    Json::Object(out)
}

fn list_deletions(previous: &Json, modified: &Json, current: &Json, key: &str, schema: &StructuralSchema, path: &str) -> Vec<Json> {
    let modi = modified.as_array().map(Vec::as_slice).unwrap_or_default();
    let cur = current.as_array().map(Vec::as_slice).unwrap_or_default();
    let mut out = Vec::new();
    for pe in previous.as_array().into_iter().flatten() {
        let Some(kv) = pe.get(key) else { continue };
        let Some(ce) = find_by_key(cur, key, kv) else { continue };
        match find_by_key(modi, key, kv) {
            None => {
                let mut directive = Map::new();
                directive.insert(key.to_string(), kv.clone());
                directive.insert(PATCH_DIRECTIVE.to_string(), Json::String(DIRECTIVE_DELETE.to_string()));
                out.push(Json::Object(directive));
            }
            Some(me) => {
                let mut sub = deletions(pe, me, ce, schema, path);
                if let Some(obj) = sub.as_object_mut() {
                    if !obj.is_empty() {
                        obj.insert(key.to_string(), kv.clone());
                        out.push(sub);
                    }
                }
            }
        }
    }
    out
}

/// Deep-merge two structural patches; keyed lists combine per element.
fn merge_keyed(base: Json, overlay: Json, schema: &StructuralSchema, path: &str) -> Json {
    match (base, overlay) {
        (Json::Object(mut b), Json::Object(o)) => {
            for (k, ov) in o {
                let p = child(path, &k);
                let merged = match b.remove(&k) {
                    Some(bv) if bv.is_object() && ov.is_object() => merge_keyed(bv, ov, schema, &p),
                    Some(Json::Array(bl)) if ov.is_array() => match schema.merge_key(&p) {
                        Some(key) => {
                            let mut items = bl;
                            for oe in ov.as_array().into_iter().flatten() {
                                let pos = oe.get(key).and_then(|kv| items.iter().position(|i| i.get(key) == Some(kv)));
                                match pos {
                                    Some(i) => {
                                        let be = std::mem::take(&mut items[i]);
                                        items[i] = merge_keyed(be, oe.clone(), schema, &p);
                                    }
                                    None => items.push(oe.clone()),
                                }
                            }
                            Json::Array(items)
                        }
                        None => ov,
                    },
                    _ => ov,
                };
                b.insert(k, merged);
            }
            Json::Object(b)
        }
        (_, o) => o,
    }
}

/// Apply a structural patch produced by [`three_way`] to `target` in place.
pub fn apply_structural_patch(target: &mut Json, patch: &Json, schema: &StructuralSchema) {
    apply_at(target, patch, schema, "");
}

fn apply_at(target: &mut Json, patch: &Json, schema: &StructuralSchema, path: &str) {
    let Some(p) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    let Some(t) = target.as_object_mut() else { return };
    for (k, pv) in p.iter() {
        if k == PATCH_DIRECTIVE { continue; }
        if let Some(field) = k.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            if let (Some(list), Some(gone)) = (t.get_mut(field).and_then(Json::as_array_mut), pv.as_array()) {
                list.retain(|e| !gone.contains(e));
            }
            continue;
        }
        if pv.is_null() {
            t.remove(k);
            continue;
        }
        let sub_path = child(path, k);
        match (schema.merge_key(&sub_path), pv.as_array()) {
            (Some(key), Some(items)) => {
                let slot = t.entry(k.clone()).or_insert(Json::Array(Vec::new()));
                if !slot.is_array() {
                    *slot = Json::Array(Vec::new());
                }
                if let Some(list) = slot.as_array_mut() {
                    apply_list(list, items, key, schema, &sub_path);
                }
            }
            (None, Some(items)) if schema.is_set_list(&sub_path) => {
                let slot = t.entry(k.clone()).or_insert(Json::Array(Vec::new()));
                if !slot.is_array() {
                    *slot = Json::Array(Vec::new());
                }
                if let Some(list) = slot.as_array_mut() {
                    for e in items {
                        if !list.contains(e) { list.push(e.clone()); }
                    }
                }
            }
            _ => apply_at(t.entry(k.clone()).or_insert(Json::Null), pv, schema, &sub_path),
        }
    }
}

fn apply_list(list: &mut Vec<Json>, items: &[Json], key: &str, schema: &StructuralSchema, path: &str) {
    for pe in items {
        let pos = pe.get(key).and_then(|kv| list.iter().position(|i| i.get(key) == Some(kv)));
        let delete = pe.get(PATCH_DIRECTIVE).and_then(|d| d.as_str()) == Some(DIRECTIVE_DELETE);
        match (pos, delete) {
            (Some(i), true) => { list.remove(i); }
            (None, true) => {}
            (Some(i), false) => apply_at(&mut list[i], pe, schema, path),
            (None, false) => {
                let mut fresh = Json::Null;
                apply_at(&mut fresh, pe, schema, path);
                list.push(fresh);
            }
        }
    }
}
