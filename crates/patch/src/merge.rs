//! Three-way JSON merge patch (RFC 7386 documents, lists are atomic).

use serde_json::{Map, Value as Json};

/// Compute the patch taking `current` to `modified` while honouring what was
/// removed since `previous`. Fields only `current` knows about are left alone.
pub fn three_way(previous: &Json, modified: &Json, current: &Json) -> Json {
    let deltas = deltas(current, modified);
    let deletions = deletions(previous, modified, current);
    merge_patches(deletions, deltas)
}

/// Additions and changes from `current` to `modified`; never deletes.
fn deltas(current: &Json, modified: &Json) -> Json {
    let mut out = Map::new();
    if let Some(m) = modified.as_object() {
        let cur = current.as_object();
        for (k, mv) in m.iter() {
            match cur.and_then(|c| c.get(k)) {
                None => { out.insert(k.clone(), mv.clone()); }
                Some(cv) if cv == mv => {}
                Some(cv) if cv.is_object() && mv.is_object() => {
                    let sub = deltas(cv, mv);
                    if !is_empty_object(&sub) { out.insert(k.clone(), sub); }
                }
                Some(_) => { out.insert(k.clone(), mv.clone()); }
            }
        }
    }
    Json::Object(out)
}

/// Fields present in `previous` but dropped from `modified`, restricted to
/// those still present in `current`.
fn deletions(previous: &Json, modified: &Json, current: &Json) -> Json {
    let mut out = Map::new();
    if let (Some(p), Some(c)) = (previous.as_object(), current.as_object()) {
        let m = modified.as_object();
        for (k, pv) in p.iter() {
            let Some(cv) = c.get(k) else { continue };
            match m.and_then(|m| m.get(k)) {
                None => { out.insert(k.clone(), Json::Null); }
                Some(mv) if pv.is_object() && mv.is_object() && cv.is_object() => {
                    let sub = deletions(pv, mv, cv);
                    if !is_empty_object(&sub) { out.insert(k.clone(), sub); }
                }
                Some(_) => {}
            }
        }
    }
    Json::Object(out)
}

/// Deep-merge two patches; `overlay` wins on scalar conflicts.
pub(crate) fn merge_patches(base: Json, overlay: Json) -> Json {
    match (base, overlay) {
        (Json::Object(mut b), Json::Object(o)) => {
            for (k, ov) in o {
                let merged = match b.remove(&k) {
                    Some(bv) if bv.is_object() && ov.is_object() => merge_patches(bv, ov),
                    _ => ov,
                };
                b.insert(k, merged);
            }
            Json::Object(b)
        }
        (_, o) => o,
    }
}

/// Apply an RFC 7386 merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Json, patch: &Json) {
    let Some(p) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Some(t) = target.as_object_mut() {
        for (k, pv) in p.iter() {
            if pv.is_null() {
                t.remove(k);
            } else {
                apply_merge_patch(t.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

pub(crate) fn is_empty_object(v: &Json) -> bool {
    v.as_object().map(|o| o.is_empty()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preserves_foreign_fields() {
        let previous = json!({ "a": 1 });
        let modified = json!({ "a": 1, "b": 2 });
        let mut current = json!({ "a": 1, "c": 3 });
        let patch = three_way(&previous, &modified, &current);
        assert_eq!(patch, json!({ "b": 2 }));
        apply_merge_patch(&mut current, &patch);
        assert_eq!(current, json!({ "a": 1, "b": 2, "c": 3 }));
    }

    #[test]
    fn removes_fields_dropped_from_declaration() {
        let previous = json!({ "spec": { "a": 1, "b": 2 }, "extra": true });
        let modified = json!({ "spec": { "a": 1 } });
        let current = json!({ "spec": { "a": 1, "b": 2, "defaulted": "x" }, "extra": true });
        let patch = three_way(&previous, &modified, &current);
        assert_eq!(patch, json!({ "spec": { "b": null }, "extra": null }));
    }

    #[test]
    fn deletion_of_field_already_gone_is_skipped() {
        let previous = json!({ "a": 1, "gone": 2 });
        let modified = json!({ "a": 1 });
        let current = json!({ "a": 1 });
        assert_eq!(three_way(&previous, &modified, &current), json!({}));
    }

    #[test]
    fn lists_are_replaced_wholesale() {
        let previous = json!({ "l": [1, 2] });
        let modified = json!({ "l": [1, 2, 3] });
        let current = json!({ "l": [1, 2], "x": 1 });
        assert_eq!(three_way(&previous, &modified, &current), json!({ "l": [1, 2, 3] }));
    }

    #[test]
    fn changed_scalar_overrides_out_of_band_edit() {
        let previous = json!({ "replicas": 3 });
        let modified = json!({ "replicas": 3 });
        let current = json!({ "replicas": 5 });
        assert_eq!(three_way(&previous, &modified, &current), json!({ "replicas": 3 }));
    }

    #[test]
    fn apply_merge_patch_follows_rfc7386() {
        let mut t = json!({ "a": "b", "c": { "d": "e", "f": "g" } });
        apply_merge_patch(&mut t, &json!({ "a": "z", "c": { "f": null } }));
        assert_eq!(t, json!({ "a": "z", "c": { "d": "e" } }));

        let mut t = json!({ "a": [{ "b": "c" }] });
        apply_merge_patch(&mut t, &json!({ "a": [1] }));
        assert_eq!(t, json!({ "a": [1] }));
    }
}
