use serde_json::Value;

/// Shallow-merge `patch` fields into `base` for the optimistic local apply.
///
/// Non-object values cannot be merged field-wise, so the patch wins outright
/// (last write wins, same as the remote's conflict policy).
pub fn apply(base: &Value, patch: &Value) -> Value {
    let (Some(base_obj), Some(patch_obj)) = (base.as_object(), patch.as_object()) else {
        return patch.clone();
    };
    let mut merged = base_obj.clone();
    for (k, v) in patch_obj {
        merged.insert(k.clone(), v.clone());
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patched_fields_overwrite_base() {
        let base = json!({"title": "X", "done": false});
        let patch = json!({"title": "Y"});
        assert_eq!(apply(&base, &patch), json!({"title": "Y", "done": false}));
    }

    #[test]
    fn fields_absent_from_patch_are_kept() {
        let base = json!({"a": 1, "b": 2});
        let patch = json!({"c": 3});
        assert_eq!(apply(&base, &patch), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn non_object_patch_replaces_base() {
        let base = json!({"a": 1});
        assert_eq!(apply(&base, &json!(42)), json!(42));
    }
}
