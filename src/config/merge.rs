//! Deep merge of the custom overlay onto the default document.
//!
//! Rules:
//! - scalars in the overlay replace the default value;
//! - objects merge recursively;
//! - arrays whose elements are objects carrying an `id` field merge *by id*
//!   (matching ids deep-merge, new ids append, default-only ids survive);
//! - every other array is replaced wholesale.

use serde_json::Value;

/// Merge `overlay` onto `base` in place.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(overlay_items))
            if is_id_list(base_items)
                && (overlay_items.is_empty() || is_id_list(overlay_items)) =>
        {
            merge_by_id(base_items, overlay_items);
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

fn is_id_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items
            .iter()
            .all(|item| item.as_object().is_some_and(|obj| obj.contains_key("id")))
}

fn item_id(item: &Value) -> Option<&str> {
    item.get("id").and_then(Value::as_str)
}

fn merge_by_id(base_items: &mut Vec<Value>, overlay_items: &[Value]) {
    for overlay_item in overlay_items {
        let Some(id) = item_id(overlay_item) else {
            continue;
        };
        match base_items
            .iter_mut()
            .find(|item| item_id(item) == Some(id))
        {
            Some(base_item) => deep_merge(base_item, overlay_item),
            None => base_items.push(overlay_item.clone()),
        }
    }
}
