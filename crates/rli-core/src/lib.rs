//! Core domain model for raw listing ingestion.

use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "rli-core";

/// Status literal written for every ingested row.
pub const INGESTED_STATUS: &str = "OK";

/// Identifier candidates, tried in order.
pub const ID_KEYS: [&str; 3] = ["id", "uuid", "pk"];

/// Keys that may hold a page's item array, tried in order.
pub const PAGE_ITEM_KEYS: [&str; 2] = ["items", "data"];

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serializing item payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One row of the `raw_listing` table, minus the store-assigned `scraped_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawListingRecord {
    pub id: String,
    pub source: String,
    pub payload: String,
    pub status: String,
}

impl RawListingRecord {
    /// Builds the row for `item`, or `None` when it carries no usable identifier.
    pub fn from_item(item: &JsonValue, default_source: &str) -> Result<Option<Self>, CoreError> {
        let Some(id) = resolve_item_id(item) else {
            return Ok(None);
        };
        Ok(Some(Self {
            id,
            source: resolve_source(item, default_source),
            payload: serialize_payload(item)?,
            status: INGESTED_STATUS.to_string(),
        }))
    }
}

/// Renders a scalar the way it should land in a key column.
///
/// Non-empty strings are taken verbatim and numbers use their JSON text.
/// Everything else (null, booleans, arrays, objects, `""`) is unusable.
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn resolve_item_id(item: &JsonValue) -> Option<String> {
    ID_KEYS
        .iter()
        .find_map(|key| item.get(*key).and_then(scalar_text))
}

pub fn resolve_source(item: &JsonValue, default_source: &str) -> String {
    item.get("source")
        .and_then(scalar_text)
        .unwrap_or_else(|| default_source.to_string())
}

/// Compact JSON with the item's key order and literal non-ASCII characters.
pub fn serialize_payload(item: &JsonValue) -> Result<String, CoreError> {
    Ok(serde_json::to_string(item)?)
}

/// Pulls the item array out of one page document.
///
/// The first key in [`PAGE_ITEM_KEYS`] holding a non-empty array wins; a page
/// with neither (or with null/empty values) yields no items.
pub fn extract_page_items(page: &JsonValue) -> Vec<JsonValue> {
    PAGE_ITEM_KEYS
        .iter()
        .filter_map(|key| page.get(*key).and_then(JsonValue::as_array))
        .find(|items| !items.is_empty())
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_falls_back_through_uuid_then_pk() {
        let id_of = |item: JsonValue| resolve_item_id(&item);
        assert_eq!(id_of(json!({"id": "a", "uuid": "b"})).as_deref(), Some("a"));
        assert_eq!(id_of(json!({"uuid": "b", "pk": 3})).as_deref(), Some("b"));
        assert_eq!(id_of(json!({"id": "", "pk": 3})).as_deref(), Some("3"));
        assert_eq!(
            id_of(json!({"id": null, "uuid": null, "pk": 17})).as_deref(),
            Some("17")
        );
    }

    #[test]
    fn numeric_zero_is_an_id_and_booleans_are_not() {
        let id_of = |item: JsonValue| resolve_item_id(&item);
        assert_eq!(id_of(json!({"id": 0, "uuid": "u"})).as_deref(), Some("0"));
        assert_eq!(id_of(json!({"id": 0.0, "uuid": "u"})).as_deref(), Some("0.0"));
        assert_eq!(id_of(json!({"id": true, "uuid": "u"})).as_deref(), Some("u"));
        assert_eq!(id_of(json!({"id": false, "pk": 9})).as_deref(), Some("9"));
        assert_eq!(id_of(json!({"id": true})), None);
    }

    #[test]
    fn items_without_usable_id_are_skipped() {
        for item in [
            json!({}),
            json!({"id": "", "uuid": "", "pk": ""}),
            json!({"id": null, "uuid": false, "pk": []}),
            json!({"name": "no key", "source": "feed"}),
        ] {
            let record = RawListingRecord::from_item(&item, "target").expect("no error");
            assert!(record.is_none(), "expected skip for {item}");
        }
    }

    #[test]
    fn source_prefers_item_field_then_default() {
        assert_eq!(resolve_source(&json!({"source": "feed-a"}), "target"), "feed-a");
        assert_eq!(resolve_source(&json!({"source": null}), "target"), "target");
        assert_eq!(resolve_source(&json!({"source": ""}), "target"), "target");
        assert_eq!(resolve_source(&json!({}), "target"), "target");
    }

    #[test]
    fn payload_keeps_key_order_and_non_ascii() {
        let raw = r#"{"z":1,"id":"k-1","title":"중고차 판매","a":true}"#;
        let item: JsonValue = serde_json::from_str(raw).unwrap();
        let record = RawListingRecord::from_item(&item, "target").unwrap().unwrap();
        assert_eq!(record.id, "k-1");
        assert_eq!(record.source, "target");
        assert_eq!(record.status, INGESTED_STATUS);
        assert_eq!(record.payload, raw);
    }

    #[test]
    fn page_items_come_from_items_or_data() {
        let under_items = json!({"items": [{"id": 1}, {"id": 2}]});
        let under_data = json!({"data": [{"id": 1}, {"id": 2}]});
        assert_eq!(extract_page_items(&under_items), extract_page_items(&under_data));
        assert_eq!(extract_page_items(&under_data).len(), 2);
    }

    #[test]
    fn page_items_default_to_empty() {
        assert!(extract_page_items(&json!({})).is_empty());
        assert!(extract_page_items(&json!({"items": null, "data": null})).is_empty());
        assert!(extract_page_items(&json!({"items": []})).is_empty());
        assert!(extract_page_items(&json!([1, 2])).is_empty());
    }

    #[test]
    fn empty_items_falls_through_to_data() {
        let page = json!({"items": [], "data": [{"id": "d"}]});
        assert_eq!(extract_page_items(&page), vec![json!({"id": "d"})]);
    }
}
