//! The enriched-document envelope stored after parsing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::normalizer::{PageInfo, Section};

/// The JSON envelope written to the `enriched` artifact address. Downstream
/// chunking consumes `sections`; search surfaces `enriched_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedDocument {
    pub sections: Vec<Section>,
    pub page_info: BTreeMap<String, PageInfo>,
    /// `{}` when enrichment is disabled or failed
    #[serde(default = "empty_object")]
    pub enriched_metadata: serde_json::Value,
    /// Parser-specific counts (total pages, tables, slides, ...)
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl EnrichedDocument {
    pub fn new(
        sections: Vec<Section>,
        page_info: BTreeMap<String, PageInfo>,
        enriched_metadata: Option<serde_json::Value>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            sections,
            page_info,
            enriched_metadata: enriched_metadata.unwrap_or_else(empty_object),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_enrichment_serializes_as_empty_object() {
        let envelope = EnrichedDocument::new(
            Vec::new(),
            BTreeMap::new(),
            None,
            serde_json::json!({ "total_pages": 0 }),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["enriched_metadata"], serde_json::json!({}));
        assert_eq!(value["metadata"]["total_pages"], 0);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EnrichedDocument::new(
            Vec::new(),
            BTreeMap::new(),
            Some(serde_json::json!({ "document_type": "invoice" })),
            serde_json::json!({ "total_sections": 0 }),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        let back: EnrichedDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.enriched_metadata["document_type"], "invoice");
    }
}
