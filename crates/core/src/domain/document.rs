use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub String);

/// The engine's view of a proposal: only the numeric value and the
/// categorical fields that trigger conditions can reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub owner_id: String,
    pub value: Decimal,
    pub client_type: Option<String>,
    pub category: Option<String>,
    pub discount_pct: Option<Decimal>,
    pub custom_fields: BTreeMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, value: Decimal) -> Self {
        Self {
            id: DocumentId(id.into()),
            owner_id: owner_id.into(),
            value,
            client_type: None,
            category: None,
            discount_pct: None,
            custom_fields: BTreeMap::new(),
        }
    }
}
