use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// Structured delivery/order data extracted by the reasoning service.
///
/// Field names on the wire are the Spanish keys the extraction tool uses; all
/// of them are optional because the model fills in whatever the customer has
/// provided so far.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDraft {
    #[serde(rename = "nombre", default)]
    pub first_name: Option<String>,
    #[serde(rename = "apellido", default)]
    pub last_name: Option<String>,
    #[serde(rename = "cedula", default)]
    pub document_id: Option<String>,
    #[serde(rename = "telefono", default)]
    pub phone: Option<String>,
    #[serde(rename = "email", default)]
    pub email: Option<String>,
    #[serde(rename = "departamento", default)]
    pub department: Option<String>,
    #[serde(rename = "ciudad", default)]
    pub city: Option<String>,
    #[serde(rename = "direccion", default)]
    pub address: Option<String>,
    #[serde(rename = "cantidad", default, deserialize_with = "lenient_quantity")]
    pub quantity: Option<u32>,
}

impl OrderDraft {
    /// Quantity defaults to a single unit when the model omits it.
    pub fn quantity(&self) -> u32 {
        self.quantity.unwrap_or(1).max(1)
    }

    pub fn total(&self, unit_price: Decimal) -> Decimal {
        unit_price * Decimal::from(self.quantity())
    }

    pub fn full_name(&self) -> Option<String> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.to_string()),
            (None, Some(last)) => Some(last.to_string()),
            (None, None) => None,
        }
    }
}

/// The model sometimes emits `"cantidad": "2"` instead of a number.
fn lenient_quantity<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(value)) => Ok(value.trim().parse::<u32>().ok()),
    }
}
