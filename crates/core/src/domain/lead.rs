use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// CRM lead identifier. The CRM hands these out as integers; webhook payloads
/// may carry them as numeric strings, so parsing stays at the ingress edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub u64);

impl std::fmt::Display for LeadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub u64);

impl std::fmt::Display for ContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One custom-field write within a lead patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub field_id: u64,
    pub value: String,
}

/// A partial update to a lead. Every CRM mutation the executor performs is
/// expressed as one of these; `None`/empty parts are left untouched remotely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadPatch {
    pub pipeline_id: Option<u64>,
    pub status_id: Option<u64>,
    pub price: Option<Decimal>,
    pub fields: Vec<FieldWrite>,
}

impl LeadPatch {
    pub fn stage_move(status_id: u64) -> Self {
        Self { status_id: Some(status_id), ..Self::default() }
    }

    pub fn pipeline_migration(pipeline_id: u64, status_id: u64) -> Self {
        Self { pipeline_id: Some(pipeline_id), status_id: Some(status_id), ..Self::default() }
    }

    pub fn with_field(mut self, field_id: u64, value: impl Into<String>) -> Self {
        self.fields.push(FieldWrite { field_id, value: value.into() });
        self
    }

    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pipeline_id.is_none()
            && self.status_id.is_none()
            && self.price.is_none()
            && self.fields.is_empty()
    }

    /// True when applying this patch changes the lead's stage or pipeline.
    pub fn moves_stage(&self) -> bool {
        self.pipeline_id.is_some() || self.status_id.is_some()
    }
}

/// Request to attach a catalog product to a lead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogLink {
    pub catalog_id: u64,
    pub element_id: u64,
    pub quantity: u32,
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{LeadId, LeadPatch};

    #[test]
    fn patch_builders_compose() {
        let patch = LeadPatch::stage_move(404)
            .with_field(7, "hola")
            .with_price(Decimal::new(89_900, 0));

        assert_eq!(patch.status_id, Some(404));
        assert_eq!(patch.pipeline_id, None);
        assert_eq!(patch.fields.len(), 1);
        assert_eq!(patch.price, Some(Decimal::new(89_900, 0)));
        assert!(patch.moves_stage());
        assert!(!patch.is_empty());
    }

    #[test]
    fn migration_patch_sets_both_pipeline_and_stage() {
        let patch = LeadPatch::pipeline_migration(900, 901);
        assert_eq!(patch.pipeline_id, Some(900));
        assert_eq!(patch.status_id, Some(901));
        assert!(patch.moves_stage());
    }

    #[test]
    fn empty_patch_reports_empty() {
        assert!(LeadPatch::default().is_empty());
        assert!(!LeadPatch::default().moves_stage());
    }

    #[test]
    fn lead_id_displays_as_plain_number() {
        assert_eq!(LeadId(128_553_042).to_string(), "128553042");
    }
}
