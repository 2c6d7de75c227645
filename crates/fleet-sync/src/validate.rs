use fleet_adapters::EntitySchema;
use fleet_core::{CanonicalRecord, RecordDraft, Rejection};

pub fn validate(draft: RecordDraft, schema: &EntitySchema) -> Result<CanonicalRecord, Rejection> {
    CanonicalRecord::try_from_draft(draft, &schema.required)
}

#[derive(Debug, Default)]
pub struct Validated {
    pub records: Vec<CanonicalRecord>,
    pub rejections: Vec<Rejection>,
}

/// Splits drafts into records and rejections; order is preserved in both.
pub fn validate_all(drafts: impl IntoIterator<Item = RecordDraft>, schema: &EntitySchema) -> Validated {
    let mut out = Validated::default();
    for draft in drafts {
        match validate(draft, schema) {
            Ok(record) => out.records.push(record),
            Err(rejection) => out.rejections.push(rejection),
        }
    }
    out
}
