use fleet_core::{fold_label, EntityType, IngestError};

use crate::schema::{EntitySchema, SchemaRegistry};

/// Signature hits needed before a detected entity overrides the default.
pub const MIN_SIGNATURE_HITS: usize = 2;

/// Labels shorter than this never count as contained in a keyword.
const MIN_LABEL_OVERLAP_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityScore {
    pub entity: EntityType,
    pub hits: usize,
}

fn overlaps(label: &str, keyword: &str) -> bool {
    label.contains(keyword)
        || (label.chars().count() >= MIN_LABEL_OVERLAP_CHARS && keyword.contains(label))
}

/// Number of signature keywords found among the labels.
pub fn signature_hits(schema: &EntitySchema, folded_labels: &[String]) -> usize {
    schema
        .signature
        .iter()
        .filter(|keyword| folded_labels.iter().any(|label| overlaps(label, keyword)))
        .count()
}

/// Scores in `EntityType::ALL` order.
pub fn score_entities(labels: &[String], registry: &SchemaRegistry) -> Vec<EntityScore> {
    let folded = labels
        .iter()
        .map(|l| fold_label(l))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>();
    EntityType::ALL
        .iter()
        .map(|entity| EntityScore {
            entity: *entity,
            hits: signature_hits(registry.schema(*entity), &folded),
        })
        .collect()
}

pub fn classify(
    labels: &[String],
    registry: &SchemaRegistry,
    default: Option<EntityType>,
) -> Result<EntityType, IngestError> {
    let scores = score_entities(labels, registry);
    // Strictly greater keeps the earliest entity on ties.
    let best = scores
        .iter()
        .fold(None::<EntityScore>, |best, score| match best {
            Some(b) if b.hits >= score.hits => Some(b),
            _ => Some(*score),
        });

    match (best, default) {
        (Some(best), _) if best.hits >= MIN_SIGNATURE_HITS => Ok(best.entity),
        (_, Some(default)) => Ok(default),
        (best, None) => Err(IngestError::UnclassifiableEntity {
            best_score: best.map_or(0, |b| b.hits),
            threshold: MIN_SIGNATURE_HITS,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn machine_registry_sheet_is_detected() {
        let registry = SchemaRegistry::builtin();
        let header = labels(&["mã quản lý", "tên máy móc", "dự án", "tình trạng"]);
        assert_eq!(classify(&header, &registry, None).unwrap(), EntityType::Machine);
    }

    #[test]
    fn standards_and_history_are_told_apart() {
        let registry = SchemaRegistry::builtin();
        let standards = labels(&["mã xe", "định mức", "chu kỳ"]);
        assert_eq!(
            classify(&standards, &registry, None).unwrap(),
            EntityType::MaintenanceStandard
        );
        let history = labels(&["Mã tài sản", "Ngày thực hiện", "Nội dung", "Chi phí"]);
        assert_eq!(
            classify(&history, &registry, Some(EntityType::Machine)).unwrap(),
            EntityType::MaintenanceHistory
        );
    }

    #[test]
    fn single_hit_keeps_the_default() {
        let registry = SchemaRegistry::builtin();
        let header = labels(&["mã lỗi", "ghi chú"]);
        assert_eq!(
            classify(&header, &registry, Some(EntityType::Parts)).unwrap(),
            EntityType::Parts
        );
        let err = classify(&header, &registry, None).unwrap_err();
        assert_eq!(
            err,
            IngestError::UnclassifiableEntity {
                best_score: 1,
                threshold: MIN_SIGNATURE_HITS
            }
        );
    }

    #[test]
    fn short_labels_do_not_match_inside_keywords() {
        let registry = SchemaRegistry::builtin();
        // "bd" would otherwise sit inside "mức bd".
        let scores = score_entities(&labels(&["bd", "km"]), &registry);
        assert!(scores.iter().all(|s| s.hits == 0));
    }

    #[test]
    fn classification_is_deterministic() {
        let registry = SchemaRegistry::builtin();
        let header = labels(&["tên vật tư", "mã danh điểm", "đvt", "số lượng"]);
        let first = classify(&header, &registry, None).unwrap();
        for _ in 0..10 {
            assert_eq!(classify(&header, &registry, None).unwrap(), first);
        }
        assert_eq!(first, EntityType::Parts);
    }
}
