use fleet_core::{fold_label, normalize_label, EntityType, HeaderCandidate, IngestError, RawGrid};
use tracing::debug;

use crate::schema::SchemaRegistry;

/// Picks the earliest row in the leading window with the most synonym hits.
pub fn locate(
    grid: &RawGrid,
    registry: &SchemaRegistry,
    hint: Option<EntityType>,
) -> Result<HeaderCandidate, IngestError> {
    let window = registry.header_window(hint);
    let mut best: Option<(usize, usize)> = None;

    for (index, row) in grid.rows().iter().take(window).enumerate() {
        let score = row
            .iter()
            .map(|cell| fold_label(&cell.display_text()))
            .filter(|folded| !folded.is_empty() && registry.is_known_label(folded, hint))
            .count();
        if score > best.map_or(0, |(_, s)| s) {
            best = Some((index, score));
        }
    }

    let Some((row_index, match_score)) = best else {
        return Err(IngestError::NoHeaderFound { window });
    };
    debug!(row_index, match_score, "header row located");

    let raw_labels = grid
        .row(row_index)
        .unwrap_or_default()
        .iter()
        .map(|cell| cell.display_text())
        .collect::<Vec<_>>();
    Ok(HeaderCandidate {
        row_index,
        labels: raw_labels.iter().map(|l| normalize_label(l)).collect(),
        raw_labels,
        match_score,
    })
}
