//! Free-text group label normalization and alias bookkeeping.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use fleet_core::{fold_label, CanonicalRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use unicode_normalization::UnicodeNormalization;

use fleet_adapters::EntitySchema;

pub const STORAGE_LABEL: &str = "Lưu Kho";

/// Similarity at or above which two distinct group labels are reported as likely aliases.
pub const ALIAS_SUGGESTION_THRESHOLD: f64 = 0.92;

fn bracketed_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\((?:P\.QLTB|QLTB|PQLTB)\)\s*").expect("prefix regex should compile")
    })
}

fn storage_variant() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)lưu\s*kho|kho\s*tổng|pqltb\s*/\s*lưu\s*kho").expect("storage regex should compile")
    })
}

/// Pure, total and idempotent.
pub fn normalize_name(raw: &str) -> String {
    let mut stripped = raw.nfc().collect::<String>();
    // Removing one prefix can join the text around it into another.
    loop {
        let next = bracketed_prefix().replace_all(&stripped, "").into_owned();
        if next == stripped {
            break;
        }
        stripped = next;
    }
    if storage_variant().is_match(&stripped) {
        return STORAGE_LABEL.to_string();
    }
    stripped.trim_matches(|c: char| c.is_whitespace()).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameAlias {
    pub raw: String,
    pub canonical: String,
}

/// Rewrites group-label fields in place and returns the aliases that fired.
pub fn normalize_group_labels(records: &mut [CanonicalRecord], schema: &EntitySchema) -> Vec<NameAlias> {
    let mut aliases = BTreeSet::new();
    for record in records.iter_mut() {
        for field in &schema.group_label_fields {
            let Some(raw) = record.text(field).map(str::to_string) else {
                continue;
            };
            let canonical = normalize_name(&raw);
            if canonical != raw {
                aliases.insert(NameAlias {
                    raw: raw.clone(),
                    canonical: canonical.clone(),
                });
            }
            record.set_text(field, canonical);
        }
    }
    aliases.into_iter().collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AliasSuggestion {
    pub label_a: String,
    pub label_b: String,
    pub similarity: f64,
}

/// Pairs of distinct labels that fold differently yet look alike.
pub fn suggest_aliases<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<AliasSuggestion> {
    let mut distinct: Vec<(String, &str)> = Vec::new();
    for label in labels {
        let folded = fold_label(label);
        if !folded.is_empty() && !distinct.iter().any(|(f, _)| *f == folded) {
            distinct.push((folded, label));
        }
    }

    let mut out = Vec::new();
    for (i, (fa, a)) in distinct.iter().enumerate() {
        for (fb, b) in distinct.iter().skip(i + 1) {
            let similarity = jaro_winkler(fa, fb);
            if similarity >= ALIAS_SUGGESTION_THRESHOLD {
                out.push(AliasSuggestion {
                    label_a: a.to_string(),
                    label_b: b.to_string(),
                    similarity,
                });
            }
        }
    }
    out.sort_by(|x, y| y.similarity.total_cmp(&x.similarity));
    out
}
