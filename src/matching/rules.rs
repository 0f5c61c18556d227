//! Deterministic title comparator.
//!
//! Titles are split into a core name and variant attributes (color, tier,
//! capacity, size, bundle, model codes). The core names are compared with
//! Jaro-Winkler plus token overlap; attributes decide whether the two
//! listings are the same variant. Any variant conflict keeps the result below
//! the review threshold, and one-sided capacity/size/model information keeps
//! it below auto-accept.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::config::PRICE_TOLERANCE;
use crate::error::Result;
use crate::matching::Comparator;
use crate::types::{Candidate, MatchDecision, MatchFactors, Product};

const NAME_WEIGHT: f64 = 0.40;
const PRICE_WEIGHT: f64 = 0.25;
const SPECS_WEIGHT: f64 = 0.35;

/// Ceiling when the listings disagree on a distinguishing attribute.
const CONFLICT_CAP: f64 = 0.60;
/// Ceiling when only one side states a distinguishing attribute.
const AMBIGUOUS_CAP: f64 = 0.80;
/// Ceiling when the core names are unrelated.
const UNRELATED_CAP: f64 = 0.50;
const UNRELATED_NAME_SCORE: f64 = 0.45;

const SOFT_PENALTY: f64 = 0.05;
const AMBIGUOUS_PENALTY: f64 = 0.15;
const CONFLICT_PENALTY: f64 = 0.35;

/// Reported when the price factor could not be evaluated.
const NEUTRAL_PRICE_SCORE: f64 = 0.5;

const COLORS: &[&str] = &[
    "black", "white", "silver", "gold", "red", "blue", "green", "pink", "purple", "gray", "grey",
    "yellow", "orange", "rose", "graphite", "midnight", "starlight", "navy", "beige", "brown",
    "teal", "bronze",
];
const TIERS: &[&str] = &["pro", "max", "plus", "ultra", "mini", "lite"];
const CAPACITY_UNITS: &[&str] = &["gb", "tb", "mb"];
const SIZE_UNITS: &[&str] = &["in", "inch", "inches", "mm", "cm", "ml", "oz", "l", "ft", "qt"];
const SIZE_WORDS: &[&str] = &["xs", "small", "medium", "large", "xl", "xxl", "xxxl"];
const BUNDLE_WORDS: &[&str] = &["bundle", "pack", "pk", "combo", "kit", "set", "pair"];
const STOP_WORDS: &[&str] = &["the", "a", "an", "with", "for", "and", "of", "by", "new", "in"];

#[derive(Debug, Default, Clone, PartialEq)]
struct Attributes {
    core: Vec<String>,
    colors: BTreeSet<String>,
    tiers: BTreeSet<String>,
    capacities: BTreeSet<String>,
    sizes: BTreeSet<String>,
    bundle: BTreeSet<String>,
    models: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct SpecComparison {
    soft: u32,
    ambiguous: u32,
    conflicts: u32,
    notes: Vec<String>,
}

impl SpecComparison {
    fn score(&self) -> f64 {
        (1.0 - SOFT_PENALTY * self.soft as f64
            - AMBIGUOUS_PENALTY * self.ambiguous as f64
            - CONFLICT_PENALTY * self.conflicts as f64)
            .clamp(0.0, 1.0)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleComparator;

impl RuleComparator {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, reference: &Product, candidate: &Candidate) -> MatchDecision {
        let a = extract(&reference.name);
        let b = extract(&candidate.product.name);

        let name_score = name_similarity(&a.core, &b.core);
        let price_score = price_plausibility(reference.price, candidate.product.price);
        let specs = compare_specs(&a, &b);
        let specs_score = specs.score();

        let mut confidence = match price_score {
            Some(p) => NAME_WEIGHT * name_score + PRICE_WEIGHT * p + SPECS_WEIGHT * specs_score,
            None => (NAME_WEIGHT * name_score + SPECS_WEIGHT * specs_score) / (NAME_WEIGHT + SPECS_WEIGHT),
        };

        let mut notes = vec![format!("name similarity {name_score:.2}")];
        match price_score {
            Some(p) if p >= 1.0 => notes.push("price within normal marketplace variance".to_string()),
            Some(p) => notes.push(format!("price divergence beyond tolerance ({p:.2})")),
            None => notes.push("price unknown on one side".to_string()),
        }
        notes.extend(specs.notes.iter().cloned());

        if name_score < UNRELATED_NAME_SCORE {
            confidence = confidence.min(UNRELATED_CAP);
            notes.push("titles describe different products".to_string());
        }
        if specs.conflicts > 0 {
            confidence = confidence.min(CONFLICT_CAP);
        } else if specs.ambiguous > 0 {
            confidence = confidence.min(AMBIGUOUS_CAP);
        }
        let confidence = confidence.clamp(0.0, 1.0);

        MatchDecision {
            is_match: confidence >= crate::config::AUTO_ACCEPT_CONFIDENCE,
            confidence,
            reasoning: notes.join("; "),
            factors: MatchFactors {
                name_match: name_score,
                price_match: price_score.unwrap_or(NEUTRAL_PRICE_SCORE),
                specs_match: specs_score,
                image_match: None,
            },
            degraded: false,
        }
    }
}

#[async_trait]
impl Comparator for RuleComparator {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn compare(&self, reference: &Product, candidate: &Candidate) -> Result<MatchDecision> {
        Ok(self.score(reference, candidate))
    }
}

fn tokenize(title: &str) -> Vec<String> {
    title
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '.'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_number(t: &str) -> bool {
    t.chars().any(|c| c.is_ascii_digit()) && t.parse::<f64>().is_ok()
}

/// `512gb` → ("512", "gb"). Only for tokens that start with a digit.
fn split_number_suffix(t: &str) -> Option<(&str, &str)> {
    let idx = t.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    let (num, suffix) = t.split_at(idx);
    if num.is_empty() || !is_number(num) || !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((num, suffix))
}

fn extract(title: &str) -> Attributes {
    let tokens = tokenize(title);
    let mut attrs = Attributes::default();
    let mut i = 0;

    while i < tokens.len() {
        let t = tokens[i].as_str();
        let next = tokens.get(i + 1).map(String::as_str);

        if is_number(t) {
            match next {
                Some(unit) if CAPACITY_UNITS.contains(&unit) => {
                    attrs.capacities.insert(format!("{t}{unit}"));
                    i += 2;
                    continue;
                }
                Some(unit) if SIZE_UNITS.contains(&unit) => {
                    attrs.sizes.insert(format!("{t}{unit}"));
                    i += 2;
                    continue;
                }
                Some(word) if BUNDLE_WORDS.contains(&word) => {
                    attrs.bundle.insert(format!("{t}pack"));
                    i += 2;
                    continue;
                }
                _ => {
                    attrs.models.insert(t.to_string());
                    attrs.core.push(t.to_string());
                    i += 1;
                    continue;
                }
            }
        }

        if let Some((num, suffix)) = split_number_suffix(t) {
            if CAPACITY_UNITS.contains(&suffix) {
                attrs.capacities.insert(t.to_string());
                i += 1;
                continue;
            }
            if SIZE_UNITS.contains(&suffix) {
                attrs.sizes.insert(t.to_string());
                i += 1;
                continue;
            }
            if suffix == "pk" || suffix == "pack" {
                attrs.bundle.insert(format!("{num}pack"));
                i += 1;
                continue;
            }
        }

        if COLORS.contains(&t) {
            attrs.colors.insert(t.to_string());
        } else if TIERS.contains(&t) {
            attrs.tiers.insert(t.to_string());
        } else if SIZE_WORDS.contains(&t) {
            attrs.sizes.insert(t.to_string());
        } else if BUNDLE_WORDS.contains(&t) {
            attrs.bundle.insert(t.to_string());
        } else if !STOP_WORDS.contains(&t) {
            let has_digit = t.chars().any(|c| c.is_ascii_digit());
            let has_alpha = t.chars().any(|c| c.is_alphabetic());
            if has_digit && has_alpha {
                attrs.models.insert(t.to_string());
            }
            attrs.core.push(t.to_string());
        }
        i += 1;
    }

    attrs
}

fn name_similarity(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let jw = strsim::jaro_winkler(&a.join(" "), &b.join(" "));

    let sa: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let sb: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    let union = sa.union(&sb).count();
    let overlap = if union == 0 {
        1.0
    } else {
        sa.intersection(&sb).count() as f64 / union as f64
    };

    0.5 * jw + 0.5 * overlap
}

/// None when either price is missing or not positive.
fn price_plausibility(reference: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    let (r, c) = (reference?, candidate?);
    if !(r.is_finite() && c.is_finite()) || r <= 0.0 || c <= 0.0 {
        return None;
    }
    let divergence = (c - r).abs() / r;
    if divergence <= PRICE_TOLERANCE {
        Some(1.0)
    } else {
        Some((1.0 - (divergence - PRICE_TOLERANCE) / (1.0 - PRICE_TOLERANCE)).max(0.0))
    }
}

fn compare_specs(a: &Attributes, b: &Attributes) -> SpecComparison {
    let mut cmp = SpecComparison::default();

    // Color only conflicts when both sides name one.
    match (a.colors.is_empty(), b.colors.is_empty()) {
        (false, false) if a.colors.is_disjoint(&b.colors) => {
            cmp.conflicts += 1;
            cmp.notes.push(format!("different color: {} vs {}", join(&a.colors), join(&b.colors)));
        }
        (true, false) | (false, true) => cmp.soft += 1,
        _ => {}
    }

    // Tier and bundle composition must agree exactly.
    if a.tiers != b.tiers {
        cmp.conflicts += 1;
        cmp.notes.push(format!("different tier: {} vs {}", join(&a.tiers), join(&b.tiers)));
    }
    if a.bundle != b.bundle {
        cmp.conflicts += 1;
        cmp.notes.push(format!("different bundle: {} vs {}", join(&a.bundle), join(&b.bundle)));
    }

    for (label, sa, sb) in [
        ("capacity", &a.capacities, &b.capacities),
        ("size", &a.sizes, &b.sizes),
        ("model", &a.models, &b.models),
    ] {
        match (sa.is_empty(), sb.is_empty()) {
            (true, true) => {}
            (false, false) if sa == sb => {}
            (false, false) if sa.is_disjoint(sb) => {
                cmp.conflicts += 1;
                cmp.notes.push(format!("different {label}: {} vs {}", join(sa), join(sb)));
            }
            _ => {
                cmp.ambiguous += 1;
                cmp.notes.push(format!("{label} unconfirmed: {} vs {}", join(sa), join(sb)));
            }
        }
    }

    cmp
}

fn join(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        "-".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join("/")
    }
}
