//! Edit-distance similarity for names that OCR sources spell differently.

/// Normalized Levenshtein similarity after case-folding and collapsing whitespace.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}

pub fn is_similar(a: &str, b: &str, threshold: f64) -> bool {
    similarity_ratio(a, b) >= threshold
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}
