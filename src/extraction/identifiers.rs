//! UEN / GST registration number normalisation and format checks.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

static UEN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{8}[A-Z]|\d{9}[A-Z]|[TSR]\d{2}[A-Z]{2}\d{4}[A-Z])$").expect("valid UEN regex")
});

static GST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(M[0-9A-Z]\d{7}[0-9A-Z]|\d{8}[A-Z]|\d{9}[A-Z]|[TSR]\d{2}[A-Z]{2}\d{4}[A-Z])$")
        .expect("valid GST regex")
});

static PEPPOL_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^0195:SGUEN(\d{8}[A-Z]|\d{9}[A-Z]|[TSR]\d{2}[A-Z]{2}\d{4}[A-Z])$").expect("valid participant regex")
});

/// Uppercase, strip separators and repair OCR letter/digit confusions in the numeric runs.
///
/// The repair is kept only when it yields a Singapore UEN or GST number; other identifiers
/// (foreign VAT numbers and the like) come back stripped and uppercased.
pub fn normalize_identifier(raw: &str) -> String {
    let stripped: Vec<char> = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let Some((digit_runs, letter_positions)) = layout(&stripped) else {
        return stripped.into_iter().collect();
    };

    let mut repaired = stripped.clone();
    for run in digit_runs {
        for pos in run {
            repaired[pos] = as_digit(repaired[pos]);
        }
    }
    for pos in letter_positions {
        repaired[pos] = as_letter(repaired[pos]);
    }

    let repaired: String = repaired.into_iter().collect();
    if is_valid_gst_number(&repaired) {
        repaired
    } else {
        stripped.into_iter().collect()
    }
}

/// Which positions must be digits and which must be letters, by identifier shape.
fn layout(chars: &[char]) -> Option<(Vec<Range<usize>>, Vec<usize>)> {
    let n = chars.len();
    match chars.first()? {
        // T08LL0001A style entity UEN
        'T' | 'S' | 'R' if n == 10 && !chars[3].is_ascii_digit() => Some((vec![1..3, 5..9], vec![3, 4, 9])),
        // M2-1234567-8 style GST number
        'M' if n == 10 => Some((vec![2..9], vec![])),
        // business and local company UENs
        _ if n == 9 || n == 10 => Some((vec![0..n - 1], vec![n - 1])),
        _ => None,
    }
}

fn as_digit(c: char) -> char {
    match c {
        'O' | 'Q' | 'D' => '0',
        'I' | 'L' => '1',
        'Z' => '2',
        'S' => '5',
        'B' => '8',
        other => other,
    }
}

fn as_letter(c: char) -> char {
    match c {
        '0' => 'O',
        '1' => 'I',
        '5' => 'S',
        '8' => 'B',
        other => other,
    }
}

pub fn is_valid_uen(value: &str) -> bool {
    UEN_PATTERN.is_match(value)
}

pub fn is_valid_gst_number(value: &str) -> bool {
    GST_PATTERN.is_match(value)
}

pub fn is_valid_participant_id(value: &str) -> bool {
    PEPPOL_ID_PATTERN.is_match(&value.trim().to_ascii_uppercase())
}
