//! Compound-query detection and splitting
//!
//! A single request can carry several independent questions ("$SPY trend?
//! also what does this image say?"). The splitter cuts on conjunction
//! patterns and question boundaries, and separates a ticker question from an
//! image question when both appear. Sub-queries run as independent
//! pipelines; the caller merges numbered sections, takes the worst badge,
//! and averages confidence.

use regex::Regex;
use std::sync::OnceLock;

use crate::routing::extract_ticker;

/// Split a query into at most `max_parts` sub-queries. A single-element
/// result means "no split".
pub fn split_compound(query: &str, has_photos: bool, max_parts: usize) -> Vec<String> {
    static CONJUNCTION_RE: OnceLock<Regex> = OnceLock::new();
    let conjunction_re = CONJUNCTION_RE.get_or_init(|| {
        Regex::new(r"(?i)\s+(?:also|additionally|and also|as well as|plus)[,:]?\s+").unwrap()
    });

    let trimmed = query.trim();
    if trimmed.is_empty() {
        return vec![String::new()];
    }

    // question-mark boundaries first, conjunctions within each piece
    let mut parts: Vec<String> = Vec::new();
    for question in split_questions(trimmed) {
        for piece in conjunction_re.split(&question) {
            let piece = strip_edge_conjunctions(piece);
            if !piece.is_empty() {
                parts.push(piece);
            }
        }
    }

    // ticker + image co-occurrence forces a split even without conjunctions
    if parts.len() == 1 && has_photos {
        let lowered = trimmed.to_lowercase();
        let mentions_image =
            lowered.contains("image") || lowered.contains("photo") || lowered.contains("picture");
        if mentions_image && extract_ticker(trimmed).is_some() {
            if let Some(split_at) = image_clause_start(trimmed) {
                let (head, tail) = trimmed.split_at(split_at);
                let head = strip_edge_conjunctions(head);
                let tail = strip_edge_conjunctions(tail);
                if !head.is_empty() && !tail.is_empty() {
                    parts = vec![head, tail];
                }
            }
        }
    }

    if parts.len() <= 1 {
        return vec![trimmed.to_string()];
    }
    parts.truncate(max_parts);
    parts
}

/// Trim whitespace, commas, and dangling "and"/"also" at either edge.
fn strip_edge_conjunctions(piece: &str) -> String {
    let mut piece = piece.trim().trim_matches(',').trim();
    for prefix in ["also ", "Also ", "and ", "And "] {
        if let Some(rest) = piece.strip_prefix(prefix) {
            piece = rest.trim();
            break;
        }
    }
    for suffix in [" and", " also", " plus"] {
        if let Some(rest) = piece.strip_suffix(suffix) {
            piece = rest.trim();
            break;
        }
    }
    piece.to_string()
}

fn split_questions(text: &str) -> Vec<String> {
    let mut questions = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == '?' {
            let piece = current.trim();
            if !piece.is_empty() {
                questions.push(piece.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        questions.push(rest.to_string());
    }
    if questions.is_empty() {
        questions.push(text.to_string());
    }
    questions
}

fn image_clause_start(text: &str) -> Option<usize> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(what (does|is|about)|describe|explain|read)\b[^.?!]*\b(image|photo|picture)\b")
            .unwrap()
    });
    re.find(text).map(|m| m.start())
}

/// Merge sub-answers into numbered sections.
pub fn merge_sections(answers: &[String]) -> String {
    answers
        .iter()
        .enumerate()
        .map(|(i, answer)| format!("{}. {}", i + 1, answer.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
