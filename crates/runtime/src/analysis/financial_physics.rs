//! Financial-physics document classifier
//!
//! Classifies rows of extracted tabular text into income (+), cost (−), and
//! profit (=) natures using multilingual keyword priors (Indonesian,
//! English, Chinese, Japanese) combined with position and sign heuristics,
//! then validates the accounting identity `income − cost = profit` within a
//! 5% variance band. A temporal check flags "future year + Actual"
//! mislabeling in headers.

use chrono::{Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Row nature in the accounting identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nature {
    Income,
    Cost,
    Profit,
}

impl Nature {
    pub fn symbol(&self) -> char {
        match self {
            Nature::Income => '+',
            Nature::Cost => '−',
            Nature::Profit => '=',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    IncomeStatement,
    BalanceSheet,
    CashFlow,
    Ledger,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowClassification {
    pub nature: Nature,
    pub symbol: char,
    pub confidence: f64,
    pub label: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Temporal {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityValidation {
    pub valid: bool,
    pub income: f64,
    pub cost: f64,
    pub profit: f64,
    pub variance_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub income_rows: usize,
    pub cost_rows: usize,
    pub profit_rows: usize,
    pub unclassified_rows: usize,
}

/// Full classifier output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialPhysicsReport {
    pub document_type: DocumentType,
    pub currency: Option<String>,
    pub temporal: Temporal,
    pub temporal_errors: Vec<String>,
    pub classifications: Vec<RowClassification>,
    pub validation: Option<IdentityValidation>,
    pub summary: SummaryCounts,
}

const INCOME_KEYWORDS: &[&str] = &[
    // English
    "revenue", "income", "sales", "turnover", "earnings", "receipts",
    // Indonesian
    "pendapatan", "penjualan", "penerimaan", "omzet",
    // Chinese
    "收入", "营收", "销售",
    // Japanese
    "売上", "収益", "収入",
];

const COST_KEYWORDS: &[&str] = &[
    // English
    "cost", "expense", "expenditure", "payroll", "depreciation", "overhead", "cogs",
    // Indonesian
    "beban", "biaya", "pengeluaran", "ongkos",
    // Chinese
    "成本", "费用", "支出",
    // Japanese
    "費用", "経費", "原価",
];

const PROFIT_KEYWORDS: &[&str] = &[
    // English
    "profit", "net", "margin", "surplus", "loss", "ebit", "ebitda",
    // Indonesian
    "laba", "rugi", "keuntungan",
    // Chinese
    "利润", "净利", "亏损",
    // Japanese
    "利益", "損失", "純利",
];

const LOG_TOKENS: &[&str] = &[
    "error", "warn", "debug", "trace", "stacktrace", "exception", "http", "GET", "POST", "200 ok",
];

/// Fast guard: reject obvious log data before any classification work.
pub fn looks_like_log_data(text: &str) -> bool {
    static TS_RE: OnceLock<Regex> = OnceLock::new();
    let ts_re = TS_RE
        .get_or_init(|| Regex::new(r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}").unwrap());
    let timestamp_lines = text
        .lines()
        .take(50)
        .filter(|line| ts_re.is_match(line))
        .count();
    let lowered = text.to_lowercase();
    let log_hits = LOG_TOKENS
        .iter()
        .filter(|t| lowered.contains(&t.to_lowercase()))
        .count();
    timestamp_lines >= 5 || (timestamp_lines >= 2 && log_hits >= 3)
}

/// Detect the document type by keyword counts over the whole text.
pub fn detect_document_type(text: &str) -> DocumentType {
    let lowered = text.to_lowercase();
    let count = |keywords: &[&str]| -> usize {
        keywords.iter().filter(|k| lowered.contains(*k)).count()
    };
    let balance = count(&["assets", "liabilities", "equity", "aset", "kewajiban", "ekuitas"]);
    let cash_flow = count(&["cash flow", "operating activities", "investing activities", "arus kas"]);
    let income_stmt = count(INCOME_KEYWORDS) + count(PROFIT_KEYWORDS);
    let ledger = count(&["debit", "credit", "journal", "ledger", "jurnal", "buku besar"]);

    let best = [
        (DocumentType::BalanceSheet, balance),
        (DocumentType::CashFlow, cash_flow),
        (DocumentType::IncomeStatement, income_stmt),
        (DocumentType::Ledger, ledger),
    ]
    .into_iter()
    .max_by_key(|(_, score)| *score);

    match best {
        Some((doc_type, score)) if score >= 2 => doc_type,
        _ => DocumentType::Unknown,
    }
}

/// Detect the dominant currency marker.
pub fn detect_currency(text: &str) -> Option<String> {
    let markers: [(&str, &str); 7] = [
        ("Rp", "IDR"),
        ("IDR", "IDR"),
        ("$", "USD"),
        ("USD", "USD"),
        ("€", "EUR"),
        ("£", "GBP"),
        ("¥", "JPY"),
    ];
    markers
        .iter()
        .map(|(marker, code)| (text.matches(marker).count(), *code))
        .filter(|(count, _)| *count > 0)
        .max_by_key(|(count, _)| *count)
        .map(|(_, code)| code.to_string())
}

/// Classify a single labeled row.
///
/// Keyword priors dominate; position (profit rows cluster at the bottom)
/// and value sign (negative values lean cost) break ties.
pub fn classify_row(
    label: &str,
    value: f64,
    position: usize,
    total_rows: usize,
) -> Option<RowClassification> {
    let lowered = label.to_lowercase();
    let hits = |keywords: &[&str]| -> usize {
        keywords.iter().filter(|k| lowered.contains(*k)).count()
    };

    let income_hits = hits(INCOME_KEYWORDS);
    let cost_hits = hits(COST_KEYWORDS);
    let profit_hits = hits(PROFIT_KEYWORDS);

    // "net income" and friends must not count toward income
    let income_hits = if profit_hits > 0 { 0 } else { income_hits };

    let mut scores = [
        (Nature::Income, income_hits as f64),
        (Nature::Cost, cost_hits as f64),
        (Nature::Profit, profit_hits as f64),
    ];

    let in_bottom_quarter = total_rows > 0 && position * 4 >= total_rows * 3;
    for (nature, score) in scores.iter_mut() {
        if *nature == Nature::Profit && in_bottom_quarter {
            *score += 0.5;
        }
        if *nature == Nature::Cost && value < 0.0 {
            *score += 0.5;
        }
    }

    let (nature, best) = scores
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
    if best <= 0.0 {
        return None;
    }
    let keyword_total = (income_hits + cost_hits + profit_hits) as f64;
    let confidence = (best / (keyword_total + 1.0)).clamp(0.2, 0.95);

    Some(RowClassification {
        nature,
        symbol: nature.symbol(),
        confidence,
        label: label.to_string(),
        value,
    })
}

/// Validate the accounting identity over classified rows.
pub fn validate_identity(classifications: &[RowClassification]) -> Option<IdentityValidation> {
    let sum = |nature: Nature| -> f64 {
        classifications
            .iter()
            .filter(|c| c.nature == nature)
            .map(|c| c.value.abs())
            .sum()
    };
    let income = sum(Nature::Income);
    let cost = sum(Nature::Cost);
    let profit = sum(Nature::Profit);
    if profit == 0.0 {
        return None;
    }
    let variance_pct = ((income - cost - profit).abs() / profit.abs()) * 100.0;
    Some(IdentityValidation {
        valid: variance_pct < 5.0,
        income,
        cost,
        profit,
        variance_pct,
    })
}

/// Extract temporal hints and flag future-year "Actual" mislabeling.
pub fn check_temporal(text: &str) -> (Temporal, Vec<String>) {
    static DATE_RE: OnceLock<Regex> = OnceLock::new();
    static YEAR_RE: OnceLock<Regex> = OnceLock::new();
    let date_re = DATE_RE
        .get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap());
    let year_re = YEAR_RE.get_or_init(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());

    let mut temporal = Temporal::default();
    if let Some(caps) = date_re.captures(text) {
        temporal.year = caps[1].parse().ok();
        temporal.month = caps[2].parse().ok();
        temporal.day = caps[3].parse().ok();
    } else if let Some(caps) = year_re.captures(text) {
        temporal.year = caps[1].parse().ok();
    }

    let mut errors = Vec::new();
    let current_year = Utc::now().year();
    let lowered = text.to_lowercase();
    for caps in year_re.captures_iter(text) {
        if let Ok(year) = caps[1].parse::<i32>() {
            if year > current_year && (lowered.contains("actual") || lowered.contains("realisasi")) {
                errors.push(format!(
                    "header claims Actual figures for future year {year}"
                ));
            }
        }
    }
    (temporal, errors)
}

/// Extract `(label, value)` rows from plain extracted text: lines that end
/// in a number, with the leading text as the label.
pub fn rows_from_text(text: &str) -> Vec<(String, f64)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^(.*?[A-Za-z\u{4e00}-\u{9fff}].*?)[\s:|]+\(?(-?\d{1,3}(?:[.,]\d{3})*(?:[.,]\d{1,2})?)\)?\s*$")
            .unwrap()
    });
    text.lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let label = caps[1].trim().trim_matches('|').trim().to_string();
            let negative = line.contains('(') && line.contains(')');
            let value = parse_localized_number(&caps[2])?;
            Some((label, if negative { -value } else { value }))
        })
        .collect()
}

/// Parse `1,234.56` and `1.234,56` styles.
fn parse_localized_number(raw: &str) -> Option<f64> {
    let cleaned = if raw.matches(',').count() > 0 && raw.matches('.').count() > 0 {
        // whichever separator comes last is the decimal point
        if raw.rfind(',') > raw.rfind('.') {
            raw.replace('.', "").replace(',', ".")
        } else {
            raw.replace(',', "")
        }
    } else if raw.matches(',').count() == 1 && raw.split(',').nth(1).is_some_and(|d| d.len() == 2)
    {
        raw.replace(',', ".")
    } else {
        raw.replace(',', "")
    };
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Run the full classifier over labeled rows extracted from a document.
pub fn classify_document(text: &str, rows: &[(String, f64)]) -> FinancialPhysicsReport {
    if looks_like_log_data(text) {
        let (temporal, temporal_errors) = check_temporal(text);
        return FinancialPhysicsReport {
            document_type: DocumentType::Unknown,
            currency: None,
            temporal,
            temporal_errors,
            classifications: Vec::new(),
            validation: None,
            summary: SummaryCounts {
                income_rows: 0,
                cost_rows: 0,
                profit_rows: 0,
                unclassified_rows: rows.len(),
            },
        };
    }

    let total = rows.len();
    let mut classifications = Vec::new();
    let mut unclassified = 0usize;
    for (position, (label, value)) in rows.iter().enumerate() {
        match classify_row(label, *value, position, total) {
            Some(classification) => classifications.push(classification),
            None => unclassified += 1,
        }
    }

    let count = |nature: Nature| classifications.iter().filter(|c| c.nature == nature).count();
    let summary = SummaryCounts {
        income_rows: count(Nature::Income),
        cost_rows: count(Nature::Cost),
        profit_rows: count(Nature::Profit),
        unclassified_rows: unclassified,
    };
    let (temporal, temporal_errors) = check_temporal(text);

    FinancialPhysicsReport {
        document_type: detect_document_type(text),
        currency: detect_currency(text),
        temporal,
        temporal_errors,
        validation: validate_identity(&classifications),
        classifications,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_data_guard_trips_on_timestamped_lines() {
        let log = (0..6)
            .map(|i| format!("2026-07-30T12:00:0{i} ERROR something broke"))
            .collect::<Vec<_>>()
            .join("\n");
        assert!(looks_like_log_data(&log));
        assert!(!looks_like_log_data("Pendapatan 500\nBeban 300\nLaba 200"));
    }

    #[test]
    fn classifies_indonesian_rows() {
        let income = classify_row("Pendapatan penjualan", 500.0, 0, 3).unwrap();
        assert_eq!(income.nature, Nature::Income);
        assert_eq!(income.symbol, '+');

        let cost = classify_row("Beban operasional", 300.0, 1, 3).unwrap();
        assert_eq!(cost.nature, Nature::Cost);

        let profit = classify_row("Laba bersih", 200.0, 2, 3).unwrap();
        assert_eq!(profit.nature, Nature::Profit);
        assert_eq!(profit.symbol, '=');
    }

    #[test]
    fn net_income_is_profit_not_income() {
        let row = classify_row("Net income", 200.0, 4, 5).unwrap();
        assert_eq!(row.nature, Nature::Profit);
    }

    #[test]
    fn negative_value_leans_cost() {
        let row = classify_row("Adjustment cost item expense", -120.0, 1, 5).unwrap();
        assert_eq!(row.nature, Nature::Cost);
    }

    #[test]
    fn unlabeled_row_is_unclassified() {
        assert!(classify_row("Miscellaneous", 10.0, 0, 5).is_none());
    }

    #[test]
    fn identity_validates_within_five_percent() {
        let rows = vec![
            ("Revenue".to_string(), 1_000.0),
            ("Operating cost".to_string(), 600.0),
            ("Net profit".to_string(), 395.0),
        ];
        let report = classify_document("Revenue cost profit", &rows);
        let validation = report.validation.unwrap();
        assert!(validation.valid); // |1000-600-395|/395 ≈ 1.27%
        assert!((validation.variance_pct - 1.2658).abs() < 0.01);
    }

    #[test]
    fn identity_fails_outside_the_band() {
        let rows = vec![
            ("Revenue".to_string(), 1_000.0),
            ("Cost".to_string(), 600.0),
            ("Profit".to_string(), 300.0),
        ];
        let report = classify_document("statement", &rows);
        assert!(!report.validation.unwrap().valid); // 100/300 = 33%
    }

    #[test]
    fn detects_document_type_and_currency() {
        let text = "Laporan: Pendapatan Rp 500.000, Beban Rp 300.000, Laba Rp 200.000";
        assert_eq!(detect_document_type(text), DocumentType::IncomeStatement);
        assert_eq!(detect_currency(text).as_deref(), Some("IDR"));
    }

    #[test]
    fn future_actual_header_is_flagged() {
        let future = Utc::now().year() + 2;
        let text = format!("Actual results for {future}");
        let (_, errors) = check_temporal(&text);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains(&future.to_string()));

        let (_, clean) = check_temporal("Budget plan for 2030");
        assert!(clean.is_empty());
    }

    #[test]
    fn temporal_parses_full_dates() {
        let (temporal, _) = check_temporal("per 2025-03-31 balance");
        assert_eq!(temporal.year, Some(2025));
        assert_eq!(temporal.month, Some(3));
        assert_eq!(temporal.day, Some(31));
    }

    #[test]
    fn rows_parse_from_plain_text() {
        let text = "Laporan Laba Rugi\nPendapatan penjualan  1,500,000\nBeban operasional  (900,000)\nLaba bersih: 600,000\nnotes without numbers\n";
        let rows = rows_from_text(text);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, "Pendapatan penjualan");
        assert_eq!(rows[0].1, 1_500_000.0);
        assert_eq!(rows[1].1, -900_000.0);
        assert_eq!(rows[2].1, 600_000.0);
    }

    #[test]
    fn localized_numbers_parse_both_styles() {
        assert_eq!(parse_localized_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_localized_number("1.234,56"), Some(1234.56));
        assert_eq!(parse_localized_number("1,500,000"), Some(1_500_000.0));
        assert_eq!(parse_localized_number("42"), Some(42.0));
    }

    #[test]
    fn log_document_short_circuits() {
        let log = (0..6)
            .map(|i| format!("2026-07-30 12:00:0{i} ERROR x"))
            .collect::<Vec<_>>()
            .join("\n");
        let report = classify_document(&log, &[("Revenue".to_string(), 10.0)]);
        assert_eq!(report.document_type, DocumentType::Unknown);
        assert!(report.classifications.is_empty());
        assert_eq!(report.summary.unclassified_rows, 1);
    }
}
