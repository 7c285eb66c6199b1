//! Ticker extraction and the 2-of-3 lego key detector
//!
//! An indicator analysis unlocks only when at least two of three keys
//! (analysis verb, market adjective, ticker) are present and one of them is
//! the ticker, or the explicit "psi-ema" keyword appears, which counts as
//! verb AND adjective. Ticker candidates rank
//! `$TICKER > ALL-CAPS ≥ Titlecase`; lowercase text never produces a ticker
//! without strong context, and a geo veto redirects city-abbreviation
//! comparisons to the affordability path before any of this runs.

use regex::Regex;
use std::sync::OnceLock;

/// Analysis verbs (key 1).
const VERBS: [&str; 12] = [
    "analyze", "analyse", "diagnose", "forecast", "evaluate", "assess", "scan", "examine",
    "predict", "read", "chart", "study",
];

/// Market adjectives (key 2).
const ADJECTIVES: [&str; 12] = [
    "price", "trend", "wave", "ema", "momentum", "oscillator", "signal", "pattern",
    "breakout", "volatility", "technical", "indicator",
];

/// Words that can never be tickers, however they are capitalized.
const TICKER_BLOCKLIST: [&str; 69] = [
    "A", "I", "AN", "IT", "IS", "BE", "DO", "GO", "ON", "AT", "TO", "OR", "SO", "NO", "UP",
    "OF", "IN", "BY", "AS", "IF", "WE", "HE", "MY", "ME", "US", "AM", "PM", "ETC", "NOT",
    "BUT", "HAS", "HAD", "WAS", "ARE", "YOU", "HOW", "WHO", "DID", "GET", "DOES",
    "THE", "AND", "FOR", "ALL", "CAN", "NOW", "NEW", "ONE", "TWO", "VS", "OK", "USA", "CEO",
    "AI", "USD", "EUR", "GBP", "JPY", "ETF", "IPO", "GDP", "FAQ", "API", "PDF", "URL", "ASAP",
    "NYSE", "WHAT", "WHY",
];

/// City abbreviations that trigger the geo veto in comparison contexts.
const GEO_TOKENS: [&str; 6] = ["la", "ny", "sf", "dc", "hk", "kl"];

const COMPARISON_WORDS: [&str; 4] = ["vs", "versus", "compare", "compared"];
const GEO_SUBJECTS: [&str; 8] = [
    "price", "land", "housing", "home", "rent", "income", "property", "afford",
];
const STOCK_CUES: [&str; 4] = ["stock", "ticker", "share", "shares"];

/// Financial context words that permit the Titlecase tier and the LLM
/// extraction fallback.
const FINANCIAL_CONTEXT: [&str; 8] = [
    "stock", "ticker", "share", "market", "trading", "equity", "invest", "portfolio",
];

/// A detected ticker candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerCandidate {
    pub symbol: String,
    /// True for `$TICKER` spellings and "stock"/"ticker" adjacency.
    pub explicit: bool,
}

/// Lego keys found in a classification query.
#[derive(Debug, Clone, Default)]
pub struct LegoKeys {
    pub verb: bool,
    pub adjective: bool,
    pub ticker: Option<TickerCandidate>,
    /// The compound "psi-ema" token, which contributes verb AND adjective.
    pub psi_ema_keyword: bool,
}

impl LegoKeys {
    /// Number of effective keys present.
    pub fn count(&self) -> usize {
        let mut n = 0;
        if self.verb {
            n += 1;
        }
        if self.adjective {
            n += 1;
        }
        if self.ticker.is_some() {
            n += 1;
        }
        n
    }

    /// Unlock condition: at least two effective keys with one of them a
    /// ticker, or the explicit indicator keyword.
    pub fn unlocked(&self) -> bool {
        self.psi_ema_keyword || (self.count() >= 2 && self.ticker.is_some())
    }
}

/// Detect all three keys over a classification query.
pub fn detect_keys(query: &str) -> LegoKeys {
    let lowered = query.to_lowercase();
    let psi_ema_keyword = lowered.contains("psi-ema")
        || lowered.contains("psi ema")
        || lowered.contains("ψ-ema");

    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    let verb = psi_ema_keyword || words.iter().any(|w| VERBS.contains(w));
    let adjective = psi_ema_keyword || words.iter().any(|w| ADJECTIVES.contains(w));

    LegoKeys {
        verb,
        adjective,
        ticker: extract_ticker(query),
        psi_ema_keyword,
    }
}

/// Extract a ticker candidate, in priority order `$TICKER`, ALL-CAPS,
/// Titlecase-with-financial-context. Lowercase never qualifies.
pub fn extract_ticker(query: &str) -> Option<TickerCandidate> {
    static DOLLAR_RE: OnceLock<Regex> = OnceLock::new();
    static CAPS_RE: OnceLock<Regex> = OnceLock::new();
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();

    // $TICKER wins outright, blocklist does not apply to explicit spellings
    let dollar_re =
        DOLLAR_RE.get_or_init(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9.\-]{0,9})\b").unwrap());
    if let Some(caps) = dollar_re.captures(query) {
        return Some(TickerCandidate {
            symbol: caps[1].to_uppercase(),
            explicit: true,
        });
    }

    // ALL-CAPS word, 1-6 chars, not blocklisted
    let caps_re = CAPS_RE.get_or_init(|| Regex::new(r"\b([A-Z][A-Z0-9.\-]{0,5})\b").unwrap());
    let lowered = query.to_lowercase();
    let near_stock_cue = STOCK_CUES.iter().any(|cue| lowered.contains(cue));
    for caps in caps_re.captures_iter(query) {
        let symbol = caps[1].to_string();
        if symbol.chars().any(|c| c.is_ascii_lowercase()) {
            continue;
        }
        if TICKER_BLOCKLIST.contains(&symbol.as_str()) {
            continue;
        }
        // single letters only count next to a stock cue
        if symbol.len() == 1 && !near_stock_cue {
            continue;
        }
        return Some(TickerCandidate {
            symbol,
            explicit: near_stock_cue,
        });
    }

    // Titlecase only with financial context in the query
    if FINANCIAL_CONTEXT.iter().any(|w| lowered.contains(w)) {
        let title_re = TITLE_RE.get_or_init(|| Regex::new(r"\b([A-Z][a-z]{1,5})\b").unwrap());
        for caps in title_re.captures_iter(query) {
            let word = caps[1].to_string();
            let upper = word.to_uppercase();
            if TICKER_BLOCKLIST.contains(&upper.as_str()) {
                continue;
            }
            if COMMON_TITLECASE.contains(&word.as_str()) {
                continue;
            }
            return Some(TickerCandidate {
                symbol: upper,
                explicit: false,
            });
        }
    }

    None
}

/// Titlecase words that start sentences far too often to be tickers.
const COMMON_TITLECASE: [&str; 20] = [
    "What", "Which", "Where", "When", "How", "Why", "Who", "The", "This", "That", "Can",
    "Could", "Would", "Should", "Please", "Show", "Tell", "Give", "Does", "Stock",
];

/// Geo veto: a city abbreviation in a comparison about prices or income,
/// with no explicit stock cue, is an affordability question, not a ticker.
pub fn geo_veto(query: &str, ticker: Option<&TickerCandidate>) -> bool {
    let lowered = query.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let has_geo = words.iter().any(|w| GEO_TOKENS.contains(w));
    if !has_geo {
        return false;
    }
    let has_comparison = words.iter().any(|w| COMPARISON_WORDS.contains(w));
    let has_subject = GEO_SUBJECTS.iter().any(|s| lowered.contains(s));
    if !(has_comparison && has_subject) {
        return false;
    }
    let has_stock_cue =
        query.contains('$') || STOCK_CUES.iter().any(|cue| words.contains(cue));
    if has_stock_cue {
        return false;
    }
    // an explicit ticker elsewhere in the query also defeats the veto
    match ticker {
        Some(candidate) if candidate.explicit => false,
        Some(candidate) if !GEO_TOKENS.contains(&candidate.symbol.to_lowercase().as_str()) => {
            false
        }
        _ => true,
    }
}

/// True when the query carries enough financial context to justify an LLM
/// extraction call for the missing ticker key.
pub fn has_financial_context(query: &str) -> bool {
    let lowered = query.to_lowercase();
    FINANCIAL_CONTEXT.iter().any(|w| lowered.contains(w))
        || ADJECTIVES.iter().any(|w| lowered.contains(w))
}

/// Parse the reply of the LLM ticker-extraction prompt (`TICKER:XXX` or
/// `NONE`).
pub fn parse_ai_ticker(reply: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"TICKER:\s*([A-Za-z][A-Za-z0-9.\-]{0,9})").unwrap());
    let caps = re.captures(reply)?;
    let symbol = caps[1].to_uppercase();
    if TICKER_BLOCKLIST.contains(&symbol.as_str()) {
        None
    } else {
        Some(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_ticker_wins_over_everything() {
        let candidate = extract_ticker("is $NVDA beating AMD on price?").unwrap();
        assert_eq!(candidate.symbol, "NVDA");
        assert!(candidate.explicit);
    }

    #[test]
    fn all_caps_tickers_skip_blocklist_words() {
        let candidate = extract_ticker("analyze NVDA trend please").unwrap();
        assert_eq!(candidate.symbol, "NVDA");
        assert!(!candidate.explicit);

        // blocklisted caps words never match
        assert!(extract_ticker("WHAT IS THE GDP OF THE USA").is_none());
    }

    #[test]
    fn lowercase_never_yields_a_ticker() {
        assert!(extract_ticker("analyze nvda trend").is_none());
    }

    #[test]
    fn titlecase_needs_financial_context() {
        assert!(extract_ticker("tell me about Nvda").is_none());
        let candidate = extract_ticker("is Nvda a good stock").unwrap();
        assert_eq!(candidate.symbol, "NVDA");
    }

    #[test]
    fn single_letter_needs_stock_cue() {
        assert!(extract_ticker("grade F results").is_none());
        let candidate = extract_ticker("F stock analysis").unwrap();
        assert_eq!(candidate.symbol, "F");
    }

    #[test]
    fn psi_ema_keyword_contributes_verb_and_adjective() {
        let keys = detect_keys("psi-ema NVDA");
        assert!(keys.verb && keys.adjective);
        assert!(keys.psi_ema_keyword);
        assert!(keys.unlocked());
    }

    #[test]
    fn two_of_three_requires_a_ticker() {
        // verb + adjective, no ticker: not unlocked (AI-push territory)
        let keys = detect_keys("analyze the price action here");
        assert_eq!(keys.count(), 2);
        assert!(!keys.unlocked());

        // verb + ticker: unlocked via implication
        let keys = detect_keys("analyze NVDA");
        assert!(keys.unlocked());
    }

    #[test]
    fn geo_veto_fires_on_city_comparisons() {
        let ticker = extract_ticker("LA vs NY housing price");
        assert!(geo_veto("LA vs NY housing price", ticker.as_ref()));
    }

    #[test]
    fn dollar_spelling_defeats_the_geo_veto() {
        let ticker = extract_ticker("$LA vs NY housing price");
        assert!(!geo_veto("$LA vs NY housing price", ticker.as_ref()));
    }

    #[test]
    fn stock_cue_defeats_the_geo_veto() {
        let ticker = extract_ticker("LA stock vs NY price");
        assert!(!geo_veto("LA stock vs NY price", ticker.as_ref()));
    }

    #[test]
    fn geo_veto_needs_comparison_and_subject() {
        assert!(!geo_veto("I love LA", None));
        assert!(!geo_veto("LA vs NY", None)); // no subject
        assert!(!geo_veto("LA housing price", None)); // no comparison
    }

    #[test]
    fn ai_ticker_reply_parses() {
        assert_eq!(parse_ai_ticker("TICKER: NVDA").as_deref(), Some("NVDA"));
        assert_eq!(parse_ai_ticker("TICKER:brk.b").as_deref(), Some("BRK.B"));
        assert_eq!(parse_ai_ticker("NONE"), None);
        assert_eq!(parse_ai_ticker("TICKER: THE"), None);
    }
}
