//! The preflight routing algorithm
//!
//! Priority order: blob reduction, design questions, indicator identity,
//! forex, seed-metric (with geo veto), the Ψ-EMA lego detector with market
//! prefetch and AI-push rescue, then the general default. Attachment
//! overrides and realtime-search intent run after the mode decision.

use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::analysis::{psi_ema, seed_metric};
use crate::fetchers::forex::ForexFetcher;
use crate::fetchers::market::MarketDataFetcher;
use crate::fetchers::search::SearchStrategy;
use crate::providers::{CompletionRequest, ProviderChain};
use crate::routing::ticker::{
    detect_keys, geo_veto, has_financial_context, parse_ai_ticker, TickerCandidate,
};
use crate::routing::types::{
    AttachmentMeta, DocContext, PreflightResult, RoutingFlags, RoutingMode,
};

const BLOB_CHAR_THRESHOLD: usize = 500;
const BLOB_SENTENCE_THRESHOLD: usize = 10;

/// Input to one routing decision.
#[derive(Debug, Clone, Default)]
pub struct PreflightInput {
    pub query: String,
    pub attachments: Vec<AttachmentMeta>,
    pub doc_context: DocContext,
    /// Ticker inferred from conversation context at S-1, if any.
    pub inferred_ticker: Option<String>,
    /// Caller identity for rate-limited services.
    pub caller_id: String,
}

/// Mode detection, key extraction, and data prefetch.
pub struct PreflightRouter {
    chain: Arc<ProviderChain>,
    market: Arc<MarketDataFetcher>,
    forex: Arc<ForexFetcher>,
}

impl PreflightRouter {
    pub fn new(
        chain: Arc<ProviderChain>,
        market: Arc<MarketDataFetcher>,
        forex: Arc<ForexFetcher>,
    ) -> Self {
        Self {
            chain,
            market,
            forex,
        }
    }

    /// Route a query. Never fails: fetch errors degrade the mode and land in
    /// `result.error` instead.
    pub async fn route(&self, input: &PreflightInput) -> PreflightResult {
        let mut result = PreflightResult::default();
        result.routing_flags.has_attachments = !input.attachments.is_empty();
        result.routing_flags.has_doc_context = input.doc_context.has_financial_doc
            || input.doc_context.has_legal_doc
            || input.doc_context.has_code_doc;

        // 0. blob reduction
        let classification_query = classification_view(&input.query, &mut result.routing_flags);

        // 1. design questions
        if is_design_question(&classification_query) {
            result.mode = RoutingMode::Design;
            result.routing_flags.is_design_question = true;
            self.apply_overrides(input, &classification_query, &mut result);
            return result;
        }

        // assistant identity (audited as BYPASS downstream)
        if is_identity_query(&classification_query) {
            result.mode = RoutingMode::Identity;
            self.apply_overrides(input, &classification_query, &mut result);
            return result;
        }

        // 2. indicator identity
        let keys = detect_keys(&classification_query);
        if is_indicator_identity(&classification_query) && keys.ticker.is_none() {
            result.mode = RoutingMode::PsiEmaIdentity;
            result.routing_flags.is_psi_ema_identity = true;
            result.code_context = Some(psi_ema::CANONICAL_DOC.to_string());
            self.apply_overrides(input, &classification_query, &mut result);
            return result;
        }

        // 3. forex
        if let Some(pair) = detect_forex_pair(&classification_query) {
            result.mode = RoutingMode::Forex;
            result.routing_flags.uses_forex = true;
            result.forex_pair = Some(pair.clone());
            match self.forex.fetch(&pair).await {
                Ok(quote) => {
                    result.forex_context = Some(match quote.rate {
                        Some(rate) => {
                            format!("Current {} rate: {rate:.4} (source: {})", quote.pair, quote.source)
                        }
                        None => format!("{}: rate unavailable from {}", quote.pair, quote.source),
                    });
                    result.forex_data = Some(quote);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "forex prefetch failed");
                    result.error = Some(err.to_string());
                }
            }
            self.apply_overrides(input, &classification_query, &mut result);
            return result;
        }

        // 4. seed-metric, including the geo veto; an explicit $TICKER keeps
        // affordability wording on the indicator path
        let vetoed = geo_veto(&classification_query, keys.ticker.as_ref());
        let explicit_ticker = keys.ticker.as_ref().map(|t| t.explicit).unwrap_or(false);
        if vetoed || (!explicit_ticker && is_seed_metric_intent(&classification_query)) {
            let cities = recognized_cities(&classification_query);
            if vetoed || !cities.is_empty() {
                result.mode = RoutingMode::SeedMetric;
                result.routing_flags.is_seed_metric = true;
                result.routing_flags.geo_veto_applied = vetoed;
                result.search_strategy = SearchStrategy::Brave;
                result.decade = seed_metric::extract_decade(&classification_query);
                result.cities = cities;
                for city in &result.cities {
                    result
                        .pending_search_queries
                        .extend(seed_metric::build_queries(city, result.decade.as_deref()));
                }
                self.apply_overrides(input, &classification_query, &mut result);
                return result;
            }
        }

        // 5. Ψ-EMA lego unlock
        if self
            .try_unlock_indicator(input, &classification_query, keys, &mut result)
            .await
        {
            self.apply_overrides(input, &classification_query, &mut result);
            return result;
        }

        // 6. default
        result.mode = RoutingMode::General;
        self.apply_overrides(input, &classification_query, &mut result);
        result
    }

    /// The Ψ-EMA unlock path. Returns true when the mode was decided here.
    async fn try_unlock_indicator(
        &self,
        input: &PreflightInput,
        classification_query: &str,
        keys: crate::routing::ticker::LegoKeys,
        result: &mut PreflightResult,
    ) -> bool {
        let mut ticker: Option<TickerCandidate> = keys.ticker.clone();

        // AI-push rescue: two non-ticker keys and financial context justify
        // one LLM extraction call for the missing ticker.
        if ticker.is_none()
            && keys.verb
            && keys.adjective
            && has_financial_context(classification_query)
        {
            let extracted = self.ai_push_ticker(classification_query).await;
            if let Some(symbol) = extracted {
                ticker = Some(TickerCandidate {
                    symbol,
                    explicit: false,
                });
            } else if let Some(inferred) = &input.inferred_ticker {
                ticker = Some(TickerCandidate {
                    symbol: inferred.clone(),
                    explicit: false,
                });
            }
        }

        let key_count = usize::from(keys.verb) + usize::from(keys.adjective)
            + usize::from(ticker.is_some());
        let unlocked =
            keys.psi_ema_keyword || (key_count >= 2 && ticker.is_some());
        if !unlocked {
            return false;
        }

        result.routing_flags.uses_psi_ema = true;
        result.custom_period = extract_custom_period(classification_query);

        let Some(candidate) = ticker else {
            // explicit keyword with no resolvable ticker: the fast path at
            // S0 answers with the no-data template
            result.mode = RoutingMode::PsiEma;
            return true;
        };

        match self.market.fetch(&candidate.symbol).await {
            Ok(data) if !data.daily.closes.is_empty() => {
                result.ticker = Some(data.ticker.clone());
                result.ticker_verified = true;
                result.mode = RoutingMode::PsiEma;
                result.data_age = data.end_date.clone();
                result.indicator_analysis = psi_ema::analyze(&data.daily.closes).ok();
                if data.weekly.closes.len() >= psi_ema::MIN_WEEKLY_BARS {
                    result.weekly_analysis = psi_ema::analyze_weekly(&data.weekly.closes).ok();
                }
                result.stock_context = Some(format!(
                    "{} ({}) last {} daily bars, current price {}",
                    data.ticker,
                    data.name.as_deref().unwrap_or("unknown"),
                    data.daily.bar_count,
                    data.current_price
                        .map(|p| format!("{p:.2}"))
                        .unwrap_or_else(|| "n/a".to_string()),
                ));
                result.market_data = Some(data);
                true
            }
            Ok(_) | Err(_) if keys.psi_ema_keyword => {
                // keyword was explicit; keep the mode, drop the ticker
                result.mode = RoutingMode::PsiEma;
                result.ticker = None;
                true
            }
            Ok(_) => {
                result.routing_flags.uses_psi_ema = false;
                false
            }
            Err(err) => {
                tracing::debug!(ticker = %candidate.symbol, error = %err, "market prefetch failed");
                result.error = Some(err.to_string());
                result.routing_flags.uses_psi_ema = false;
                false
            }
        }
    }

    async fn ai_push_ticker(&self, query: &str) -> Option<String> {
        let request = CompletionRequest::new(format!(
            "Extract the stock ticker symbol this question refers to. Reply with \
             exactly `TICKER:SYMBOL` or `NONE`.\n\nQuestion: {query}"
        ))
        .with_temperature(0.0)
        .with_max_tokens(20);
        match self.chain.call(&request, None).await {
            Ok(response) => parse_ai_ticker(&response.text),
            Err(err) => {
                tracing::debug!(error = %err, "AI-push ticker extraction failed");
                None
            }
        }
    }

    /// Attachment overrides, code promotion, and realtime intent.
    fn apply_overrides(
        &self,
        input: &PreflightInput,
        classification_query: &str,
        result: &mut PreflightResult,
    ) {
        let financial_attachment = input
            .attachments
            .iter()
            .any(|a| has_extension(&a.file_name, &["xls", "xlsx"]));
        if financial_attachment || input.doc_context.has_financial_doc {
            result.routing_flags.uses_financial_physics = true;
        }

        let legal_attachment = input
            .attachments
            .iter()
            .any(|a| is_legal_filename(&a.file_name));
        if legal_attachment || input.doc_context.has_legal_doc {
            result.routing_flags.uses_legal_analysis = true;
        }

        // code promotion overrides general and forex only
        let code_attachment = input
            .attachments
            .iter()
            .any(|a| has_extension(&a.file_name, CODE_EXTENSIONS));
        let (pasted_code, topics) = detect_code_signals(&input.query);
        if (code_attachment || pasted_code || input.doc_context.has_code_doc)
            && matches!(result.mode, RoutingMode::General | RoutingMode::Forex)
        {
            result.mode = RoutingMode::CodeAudit;
            result.routing_flags.uses_code_audit = true;
            result.code_topics = topics;
            if pasted_code {
                result.code_context = Some("Query contains pasted source code.".to_string());
            }
        }

        // financial/legal documents promote a still-general query
        if result.mode == RoutingMode::General {
            if result.routing_flags.uses_financial_physics {
                result.mode = RoutingMode::Financial;
            } else if result.routing_flags.uses_legal_analysis {
                result.mode = RoutingMode::Legal;
            }
        }

        // realtime intent applies only to queries that stayed general
        if result.mode == RoutingMode::General && wants_realtime(classification_query) {
            result.routing_flags.needs_realtime_search = true;
            result.search_strategy = SearchStrategy::Duckduckgo;
            result
                .pending_search_queries
                .push(classification_query.to_string());
        }
    }
}

/// Reduce blob queries to first-3 ∪ last-2 sentences; short queries pass
/// through unchanged.
fn classification_view(query: &str, flags: &mut RoutingFlags) -> String {
    let sentences = split_sentences(query);
    let is_blob =
        query.chars().count() > BLOB_CHAR_THRESHOLD || sentences.len() >= BLOB_SENTENCE_THRESHOLD;
    flags.is_blob = is_blob;
    if !is_blob {
        return query.to_string();
    }

    let mut selected: Vec<&str> = Vec::new();
    for sentence in sentences.iter().take(3) {
        selected.push(sentence);
    }
    let tail_start = sentences.len().saturating_sub(2);
    for sentence in sentences.iter().skip(tail_start) {
        if !selected.contains(sentence) {
            selected.push(sentence);
        }
    }
    selected.join(". ")
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_design_question(query: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(architecture|design pattern|system design|microservice|scalab\w*|api design|database schema|schema design|event-driven|distributed system|load balanc\w*)\b",
        )
        .unwrap()
    });
    re.is_match(query)
}

fn is_identity_query(query: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)\b(who are you|what are you|introduce yourself|are you an ai|your name)\b")
            .unwrap()
    });
    re.is_match(query)
}

fn is_indicator_identity(query: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)(what\s+is\s+(ψ|psi)[\s-]?ema|what's\s+(ψ|psi)[\s-]?ema|explain\s+(ψ|psi)[\s-]?ema|how\s+does\s+(ψ|psi)[\s-]?ema\s+work|define\s+(ψ|psi)[\s-]?ema|(ψ|psi)[\s-]?ema\s+documentation)",
        )
        .unwrap()
    });
    re.is_match(query)
}

const CURRENCY_CODES: [&str; 27] = [
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "CAD", "NZD", "CNY", "HKD", "SGD", "IDR", "INR",
    "KRW", "THB", "MYR", "PHP", "VND", "BRL", "MXN", "ZAR", "TRY", "RUB", "SEK", "NOK", "DKK",
    "PLN",
];

/// Detect a forex pair (`USD/JPY`) or a forex keyword plus a single code.
fn detect_forex_pair(query: &str) -> Option<String> {
    static PAIR_RE: OnceLock<Regex> = OnceLock::new();
    let re = PAIR_RE
        .get_or_init(|| Regex::new(r"\b([A-Za-z]{3})\s*/\s*([A-Za-z]{3})\b").unwrap());
    if let Some(caps) = re.captures(query) {
        let base = caps[1].to_uppercase();
        let quote = caps[2].to_uppercase();
        if base != quote
            && (CURRENCY_CODES.contains(&base.as_str()) || CURRENCY_CODES.contains(&quote.as_str()))
        {
            return Some(format!("{base}/{quote}"));
        }
    }

    let lowered = query.to_lowercase();
    if lowered.contains("forex") || lowered.contains("exchange rate") {
        let mut found = CURRENCY_CODES
            .iter()
            .filter(|code| {
                query
                    .split(|c: char| !c.is_ascii_alphanumeric())
                    .any(|w| w.eq_ignore_ascii_case(code))
            })
            .take(2);
        if let (Some(base), Some(quote)) = (found.next(), found.next()) {
            return Some(format!("{base}/{quote}"));
        }
    }
    None
}

fn is_seed_metric_intent(query: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(housing|afford\w*|land price|price per (square )?met\w*|property price|home price|real estate|cost of living)\b",
        )
        .unwrap()
    });
    re.is_match(query)
}

/// Cities named in the query, with geo abbreviations expanded.
fn recognized_cities(query: &str) -> Vec<String> {
    let mut cities = seed_metric::find_cities(query);
    let geo_map: [(&str, &str); 6] = [
        ("la", "los angeles"),
        ("ny", "new york"),
        ("sf", "san francisco"),
        ("dc", "washington"),
        ("hk", "hong kong"),
        ("kl", "kuala lumpur"),
    ];
    let lowered = query.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    for (abbrev, city) in geo_map {
        if words.contains(&abbrev) && !cities.iter().any(|c| c == city) {
            cities.push(city.to_string());
        }
    }
    cities
}

/// Custom data period like `90d`, `26w`, `6m`, `2y`.
fn extract_custom_period(query: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\b(\d+[dwmy])\b").unwrap());
    re.captures(query).map(|caps| caps[1].to_string())
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "ts", "jsx", "tsx", "java", "go", "c", "cc", "cpp", "h", "hpp", "rb",
    "php", "swift", "kt", "sh", "sql", "cs",
];

fn has_extension(file_name: &str, extensions: &[&str]) -> bool {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| extensions.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

fn is_legal_filename(file_name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)(contract|agreement|nda|lease|terms|legal|license|court|statute)")
            .unwrap()
    });
    re.is_match(file_name)
}

/// Language-pattern heuristics over pasted text; returns detected topics.
fn detect_code_signals(query: &str) -> (bool, Vec<String>) {
    let mut topics = Vec::new();
    let checks: [(&str, &str); 8] = [
        ("```", "fenced-block"),
        ("fn ", "rust"),
        ("def ", "python"),
        ("function ", "javascript"),
        ("#include", "c"),
        ("import ", "module-import"),
        ("class ", "oop"),
        ("SELECT ", "sql"),
    ];
    for (needle, topic) in checks {
        if query.contains(needle) {
            topics.push(topic.to_string());
        }
    }
    // a single "import"/"class" in prose is not code; require a stronger
    // signal or two weak ones
    let strong = topics
        .iter()
        .any(|t| matches!(t.as_str(), "fenced-block" | "rust" | "python" | "c" | "sql"));
    (strong || topics.len() >= 2, topics)
}

fn wants_realtime(query: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(latest|news|score|game (tonight|today)|weather|right now|currently|this week|yesterday|breaking|live|happening)\b",
        )
        .unwrap()
    });
    re.is_match(query)
}
