//! Chemistry identification cascade for image pre-analysis
//!
//! Vision output for chemical-looking images runs through a tiered cascade:
//! a settled-science table of canonical formulas, a search arbitration step
//! when vision and the table disagree, a discovery cascade (exact query →
//! alternate query → structure keywords → fuzzy formula variants), and a
//! Wikipedia extract when any tier hits. A scholastic-domain gate upstream
//! keeps pure-math, engineering, biology, and finance imagery out of the
//! chemistry path entirely.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::fetchers::search::SearchCascade;

/// Category assigned to each vision description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCategory {
    Chemical,
    Chart,
    Diagram,
    Visual,
}

/// Categorize a vision description by its vocabulary.
pub fn categorize_description(text: &str) -> ImageCategory {
    let lowered = text.to_lowercase();
    let hits = |keywords: &[&str]| keywords.iter().filter(|k| lowered.contains(*k)).count();

    let chemical = hits(&[
        "molecule", "molecular", "chemical", "compound", "formula", "bond", "atom", "benzene",
        "hydroxyl", "carboxyl", "reaction", "element", "ion",
    ]);
    let chart = hits(&[
        "chart", "candlestick", "price", "axis", "graph", "plot", "trend line", "ticker",
        "ohlc", "volume bars",
    ]);
    let diagram = hits(&[
        "diagram", "flowchart", "architecture", "schematic", "circuit", "uml", "topology",
        "block diagram",
    ]);

    let best = [
        (ImageCategory::Chemical, chemical),
        (ImageCategory::Chart, chart),
        (ImageCategory::Diagram, diagram),
    ]
    .into_iter()
    .max_by_key(|(_, score)| *score);

    match best {
        Some((category, score)) if score > 0 => category,
        _ => ImageCategory::Visual,
    }
}

/// Scholastic domains used by the chemistry gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScholasticDomain {
    Chemistry,
    PureMath,
    Engineering,
    Biology,
    Finance,
}

/// Classify the dominant scholastic domain of combined vision descriptions.
pub fn classify_domain(text: &str) -> ScholasticDomain {
    let lowered = text.to_lowercase();
    let hits = |keywords: &[&str]| keywords.iter().filter(|k| lowered.contains(*k)).count();

    let scores = [
        (
            ScholasticDomain::Chemistry,
            hits(&[
                "molecule", "compound", "bond", "reaction", "acid", "element", "formula",
                "oxidation", "solvent",
            ]),
        ),
        (
            ScholasticDomain::PureMath,
            hits(&[
                "theorem", "proof", "integral", "derivative", "matrix", "equation", "lemma",
                "polynomial", "topology",
            ]),
        ),
        (
            ScholasticDomain::Engineering,
            hits(&[
                "circuit", "voltage", "torque", "beam", "load", "gear", "cad", "stress",
                "amplifier",
            ]),
        ),
        (
            ScholasticDomain::Biology,
            hits(&[
                "cell", "protein", "dna", "enzyme", "organism", "membrane", "tissue", "gene",
                "bacteria",
            ]),
        ),
        (
            ScholasticDomain::Finance,
            hits(&[
                "price", "stock", "ticker", "candlestick", "revenue", "portfolio", "dividend",
                "balance sheet",
            ]),
        ),
    ];

    scores
        .into_iter()
        .max_by_key(|(_, score)| *score)
        .map(|(domain, _)| domain)
        .unwrap_or(ScholasticDomain::Chemistry)
}

/// Settled-science table: 18 canonical name/formula pairs.
pub const SETTLED_FORMULAS: [(&str, &str); 18] = [
    ("water", "H2O"),
    ("carbon dioxide", "CO2"),
    ("methane", "CH4"),
    ("ammonia", "NH3"),
    ("sulfuric acid", "H2SO4"),
    ("sodium chloride", "NaCl"),
    ("glucose", "C6H12O6"),
    ("ethanol", "C2H5OH"),
    ("acetic acid", "CH3COOH"),
    ("hydrogen peroxide", "H2O2"),
    ("calcium carbonate", "CaCO3"),
    ("sodium hydroxide", "NaOH"),
    ("hydrochloric acid", "HCl"),
    ("nitric acid", "HNO3"),
    ("benzene", "C6H6"),
    ("ozone", "O3"),
    ("nitrous oxide", "N2O"),
    ("potassium permanganate", "KMnO4"),
];

/// Names too generic to headline a compound identification.
const GENERIC_NAMES: [&str; 6] = [
    "compound", "molecule", "chemical", "substance", "unknown", "structure",
];

/// One identified compound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundIdentification {
    pub name: String,
    pub formula: Option<String>,
    pub confidence: f64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wikipedia: Option<String>,
}

/// Stage 0: settled table lookup by formula token or name substring.
pub fn settled_lookup(description: &str) -> Option<CompoundIdentification> {
    let lowered = description.to_lowercase();
    let tokens: Vec<&str> = description.split_whitespace().collect();
    for (name, formula) in SETTLED_FORMULAS {
        let formula_hit = tokens.iter().any(|t| t.trim_matches(|c: char| !c.is_ascii_alphanumeric()) == formula);
        if formula_hit || lowered.contains(name) {
            return Some(CompoundIdentification {
                name: name.to_string(),
                formula: Some(formula.to_string()),
                confidence: 0.95,
                source: "settled".to_string(),
                wikipedia: None,
            });
        }
    }
    None
}

/// Pull a plausible molecular formula token out of free text.
pub fn extract_formula(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\b((?:[A-Z][a-z]?\d*){2,})\b").unwrap()
    });
    re.find_iter(text)
        .map(|m| m.as_str())
        .find(|candidate| candidate.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Fuzzy ±1 variants on the H and C counts of a formula.
pub fn formula_variants(formula: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"([A-Z][a-z]?)(\d*)").unwrap());

    let mut variants = Vec::new();
    for target in ["H", "C"] {
        for delta in [-1i64, 1] {
            let mut rebuilt = String::new();
            let mut changed = false;
            for caps in re.captures_iter(formula) {
                let element = &caps[1];
                let count: i64 = caps[2].parse().unwrap_or(1);
                if element == target && !changed {
                    let new_count = count + delta;
                    if new_count < 1 {
                        rebuilt.clear();
                        break;
                    }
                    changed = true;
                    rebuilt.push_str(element);
                    if new_count > 1 {
                        rebuilt.push_str(&new_count.to_string());
                    }
                } else {
                    rebuilt.push_str(&caps[0]);
                }
            }
            if changed && !rebuilt.is_empty() && rebuilt != formula {
                variants.push(rebuilt);
            }
        }
    }
    variants.dedup();
    variants
}

/// Extract 2–8 meaningful terms for vision-search enrichment.
pub fn extract_search_terms(description: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "the", "a", "an", "of", "in", "on", "with", "and", "or", "this", "that", "image",
        "picture", "photo", "shows", "showing", "appears", "contains", "there", "some", "what",
        "is", "are", "to", "for", "it", "its", "be", "at", "by", "from",
    ];
    let mut terms: Vec<String> = Vec::new();
    for word in description.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect();
        let lowered = cleaned.to_lowercase();
        if cleaned.len() >= 3
            && !STOPWORDS.contains(&lowered.as_str())
            && !terms.iter().any(|t| t.eq_ignore_ascii_case(&cleaned))
        {
            terms.push(cleaned);
        }
        if terms.len() == 8 {
            break;
        }
    }
    if terms.len() < 2 {
        terms.clear();
    }
    terms
}

/// Run the full identification cascade for one chemical-looking description.
pub async fn identify_compound(
    description: &str,
    vision_name: Option<&str>,
    search: &SearchCascade,
    client_id: &str,
) -> Option<CompoundIdentification> {
    // Stage 0: settled table
    let mut identification = settled_lookup(description);

    // Stage 0.5: arbitration when vision disagrees with the table
    let settled_info = identification
        .as_ref()
        .map(|s| (s.name.clone(), s.formula.clone().unwrap_or_default()));
    if let (Some((settled_name, settled_formula)), Some(vision)) = (settled_info, vision_name) {
        let vision_lower = vision.to_lowercase();
        if !vision_lower.contains(&settled_name) && !GENERIC_NAMES.contains(&vision_lower.as_str())
        {
            let query = format!("{vision} chemical formula");
            if let Some(result) = search.best_effort(&query, client_id).await {
                if !settled_formula.is_empty() && result.text.contains(&settled_formula) {
                    // search corroborates the table; keep it
                } else if result.text.to_lowercase().contains(&vision_lower) {
                    identification = Some(CompoundIdentification {
                        name: vision_lower.clone(),
                        formula: extract_formula(&result.text),
                        confidence: 0.75,
                        source: "arbitration".to_string(),
                        wikipedia: None,
                    });
                } else if let Some(settled) = identification.as_mut() {
                    settled.confidence = 0.8;
                }
            }
        }
    }

    // Stage 1: discovery cascade
    if identification.is_none() {
        identification = discovery_cascade(description, vision_name, search, client_id).await;
    }

    // Wikipedia extract for whatever survived
    if let Some(identification) = identification.as_mut() {
        let query = format!("{} wikipedia", identification.name);
        if let Some(result) = search.best_effort(&query, client_id).await {
            let extract: String = result.text.chars().take(600).collect();
            if !extract.is_empty() {
                identification.wikipedia = Some(extract);
            }
        }
    }

    identification
}

async fn discovery_cascade(
    description: &str,
    vision_name: Option<&str>,
    search: &SearchCascade,
    client_id: &str,
) -> Option<CompoundIdentification> {
    let terms = extract_search_terms(description);
    let subject = vision_name
        .map(str::to_string)
        .unwrap_or_else(|| terms.join(" "));
    if subject.is_empty() {
        return None;
    }

    // exact
    let queries = [
        format!("{subject} chemical compound identification"),
        // alternate phrasing
        format!("{subject} molecular formula name"),
        // structure keywords
        format!("{} structure functional groups", terms.join(" ")),
    ];
    for (tier, query) in queries.iter().enumerate() {
        if let Some(result) = search.best_effort(query, client_id).await {
            if let Some(formula) = extract_formula(&result.text) {
                return Some(CompoundIdentification {
                    name: subject.to_lowercase(),
                    formula: Some(formula),
                    confidence: 0.8 - tier as f64 * 0.05,
                    source: format!("discovery:{}", ["exact", "alternate", "structure"][tier]),
                    wikipedia: None,
                });
            }
        }
    }

    // fuzzy ±1 H/C against the settled table
    if let Some(candidate) = extract_formula(description) {
        for variant in formula_variants(&candidate) {
            if let Some((name, formula)) =
                SETTLED_FORMULAS.iter().find(|(_, f)| *f == variant)
            {
                return Some(CompoundIdentification {
                    name: name.to_string(),
                    formula: Some(formula.to_string()),
                    confidence: 0.7,
                    source: "discovery:fuzzy".to_string(),
                    wikipedia: None,
                });
            }
        }
    }
    None
}

/// The "Compound Identification" header, emitted only when confidence is at
/// least 0.7 and the name is not generic.
pub fn compound_header(identification: &CompoundIdentification) -> Option<String> {
    if identification.confidence < 0.7 {
        return None;
    }
    let lowered = identification.name.to_lowercase();
    if GENERIC_NAMES.iter().any(|g| lowered == *g) {
        return None;
    }
    let formula = identification
        .formula
        .as_deref()
        .map(|f| format!(" ({f})"))
        .unwrap_or_default();
    Some(format!(
        "**Compound Identification: {}{formula}** — confidence {:.0}%\n",
        title_case(&identification.name),
        identification.confidence * 100.0
    ))
}

fn title_case(name: &str) -> String {
    name.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetcherConfig;
    use crate::fetchers::search::testing::ScriptedSearch;
    use std::sync::Arc;
    use std::time::Duration;

    fn cascade(provider: ScriptedSearch) -> SearchCascade {
        SearchCascade::new(
            Arc::new(provider),
            &FetcherConfig {
                fanout_spacing: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    #[test]
    fn categorizes_descriptions() {
        assert_eq!(
            categorize_description("a benzene ring molecular structure with bonds"),
            ImageCategory::Chemical
        );
        assert_eq!(
            categorize_description("a candlestick price chart with volume bars"),
            ImageCategory::Chart
        );
        assert_eq!(
            categorize_description("a system architecture flowchart"),
            ImageCategory::Diagram
        );
        assert_eq!(
            categorize_description("a photo of a sunset over the sea"),
            ImageCategory::Visual
        );
    }

    #[test]
    fn domain_gate_separates_math_from_chemistry() {
        assert_eq!(
            classify_domain("integral of a polynomial, proof of the theorem"),
            ScholasticDomain::PureMath
        );
        assert_eq!(
            classify_domain("acid reacts with the compound forming a new bond"),
            ScholasticDomain::Chemistry
        );
        assert_eq!(
            classify_domain("candlestick stock price with ticker symbols"),
            ScholasticDomain::Finance
        );
    }

    #[test]
    fn settled_lookup_by_name_and_formula() {
        let by_name = settled_lookup("a diagram of sulfuric acid structure").unwrap();
        assert_eq!(by_name.formula.as_deref(), Some("H2SO4"));
        assert_eq!(by_name.confidence, 0.95);

        let by_formula = settled_lookup("shows the label C6H12O6 on a flask").unwrap();
        assert_eq!(by_formula.name, "glucose");

        assert!(settled_lookup("an unknown alkaloid").is_none());
    }

    #[test]
    fn formula_extraction_requires_digits() {
        assert_eq!(extract_formula("contains H2SO4 in solution").as_deref(), Some("H2SO4"));
        assert_eq!(extract_formula("the word Hello"), None);
    }

    #[test]
    fn fuzzy_variants_step_h_and_c() {
        let variants = formula_variants("C6H12O6");
        assert!(variants.contains(&"C6H11O6".to_string()));
        assert!(variants.contains(&"C6H13O6".to_string()));
        assert!(variants.contains(&"C5H12O6".to_string()));
        assert!(variants.contains(&"C7H12O6".to_string()));
    }

    #[test]
    fn search_terms_bounded_two_to_eight() {
        let terms = extract_search_terms(
            "the image shows a suspension bridge with steel cables over a wide river gorge at dawn",
        );
        assert!(terms.len() >= 2 && terms.len() <= 8, "{terms:?}");
        assert!(terms.iter().any(|t| t == "bridge"));
        assert!(extract_search_terms("the a of").is_empty());
    }

    #[tokio::test]
    async fn cascade_prefers_settled_with_wikipedia_extract() {
        let cascade = cascade(ScriptedSearch::with_ddg(vec![(
            "water wikipedia",
            "Water is an inorganic compound with the formula H2O.",
        )]));
        let id = identify_compound("a molecule of water", None, &cascade, "c1")
            .await
            .unwrap();
        assert_eq!(id.source, "settled");
        assert_eq!(id.formula.as_deref(), Some("H2O"));
        assert!(id.wikipedia.unwrap().contains("inorganic"));
    }

    #[tokio::test]
    async fn discovery_cascade_finds_formula_via_search() {
        let cascade = cascade(ScriptedSearch::with_ddg(vec![(
            "chemical compound identification",
            "Caffeine has the molecular formula C8H10N4O2.",
        )]));
        let id = identify_compound(
            "a stimulant alkaloid structure drawing",
            Some("caffeine"),
            &cascade,
            "c1",
        )
        .await
        .unwrap();
        assert!(id.source.starts_with("discovery"));
        assert_eq!(id.formula.as_deref(), Some("C8H10N4O2"));
    }

    #[tokio::test]
    async fn fuzzy_tier_repairs_off_by_one_formula() {
        let cascade = cascade(ScriptedSearch::default());
        let id = identify_compound(
            "flask labeled C6H13O6 crystalline sugar",
            None,
            &cascade,
            "c1",
        )
        .await
        .unwrap();
        assert_eq!(id.name, "glucose");
        assert_eq!(id.source, "discovery:fuzzy");
        assert_eq!(id.confidence, 0.7);
    }

    #[test]
    fn header_respects_confidence_and_generic_gates() {
        let good = CompoundIdentification {
            name: "glucose".to_string(),
            formula: Some("C6H12O6".to_string()),
            confidence: 0.95,
            source: "settled".to_string(),
            wikipedia: None,
        };
        assert!(compound_header(&good).unwrap().contains("Glucose"));

        let weak = CompoundIdentification {
            confidence: 0.6,
            ..good.clone()
        };
        assert!(compound_header(&weak).is_none());

        let generic = CompoundIdentification {
            name: "compound".to_string(),
            ..good
        };
        assert!(compound_header(&generic).is_none());
    }
}
