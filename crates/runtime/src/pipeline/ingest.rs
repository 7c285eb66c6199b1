//! Stage S-1: context extract and perception ingest
//!
//! Attachments go through the caching extraction seam; photos fan out to a
//! vision adapter (at most five, concurrently, one failure never failing the
//! run); chemical-looking images pass the scholastic-domain gate and the
//! identification cascade; everything else gets vision-search enrichment.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::analysis::chemistry::{
    self, categorize_description, classify_domain, ImageCategory, ScholasticDomain,
};
use crate::extraction::CachingExtractor;
use crate::fetchers::search::SearchCascade;
use crate::memory::{AttachmentRecord, MemoryMessage, MessageRole};
use crate::pipeline::types::{DocumentInput, Photo};

/// Vision-capable model seam. The runtime's text chain cannot see images;
/// transports wire in whatever vision model they have.
#[async_trait]
pub trait VisionAdapter: Send + Sync {
    async fn describe(&self, photo: &Photo) -> anyhow::Result<String>;
}

/// Default adapter for deployments without a vision model: every photo
/// fails individually and the pipeline continues without image context.
pub struct NoVision;

#[async_trait]
impl VisionAdapter for NoVision {
    async fn describe(&self, _photo: &Photo) -> anyhow::Result<String> {
        anyhow::bail!("no vision adapter configured")
    }
}

/// One analyzed photo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoInsight {
    pub description: String,
    pub category: ImageCategory,
}

/// Everything S-1 produced for the rest of the run.
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    pub attachment_text: String,
    pub attachment_records: Vec<AttachmentRecord>,
    pub photo_insights: Vec<PhotoInsight>,
    pub chemistry_header: Option<String>,
    pub photo_context: String,
    pub inferred_ticker: Option<String>,
    pub has_financial_context: bool,
}

/// Analyze up to `max_photos` photos concurrently. A failed description is
/// dropped, not fatal.
pub async fn ingest_photos(
    vision: &dyn VisionAdapter,
    photos: &[Photo],
    max_photos: usize,
) -> Vec<PhotoInsight> {
    let futures = photos.iter().take(max_photos).map(|photo| async move {
        match vision.describe(photo).await {
            Ok(description) => {
                let category = categorize_description(&description);
                Some(PhotoInsight {
                    description,
                    category,
                })
            }
            Err(err) => {
                tracing::debug!(error = %err, "photo analysis failed, skipping");
                None
            }
        }
    });
    join_all(futures).await.into_iter().flatten().collect()
}

/// The chemistry gate plus enrichment: chemical insights only survive when
/// the combined descriptions read as chemistry; survivors run the
/// identification cascade and may yield the compound header.
pub async fn enrich_chemistry(
    insights: &mut [PhotoInsight],
    search: &SearchCascade,
    client_id: &str,
) -> Option<String> {
    let chemical: Vec<&PhotoInsight> = insights
        .iter()
        .filter(|i| i.category == ImageCategory::Chemical)
        .collect();
    if chemical.is_empty() {
        return None;
    }

    let combined = chemical
        .iter()
        .map(|i| i.description.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let domain = classify_domain(&combined);
    if domain != ScholasticDomain::Chemistry {
        tracing::debug!(?domain, "chemistry gate relabeled non-chemistry imagery");
        for insight in insights.iter_mut() {
            if insight.category == ImageCategory::Chemical {
                insight.category = match domain {
                    ScholasticDomain::Finance => ImageCategory::Chart,
                    ScholasticDomain::Engineering | ScholasticDomain::PureMath => {
                        ImageCategory::Diagram
                    }
                    _ => ImageCategory::Visual,
                };
            }
        }
        return None;
    }

    let description = chemical[0].description.clone();
    let identification = chemistry::identify_compound(&description, None, search, client_id).await?;
    chemistry::compound_header(&identification)
}

/// Vision-search enrichment for non-chemistry imagery: pull 2–8 meaningful
/// terms and query the cascade.
pub async fn enrich_vision_search(
    insights: &[PhotoInsight],
    search: &SearchCascade,
    client_id: &str,
) -> String {
    let mut context = String::new();
    for insight in insights {
        if insight.category == ImageCategory::Chemical {
            continue;
        }
        let terms = chemistry::extract_search_terms(&insight.description);
        if terms.is_empty() {
            continue;
        }
        if let Some(result) = search.best_effort(&terms.join(" "), client_id).await {
            context.push_str(&format!(
                "Image context ({}):\n{}\n",
                terms.join(" "),
                result.text
            ));
        }
    }
    context
}

/// Extract all documents through the caching seam, producing the aggregate
/// prompt text and per-attachment memory records.
pub async fn ingest_documents(
    extractor: &CachingExtractor,
    documents: &[DocumentInput],
    tenant_id: &str,
    max_chars: usize,
) -> (String, Vec<AttachmentRecord>) {
    let mut aggregate = String::new();
    let mut records = Vec::new();
    for document in documents {
        match extractor
            .extract(
                &document.bytes,
                &document.file_type,
                &document.file_name,
                tenant_id,
            )
            .await
        {
            Ok(outcome) if outcome.success => {
                let text = outcome.extracted_data.text.unwrap_or_default();
                if aggregate.len() < max_chars {
                    let remaining = max_chars - aggregate.len();
                    aggregate.push_str(&format!("--- {} ---\n", document.file_name));
                    aggregate.extend(text.chars().take(remaining));
                    aggregate.push('\n');
                }
                records.push(AttachmentRecord {
                    file_name: document.file_name.clone(),
                    file_type: document.file_type.clone(),
                    text,
                    timestamp: chrono::Utc::now(),
                });
            }
            Ok(outcome) => {
                tracing::debug!(
                    file = %document.file_name,
                    cascade = ?outcome.cascade_log,
                    "extraction produced nothing"
                );
            }
            Err(err) => {
                tracing::warn!(file = %document.file_name, error = %err, "extraction failed");
            }
        }
    }
    (aggregate, records)
}

/// Summarize the conversation for routing: an inferred ticker and a
/// financial-context flag drawn from recent history.
pub fn extract_context(history: &[MemoryMessage]) -> (Option<String>, bool) {
    let mut inferred_ticker = None;
    let mut financial = false;
    for message in history.iter().rev().take(6) {
        if message.role == MessageRole::System {
            continue;
        }
        let lowered = message.content.to_lowercase();
        if lowered.contains("stock")
            || lowered.contains("ticker")
            || lowered.contains("price")
            || lowered.contains("market")
        {
            financial = true;
        }
        if inferred_ticker.is_none() {
            if let Some(candidate) = crate::routing::extract_ticker(&message.content) {
                inferred_ticker = Some(candidate.symbol);
            }
        }
    }
    (inferred_ticker, financial)
}

/// Convenience wrapper used by the orchestrator: run the whole S-1 ingest.
#[allow(clippy::too_many_arguments)]
pub async fn ingest_all(
    vision: &dyn VisionAdapter,
    extractor: &CachingExtractor,
    search: &SearchCascade,
    photos: &[Photo],
    documents: &[DocumentInput],
    history: &[MemoryMessage],
    tenant_id: &str,
    caller_id: &str,
    max_photos: usize,
    max_attachment_chars: usize,
) -> IngestResult {
    let (attachment_text, attachment_records) =
        ingest_documents(extractor, documents, tenant_id, max_attachment_chars).await;

    let mut photo_insights = ingest_photos(vision, photos, max_photos).await;
    let chemistry_header = enrich_chemistry(&mut photo_insights, search, caller_id).await;
    let photo_context = if chemistry_header.is_none() {
        enrich_vision_search(&photo_insights, search, caller_id).await
    } else {
        String::new()
    };

    let (inferred_ticker, has_financial_context) = extract_context(history);

    IngestResult {
        attachment_text,
        attachment_records,
        photo_insights,
        chemistry_header,
        photo_context,
        inferred_ticker,
        has_financial_context,
    }
}
