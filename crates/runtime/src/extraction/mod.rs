//! Content-addressed document extraction cache and the extractor seam
//!
//! File parsing itself (PDF, Excel, Word, audio) lives behind the
//! [`DocumentExtractor`] trait; the runtime only owns the shared cache and
//! the caching wrapper that keys extraction work by
//! `(tenant_id, sha256(bytes))`. Identical bytes produce independent entries
//! per tenant, so no tenant ever observes another tenant's extraction.

mod cache;

pub use cache::{CacheStats, DocumentExtractionCache, ExtractionEntry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shape classification of extracted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStructure {
    Text,
    Table,
    Mixed,
    Binary,
}

/// Extracted payload pieces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedded_images: Vec<String>,
}

/// Result of one extraction attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    pub success: bool,
    pub file_type: String,
    pub file_name: String,
    pub data_structure: DataStructure,
    pub extracted_data: ExtractedData,
    pub tools_used: Vec<String>,
    pub cascade_log: Vec<String>,
    pub from_cache: bool,
}

/// Interface required of the file-parser collaborator.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(
        &self,
        bytes: &[u8],
        file_type: &str,
        file_name: &str,
        tenant_id: &str,
    ) -> anyhow::Result<ExtractionOutcome>;
}

/// Wraps an extractor with the shared cache.
///
/// On a hit the stored entry is replayed with `from_cache = true`; on a miss
/// the inner extractor runs and its text output is cached. Cache failures are
/// logged and swallowed; extraction never blocks on the cache.
pub struct CachingExtractor {
    inner: Arc<dyn DocumentExtractor>,
    cache: Arc<DocumentExtractionCache>,
}

impl CachingExtractor {
    pub fn new(inner: Arc<dyn DocumentExtractor>, cache: Arc<DocumentExtractionCache>) -> Self {
        Self { inner, cache }
    }

    pub async fn extract(
        &self,
        bytes: &[u8],
        file_type: &str,
        file_name: &str,
        tenant_id: &str,
    ) -> anyhow::Result<ExtractionOutcome> {
        let hash = DocumentExtractionCache::content_hash(bytes);

        if let Some(entry) = self.cache.get(tenant_id, &hash) {
            tracing::debug!(file = file_name, tenant = tenant_id, "extraction cache hit");
            return Ok(ExtractionOutcome {
                success: true,
                file_type: entry.file_type.clone(),
                file_name: entry.file_name.clone(),
                data_structure: DataStructure::Text,
                extracted_data: ExtractedData {
                    text: Some(entry.text),
                    ..Default::default()
                },
                tools_used: entry.tools_used,
                cascade_log: vec!["cache".to_string()],
                from_cache: true,
            });
        }

        let outcome = self
            .inner
            .extract(bytes, file_type, file_name, tenant_id)
            .await?;

        if outcome.success {
            if let Some(text) = &outcome.extracted_data.text {
                self.cache.set(
                    tenant_id,
                    &hash,
                    ExtractionEntry {
                        text: text.clone(),
                        file_name: outcome.file_name.clone(),
                        file_type: outcome.file_type.clone(),
                        tools_used: outcome.tools_used.clone(),
                    },
                );
            }
        }

        Ok(outcome)
    }
}

/// Extractor used when no parser collaborator is wired in: treats bytes as
/// UTF-8 text and refuses anything that does not decode.
pub struct PlainTextExtractor;

#[async_trait]
impl DocumentExtractor for PlainTextExtractor {
    async fn extract(
        &self,
        bytes: &[u8],
        file_type: &str,
        file_name: &str,
        _tenant_id: &str,
    ) -> anyhow::Result<ExtractionOutcome> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(ExtractionOutcome {
                success: true,
                file_type: file_type.to_string(),
                file_name: file_name.to_string(),
                data_structure: DataStructure::Text,
                extracted_data: ExtractedData {
                    text: Some(text.to_string()),
                    ..Default::default()
                },
                tools_used: vec!["plaintext".to_string()],
                cascade_log: vec!["plaintext: utf-8 decode".to_string()],
                from_cache: false,
            }),
            Err(_) => Ok(ExtractionOutcome {
                success: false,
                file_type: file_type.to_string(),
                file_name: file_name.to_string(),
                data_structure: DataStructure::Binary,
                extracted_data: ExtractedData::default(),
                tools_used: vec!["plaintext".to_string()],
                cascade_log: vec!["plaintext: not valid utf-8".to_string()],
                from_cache: false,
            }),
        }
    }
}
