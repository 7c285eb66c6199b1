//! The S-1..S6 state machine

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::analysis::{financial_physics, psi_ema, seed_metric};
use crate::config::PipelineConfig;
use crate::extraction::CachingExtractor;
use crate::fetchers::search::{LabeledBlock, SearchCascade};
use crate::memory::{MemoryManager, MessageRole};
use crate::metrics::UsageMetrics;
use crate::package::{DataPackage, PackageSummary, TenantPackageStore};
use crate::pipeline::audit::{run_audit, AuditContext, AuditStrictness};
use crate::pipeline::compound::{merge_sections, split_compound};
use crate::pipeline::ingest::{self, IngestResult, VisionAdapter};
use crate::pipeline::personality::{apply_personality, strip_signature};
use crate::pipeline::types::{
    AuditOutcome, PipelineRequest, PipelineResponse,
};
use crate::providers::{CompletionRequest, ProviderChain};
use crate::routing::{
    build_system_context, AttachmentMeta, ContextOptions, PreflightInput, PreflightResult,
    PreflightRouter, RoutingMode,
};
use crate::types::{
    AuditVerdict, Badge, PipelineResult, StageId, TokenUsage,
};

const NO_DATA_TEMPLATE: &str = "No market data is available for that request right now. \
     Try a different ticker symbol or a longer period.";

const PROVIDER_FALLBACK: &str = "I can't reach my reasoning providers right now, so I can't \
     produce a verified answer. Please try again in a moment.";

const IDENTITY_TEMPLATE: &str = "I'm nyan — a verification-first analysis pipeline. Every \
     answer I give passes a routing stage, a reasoning stage, and an audit stage before you \
     see it, and the badge on each response tells you how the audit went.";

/// The pipeline orchestrator. One instance serves all tenants; each `run`
/// owns its own state and data package.
pub struct Pipeline {
    config: PipelineConfig,
    chain: Arc<ProviderChain>,
    router: Arc<PreflightRouter>,
    memory: Arc<MemoryManager>,
    store: Arc<TenantPackageStore>,
    extractor: Arc<CachingExtractor>,
    search: Arc<SearchCascade>,
    vision: Arc<dyn VisionAdapter>,
    metrics: Arc<UsageMetrics>,
}

struct RunState {
    timestamp: DateTime<Utc>,
    package: DataPackage,
    usage: TokenUsage,
    search_context: String,
    did_search: bool,
    retry_count: u32,
    pass_count: u32,
    city_figures: Vec<seed_metric::CityFigures>,
    provider_failed: bool,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        chain: Arc<ProviderChain>,
        router: Arc<PreflightRouter>,
        memory: Arc<MemoryManager>,
        store: Arc<TenantPackageStore>,
        extractor: Arc<CachingExtractor>,
        search: Arc<SearchCascade>,
        vision: Arc<dyn VisionAdapter>,
        metrics: Arc<UsageMetrics>,
    ) -> Self {
        Self {
            config,
            chain,
            router,
            memory,
            store,
            extractor,
            search,
            vision,
            metrics,
        }
    }

    /// Run a request, splitting compound queries into sequential
    /// sub-pipelines. Never returns an error: internal failures surface as
    /// an `unavailable` envelope.
    pub async fn run(&self, request: PipelineRequest) -> PipelineResponse {
        if let Some(order) = &request.chain {
            self.chain.set_dynamic_chain(order.clone());
        }

        let parts = split_compound(
            &request.query,
            !request.photos.is_empty(),
            self.config.max_compound_parts,
        );

        let response = if parts.len() == 1 {
            self.run_single(&request, &request.query).await
        } else {
            self.run_compound(&request, &parts).await
        };

        match response {
            Ok(response) => {
                self.metrics.record_pipeline_run(response.success);
                response
            }
            Err(err) => {
                tracing::error!(error = %err, "pipeline run failed internally");
                self.metrics.record_pipeline_run(false);
                self.failure_envelope()
            }
        }
    }

    async fn run_compound(
        &self,
        request: &PipelineRequest,
        parts: &[String],
    ) -> PipelineResult<PipelineResponse> {
        let mut answers = Vec::with_capacity(parts.len());
        let mut badge = Badge::Verified;
        let mut confidence_sum: u32 = 0;
        let mut usage = TokenUsage::default();
        let mut did_search = false;
        let mut retry_count = 0;
        let mut pass_count = 0;
        let mut success = true;
        let mut last: Option<PipelineResponse> = None;

        for part in parts {
            let mut sub_request = request.clone();
            sub_request.query = part.clone();
            let mentions_image = {
                let lowered = part.to_lowercase();
                lowered.contains("image") || lowered.contains("photo") || lowered.contains("picture")
            };
            if !mentions_image {
                sub_request.photos = Vec::new();
            }
            let response = self.run_single(&sub_request, part).await?;

            badge = badge.worst(response.badge);
            confidence_sum += response.audit.confidence as u32;
            usage.accumulate(&response.usage);
            did_search |= response.did_search;
            retry_count += response.retry_count;
            pass_count += response.pass_count;
            success &= response.success;
            answers.push(strip_signature(&response.answer));
            last = Some(response);
        }

        let last = last.ok_or_else(|| {
            crate::types::PipelineError::Internal("compound split produced no parts".to_string())
        })?;
        let timestamp = Utc::now();
        let mut answer = merge_sections(&answers);
        answer.push_str("\n\n");
        answer.push_str(&crate::pipeline::personality::signature(timestamp));

        let mut audit = last.audit.clone();
        audit.confidence = (confidence_sum / parts.len() as u32).min(100) as u8;

        Ok(PipelineResponse {
            success,
            answer,
            mode: last.mode,
            preflight: last.preflight,
            audit,
            badge,
            did_search,
            retry_count,
            pass_count,
            data_package_id: last.data_package_id,
            data_package_summary: last.data_package_summary,
            usage,
        })
    }

    async fn run_single(
        &self,
        request: &PipelineRequest,
        query: &str,
    ) -> PipelineResult<PipelineResponse> {
        let mut state = RunState {
            timestamp: Utc::now(),
            package: DataPackage::new(&request.tenant_id),
            usage: TokenUsage::default(),
            search_context: String::new(),
            did_search: false,
            retry_count: 0,
            pass_count: 0,
            city_figures: Vec::new(),
            provider_failed: false,
        };

        // ---- S-1: context extract & perception ingest
        let ingested = ingest::ingest_all(
            self.vision.as_ref(),
            &self.extractor,
            &self.search,
            &request.photos,
            &request.documents,
            &request.history,
            &request.tenant_id,
            &request.caller_id,
            self.config.max_photos,
            self.config.max_attachment_prompt_chars,
        )
        .await;

        let mut first_query = true;
        if let Some(session) = &request.session_id {
            first_query = self.memory.mark_booted(session);
            let attachment = ingested.attachment_records.first().cloned();
            self.memory
                .add_message(session, MessageRole::User, query, attachment);
            if self.memory.should_summarize(session) {
                self.memory.generate_summary(session).await;
            }
        }

        state.package.write_stage(
            StageId::ContextExtract,
            json!({
                "query": query,
                "attachment_count": ingested.attachment_records.len(),
                "photo_count": ingested.photo_insights.len(),
                "photo_categories": ingested
                    .photo_insights
                    .iter()
                    .map(|i| serde_json::to_value(i.category).unwrap_or_default())
                    .collect::<Vec<_>>(),
                "chemistry_header": ingested.chemistry_header.is_some(),
                "inferred_ticker": ingested.inferred_ticker,
                "financial_context": ingested.has_financial_context,
                "first_query": first_query,
            }),
        )?;

        // ---- S0: preflight
        let mut preflight = match &request.pre_computed_preflight {
            Some(precomputed) => precomputed.clone(),
            None => {
                let input = PreflightInput {
                    query: query.to_string(),
                    attachments: request
                        .documents
                        .iter()
                        .map(|d| AttachmentMeta {
                            file_name: d.file_name.clone(),
                            file_type: d.file_type.clone(),
                        })
                        .collect(),
                    doc_context: Default::default(),
                    inferred_ticker: ingested.inferred_ticker.clone(),
                    caller_id: request.caller_id.clone(),
                };
                self.router.route(&input).await
            }
        };

        self.stage_search(&mut state, &mut preflight, query, &request.caller_id)
            .await;

        state.package.write_stage(
            StageId::Preflight,
            json!({
                "mode": preflight.mode.as_str(),
                "ticker": preflight.ticker,
                "tickerVerified": preflight.ticker_verified,
                "searchStrategy": serde_json::to_value(preflight.search_strategy).unwrap_or_default(),
                "didSearch": state.did_search,
                "flags": serde_json::to_value(preflight.routing_flags).unwrap_or_default(),
                "error": preflight.error,
            }),
        )?;

        // fast path: indicator mode without a resolvable ticker
        if preflight.mode == RoutingMode::PsiEma && preflight.ticker.is_none() {
            let audit = AuditOutcome::bypass();
            return self.finish(request, state, preflight, ingested, NO_DATA_TEMPLATE, audit, true);
        }

        // ---- S1: context build
        let options = ContextOptions {
            is_first_query: first_query,
            base_protocol: request.base_protocol.clone(),
            compressed_protocol: request.compressed_protocol.clone(),
        };
        let system_messages = build_system_context(&preflight, &options);
        state.package.write_stage(
            StageId::ContextBuild,
            json!({
                "temporal_timestamp": state.timestamp.to_rfc3339(),
                "nyan_mode": if first_query { "full" } else { "compressed" },
                "system_message_count": system_messages.len(),
            }),
        )?;
        let system_prompt = system_messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let memory_prefix = request
            .session_id
            .as_deref()
            .and_then(|session| self.memory.build_memory_prompt(session, query));

        // ---- S2/S3 with the single bounded loop-back through S4
        let mut draft;
        let mut direct;
        let mut audit;
        loop {
            state.pass_count += 1;

            // S2: reasoning
            match self
                .stage_reasoning(
                    request,
                    query,
                    &preflight,
                    &ingested,
                    &state.search_context,
                    &state.city_figures,
                    memory_prefix.as_deref(),
                    &system_prompt,
                    &mut state.usage,
                )
                .await
            {
                Ok((text, was_direct)) => {
                    draft = text;
                    direct = was_direct;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "reasoning stage exhausted providers");
                    state.provider_failed = true;
                    state.package.write_stage(
                        StageId::Reasoning,
                        json!({"error": err.to_string()}),
                    )?;
                    return self.finish(
                        request,
                        state,
                        preflight,
                        ingested,
                        PROVIDER_FALLBACK,
                        AuditOutcome::api_failure(),
                        false,
                    );
                }
            }
            state.package.write_stage(
                StageId::Reasoning,
                json!({
                    "draft_length": draft.len(),
                    "direct_output": direct,
                    "pass": state.pass_count,
                }),
            )?;

            // S3: audit
            let (outcome, audit_usage) = self
                .stage_audit(request, query, &preflight, &ingested, &state, &draft, direct)
                .await;
            audit = outcome;
            state.usage.accumulate(&audit_usage);
            if let Some(extra) = self
                .seed_metric_format_pass(&preflight, &state, &draft, &mut audit)
                .await
            {
                state.usage.accumulate(&extra);
            }
            state.package.write_stage(
                StageId::Audit,
                json!({
                    "verdict": audit.verdict.to_string(),
                    "confidence": audit.confidence,
                    "strictness": if self.is_strict(request) { "STRICT" } else { "RESEARCH" },
                    "has_fixed_answer": audit.fixed_answer.is_some(),
                    "pass": state.pass_count,
                }),
            )?;

            // S4: retry, at most once, never for the skip-list modes or
            // image-bearing requests
            let retry_allowed = audit.verdict == AuditVerdict::Rejected
                && state.retry_count < self.config.max_retries
                && !preflight.mode.skips_retry()
                && request.photos.is_empty();
            if !retry_allowed {
                break;
            }

            let refined = self.core_question(query, &mut state.usage).await;
            match self.search.best_effort(&refined, &request.caller_id).await {
                Some(result) => {
                    state.did_search = true;
                    state.search_context = result.text;
                    state.retry_count += 1;
                    state.package.write_stage(
                        StageId::Retry,
                        json!({"refined_query": refined, "found": true}),
                    )?;
                }
                None => {
                    state.package.write_stage(
                        StageId::Retry,
                        json!({"refined_query": refined, "found": false}),
                    )?;
                    break;
                }
            }
        }

        let body = audit.fixed_answer.clone().unwrap_or(draft);
        let success = audit.verdict != AuditVerdict::ApiFailure;
        self.finish(request, state, preflight, ingested, &body, audit, success)
    }

    /// Execute pending searches decided by preflight (seed-metric fan-out or
    /// realtime lookup). Seed-metric degrades to general when nothing comes
    /// back.
    async fn stage_search(
        &self,
        state: &mut RunState,
        preflight: &mut PreflightResult,
        query: &str,
        caller_id: &str,
    ) {
        if preflight.mode == RoutingMode::SeedMetric {
            let blocks = self
                .search
                .fan_out(&preflight.pending_search_queries, caller_id)
                .await;
            state.did_search = !blocks.is_empty();
            state.city_figures = parse_city_figures(&preflight.cities, &blocks, &preflight.decade);
            state.search_context = blocks
                .iter()
                .map(|b| format!("[{}]\n{}", b.label, b.text))
                .collect::<Vec<_>>()
                .join("\n\n");
            if blocks.is_empty() {
                tracing::debug!("seed-metric search returned nothing, degrading to general");
                preflight.mode = RoutingMode::General;
            }
            return;
        }
        if preflight.routing_flags.needs_realtime_search {
            if let Some(result) = self.search.best_effort(query, caller_id).await {
                state.did_search = true;
                state.search_context = result.text;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_reasoning(
        &self,
        request: &PipelineRequest,
        query: &str,
        preflight: &PreflightResult,
        ingested: &IngestResult,
        search_context: &str,
        city_figures: &[seed_metric::CityFigures],
        memory_prefix: Option<&str>,
        system_prompt: &str,
        usage: &mut TokenUsage,
    ) -> Result<(String, bool), crate::types::ProviderError> {
        // direct-output short-circuits: no LLM call at all
        match preflight.mode {
            RoutingMode::Identity => return Ok((IDENTITY_TEMPLATE.to_string(), true)),
            RoutingMode::PsiEmaIdentity => {
                return Ok((psi_ema::CANONICAL_DOC.to_string(), true))
            }
            RoutingMode::PsiEma => {
                if let (Some(analysis), Some(ticker)) =
                    (&preflight.indicator_analysis, &preflight.ticker)
                {
                    let data = preflight.market_data.as_ref();
                    let report = psi_ema::render_report(
                        ticker,
                        data.and_then(|d| d.name.as_deref()),
                        data.and_then(|d| d.currency.as_deref()),
                        analysis,
                        preflight.weekly_analysis.as_ref(),
                        preflight.custom_period.as_deref(),
                    );
                    return Ok((report, true));
                }
            }
            RoutingMode::SeedMetric => {
                let complete = !city_figures.is_empty()
                    && city_figures
                        .iter()
                        .all(|c| c.price_per_sqm.is_some() && c.annual_income.is_some());
                if complete {
                    return Ok((seed_metric::render_table(city_figures), true));
                }
            }
            _ => {}
        }

        let mut prompt = String::new();
        if let Some(prefix) = memory_prefix {
            prompt.push_str(prefix);
            prompt.push('\n');
        }
        if !ingested.attachment_text.is_empty() {
            prompt.push_str("PRIMARY SOURCE DOCUMENTS:\n");
            prompt.push_str(&ingested.attachment_text);
            prompt.push('\n');
        }
        if preflight.routing_flags.uses_financial_physics && !ingested.attachment_text.is_empty() {
            let rows = financial_physics::rows_from_text(&ingested.attachment_text);
            if !rows.is_empty() {
                let report = financial_physics::classify_document(&ingested.attachment_text, &rows);
                if let Ok(rendered) = serde_json::to_string_pretty(&report) {
                    prompt.push_str("FINANCIAL CLASSIFICATION (precomputed):\n");
                    prompt.push_str(&rendered);
                    prompt.push('\n');
                }
            }
        }
        if !ingested.photo_context.is_empty() || !ingested.photo_insights.is_empty() {
            prompt.push_str("IMAGE ANALYSIS:\n");
            for insight in &ingested.photo_insights {
                prompt.push_str(&insight.description);
                prompt.push('\n');
            }
            prompt.push_str(&ingested.photo_context);
            prompt.push('\n');
        }
        if !search_context.is_empty() {
            prompt.push_str("SEARCH CONTEXT (secondary source):\n");
            prompt.push_str(search_context);
            prompt.push('\n');
        }
        prompt.push_str("QUESTION:\n");
        prompt.push_str(query);

        match preflight.mode {
            RoutingMode::PsiEma => {
                prompt.push_str(
                    "\n\nReport the indicator dimensions θ, z, and R for this ticker using \
                     only the provided market context.",
                );
            }
            RoutingMode::SeedMetric => {
                prompt.push_str(
                    "\n\nAnswer with the affordability table (City, Price/m², Annual income, \
                     Years for 700 m², Regime). If a figure is missing, reply for that city \
                     with `LAND:<number> INCOME:<number>` estimates drawn from the search \
                     context.",
                );
            }
            RoutingMode::CodeAudit => {
                prompt.push_str("\n\nThis is a code audit. Review correctness, safety, style.");
            }
            _ => {}
        }

        let completion = CompletionRequest {
            prompt,
            system: Some(system_prompt.to_string()),
            model: None,
            temperature: request
                .temperature
                .unwrap_or(self.config.reasoning_temperature),
            max_tokens: self.config.reasoning_max_tokens,
        };
        let response = self
            .chain
            .call_with_retry(&completion, request.provider)
            .await?;
        usage.accumulate(&response.usage);
        Ok((response.text, false))
    }

    async fn stage_audit(
        &self,
        request: &PipelineRequest,
        query: &str,
        preflight: &PreflightResult,
        ingested: &IngestResult,
        state: &RunState,
        draft: &str,
        direct: bool,
    ) -> (AuditOutcome, TokenUsage) {
        if direct || preflight.mode == RoutingMode::Identity {
            return (AuditOutcome::bypass(), TokenUsage::default());
        }

        let mut thesis = String::new();
        if !state.search_context.is_empty() {
            thesis.push_str(&state.search_context);
            thesis.push('\n');
        }
        if let Some(stock) = &preflight.stock_context {
            thesis.push_str(stock);
            thesis.push('\n');
        }
        if let Some(forex) = &preflight.forex_context {
            thesis.push_str(forex);
            thesis.push('\n');
        }
        if !ingested.attachment_text.is_empty() {
            let snippet: String = ingested.attachment_text.chars().take(4_000).collect();
            thesis.push_str(&snippet);
        }

        let strictness = if self.is_strict(request) {
            AuditStrictness::Strict
        } else {
            AuditStrictness::Research
        };
        run_audit(
            &self.chain,
            request.provider,
            AuditContext {
                thesis: &thesis,
                antithesis: query,
                synthesis: draft,
            },
            strictness,
        )
        .await
    }

    fn is_strict(&self, request: &PipelineRequest) -> bool {
        !request.documents.is_empty() || !request.photos.is_empty()
    }

    /// Seed-metric format validator: one reformat call, then the
    /// deterministic fallback from parsed search data.
    async fn seed_metric_format_pass(
        &self,
        preflight: &PreflightResult,
        state: &RunState,
        draft: &str,
        audit: &mut AuditOutcome,
    ) -> Option<TokenUsage> {
        if preflight.mode != RoutingMode::SeedMetric {
            return None;
        }
        let current = audit.fixed_answer.as_deref().unwrap_or(draft);
        if seed_metric::table_matches(current) {
            return None;
        }

        let request = CompletionRequest::new(format!(
            "Reformat this answer into a Markdown table with exactly the columns \
             | City | Price/m² | Annual income | Years for 700 m² | Regime | and no prose \
             before the table:\n\n{current}"
        ))
        .with_temperature(0.1)
        .with_max_tokens(600);

        match self.chain.call(&request, None).await {
            Ok(response) if seed_metric::table_matches(&response.text) => {
                let usage = response.usage;
                audit.fixed_answer = Some(response.text);
                Some(usage)
            }
            _ => {
                if !state.city_figures.is_empty() {
                    audit.fixed_answer = Some(seed_metric::render_table(&state.city_figures));
                } else if let Some(city) = preflight.cities.first() {
                    let failure = crate::types::SeedMetricParseFailure {
                        city: city.clone(),
                        reason: "no parsable figures in the search payload".to_string(),
                    };
                    tracing::warn!(error = %failure, "deterministic table fallback unavailable");
                }
                None
            }
        }
    }

    /// LLM-assisted core-question extraction for the S4 retry search.
    async fn core_question(&self, query: &str, usage: &mut TokenUsage) -> String {
        let request = CompletionRequest::new(format!(
            "Extract the single core factual question from this text as one short \
             search query, with no preamble:\n\n{query}"
        ))
        .with_temperature(0.1)
        .with_max_tokens(60);
        match self.chain.call(&request, None).await {
            Ok(response) => {
                usage.accumulate(&response.usage);
                let refined = response.text.trim().trim_matches('"').to_string();
                if refined.is_empty() {
                    query.to_string()
                } else {
                    refined
                }
            }
            Err(_) => query.to_string(),
        }
    }

    /// S5 + S6: personality, finalize, store, respond.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request: &PipelineRequest,
        mut state: RunState,
        preflight: PreflightResult,
        ingested: IngestResult,
        body: &str,
        audit: AuditOutcome,
        success: bool,
    ) -> PipelineResult<PipelineResponse> {
        let answer = apply_personality(
            body,
            preflight.mode,
            ingested.chemistry_header.as_deref(),
            state.timestamp,
        );

        state
            .package
            .write_stage(StageId::Personality, json!({"length": answer.len()}))?;

        let badge = if state.provider_failed {
            Badge::Unavailable
        } else {
            Badge::from_verdict(audit.verdict)
        };
        state.package.write_stage(
            StageId::Output,
            json!({
                "badge": badge.to_string(),
                "output_length": answer.len(),
            }),
        )?;

        state.package.finalize();
        self.store.store_package(&request.tenant_id, &state.package);

        if let Some(session) = &request.session_id {
            self.memory
                .add_message(session, MessageRole::Assistant, &answer, None);
        }

        let summary = state.package.compressed_summary();
        Ok(PipelineResponse {
            success,
            answer,
            mode: preflight.mode,
            audit,
            badge,
            did_search: state.did_search,
            retry_count: state.retry_count,
            pass_count: state.pass_count.max(1),
            data_package_id: state.package.id(),
            data_package_summary: summary,
            usage: state.usage,
            preflight,
        })
    }

    fn failure_envelope(&self) -> PipelineResponse {
        let timestamp = Utc::now();
        let answer = apply_personality(PROVIDER_FALLBACK, RoutingMode::General, None, timestamp);
        PipelineResponse {
            success: false,
            answer,
            mode: RoutingMode::General,
            preflight: PreflightResult::default(),
            audit: AuditOutcome::api_failure(),
            badge: Badge::Unavailable,
            did_search: false,
            retry_count: 0,
            pass_count: 0,
            data_package_id: crate::types::PackageId::new(),
            data_package_summary: PackageSummary {
                short_id: "--------".to_string(),
                current_stage: None,
                ts_time: timestamp.format("%H:%M:%S").to_string(),
                ticker: None,
                mode: None,
                audit_pass: None,
            },
            usage: TokenUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::market::testing::StaticMarket;
    use crate::fetchers::search::testing::ScriptedSearch;
    use crate::testkit;

    fn request(query: &str) -> PipelineRequest {
        PipelineRequest {
            query: query.to_string(),
            tenant_id: "tenant-test".to_string(),
            session_id: Some("s1".to_string()),
            caller_id: "caller".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn general_query_produces_a_finalized_package() {
        let fixture = testkit::pipeline_fixture("Paris is the capital of France.");
        let response = fixture.pipeline.run(request("hello")).await;

        assert!(response.success);
        assert_eq!(response.mode, RoutingMode::General);
        assert_eq!(response.badge, Badge::Verified);
        assert!(response.answer.contains("🔥 ~nyan ["));
        assert_eq!(response.pass_count, 1);
        assert_eq!(response.retry_count, 0);

        // invariant: the returned id is a finalized package in the store
        assert!(fixture
            .store
            .contains_package("tenant-test", response.data_package_id));
        let stored = fixture.store.get_recent_packages("tenant-test", 1);
        assert!(stored[0].is_finalized());

        // stages S-1, S0, S1, S2, S3, S5, S6 written; S4 never ran
        for stage in [
            StageId::ContextExtract,
            StageId::Preflight,
            StageId::ContextBuild,
            StageId::Reasoning,
            StageId::Audit,
            StageId::Personality,
            StageId::Output,
        ] {
            assert!(stored[0].read_stage(stage).is_some(), "missing {stage}");
        }
        assert!(stored[0].read_stage(StageId::Retry).is_none());

        // invariant: S6 records the exact output length
        let s6 = stored[0].read_stage(StageId::Output).unwrap();
        assert_eq!(
            s6["output_length"].as_u64().unwrap() as usize,
            response.answer.len()
        );
    }

    #[tokio::test]
    async fn verified_ticker_renders_the_clinical_report() {
        let fixture = testkit::pipeline_fixture_with(
            "unused",
            StaticMarket::with_daily_bars("NVDA", 120),
            ScriptedSearch::default(),
        );
        let response = fixture.pipeline.run(request("analyze $NVDA trend")).await;

        assert!(response.success);
        assert_eq!(response.mode, RoutingMode::PsiEma);
        assert_eq!(response.audit.verdict, AuditVerdict::Bypass);
        assert_eq!(response.badge, Badge::Verified);
        assert!(response.answer.contains("θ"));
        assert!(response.answer.contains("z (anomaly)"));
        assert!(response.answer.contains("R (convergence)"));
    }

    #[tokio::test]
    async fn empty_chain_degrades_to_unavailable() {
        let fixture = testkit::pipeline_fixture_no_providers();
        let response = fixture.pipeline.run(request("what is the answer?")).await;

        assert!(!response.success);
        assert_eq!(response.badge, Badge::Unavailable);
        assert_eq!(response.audit.verdict, AuditVerdict::ApiFailure);
        assert!(response.answer.contains("🔥 ~nyan ["));
        // the failed run still finalized and stored its package
        assert!(fixture
            .store
            .contains_package("tenant-test", response.data_package_id));
    }

    #[tokio::test]
    async fn compound_query_merges_numbered_sections() {
        let fixture = testkit::pipeline_fixture_with(
            "Section answer.",
            StaticMarket::with_daily_bars("SPY", 120),
            ScriptedSearch::default(),
        );
        let response = fixture
            .pipeline
            .run(request("$SPY trend? also what is the capital of France?"))
            .await;

        assert!(response.answer.contains("1. "));
        assert!(response.answer.contains("2. "));
        assert_eq!(response.pass_count, 2);
        // exactly one signature after the merge
        assert_eq!(response.answer.matches("🔥 ~nyan [").count(), 1);
        assert_eq!(response.badge, Badge::Verified);
    }

    #[tokio::test]
    async fn precomputed_preflight_is_not_rerouted() {
        let fixture = testkit::pipeline_fixture("ignored");
        let mut preflight = PreflightResult::default();
        preflight.mode = RoutingMode::PsiEma; // no ticker: fast path

        let mut req = request("this text would never route to psi-ema");
        req.pre_computed_preflight = Some(preflight);
        let response = fixture.pipeline.run(req).await;

        assert_eq!(response.mode, RoutingMode::PsiEma);
        assert_eq!(response.audit.verdict, AuditVerdict::Bypass);
        assert!(response.answer.contains("No market data is available"));
    }

    #[tokio::test]
    async fn seed_metric_renders_the_table_from_search() {
        let fixture = testkit::pipeline_fixture_with(
            "unused",
            StaticMarket::unavailable(),
            ScriptedSearch::with_brave(vec![
                ("jakarta current residential land price", "around $2,000 per square meter"),
                ("jakarta current median annual household income", "roughly $10,000 per year"),
                ("jakarta historical", "older figures around $300"),
            ]),
        );
        let response = fixture
            .pipeline
            .run(request("how affordable is jakarta housing?"))
            .await;

        assert!(response.success);
        assert_eq!(response.mode, RoutingMode::SeedMetric);
        assert!(response.did_search);
        assert!(response.answer.contains("| Jakarta |"));
        assert!(response.answer.contains("FATALISM"));
        assert_eq!(response.audit.verdict, AuditVerdict::Bypass);
    }

    #[tokio::test]
    async fn search_miss_degrades_seed_metric_to_general() {
        let fixture = testkit::pipeline_fixture("A general answer instead.");
        let response = fixture
            .pipeline
            .run(request("how affordable is jakarta housing?"))
            .await;

        assert!(response.success);
        assert_eq!(response.mode, RoutingMode::General);
        assert!(!response.did_search);
        assert!(response.answer.contains("A general answer instead."));
    }

    #[tokio::test]
    async fn tenants_accumulate_at_most_eight_packages() {
        let fixture = testkit::pipeline_fixture("ok");
        for _ in 0..9 {
            fixture.pipeline.run(request("hello")).await;
        }
        assert_eq!(fixture.store.package_count("tenant-test"), 8);
    }
}

/// Pair fan-out blocks back to their cities and pull current price/income
/// figures out of the snippets.
fn parse_city_figures(
    cities: &[String],
    blocks: &[LabeledBlock],
    decade: &Option<String>,
) -> Vec<seed_metric::CityFigures> {
    cities
        .iter()
        .map(|city| {
            let for_city: Vec<&LabeledBlock> = blocks
                .iter()
                .filter(|b| b.label.to_lowercase().contains(city.as_str()))
                .collect();
            let price_per_sqm = for_city
                .iter()
                .find(|b| b.label.contains("current") && b.label.contains("price"))
                .and_then(|b| seed_metric::parse_snippet_figure(&b.text));
            let annual_income = for_city
                .iter()
                .find(|b| b.label.contains("current") && b.label.contains("income"))
                .and_then(|b| seed_metric::parse_snippet_figure(&b.text));
            seed_metric::CityFigures {
                city: city.clone(),
                price_per_sqm,
                annual_income,
                decade: decade.clone(),
            }
        })
        .collect()
}
