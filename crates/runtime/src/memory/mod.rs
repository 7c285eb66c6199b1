//! Per-session rolling memory with φ-compressed summaries
//!
//! Each session keeps a bounded window of recent messages and attachment
//! extracts. Every second user query the window is digested into a short
//! summary via the provider chain; the raw window is then trimmed so prompts
//! stay small while continuity survives. Summarization failures are silent:
//! the previous summary is simply retained.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::MemoryConfig;
use crate::providers::{CompletionRequest, ProviderChain};

/// Phrases that open the attachment side door: when one of these occurs in a
/// query, the most relevant stored attachment is pulled into the context.
const SIDE_DOOR_PHRASES: [&str; 25] = [
    "the document",
    "the file",
    "the pdf",
    "the spreadsheet",
    "the image",
    "the photo",
    "the picture",
    "the attachment",
    "the upload",
    "that file",
    "that document",
    "that pdf",
    "that image",
    "that photo",
    "that attachment",
    "this file",
    "this document",
    "this image",
    "uploaded",
    "attached",
    "the excel",
    "the doc",
    "my file",
    "my document",
    "earlier file",
];

/// Message roles tracked in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub file_name: String,
    pub file_type: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionState {
    messages: VecDeque<MemoryMessage>,
    attachments: VecDeque<AttachmentRecord>,
    query_count: u64,
    current_summary: Option<String>,
    nyan_booted: bool,
    last_activity: DateTime<Utc>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            attachments: VecDeque::new(),
            query_count: 0,
            current_summary: None,
            nyan_booted: false,
            last_activity: Utc::now(),
        }
    }
}

/// Context slice returned for prompt assembly.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    pub memory_summary: Option<String>,
    pub recent_messages: Vec<MemoryMessage>,
    pub attachment_context: Option<String>,
    pub has_memory: bool,
}

/// Serializable session snapshot. Attachment text is bounded on export by
/// design ("export-bounded identity").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryExport {
    pub messages: Vec<MemoryMessage>,
    pub attachments: Vec<AttachmentRecord>,
    pub query_count: u64,
    pub current_summary: Option<String>,
    pub nyan_booted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub sessions: usize,
}

/// Session memory registry, bounded at 500 sessions with LRU eviction.
pub struct MemoryManager {
    sessions: DashMap<String, SessionState>,
    chain: Arc<ProviderChain>,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(chain: Arc<ProviderChain>, config: MemoryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            chain,
            config,
        }
    }

    /// Append a message (and optionally an attachment extract) to the
    /// session window, truncating content and evicting beyond the bounds.
    pub fn add_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        attachment: Option<AttachmentRecord>,
    ) {
        self.ensure_capacity_for(session_id);
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionState::new);

        let content = truncate_chars(content, self.config.max_message_chars);
        session.messages.push_back(MemoryMessage {
            role,
            content,
            timestamp: Utc::now(),
        });
        while session.messages.len() > self.config.message_window {
            session.messages.pop_front();
        }

        if let Some(mut record) = attachment {
            record.text = truncate_chars(&record.text, self.config.max_attachment_chars);
            session.attachments.push_back(record);
            while session.attachments.len() > self.config.attachment_window {
                session.attachments.pop_front();
            }
        }

        session.last_activity = Utc::now();
    }

    /// Count this user query and report whether the window should be
    /// summarized now (every 2nd query with at least 2 messages present).
    pub fn should_summarize(&self, session_id: &str) -> bool {
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionState::new);
        session.query_count += 1;
        session.last_activity = Utc::now();
        session.query_count % self.config.summarize_every == 0 && session.messages.len() >= 2
    }

    /// Digest the window into `current_summary` via the provider chain.
    /// On success the raw window is trimmed to the last 4 messages and the
    /// query counter resets; on failure the previous summary is retained.
    pub async fn generate_summary(&self, session_id: &str) {
        let digest = {
            let Some(session) = self.sessions.get(session_id) else {
                return;
            };
            let mut digest = String::new();
            if let Some(previous) = &session.current_summary {
                digest.push_str("Previous summary: ");
                digest.push_str(previous);
                digest.push_str("\n\n");
            }
            for message in &session.messages {
                let role = match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::System => "system",
                };
                digest.push_str(role);
                digest.push_str(": ");
                digest.push_str(&truncate_chars(&message.content, 800));
                digest.push('\n');
            }
            if !session.attachments.is_empty() {
                digest.push_str("\nAttachments: ");
                let names: Vec<String> = session
                    .attachments
                    .iter()
                    .map(|a| format!("{} ({})", a.file_name, a.file_type))
                    .collect();
                digest.push_str(&names.join(", "));
            }
            digest
        };

        let request = CompletionRequest::new(format!(
            "Summarize this conversation in at most 5 sentences, keeping names, \
             tickers, figures, and open questions:\n\n{digest}"
        ))
        .with_temperature(0.3)
        .with_max_tokens(300);

        match self.chain.call(&request, None).await {
            Ok(response) => {
                if let Some(mut session) = self.sessions.get_mut(session_id) {
                    session.current_summary = Some(response.text.trim().to_string());
                    while session.messages.len() > 4 {
                        session.messages.pop_front();
                    }
                    session.query_count = 0;
                }
            }
            Err(err) => {
                tracing::debug!(session = session_id, error = %err, "summary generation failed, keeping previous");
            }
        }
    }

    /// Assemble the memory slice for a prompt: summary, the last 4 raw
    /// messages, and (when the query opens the side door) up to 4 000 chars
    /// of the most relevant attachment's extracted text.
    pub fn get_context_for_prompt(&self, session_id: &str, query: &str) -> MemoryContext {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return MemoryContext::default();
        };
        session.last_activity = Utc::now();

        let recent_messages: Vec<MemoryMessage> = {
            let len = session.messages.len();
            session
                .messages
                .iter()
                .skip(len.saturating_sub(4))
                .cloned()
                .collect()
        };

        let attachment_context = self
            .select_attachment(&session, query)
            .map(|a| truncate_chars(&a.text, 4_000));

        let has_memory = session.current_summary.is_some()
            || !recent_messages.is_empty()
            || attachment_context.is_some();

        MemoryContext {
            memory_summary: session.current_summary.clone(),
            recent_messages,
            attachment_context,
            has_memory,
        }
    }

    /// Render the memory context as a prompt prefix, or `None` when the
    /// session has nothing to contribute.
    pub fn build_memory_prompt(&self, session_id: &str, query: &str) -> Option<String> {
        let context = self.get_context_for_prompt(session_id, query);
        if !context.has_memory {
            return None;
        }
        let mut prompt = String::new();
        if let Some(summary) = &context.memory_summary {
            prompt.push_str("Conversation so far: ");
            prompt.push_str(summary);
            prompt.push_str("\n\n");
        }
        for message in &context.recent_messages {
            let role = match message.role {
                MessageRole::User => "User",
                MessageRole::Assistant => "Assistant",
                MessageRole::System => "System",
            };
            prompt.push_str(role);
            prompt.push_str(": ");
            prompt.push_str(&truncate_chars(&message.content, 1_000));
            prompt.push('\n');
        }
        if let Some(attachment) = &context.attachment_context {
            prompt.push_str("\nRelevant attachment content:\n");
            prompt.push_str(attachment);
            prompt.push('\n');
        }
        Some(prompt)
    }

    fn select_attachment<'a>(
        &self,
        session: &'a SessionState,
        query: &str,
    ) -> Option<&'a AttachmentRecord> {
        if session.attachments.is_empty() {
            return None;
        }
        let lowered = query.to_lowercase();
        if !SIDE_DOOR_PHRASES.iter().any(|p| lowered.contains(p)) {
            return None;
        }

        // 1. filename prefix mentioned in the query
        let by_name = session.attachments.iter().rev().find(|a| {
            let stem = a
                .file_name
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&a.file_name)
                .to_lowercase();
            !stem.is_empty() && lowered.contains(&stem)
        });
        if by_name.is_some() {
            return by_name;
        }

        // 2. kind heuristics
        let kind = if lowered.contains("pdf") {
            Some("pdf")
        } else if lowered.contains("excel") || lowered.contains("spreadsheet") {
            Some("xls")
        } else if lowered.contains("image") || lowered.contains("photo") || lowered.contains("picture")
        {
            Some("image")
        } else {
            None
        };
        if let Some(kind) = kind {
            let by_kind = session
                .attachments
                .iter()
                .rev()
                .find(|a| a.file_type.to_lowercase().contains(kind));
            if by_kind.is_some() {
                return by_kind;
            }
        }

        // 3. most recent
        session.attachments.back()
    }

    /// Flip the session's boot flag, returning true when this is the first
    /// query of the session (used for protocol compression decisions).
    pub fn mark_booted(&self, session_id: &str) -> bool {
        self.ensure_capacity_for(session_id);
        let mut session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionState::new);
        let first = !session.nyan_booted;
        session.nyan_booted = true;
        first
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn export(&self, session_id: &str) -> Option<MemoryExport> {
        let session = self.sessions.get(session_id)?;
        Some(MemoryExport {
            messages: session.messages.iter().cloned().collect(),
            attachments: session
                .attachments
                .iter()
                .map(|a| AttachmentRecord {
                    text: truncate_chars(&a.text, self.config.export_attachment_chars),
                    ..a.clone()
                })
                .collect(),
            query_count: session.query_count,
            current_summary: session.current_summary.clone(),
            nyan_booted: session.nyan_booted,
        })
    }

    pub fn import(&self, session_id: &str, export: MemoryExport) {
        self.ensure_capacity_for(session_id);
        let mut state = SessionState::new();
        state.messages = export.messages.into_iter().collect();
        state.attachments = export.attachments.into_iter().collect();
        while state.messages.len() > self.config.message_window {
            state.messages.pop_front();
        }
        while state.attachments.len() > self.config.attachment_window {
            state.attachments.pop_front();
        }
        state.query_count = export.query_count;
        state.current_summary = export.current_summary;
        state.nyan_booted = export.nyan_booted;
        self.sessions.insert(session_id.to_string(), state);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            sessions: self.sessions.len(),
        }
    }

    /// Remove sessions idle beyond the TTL.
    pub fn sweep_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.last_activity < cutoff)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.sessions.remove(&key);
        }
        count
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                manager.sweep_expired();
            }
        })
    }

    /// LRU-evict the stalest session when inserting a new one would exceed
    /// the session cap.
    fn ensure_capacity_for(&self, session_id: &str) {
        if self.sessions.contains_key(session_id)
            || self.sessions.len() < self.config.max_sessions
        {
            return;
        }
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|e| e.last_activity)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            tracing::debug!(session = %key, "evicting least recently used session");
            self.sessions.remove(&key);
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::metrics::UsageMetrics;
    use crate::providers::testing::ScriptedAdapter;
    use crate::providers::ProviderTag;

    fn manager_with_chain(text: &str) -> MemoryManager {
        let adapter = Arc::new(ScriptedAdapter::always(ProviderTag::Groq, text));
        let chain = Arc::new(ProviderChain::with_adapters(
            vec![adapter],
            ProviderConfig::default(),
            Arc::new(UsageMetrics::new()),
        ));
        MemoryManager::new(chain, MemoryConfig::default())
    }

    fn empty_chain_manager() -> MemoryManager {
        let chain = Arc::new(ProviderChain::with_adapters(
            vec![],
            ProviderConfig::default(),
            Arc::new(UsageMetrics::new()),
        ));
        MemoryManager::new(chain, MemoryConfig::default())
    }

    fn attachment(name: &str, file_type: &str, text: &str) -> AttachmentRecord {
        AttachmentRecord {
            file_name: name.to_string(),
            file_type: file_type.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn window_bounds_hold_after_many_messages() {
        let manager = empty_chain_manager();
        for i in 0..20 {
            manager.add_message(
                "s1",
                MessageRole::User,
                &format!("message {i}"),
                Some(attachment(&format!("f{i}.txt"), "txt", "text")),
            );
        }
        let context = manager.get_context_for_prompt("s1", "uploaded the file f19");
        assert_eq!(context.recent_messages.len(), 4);
        let export = manager.export("s1").unwrap();
        assert_eq!(export.messages.len(), 8);
        assert_eq!(export.attachments.len(), 8);
    }

    #[test]
    fn should_summarize_every_second_query_with_two_messages() {
        let manager = empty_chain_manager();
        manager.add_message("s1", MessageRole::User, "one", None);
        assert!(!manager.should_summarize("s1")); // query 1
        manager.add_message("s1", MessageRole::Assistant, "two", None);
        assert!(manager.should_summarize("s1")); // query 2, 2 messages
    }

    #[test]
    fn should_summarize_requires_two_messages() {
        let manager = empty_chain_manager();
        manager.add_message("s1", MessageRole::User, "only one", None);
        assert!(!manager.should_summarize("s1"));
        assert!(!manager.should_summarize("s1")); // 2nd query but 1 message
    }

    #[tokio::test]
    async fn generate_summary_trims_window_and_resets_counter() {
        let manager = manager_with_chain("A compact summary.");
        for i in 0..8 {
            manager.add_message("s1", MessageRole::User, &format!("m{i}"), None);
        }
        manager.should_summarize("s1");
        manager.should_summarize("s1");
        manager.generate_summary("s1").await;

        let context = manager.get_context_for_prompt("s1", "anything");
        assert_eq!(context.memory_summary.as_deref(), Some("A compact summary."));
        let export = manager.export("s1").unwrap();
        assert_eq!(export.messages.len(), 4);
        assert_eq!(export.query_count, 0);
    }

    #[tokio::test]
    async fn failed_summary_keeps_previous_one() {
        let manager = empty_chain_manager();
        manager.add_message("s1", MessageRole::User, "hello", None);
        manager.add_message("s1", MessageRole::Assistant, "hi", None);
        // seed a summary through import
        let mut export = manager.export("s1").unwrap();
        export.current_summary = Some("old summary".to_string());
        manager.import("s1", export);

        manager.generate_summary("s1").await; // chain is empty, call fails

        let context = manager.get_context_for_prompt("s1", "q");
        assert_eq!(context.memory_summary.as_deref(), Some("old summary"));
    }

    #[test]
    fn side_door_selects_by_filename_then_kind_then_recency() {
        let manager = empty_chain_manager();
        manager.add_message(
            "s1",
            MessageRole::User,
            "here",
            Some(attachment("report.pdf", "pdf", "pdf text")),
        );
        manager.add_message(
            "s1",
            MessageRole::User,
            "and here",
            Some(attachment("budget.xlsx", "xls", "excel text")),
        );

        let by_name = manager.get_context_for_prompt("s1", "what does the document report say");
        assert_eq!(by_name.attachment_context.as_deref(), Some("pdf text"));

        let by_kind = manager.get_context_for_prompt("s1", "summarize the pdf please, uploaded earlier");
        assert_eq!(by_kind.attachment_context.as_deref(), Some("pdf text"));

        let by_recency = manager.get_context_for_prompt("s1", "what's in the attachment");
        assert_eq!(by_recency.attachment_context.as_deref(), Some("excel text"));

        let no_side_door = manager.get_context_for_prompt("s1", "what is 2+2");
        assert!(no_side_door.attachment_context.is_none());
    }

    #[test]
    fn export_bounds_attachment_text() {
        let manager = empty_chain_manager();
        let long_text = "x".repeat(10_000);
        manager.add_message(
            "s1",
            MessageRole::User,
            "doc",
            Some(attachment("big.txt", "txt", &long_text)),
        );
        let export = manager.export("s1").unwrap();
        assert_eq!(export.attachments[0].text.len(), 2_000);

        // import(export()) is identity apart from the attachment bound
        manager.import("s2", export.clone());
        let re_export = manager.export("s2").unwrap();
        assert_eq!(
            serde_json::to_value(&export).unwrap(),
            serde_json::to_value(&re_export).unwrap()
        );
    }

    #[test]
    fn mark_booted_reports_first_query_once() {
        let manager = empty_chain_manager();
        assert!(manager.mark_booted("s1"));
        assert!(!manager.mark_booted("s1"));
    }

    #[test]
    fn session_cap_evicts_lru() {
        let chain = Arc::new(ProviderChain::with_adapters(
            vec![],
            ProviderConfig::default(),
            Arc::new(UsageMetrics::new()),
        ));
        let manager = MemoryManager::new(
            chain,
            MemoryConfig {
                max_sessions: 3,
                ..Default::default()
            },
        );
        manager.add_message("a", MessageRole::User, "1", None);
        manager.add_message("b", MessageRole::User, "1", None);
        manager.add_message("c", MessageRole::User, "1", None);
        // refresh "a" so "b" is stalest
        manager.get_context_for_prompt("a", "q");
        manager.add_message("d", MessageRole::User, "1", None);

        assert_eq!(manager.session_count(), 3);
        assert!(manager.export("b").is_none());
        assert!(manager.export("a").is_some());
    }

    #[test]
    fn clear_removes_session() {
        let manager = empty_chain_manager();
        manager.add_message("s1", MessageRole::User, "hello", None);
        manager.clear("s1");
        assert!(manager.export("s1").is_none());
    }
}
