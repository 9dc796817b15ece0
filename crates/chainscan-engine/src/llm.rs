//! LLM assistance client
//!
//! Best-effort only. The code stage may ask for a natural-language read of
//! ambiguous evidence; synthesis may ask for a full report. The wire
//! contract is a chat-completion endpoint returning either free text or a
//! JSON object; a structured response is only used after it validates
//! against the report schema, and every failure path falls back to the
//! deterministic implementation without failing the stage.

use chainscan_cache::AnalysisCache;
use chainscan_core::config::LlmConfig;
use chainscan_core::{CancellationToken, Finding, Report};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const NAMESPACE: &str = "llm";

pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    cache: Arc<AnalysisCache>,
    cache_ttl: u64,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Either an OpenAI-style choices array or a bare content object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatResponse {
    Choices { choices: Vec<ChatChoice> },
    Bare { content: String },
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl LlmClient {
    pub fn from_config(
        config: &LlmConfig,
        cache: Arc<AnalysisCache>,
        cache_ttl: u64,
    ) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Some(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            cache,
            cache_ttl,
        })
    }

    /// Short natural-language read of ambiguous code findings.
    /// `None` on any failure; the caller keeps its pattern evidence.
    pub async fn assess_code_findings(
        &self,
        findings: &[&Finding],
        cancel: &CancellationToken,
    ) -> Option<String> {
        if cancel.is_cancelled() {
            return None;
        }
        let summary: Vec<String> = findings
            .iter()
            .take(10)
            .map(|f| format!("{} ({}): {}", f.finding_type, f.severity.as_str(), f.evidence.join("; ")))
            .collect();
        let prompt = format!(
            "Assess whether these static-analysis hits on a package are likely \
             malicious or benign. Answer in two sentences.\n{}",
            summary.join("\n")
        );
        self.complete(&prompt).await
    }

    /// Structured report synthesis. The response must validate against the
    /// report schema or it is discarded.
    pub async fn synthesize_report(
        &self,
        stage_digest: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Option<Report> {
        if cancel.is_cancelled() {
            return None;
        }
        let prompt = format!(
            "Produce a supply-chain analysis report as a JSON object matching \
             the agreed report schema exactly, from this stage data:\n{stage_digest}"
        );
        let body = self.complete(&prompt).await?;
        match parse_report(&body) {
            Some(report) => Some(report),
            None => {
                warn!("model response failed report-schema validation; using deterministic path");
                None
            }
        }
    }

    async fn complete(&self, prompt: &str) -> Option<String> {
        let cache_key = AnalysisCache::hash_key(&[&self.model, prompt]);
        if let Some((cached, _age)) = self.cache.get::<String>(NAMESPACE, &cache_key) {
            return Some(cached);
        }

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };
        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = match builder.send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "model endpoint refused request");
                return None;
            }
            Err(e) => {
                debug!("model endpoint unreachable: {e}");
                return None;
            }
        };
        let parsed: ChatResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                debug!("model response undecodable: {e}");
                return None;
            }
        };
        let content = match parsed {
            ChatResponse::Choices { choices } => choices.into_iter().next()?.message.content,
            ChatResponse::Bare { content } => content,
        };

        self.cache.put(NAMESPACE, &cache_key, &content, self.cache_ttl);
        Some(content)
    }
}

/// Strict parse: the body (or a fenced JSON block inside it) must
/// deserialise into the full report schema.
fn parse_report(body: &str) -> Option<Report> {
    if let Ok(report) = serde_json::from_str::<Report>(body) {
        return Some(report);
    }
    // models wrap JSON in fences often enough to be worth one unwrap
    let stripped = body
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str::<Report>(stripped).ok()
}
