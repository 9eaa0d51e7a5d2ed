use std::{sync::Arc, time::Duration};

use common::{LlmSettings, SopAnswer};
use futures::future::BoxFuture;
use reqwest::Client;
use search_core::FusedChunk;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound on the context handed to the language model, in characters.
pub const MAX_CONTEXT_CHARS: usize = 12_000;

const SYSTEM_PROMPT: &str = "You are a senior troubleshooting assistant for data platforms \
(Spark, Flink, Kafka, Hadoop, Hive). Answer strictly from the retrieved context and do not \
invent facts. If the context is insufficient, say what is missing and how to obtain it. \
Reply with a single JSON object and no markdown code fences.";

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("llm request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llm returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response has no message content")]
    MissingContent,
    #[error("llm content is not a valid SOP object: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Produces the structured SOP for a question from its fused sources.
pub trait AnswerGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate<'a>(
        &'a self,
        question: &'a str,
        sources: &'a [FusedChunk],
    ) -> BoxFuture<'a, Result<SopAnswer, GenerationError>>;
}

/// Picks the chat-completion generator when an API key is configured, the extractive one
/// otherwise.
pub fn generator_from_settings(
    settings: &LlmSettings,
) -> Result<Arc<dyn AnswerGenerator>, GenerationError> {
    match settings.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(_) => {
            info!(model = %settings.model, api_base = %settings.api_base, "using chat completion answer generator");
            Ok(Arc::new(ChatCompletionGenerator::new(settings)?))
        }
        None => {
            info!("no llm api key configured, using extractive answer generator");
            Ok(Arc::new(ExtractiveGenerator))
        }
    }
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionGenerator {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl ChatCompletionGenerator {
    pub fn new(settings: &LlmSettings) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.api_base.trim_end_matches('/')),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }

    async fn complete(&self, question: &str, sources: &[FusedChunk]) -> Result<SopAnswer, GenerationError> {
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt(question, &format_context(sources, MAX_CONTEXT_CHARS)) },
            ],
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }
        let completion = response.json::<ChatCompletion>().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(GenerationError::MissingContent)?;
        debug!(chars = content.len(), "llm completion received");
        parse_sop(&content)
    }
}

impl AnswerGenerator for ChatCompletionGenerator {
    fn name(&self) -> &'static str {
        "chat-completion"
    }

    fn generate<'a>(
        &'a self,
        question: &'a str,
        sources: &'a [FusedChunk],
    ) -> BoxFuture<'a, Result<SopAnswer, GenerationError>> {
        Box::pin(self.complete(question, sources))
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Offline generator that lays the retrieved passages out as an SOP skeleton.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveGenerator;

impl ExtractiveGenerator {
    pub fn answer(question: &str, sources: &[FusedChunk]) -> SopAnswer {
        if sources.is_empty() {
            return SopAnswer {
                summary: format!(
                    "No retrieved passages match \"{question}\". Widen the component or tag filters, or rephrase the question."
                ),
                when_to_escalate: vec![
                    "Escalate to the platform on-call if the issue blocks production jobs.".to_string(),
                ],
                ..SopAnswer::default()
            };
        }
        let titles = sources
            .iter()
            .map(|s| s.chunk.meta.title.clone())
            .collect::<Vec<_>>();
        SopAnswer {
            summary: format!(
                "Found {} related passages for \"{question}\". Review them in order of fused rank.",
                sources.len()
            ),
            possible_causes: Vec::new(),
            checks: titles.clone(),
            step_by_step_sop: sources
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    format!(
                        "Follow the resolution in Source {} ({}): {}",
                        i + 1,
                        s.chunk.meta.component,
                        s.chunk.meta.title
                    )
                })
                .collect(),
            mitigations: Vec::new(),
            rollback_plan: Vec::new(),
            when_to_escalate: Vec::new(),
            references: titles
                .iter()
                .enumerate()
                .map(|(i, title)| format!("Source {}: {title}", i + 1))
                .collect(),
        }
    }
}

impl AnswerGenerator for ExtractiveGenerator {
    fn name(&self) -> &'static str {
        "extractive"
    }

    fn generate<'a>(
        &'a self,
        question: &'a str,
        sources: &'a [FusedChunk],
    ) -> BoxFuture<'a, Result<SopAnswer, GenerationError>> {
        Box::pin(async move { Ok(Self::answer(question, sources)) })
    }
}

/// Numbered source blocks, stopping before the block that would cross `max_chars`.
pub fn format_context(sources: &[FusedChunk], max_chars: usize) -> String {
    let mut out = String::new();
    let mut total = 0;
    for (i, source) in sources.iter().enumerate() {
        let meta = &source.chunk.meta;
        let block = format!(
            "## Source {} | {} | score={} | title={}\n{}\n\n",
            i + 1,
            meta.component,
            meta.relevance_score,
            meta.title,
            source.chunk.content
        );
        total += block.chars().count();
        if total > max_chars {
            break;
        }
        out.push_str(&block);
    }
    out
}

fn user_prompt(question: &str, context: &str) -> String {
    let schema = schemars::schema_for!(SopAnswer);
    format!(
        "Question:\n{question}\n\nRetrieved context:\n{context}\n\
         Produce a troubleshooting result as JSON following this JSON Schema \
         (structure reference only, do not echo it):\n{}\n\n\
         Requirements:\n\
         1) checks and steps should be actionable (commands, config keys, log paths)\n\
         2) references must cite the Source numbers you used (e.g. 'Source 2') with their titles\n",
        schema.as_value()
    )
}

/// Parses model output into an SOP. Code fences and text around the object are tolerated.
pub fn parse_sop(content: &str) -> Result<SopAnswer, GenerationError> {
    let trimmed = strip_fences(content.trim());
    match serde_json::from_str::<SopAnswer>(trimmed) {
        Ok(sop) => Ok(sop),
        Err(err) => {
            let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
                return Err(GenerationError::Parse(err));
            };
            if end <= start {
                return Err(GenerationError::Parse(err));
            }
            serde_json::from_str::<SopAnswer>(&trimmed[start..=end]).map_err(GenerationError::Parse)
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the info string, e.g. ```json
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Markdown view of an SOP: summary, causes, quick checks and the numbered procedure.
pub fn render_answer_markdown(sop: &SopAnswer) -> String {
    let bullets = |items: &[String]| {
        items
            .iter()
            .map(|x| format!("- {x}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let steps = sop
        .step_by_step_sop
        .iter()
        .enumerate()
        .map(|(i, x)| format!("{}. {x}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "### Summary\n{}\n\n### Possible causes\n{}\n\n### Quick checks\n{}\n\n### SOP\n{}\n",
        sop.summary,
        bullets(&sop.possible_causes),
        bullets(&sop.checks),
        steps
    )
}
