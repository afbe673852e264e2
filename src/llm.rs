//! LLM post-processing of OCR text.
//!
//! Failures here are soft: [`LlmProcessor::process_text`] always returns an
//! [`LlmOutcome`], with `success: false` and the error message when the call
//! did not go through. Callers attach the outcome to the extraction result.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::LlmSettings;
use crate::openrouter::OpenRouterClient;

/// Minimal completion interface the processor needs from an LLM provider.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> anyhow::Result<String>;
}

/// Predefined post-processing tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LlmTask {
    #[default]
    Analyze,
    Summarize,
    Structure,
    Extract,
    Translate,
    Validate,
    Format,
}

impl LlmTask {
    pub const ALL: [LlmTask; 7] = [
        LlmTask::Analyze,
        LlmTask::Summarize,
        LlmTask::Structure,
        LlmTask::Extract,
        LlmTask::Translate,
        LlmTask::Validate,
        LlmTask::Format,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmTask::Analyze => "analyze",
            LlmTask::Summarize => "summarize",
            LlmTask::Structure => "structure",
            LlmTask::Extract => "extract",
            LlmTask::Translate => "translate",
            LlmTask::Validate => "validate",
            LlmTask::Format => "format",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LlmTask::Analyze => "Analyze document structure and content",
            LlmTask::Summarize => "Create a concise summary",
            LlmTask::Structure => "Clean and organize the text",
            LlmTask::Extract => "Extract key information and data",
            LlmTask::Translate => "Detect language and translate to English",
            LlmTask::Validate => "Validate and fact-check information",
            LlmTask::Format => "Format into professional document",
        }
    }

    /// Unknown task names fall back to `analyze`.
    pub fn parse_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }

    fn prompt(&self, text: &str) -> String {
        match self {
            LlmTask::Analyze => format!(
                "Analyze the following OCR-extracted text and provide insights:\n\n\
                 1. Document type and structure\n\
                 2. Key information extracted\n\
                 3. Data quality assessment\n\
                 4. Potential improvements needed\n\
                 5. Summary of content\n\n\
                 Text to analyze:\n{text}\n"
            ),
            LlmTask::Summarize => format!(
                "Create a concise summary of the following OCR-extracted text. \
                 Focus on the main points and key information:\n\n\
                 Text to summarize:\n{text}\n"
            ),
            LlmTask::Structure => format!(
                "Structure and organize the following OCR-extracted text into a clean, \
                 readable format. Fix any OCR errors and improve formatting:\n\n\
                 Text to structure:\n{text}\n"
            ),
            LlmTask::Extract => format!(
                "Extract and organize key information from the following OCR text. Identify:\n\
                 - Names, dates, addresses\n\
                 - Important numbers, amounts, IDs\n\
                 - Key facts and data points\n\
                 - Contact information\n\n\
                 Present the information in a structured format (JSON or organized list):\n\n\
                 Text to extract from:\n{text}\n"
            ),
            LlmTask::Translate => format!(
                "First, detect the language of the following OCR-extracted text, then \
                 translate it to English. If it's already in English, just clean up any OCR errors:\n\n\
                 Text to translate:\n{text}\n"
            ),
            LlmTask::Validate => format!(
                "Validate and fact-check the information in the following OCR-extracted text. \
                 Look for:\n\
                 - Inconsistencies or errors\n\
                 - Missing information\n\
                 - Data that seems incorrect\n\
                 - Suggestions for verification\n\n\
                 Text to validate:\n{text}\n"
            ),
            LlmTask::Format => format!(
                "Format the following OCR-extracted text into a professional document format. \
                 Clean up OCR errors, improve structure, and make it presentation-ready:\n\n\
                 Text to format:\n{text}\n"
            ),
        }
    }
}

impl fmt::Display for LlmTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LlmTask::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown task: {}", s))
    }
}

/// Per-request LLM options.
#[derive(Debug, Clone)]
pub struct LlmOptions {
    pub task: LlmTask,
    /// Replaces the task template when set.
    pub prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            task: LlmTask::Analyze,
            prompt: None,
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl LlmOptions {
    pub fn build_prompt(&self, text: &str) -> String {
        match self.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(custom) => format!("{}\n\nText to process:\n{}", custom, text),
            None => self.task.prompt(text),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Result of one LLM call, attached to an extraction result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmOutcome {
    pub success: bool,
    pub response: Option<String>,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LlmOutcome {
    pub fn failed(task: LlmTask, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            task: task.to_string(),
            prompt_used: None,
            usage: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone)]
pub struct LlmProcessor {
    backend: Arc<dyn ChatBackend>,
}

impl LlmProcessor {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    pub fn from_settings(settings: &LlmSettings) -> anyhow::Result<Self> {
        let client = OpenRouterClient::from_settings(settings)?;
        Ok(Self::new(Arc::new(client)))
    }

    pub async fn process_text(&self, text: &str, options: &LlmOptions) -> LlmOutcome {
        let prompt = options.build_prompt(text);

        match self
            .backend
            .complete(&prompt, options.temperature, options.max_tokens)
            .await
        {
            Ok(response) => {
                info!(
                    "LLM task '{}' complete ({} chars)",
                    options.task,
                    response.len()
                );
                LlmOutcome {
                    success: true,
                    usage: Some(TokenUsage {
                        prompt_tokens: prompt.split_whitespace().count(),
                        completion_tokens: response.split_whitespace().count(),
                    }),
                    response: Some(response),
                    task: options.task.to_string(),
                    prompt_used: Some(prompt),
                    error: None,
                }
            }
            Err(e) => {
                warn!("LLM task '{}' failed: {:#}", options.task, e);
                LlmOutcome::failed(options.task, format!("{:#}", e))
            }
        }
    }
}

/// LLM stage of a pipeline: a processor plus the options to call it with.
#[derive(Clone)]
pub struct LlmStep {
    pub processor: LlmProcessor,
    pub options: LlmOptions,
}


#[cfg(test)]
mod tests {
    use super::testing::CannedBackend;
    use super::*;

    #[test]
    fn test_task_parsing() {
        assert_eq!("summarize".parse::<LlmTask>().unwrap(), LlmTask::Summarize);
        assert_eq!(" Extract ".parse::<LlmTask>().unwrap(), LlmTask::Extract);
        assert!("poetry".parse::<LlmTask>().is_err());
        assert_eq!(LlmTask::parse_or_default("poetry"), LlmTask::Analyze);
    }

    #[test]
    fn test_custom_prompt_replaces_template() {
        let options = LlmOptions {
            prompt: Some("Find all invoice numbers".to_string()),
            ..Default::default()
        };
        assert_eq!(
            options.build_prompt("INV-1"),
            "Find all invoice numbers\n\nText to process:\nINV-1"
        );

        let blank = LlmOptions {
            prompt: Some("   ".to_string()),
            task: LlmTask::Translate,
            ..Default::default()
        };
        assert!(blank.build_prompt("hola").starts_with("First, detect the language"));
    }

    #[test]
    fn test_every_task_embeds_text() {
        for task in LlmTask::ALL {
            let options = LlmOptions {
                task,
                ..Default::default()
            };
            assert!(options.build_prompt("MARKER-42").contains("MARKER-42"), "{task}");
        }
    }

    #[tokio::test]
    async fn test_process_text_success() {
        let backend = Arc::new(CannedBackend::replying("two words"));
        let processor = LlmProcessor::new(backend.clone());

        let outcome = processor
            .process_text("hello world", &LlmOptions::default())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.response.as_deref(), Some("two words"));
        assert_eq!(outcome.task, "analyze");
        assert_eq!(outcome.usage.as_ref().unwrap().completion_tokens, 2);
        assert_eq!(backend.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_process_text_failure_is_soft() {
        let processor = LlmProcessor::new(Arc::new(CannedBackend::failing()));
        let options = LlmOptions {
            task: LlmTask::Summarize,
            ..Default::default()
        };

        let outcome = processor.process_text("text", &options).await;

        assert!(!outcome.success);
        assert!(outcome.response.is_none());
        assert_eq!(outcome.task, "summarize");
        assert_eq!(outcome.error.as_deref(), Some("upstream unavailable"));
    }
}
