//! Extraction invoker: one file in, one normalized [`ExtractionResult`] out.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::files::is_pdf;
use crate::llm::{LlmOutcome, LlmStep};
use crate::ocr::preprocess::preprocess_file;
use crate::ocr::{OcrEngine, OcrInput};

/// OCR parameters for one invocation.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub language: String,
    /// Engine-specific config string, e.g. `--psm 6`.
    pub config: String,
    pub preprocess: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            config: "--psm 6".to_string(),
            preprocess: false,
        }
    }
}

/// Normalized output of one OCR invocation.
///
/// When `error` is set the text is empty, confidence is 0, and the record
/// counts as a failure everywhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub text: String,
    pub confidence: f64,
    pub word_count: usize,
    pub character_count: usize,
    pub language: String,
    pub config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(rename = "gemini", skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmOutcome>,
}

impl ExtractionResult {
    pub fn from_ocr(raw_text: &str, confidences: &[f32], options: &ExtractionOptions) -> Self {
        Self {
            text: raw_text.trim().to_string(),
            confidence: average_confidence(confidences),
            word_count: raw_text.split_whitespace().count(),
            character_count: raw_text.chars().count(),
            language: options.language.clone(),
            config: options.config.clone(),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, options: &ExtractionOptions) -> Self {
        Self {
            language: options.language.clone(),
            config: options.config.clone(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Mean of the strictly positive confidences, rounded to two decimals; 0 when none.
pub fn average_confidence(confidences: &[f32]) -> f64 {
    let positive: Vec<f64> = confidences
        .iter()
        .filter(|c| **c > 0.0)
        .map(|c| f64::from(*c))
        .collect();

    if positive.is_empty() {
        return 0.0;
    }

    let mean = positive.iter().sum::<f64>() / positive.len() as f64;
    round2(mean)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Wraps the OCR engine for single-file calls.
#[derive(Clone)]
pub struct Extractor {
    engine: Arc<dyn OcrEngine>,
}

impl Extractor {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &dyn OcrEngine {
        self.engine.as_ref()
    }

    /// Run OCR on `path`. Never fails: errors are folded into the record.
    pub async fn extract(&self, path: &Path, options: &ExtractionOptions) -> ExtractionResult {
        match self.try_extract(path, options).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Extraction failed for {:?}: {:#}", path, e);
                ExtractionResult::failed(format!("{:#}", e), options)
            }
        }
    }

    async fn try_extract(&self, path: &Path, options: &ExtractionOptions) -> Result<ExtractionResult> {
        if !path.exists() {
            anyhow::bail!("File not found: {}", path.display());
        }

        if is_pdf(path) {
            let owned = path.to_path_buf();
            let text = tokio::task::spawn_blocking(move || extract_pdf_text(&owned))
                .await
                .context("PDF extraction task panicked")??;
            if text.trim().is_empty() {
                anyhow::bail!("PDF has no extractable text layer");
            }
            return Ok(ExtractionResult::from_ocr(&text, &[], options));
        }

        let input = if options.preprocess {
            let owned = path.to_path_buf();
            let bitmap = tokio::task::spawn_blocking(move || preprocess_file(&owned))
                .await
                .context("Preprocessing task panicked")??;
            OcrInput::Bitmap(bitmap)
        } else {
            OcrInput::Path(path.to_path_buf())
        };

        debug!(
            engine = self.engine.name(),
            language = %options.language,
            config = %options.config,
            preprocess = options.preprocess,
            "Running OCR on {:?}",
            path
        );

        let output = self
            .engine
            .recognize(&input, &options.language, &options.config)
            .await?;

        Ok(ExtractionResult::from_ocr(&output.text, &output.confidences, options))
    }

    /// Extract, time the call, and run the LLM step when extraction succeeded.
    pub async fn process_file(
        &self,
        path: &Path,
        options: &ExtractionOptions,
        llm: Option<&LlmStep>,
    ) -> ExtractionResult {
        let started = Instant::now();
        let mut result = self.extract(path, options).await;
        result.file_path = Some(path.display().to_string());
        result.processing_time = Some(round2(started.elapsed().as_secs_f64()));

        if let (Some(step), true) = (llm, result.is_success()) {
            result.llm = Some(step.processor.process_text(&result.text, &step.options).await);
        }

        info!(
            "Processed {:?}: success={} confidence={} words={}",
            path,
            result.is_success(),
            result.confidence,
            result.word_count
        );
        result
    }
}

/// Extract the embedded text layer of a PDF using lopdf.
fn extract_pdf_text(path: &Path) -> Result<String> {
    use lopdf::Document;

    let doc = Document::load(path).map_err(|e| anyhow::anyhow!("Failed to load PDF: {}", e))?;

    let mut text = String::new();
    for (page_num, _) in doc.get_pages() {
        if let Ok(content) = doc.extract_text(&[page_num]) {
            text.push_str(&content);
            text.push('\n');
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::CannedBackend;
    use crate::llm::{LlmOptions, LlmProcessor};
    use crate::ocr::testing::ScriptedEngine;

    fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_average_confidence_excludes_non_positive() {
        assert_eq!(average_confidence(&[0.0, 0.0, 80.0, 60.0]), 70.0);
        assert_eq!(average_confidence(&[-1.0, 91.0, 92.0, 92.0]), 91.67);
        assert_eq!(average_confidence(&[-1.0, 0.0]), 0.0);
        assert_eq!(average_confidence(&[]), 0.0);
    }

    #[test]
    fn test_from_ocr_counts() {
        let options = ExtractionOptions::default();
        let result = ExtractionResult::from_ocr("  Hello  world \n", &[90.0], &options);
        assert_eq!(result.text, "Hello  world");
        assert_eq!(result.word_count, 2);
        assert_eq!(result.character_count, 16);
        assert_eq!(result.language, "eng");
        assert_eq!(result.config, "--psm 6");
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_extract_normalizes_engine_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "scan.png", b"not really a png");
        let extractor = Extractor::new(Arc::new(ScriptedEngine::with_text(
            "Invoice 42\n",
            &[0.0, 0.0, 80.0, 60.0],
        )));

        let result = extractor.extract(&path, &ExtractionOptions::default()).await;

        assert!(result.is_success());
        assert_eq!(result.text, "Invoice 42");
        assert_eq!(result.confidence, 70.0);
        assert_eq!(result.word_count, 2);
    }

    #[tokio::test]
    async fn test_engine_error_becomes_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "bad.png", b"x");
        let engine = ScriptedEngine::with_text("ignored", &[99.0]).failing_on(&["bad.png"]);
        let extractor = Extractor::new(Arc::new(engine));

        let result = extractor.extract(&path, &ExtractionOptions::default()).await;

        assert!(!result.is_success());
        assert!(result.error.as_deref().unwrap().contains("engine failed"));
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_missing_file_is_failure() {
        let extractor = Extractor::new(Arc::new(ScriptedEngine::default()));
        let result = extractor
            .extract(Path::new("/no/such/file.png"), &ExtractionOptions::default())
            .await;
        assert!(result.error.unwrap().contains("File not found"));
    }

    #[tokio::test]
    async fn test_preprocess_failure_on_undecodable_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "garbage.png", b"\x00\x01\x02");
        let engine = Arc::new(ScriptedEngine::with_text("x", &[50.0]));
        let extractor = Extractor::new(engine.clone());

        let options = ExtractionOptions {
            preprocess: true,
            ..Default::default()
        };
        let result = extractor.extract(&path, &options).await;

        assert!(!result.is_success());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_pdf_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "doc.pdf", b"%PDF-garbage");
        let engine = Arc::new(ScriptedEngine::default());
        let extractor = Extractor::new(engine.clone());

        let result = extractor.extract(&path, &ExtractionOptions::default()).await;

        assert!(result.error.unwrap().contains("PDF"));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_process_file_runs_llm_only_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(dir.path(), "good.png", b"x");
        let bad = write_file(dir.path(), "bad.png", b"x");
        let backend = Arc::new(CannedBackend::replying("summary"));
        let step = LlmStep {
            processor: LlmProcessor::new(backend.clone()),
            options: LlmOptions::default(),
        };
        let extractor = Extractor::new(Arc::new(
            ScriptedEngine::with_text("text", &[90.0]).failing_on(&["bad.png"]),
        ));
        let options = ExtractionOptions::default();

        let ok = extractor.process_file(&good, &options, Some(&step)).await;
        let failed = extractor.process_file(&bad, &options, Some(&step)).await;

        assert_eq!(ok.llm.as_ref().unwrap().response.as_deref(), Some("summary"));
        assert!(ok.processing_time.is_some());
        assert_eq!(ok.file_path.as_deref(), Some(good.to_str().unwrap()));
        assert!(failed.llm.is_none());
        assert_eq!(backend.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_llm_failure_stays_nested() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "page.png", b"x");
        let step = LlmStep {
            processor: LlmProcessor::new(Arc::new(CannedBackend::failing())),
            options: LlmOptions::default(),
        };
        let extractor = Extractor::new(Arc::new(ScriptedEngine::with_text("text", &[90.0])));

        let result = extractor
            .process_file(&path, &ExtractionOptions::default(), Some(&step))
            .await;

        assert!(result.is_success());
        assert!(!result.llm.unwrap().success);
    }

    #[test]
    fn test_serialized_shape() {
        let mut result = ExtractionResult::from_ocr("hi", &[88.0], &ExtractionOptions::default());
        result.filename = Some("a.png".to_string());
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["confidence"], 88.0);
        assert_eq!(json["filename"], "a.png");
        assert!(json.get("error").is_none());
        assert!(json.get("gemini").is_none());
    }
}
