//! OCR engine abstraction.
//!
//! Defines the [`OcrEngine`] trait so the extraction pipeline does not care
//! whether text comes from the local tesseract binary or a test double.

pub mod preprocess;
pub mod tesseract;

use std::path::PathBuf;

/// What the engine is asked to read.
#[derive(Debug, Clone)]
pub enum OcrInput {
    /// An image file on disk, passed to the engine untouched.
    Path(PathBuf),
    /// An encoded (PNG) bitmap produced by preprocessing.
    Bitmap(Vec<u8>),
}

/// Raw engine output: text plus one confidence per recognized token.
///
/// Confidences use the engine's 0–100 scale; non-positive values mean
/// "no signal" (layout rows, empty tokens).
#[derive(Debug, Clone, Default)]
pub struct OcrOutput {
    pub text: String,
    pub confidences: Vec<f32>,
}

#[async_trait::async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize text with the given language code and engine config string.
    async fn recognize(
        &self,
        input: &OcrInput,
        language: &str,
        config: &str,
    ) -> anyhow::Result<OcrOutput>;

    /// Language codes the engine has data for.
    async fn languages(&self) -> anyhow::Result<Vec<String>>;
}
