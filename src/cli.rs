//! Command-line front door.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::info;

use crate::api::{create_router, AppState};
use crate::batch::{BatchDispatcher, BatchOutcome};
use crate::config::{LlmSettings, Settings};
use crate::extractor::{ExtractionOptions, ExtractionResult, Extractor};
use crate::files::{allowed_file, find_image_files};
use crate::llm::{LlmOptions, LlmOutcome, LlmProcessor, LlmStep, LlmTask};
use crate::ocr::tesseract::TesseractCli;
use crate::ocr::OcrEngine;
use crate::upload::spawn_sweeper;

#[derive(Parser)]
#[command(name = "ocr-gateway")]
#[command(about = "Tesseract OCR gateway with optional LLM post-processing")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Extract text from a single image or PDF
    Extract(ExtractArgs),
    /// Extract text from many files or directories
    Batch(BatchArgs),
    /// List installed OCR languages
    Languages {
        #[arg(long)]
        tesseract_cmd: Option<String>,
    },
    /// List LLM post-processing tasks
    Tasks,
}

#[derive(Args, Debug, Clone)]
pub struct OcrArgs {
    /// Tesseract language code
    #[arg(short, long)]
    pub language: Option<String>,
    /// Tesseract configuration
    #[arg(short, long, allow_hyphen_values = true)]
    pub config: Option<String>,
    /// Denoise and binarize before recognition
    #[arg(short, long)]
    pub preprocess: bool,
    /// Path to the tesseract executable
    #[arg(long)]
    pub tesseract_cmd: Option<String>,
}

impl OcrArgs {
    fn options(&self, settings: &Settings) -> ExtractionOptions {
        ExtractionOptions {
            language: self
                .language
                .clone()
                .unwrap_or_else(|| settings.ocr.default_language.clone()),
            config: self
                .config
                .clone()
                .unwrap_or_else(|| settings.ocr.default_config.clone()),
            preprocess: self.preprocess,
        }
    }

    fn engine(&self, settings: &Settings) -> Arc<dyn OcrEngine> {
        let cmd = self
            .tesseract_cmd
            .clone()
            .unwrap_or_else(|| settings.ocr.tesseract_cmd.clone());
        Arc::new(TesseractCli::new(cmd, settings.ocr.timeout))
    }
}

#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    /// Post-process the OCR text with the LLM
    #[arg(long)]
    pub gemini: bool,
    #[arg(long, value_enum, default_value_t = LlmTask::Analyze)]
    pub gemini_task: LlmTask,
    /// Custom prompt, replaces the task template
    #[arg(long)]
    pub gemini_prompt: Option<String>,
    #[arg(long, default_value_t = 0.7)]
    pub gemini_temperature: f32,
    #[arg(long)]
    pub gemini_max_tokens: Option<u32>,
    /// API key (or set OPENROUTER_API_KEY / GEMINI_API_KEY)
    #[arg(long)]
    pub gemini_api_key: Option<String>,
}

impl LlmArgs {
    fn options(&self) -> LlmOptions {
        LlmOptions {
            task: self.gemini_task,
            prompt: self.gemini_prompt.clone(),
            temperature: self.gemini_temperature,
            max_tokens: self.gemini_max_tokens,
        }
    }

    /// `Ok(None)` when `--gemini` was not given.
    fn step(&self, settings: &Settings) -> Result<Option<LlmStep>> {
        if !self.gemini {
            return Ok(None);
        }
        let llm_settings = match &self.gemini_api_key {
            Some(key) => LlmSettings::with_key(key.as_str()),
            None => settings.llm.clone().context(
                "GEMINI_API_KEY not found. Please set the environment variable or use --gemini-api-key",
            )?,
        };
        Ok(Some(LlmStep {
            processor: LlmProcessor::from_settings(&llm_settings)?,
            options: self.options(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    pub file: PathBuf,
    #[command(flatten)]
    pub ocr: OcrArgs,
    #[command(flatten)]
    pub llm: LlmArgs,
    /// Write output to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// Input files or directories
    pub inputs: Vec<PathBuf>,
    #[command(flatten)]
    pub ocr: OcrArgs,
    #[command(flatten)]
    pub llm: LlmArgs,
    /// Descend into subdirectories
    #[arg(short, long)]
    pub recursive: bool,
    #[arg(short, long)]
    pub workers: Option<usize>,
    /// Keep going after a file fails
    #[arg(long)]
    pub continue_on_error: bool,
    /// Write the JSON report to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn run(cli: Cli, settings: Settings) -> Result<ExitCode> {
    let ok = match cli.command {
        Commands::Serve { host, port } => {
            let mut settings = settings;
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings).await?;
            true
        }
        Commands::Extract(args) => {
            let engine = args.ocr.engine(&settings);
            extract(&args, &settings, engine).await?
        }
        Commands::Batch(args) => {
            let engine = args.ocr.engine(&settings);
            batch(&args, &settings, engine).await?
        }
        Commands::Languages { tesseract_cmd } => {
            let cmd = tesseract_cmd.unwrap_or_else(|| settings.ocr.tesseract_cmd.clone());
            let engine = TesseractCli::new(cmd, settings.ocr.timeout);
            let mut languages = engine.languages().await?;
            languages.sort();
            println!("Available Tesseract languages:");
            for lang in languages {
                println!("  {}", lang);
            }
            true
        }
        Commands::Tasks => {
            println!("Available Gemini tasks:");
            for task in LlmTask::ALL {
                println!("  {:<12} - {}", task.as_str(), task.description());
            }
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn serve(settings: Settings) -> Result<()> {
    let engine: Arc<dyn OcrEngine> = Arc::new(TesseractCli::new(
        settings.ocr.tesseract_cmd.clone(),
        settings.ocr.timeout,
    ));
    let llm = settings
        .llm
        .as_ref()
        .map(LlmProcessor::from_settings)
        .transpose()?;
    if llm.is_some() {
        info!("LLM post-processing enabled");
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let sweep = settings
        .upload
        .session_ttl
        .map(|ttl| (ttl, settings.upload.sweep_interval));

    let state = AppState::new(settings, engine, llm);
    if let Some((ttl, every)) = sweep {
        spawn_sweeper(state.uploads.clone(), ttl, every);
        info!("Upload sessions expire after {:?} idle", ttl);
    }

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn extract(args: &ExtractArgs, settings: &Settings, engine: Arc<dyn OcrEngine>) -> Result<bool> {
    if !args.file.exists() {
        eprintln!("Error: File '{}' not found", args.file.display());
        return Ok(false);
    }
    if !allowed_file(&args.file.to_string_lossy()) {
        eprintln!(
            "Warning: '{}' may not be a supported image format",
            args.file.display()
        );
    }

    let step = match args.llm.step(settings) {
        Ok(step) => step,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(false);
        }
    };

    let options = args.ocr.options(settings);
    if args.verbose {
        println!("Processing: {}", args.file.display());
        println!("Language: {}", options.language);
        println!("Config: {}", options.config);
        println!("Preprocess: {}", options.preprocess);
        println!("{}", "-".repeat(50));
    }

    let extractor = Extractor::new(engine);
    let mut result = extractor.extract(&args.file, &options).await;
    if let Some(error) = &result.error {
        eprintln!("Error: {}", error);
        return Ok(false);
    }

    if let Some(step) = &step {
        if args.verbose {
            println!("Processing with Gemini (task: {})...", step.options.task);
        }
        let outcome = step.processor.process_text(&result.text, &step.options).await;
        if !outcome.success {
            eprintln!(
                "Gemini processing failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            if !args.verbose {
                return Ok(false);
            }
        }
        result.llm = Some(outcome);
    }

    let rendered = match args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&result)?,
        OutputFormat::Text => render_text(&result, args.verbose),
    };

    emit(&rendered, args.output.as_deref(), "Output saved to").await
}

/// Plain-text rendering of a single extraction.
fn render_text(result: &ExtractionResult, verbose: bool) -> String {
    let llm = result.llm.as_ref();
    let mut output = match llm.filter(|o| o.success) {
        Some(outcome) => format!(
            "=== OCR TEXT ===\n{}\n\n=== GEMINI ANALYSIS ===\n{}",
            result.text,
            outcome.response.as_deref().unwrap_or_default()
        ),
        None => result.text.clone(),
    };

    if verbose {
        output.push_str("\n\n--- OCR Info ---");
        output.push_str(&format!("\nConfidence: {}%", result.confidence));
        output.push_str(&format!("\nWords: {}", result.word_count));
        output.push_str(&format!("\nCharacters: {}", result.character_count));
        if let Some(outcome) = llm {
            output.push_str(&render_llm_info(outcome));
        }
    }
    output
}

fn render_llm_info(outcome: &LlmOutcome) -> String {
    let mut info = String::from("\n\n--- Gemini Info ---");
    if outcome.success {
        let (prompt, completion) = outcome
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens.to_string(), u.completion_tokens.to_string()))
            .unwrap_or_else(|| ("N/A".to_string(), "N/A".to_string()));
        info.push_str(&format!("\nTask: {}", outcome.task));
        info.push_str(&format!("\nPrompt tokens: {}", prompt));
        info.push_str(&format!("\nCompletion tokens: {}", completion));
    } else {
        info.push_str(&format!(
            "\nError: {}",
            outcome.error.as_deref().unwrap_or_default()
        ));
    }
    info
}

/// Print `content`, or write it to `path` and say so.
async fn emit(content: &str, path: Option<&Path>, saved_label: &str) -> Result<bool> {
    match path {
        Some(path) => match tokio::fs::write(path, content).await {
            Ok(()) => {
                println!("{}: {}", saved_label, path.display());
                Ok(true)
            }
            Err(e) => {
                eprintln!("Error saving output: {}", e);
                Ok(false)
            }
        },
        None => {
            println!("{}", content);
            Ok(true)
        }
    }
}

/// Expand inputs into files; directories are scanned for images.
fn collect_inputs(inputs: &[PathBuf], recursive: bool, verbose: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            let found = find_image_files(input, recursive)
                .with_context(|| format!("Failed to scan {}", input.display()))?;
            if verbose {
                println!("Found {} images in {}", found.len(), input.display());
            }
            files.extend(found);
        } else {
            eprintln!("Warning: {} not found", input.display());
        }
    }
    Ok(files)
}

/// JSON report for a finished (or halted) batch.
fn batch_report(total: usize, outcome: &BatchOutcome) -> Value {
    let failed: Vec<_> = outcome.rejected.iter().chain(&outcome.failures).collect();
    let successful = outcome.successes.len();
    let success_rate = if total > 0 {
        (successful as f64 / total as f64 * 10000.0).round() / 100.0
    } else {
        0.0
    };

    let mut report = json!({
        "summary": {
            "total_files": total,
            "successful": successful,
            "failed": failed.len(),
            "success_rate": success_rate,
            "skipped": outcome.skipped,
        },
        "results": outcome.successes,
    });
    if !failed.is_empty() {
        report["failed_files"] = json!(failed);
    }
    report
}

async fn batch(args: &BatchArgs, settings: &Settings, engine: Arc<dyn OcrEngine>) -> Result<bool> {
    let step = match args.llm.step(settings) {
        Ok(step) => step,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(false);
        }
    };
    if args.verbose {
        if let Some(step) = &step {
            println!("Gemini integration enabled (task: {})", step.options.task);
        }
    }

    let files = collect_inputs(&args.inputs, args.recursive, args.verbose)?;
    if files.is_empty() {
        eprintln!("No files to process");
        return Ok(false);
    }

    let workers = args.workers.unwrap_or(settings.batch.workers);
    if args.verbose {
        println!("Processing {} files with {} workers", files.len(), workers);
        println!("{}", "-".repeat(50));
    }

    let total = files.len();
    let outcome = BatchDispatcher::new(Extractor::new(engine), workers)
        .process(
            files,
            &args.ocr.options(settings),
            step.as_ref(),
            args.continue_on_error,
        )
        .await;

    if args.verbose {
        for result in &outcome.successes {
            let llm_note = match &result.llm {
                Some(o) if o.success => " + Gemini",
                Some(_) => " + Gemini (failed)",
                None => "",
            };
            println!(
                "✓ {} - {}% confidence, {} words, {}s{}",
                result.file_path.as_deref().unwrap_or_default(),
                result.confidence,
                result.word_count,
                result.processing_time.unwrap_or_default(),
                llm_note
            );
        }
        for failure in outcome.rejected.iter().chain(&outcome.failures) {
            println!("Failed: {} - {}", failure.file, failure.error);
        }
    }
    if outcome.halted {
        if let Some(failure) = outcome.failures.last() {
            eprintln!("Error processing {}: {}", failure.file, failure.error);
        }
    }

    let report = batch_report(total, &outcome);
    let written = emit(
        &serde_json::to_string_pretty(&report)?,
        args.output.as_deref(),
        "Results saved to",
    )
    .await?;

    if args.verbose {
        println!("\n{}", "=".repeat(50));
        println!(
            "Summary: {}/{} files processed successfully",
            outcome.processed(),
            total
        );
        let failed = outcome.failed() + outcome.rejected.len();
        if failed > 0 {
            println!("Failed files: {}", failed);
        }
    }

    Ok(written && !outcome.halted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchFailure;
    use crate::llm::TokenUsage;
    use crate::ocr::testing::ScriptedEngine;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_extract_flags() {
        let cli = parse(&[
            "ocr-gateway",
            "extract",
            "scan.png",
            "-l",
            "spa",
            "-c",
            "--psm 4",
            "-p",
            "--format",
            "json",
            "--gemini",
            "--gemini-task",
            "extract",
        ]);
        let Commands::Extract(args) = cli.command else {
            panic!("expected extract");
        };
        assert_eq!(args.file, PathBuf::from("scan.png"));
        assert_eq!(args.ocr.language.as_deref(), Some("spa"));
        assert_eq!(args.ocr.config.as_deref(), Some("--psm 4"));
        assert!(args.ocr.preprocess);
        assert_eq!(args.format, OutputFormat::Json);
        assert!(args.llm.gemini);
        assert_eq!(args.llm.gemini_task, LlmTask::Extract);
        assert_eq!(args.llm.gemini_temperature, 0.7);
    }

    #[test]
    fn test_parse_batch_flags() {
        let cli = parse(&["ocr-gateway", "batch", "scans/", "a.png", "-r", "-w", "4", "--continue-on-error"]);
        let Commands::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        assert_eq!(args.inputs.len(), 2);
        assert!(args.recursive);
        assert_eq!(args.workers, Some(4));
        assert!(args.continue_on_error);
    }

    #[test]
    fn test_unknown_task_is_rejected() {
        assert!(Cli::try_parse_from(["ocr-gateway", "extract", "a.png", "--gemini-task", "poetry"]).is_err());
    }

    #[test]
    fn test_render_text_with_llm() {
        let mut result =
            ExtractionResult::from_ocr("Hello world", &[80.0, 60.0], &ExtractionOptions::default());
        assert_eq!(render_text(&result, false), "Hello world");

        result.llm = Some(LlmOutcome {
            success: true,
            response: Some("A greeting.".to_string()),
            task: "analyze".to_string(),
            prompt_used: None,
            usage: Some(TokenUsage {
                prompt_tokens: 12,
                completion_tokens: 2,
            }),
            error: None,
        });
        let text = render_text(&result, true);
        assert!(text.starts_with("=== OCR TEXT ===\nHello world\n\n=== GEMINI ANALYSIS ===\nA greeting."));
        assert!(text.contains("\nConfidence: 70%"));
        assert!(text.contains("\nWords: 2"));
        assert!(text.contains("\nPrompt tokens: 12"));
    }

    #[test]
    fn test_render_text_failed_llm_shows_plain_text() {
        let mut result = ExtractionResult::from_ocr("Body", &[], &ExtractionOptions::default());
        result.llm = Some(LlmOutcome::failed(LlmTask::Summarize, "quota"));
        let text = render_text(&result, true);
        assert!(text.starts_with("Body\n\n--- OCR Info ---"));
        assert!(text.ends_with("\nError: quota"));
    }

    #[test]
    fn test_batch_report_counts_rejections() {
        let outcome = BatchOutcome {
            successes: vec![ExtractionResult::from_ocr("a", &[90.0], &ExtractionOptions::default())],
            failures: vec![BatchFailure {
                file: "b.png".to_string(),
                error: "boom".to_string(),
            }],
            rejected: vec![BatchFailure {
                file: "c.txt".to_string(),
                error: "File type not allowed".to_string(),
            }],
            halted: true,
            skipped: 4,
        };

        let report = batch_report(3, &outcome);

        assert_eq!(report["summary"]["total_files"], 3);
        assert_eq!(report["summary"]["successful"], 1);
        assert_eq!(report["summary"]["failed"], 2);
        assert_eq!(report["summary"]["success_rate"], 33.33);
        assert_eq!(report["summary"]["skipped"], 4);
        assert_eq!(report["failed_files"][0]["file"], "c.txt");
        assert_eq!(report["failed_files"][1]["file"], "b.png");
    }

    #[test]
    fn test_batch_report_omits_empty_failures() {
        let report = batch_report(0, &BatchOutcome::default());
        assert_eq!(report["summary"]["success_rate"], 0.0);
        assert!(report.get("failed_files").is_none());
    }

    #[test]
    fn test_collect_inputs_scans_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.md"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.jpg"), b"x").unwrap();
        let missing = dir.path().join("missing.png");

        let flat = collect_inputs(&[dir.path().to_path_buf(), missing.clone()], false, false).unwrap();
        assert_eq!(flat, vec![dir.path().join("a.png")]);

        let deep = collect_inputs(&[dir.path().to_path_buf()], true, false).unwrap();
        assert_eq!(deep.len(), 2);
    }

    fn extract_args(file: PathBuf, output: PathBuf, format: OutputFormat) -> ExtractArgs {
        let cli = parse(&["ocr-gateway", "extract", "placeholder.png"]);
        let Commands::Extract(mut args) = cli.command else {
            panic!("expected extract");
        };
        args.file = file;
        args.output = Some(output);
        args.format = format;
        args
    }

    #[tokio::test]
    async fn test_extract_writes_json_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.png");
        std::fs::write(&input, b"image").unwrap();
        let output = dir.path().join("out.json");

        let args = extract_args(input, output.clone(), OutputFormat::Json);
        let engine = Arc::new(ScriptedEngine::with_text("Line one\n", &[90.0]));
        let ok = extract(&args, &Settings::default(), engine).await.unwrap();

        assert!(ok);
        let written: Value = serde_json::from_str(&std::fs::read_to_string(output).unwrap()).unwrap();
        assert_eq!(written["text"], "Line one");
        assert_eq!(written["confidence"], 90.0);
    }

    #[tokio::test]
    async fn test_extract_failure_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scan.png");
        std::fs::write(&input, b"image").unwrap();
        let output = dir.path().join("out.txt");

        let args = extract_args(input, output.clone(), OutputFormat::Text);
        let engine = Arc::new(ScriptedEngine::default().failing_on(&["scan.png"]));
        assert!(!extract(&args, &Settings::default(), engine).await.unwrap());
        assert!(!output.exists());

        let args = extract_args(dir.path().join("absent.png"), output, OutputFormat::Text);
        let engine = Arc::new(ScriptedEngine::default());
        assert!(!extract(&args, &Settings::default(), engine).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_fail_fast_still_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let output = dir.path().join("report.json");
        let cli = parse(&[
            "ocr-gateway",
            "batch",
            dir.path().to_str().unwrap(),
            "-w",
            "1",
            "-o",
            output.to_str().unwrap(),
        ]);
        let Commands::Batch(args) = cli.command else {
            panic!("expected batch");
        };

        let engine = Arc::new(ScriptedEngine::with_text("t", &[50.0]).failing_on(&["b.png"]));
        let ok = batch(&args, &Settings::default(), engine).await.unwrap();

        assert!(!ok);
        let report: Value = serde_json::from_str(&std::fs::read_to_string(output).unwrap()).unwrap();
        assert_eq!(report["summary"]["total_files"], 3);
        assert_eq!(report["summary"]["successful"], 1);
        assert_eq!(report["summary"]["failed"], 1);
        assert_eq!(report["summary"]["skipped"], 1);
        assert_eq!(report["failed_files"][0]["file"], "b.png");
    }

    #[tokio::test]
    async fn test_batch_without_inputs_fails() {
        let cli = parse(&["ocr-gateway", "batch"]);
        let Commands::Batch(args) = cli.command else {
            panic!("expected batch");
        };
        let engine = Arc::new(ScriptedEngine::default());
        assert!(!batch(&args, &Settings::default(), engine).await.unwrap());
    }
}
