//! Tesseract engine, driven through its command-line binary.
//!
//! Each recognition runs the binary twice: once for plain text and once for
//! TSV output, whose `conf` column carries the per-token confidences.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{OcrEngine, OcrInput, OcrOutput};

const CONF_COLUMN: usize = 10;

pub struct TesseractCli {
    cmd: String,
    timeout: Duration,
}

impl TesseractCli {
    pub fn new(cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            timeout,
        }
    }

    async fn run(&self, input: &OcrInput, args: Vec<String>) -> Result<String> {
        let mut command = Command::new(&self.cmd);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let stdin_bytes = match input {
            OcrInput::Path(_) => {
                command.stdin(Stdio::null());
                None
            }
            OcrInput::Bitmap(bytes) => {
                command.stdin(Stdio::piped());
                Some(bytes.clone())
            }
        };

        debug!(cmd = %self.cmd, ?args, "Running tesseract");

        let execution = async {
            let mut child = command
                .spawn()
                .with_context(|| format!("Failed to start '{}'", self.cmd))?;

            if let (Some(bytes), Some(mut stdin)) = (stdin_bytes, child.stdin.take()) {
                stdin
                    .write_all(&bytes)
                    .await
                    .context("Failed to write image to tesseract")?;
            }

            child
                .wait_with_output()
                .await
                .context("Failed to wait for tesseract")
        };

        let output = tokio::time::timeout(self.timeout, execution)
            .await
            .map_err(|_| {
                anyhow::anyhow!("tesseract timed out after {} seconds", self.timeout.as_secs())
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("tesseract failed ({}): {}", output.status, stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// `tesseract <input> stdout -l <lang> <config..> [tsv]`
fn build_args(input: &OcrInput, language: &str, config: &str, tsv: bool) -> Vec<String> {
    let source = match input {
        OcrInput::Path(path) => path.to_string_lossy().to_string(),
        OcrInput::Bitmap(_) => "stdin".to_string(),
    };

    let mut args = vec![
        source,
        "stdout".to_string(),
        "-l".to_string(),
        language.to_string(),
    ];
    args.extend(config.split_whitespace().map(str::to_string));
    if tsv {
        args.push("tsv".to_string());
    }
    args
}

/// Pull the `conf` column out of tesseract TSV output.
fn parse_tsv_confidences(tsv: &str) -> Vec<f32> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| line.split('\t').nth(CONF_COLUMN))
        .filter_map(|conf| conf.trim().parse::<f32>().ok())
        .collect()
}

/// Parse `--list-langs` output, skipping the banner line.
fn parse_language_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of"))
        .map(str::to_string)
        .collect()
}

#[async_trait::async_trait]
impl OcrEngine for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, input: &OcrInput, language: &str, config: &str) -> Result<OcrOutput> {
        let text = self
            .run(input, build_args(input, language, config, false))
            .await?;
        let tsv = self
            .run(input, build_args(input, language, config, true))
            .await?;

        Ok(OcrOutput {
            text,
            confidences: parse_tsv_confidences(&tsv),
        })
    }

    async fn languages(&self) -> Result<Vec<String>> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.cmd)
                .arg("--list-langs")
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("tesseract --list-langs timed out"))?
        .with_context(|| format!("Failed to start '{}'", self.cmd))?;

        // Older releases print the listing on stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let listing = if stdout.trim().is_empty() {
            String::from_utf8_lossy(&output.stderr).to_string()
        } else {
            stdout.to_string()
        };

        Ok(parse_language_list(&listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_build_args_for_path() {
        let input = OcrInput::Path(PathBuf::from("/tmp/scan.png"));
        let args = build_args(&input, "spa", "--psm 4 -c preserve_interword_spaces=1", true);
        assert_eq!(
            args,
            vec![
                "/tmp/scan.png",
                "stdout",
                "-l",
                "spa",
                "--psm",
                "4",
                "-c",
                "preserve_interword_spaces=1",
                "tsv"
            ]
        );
    }

    #[test]
    fn test_build_args_for_bitmap_reads_stdin() {
        let args = build_args(&OcrInput::Bitmap(vec![1, 2]), "eng", "", false);
        assert_eq!(args, vec!["stdin", "stdout", "-l", "eng"]);
    }

    #[test]
    fn test_parse_tsv_confidences() {
        let tsv = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
                   1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t\n\
                   5\t1\t1\t1\t1\t1\t10\t10\t50\t20\t96.5\tHello\n\
                   5\t1\t1\t1\t1\t2\t70\t10\t60\t20\t88\tWorld\n";
        assert_eq!(parse_tsv_confidences(tsv), vec![-1.0, 96.5, 88.0]);
    }

    #[test]
    fn test_parse_language_list() {
        let listing = "List of available languages in \"/usr/share/tessdata/\" (3):\neng\nosd\nspa\n";
        assert_eq!(parse_language_list(listing), vec!["eng", "osd", "spa"]);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let engine = TesseractCli::new("ocr-gateway-no-such-binary", Duration::from_secs(5));
        let err = engine
            .recognize(&OcrInput::Path(PathBuf::from("x.png")), "eng", "--psm 6")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to start"));
    }
}
