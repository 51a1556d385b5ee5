//! PDF conversion for formats the layout analyzer cannot ingest directly.
//!
//! Conversion shells out to a headless `soffice` binary. Spreadsheets get a
//! pre-processing pass first so the rendered PDF stays legible (see
//! [`spreadsheet`]).

mod spreadsheet;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ConversionConfig;
use crate::error::ConversionError;

/// Formats the analyzer accepts as-is; everything else is converted to PDF.
/// Unknown extensions are conservatively routed through conversion.
pub fn needs_conversion(filename: &str) -> bool {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        // Directly analyzable
        "pdf" | "json" | "xlsx" | "pptx" => false,
        // Audio goes to transcription, not layout analysis
        "mp3" | "wav" | "m4a" | "flac" | "ogg" | "aac" => false,
        // Mail formats are parsed structurally
        "eml" | "msg" => false,
        // Legacy office formats and images render to PDF first
        "doc" | "docx" | "xls" | "ppt" | "jpg" | "jpeg" | "png" => true,
        other => {
            warn!(
                filename = %filename,
                extension = %other,
                "Unknown file extension, routing through conversion"
            );
            true
        }
    }
}

fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

fn pdf_name(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("converted");
    format!("{stem}.pdf")
}

/// Headless office-suite converter.
pub struct Converter {
    soffice_path: PathBuf,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl Converter {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            soffice_path: PathBuf::from(&config.soffice_path),
            timeout: Duration::from_secs(config.timeout_secs),
            attempts: config.attempts.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        }
    }

    /// Convert raw bytes to PDF. Returns the PDF bytes and the output name
    /// (input stem with a `.pdf` extension).
    pub async fn convert_to_pdf(
        &self,
        content: &[u8],
        filename: &str,
    ) -> Result<(Vec<u8>, String), ConversionError> {
        let extension = file_extension(filename);

        // Spreadsheets are reshaped before rendering so wide sheets fit pages.
        let input: Vec<u8> = if matches!(extension.as_str(), "xls" | "xlsx") {
            spreadsheet::preprocess(content)?
        } else {
            content.to_vec()
        };

        let mut last_error = ConversionError::NoOutput;
        for attempt in 1..=self.attempts {
            match self.run_soffice(&input, filename).await {
                Ok(bytes) => {
                    info!(
                        filename = %filename,
                        attempt,
                        pdf_bytes = bytes.len(),
                        "Converted document to PDF"
                    );
                    return Ok((bytes, pdf_name(filename)));
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(filename = %filename, attempt, error = %e, "Conversion attempt failed");
                    last_error = e;
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn run_soffice(
        &self,
        content: &[u8],
        filename: &str,
    ) -> Result<Vec<u8>, ConversionError> {
        if !self.soffice_path.exists() {
            return Err(ConversionError::ConverterMissing {
                path: self.soffice_path.display().to_string(),
            });
        }

        let workdir = tempfile::tempdir().map_err(ConversionError::Io)?;
        let input_path = workdir.path().join(filename);
        tokio::fs::write(&input_path, content)
            .await
            .map_err(ConversionError::Io)?;

        let mut command = tokio::process::Command::new(&self.soffice_path);
        command
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(workdir.path())
            .arg(&input_path)
            .kill_on_drop(true);

        debug!(filename = %filename, "Running headless converter");

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| ConversionError::Timeout {
                secs: self.timeout.as_secs(),
            })?
            .map_err(ConversionError::Io)?;

        if !output.status.success() {
            return Err(ConversionError::ConverterFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // The converter names its output itself; take the PDF it produced.
        let mut entries = tokio::fs::read_dir(workdir.path())
            .await
            .map_err(ConversionError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(ConversionError::Io)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pdf") {
                return tokio::fs::read(&path).await.map_err(ConversionError::Io);
            }
        }

        Err(ConversionError::NoOutput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directly_analyzable_formats_skip_conversion() {
        for name in [
            "report.pdf",
            "data.json",
            "sheet.xlsx",
            "deck.pptx",
            "call.mp3",
            "voicemail.WAV",
            "mail.eml",
            "mail.msg",
        ] {
            assert!(!needs_conversion(name), "{name} should not need conversion");
        }
    }

    #[test]
    fn office_and_image_formats_need_conversion() {
        for name in [
            "letter.doc",
            "letter.docx",
            "ledger.xls",
            "deck.ppt",
            "scan.jpg",
            "scan.JPEG",
            "scan.png",
        ] {
            assert!(needs_conversion(name), "{name} should need conversion");
        }
    }

    #[test]
    fn unknown_extensions_are_converted() {
        assert!(needs_conversion("archive.xyz"));
        assert!(needs_conversion("no_extension"));
    }

    #[test]
    fn pdf_name_swaps_extension() {
        assert_eq!(pdf_name("report.docx"), "report.pdf");
        assert_eq!(pdf_name("ledger.v2.xls"), "ledger.v2.pdf");
        assert_eq!(pdf_name("scan.png"), "scan.pdf");
    }

    #[tokio::test]
    async fn missing_converter_is_terminal() {
        let converter = Converter {
            soffice_path: PathBuf::from("/nonexistent/soffice"),
            timeout: Duration::from_secs(1),
            attempts: 3,
            retry_delay: Duration::from_millis(1),
        };

        let result = converter.convert_to_pdf(b"content", "letter.docx").await;
        match result {
            Err(e) => assert!(!e.is_retryable()),
            Ok(_) => panic!("conversion should fail without a converter binary"),
        }
    }
}
