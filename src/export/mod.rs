// Transcript export: txt, docx and pdf renderers over one templated layout
// (centered header, divider, speaker turns and body paragraphs, footer).

mod docx;
mod pdf;
mod txt;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{AppError, AppResult};

/// Muted neutral palette shared by every format.
pub(crate) const NAVY: (u8, u8, u8) = (0x1A, 0x36, 0x5D);
pub(crate) const BLUE: (u8, u8, u8) = (0x31, 0x82, 0xCE);
pub(crate) const GRAY: (u8, u8, u8) = (0x2D, 0x37, 0x48);
pub(crate) const MUTED: (u8, u8, u8) = (0x71, 0x80, 0x96);
pub(crate) const DIVIDER: (u8, u8, u8) = (0xCB, 0xD5, 0xE0);

static SPEAKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(>>|\[?Speaker\s*\d*\]?:)\s*(.*)$").expect("speaker regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Txt,
    Docx,
    Pdf,
}

impl ExportFormat {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "txt" => Ok(ExportFormat::Txt),
            "docx" => Ok(ExportFormat::Docx),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(AppError::Validation(format!(
                "Unsupported export format '{other}'. Allowed: txt, docx, pdf"
            ))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Docx => "docx",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Txt => "text/plain; charset=utf-8",
            ExportFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

#[derive(Debug)]
pub struct ExportedFile {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub suggested_filename: String,
}

/// One logical line of the transcript body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Line {
    Blank,
    /// A speaker turn (marker stripped).
    Speaker(String),
    Body(String),
}

/// Render a stored transcript to the requested format.
pub fn export(text: &str, format: ExportFormat, filename: Option<&str>) -> AppResult<ExportedFile> {
    let title = title_from_filename(filename);
    let subtitle = Utc::now().format("%B %d, %Y").to_string();
    let lines = split_lines(text);

    let bytes = match format {
        ExportFormat::Txt => txt::render(&title, &subtitle, &lines),
        ExportFormat::Docx => docx::render(&title, &subtitle, &lines)
            .map_err(|e| AppError::Internal(format!("docx export failed: {e}")))?,
        ExportFormat::Pdf => pdf::render(&title, &subtitle, &lines)
            .map_err(|e| AppError::Internal(format!("pdf export failed: {e}")))?,
    };

    let stem = filename
        .map(|f| f.rsplit_once('.').map(|(s, _)| s).unwrap_or(f).to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "transcript".to_string());

    Ok(ExportedFile {
        bytes,
        content_type: format.content_type(),
        suggested_filename: format!("{stem}.{}", format.extension()),
    })
}

/// Title from the original filename: extension stripped, separators spaced,
/// title-cased. Falls back to a dated default.
pub(crate) fn title_from_filename(filename: Option<&str>) -> String {
    let default = || format!("Transcript - {}", Utc::now().format("%B %d, %Y"));

    let Some(filename) = filename else {
        return default();
    };
    // Strip a real extension only (a trailing non-empty dot-free suffix).
    let stem = match filename.rfind('.') {
        Some(i) if i + 1 < filename.len() && !filename[i + 1..].contains('.') && i > 0 => {
            &filename[..i]
        }
        _ => filename,
    };
    let spaced = stem.replace(['_', '-'], " ");
    let title = spaced
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    if title.is_empty() {
        default()
    } else {
        title
    }
}

pub(crate) fn split_lines(text: &str) -> Vec<Line> {
    text.trim()
        .lines()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return Line::Blank;
            }
            if let Some(captures) = SPEAKER_RE.captures(trimmed) {
                let content = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
                if content.is_empty() {
                    return Line::Blank;
                }
                return Line::Speaker(content.to_string());
            }
            Line::Body(trimmed.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_come_from_filenames() {
        assert_eq!(
            title_from_filename(Some("team_standup-notes.wav")),
            "Team Standup Notes"
        );
        assert!(title_from_filename(None).starts_with("Transcript - "));
        assert!(title_from_filename(Some("___")).starts_with("Transcript - "));
    }

    #[test]
    fn speaker_markers_are_detected() {
        let lines = split_lines(">> first speaker\n[Speaker 2]: second\nplain body\n\nSpeaker: third");
        assert_eq!(lines[0], Line::Speaker("first speaker".into()));
        assert_eq!(lines[1], Line::Speaker("second".into()));
        assert_eq!(lines[2], Line::Body("plain body".into()));
        assert_eq!(lines[3], Line::Blank);
        assert_eq!(lines[4], Line::Speaker("third".into()));
    }

    #[test]
    fn unknown_format_is_validation_error() {
        assert!(ExportFormat::parse("rtf").is_err());
        assert_eq!(ExportFormat::parse(" PDF ").unwrap(), ExportFormat::Pdf);
    }

    #[test]
    fn txt_export_round_trips_every_token() {
        let text = ">> hello there\nthis is the body of the call\nwith multiple lines";
        let exported = export(text, ExportFormat::Txt, Some("call.wav")).unwrap();
        let decoded = String::from_utf8(exported.bytes).unwrap();
        for token in text.split_whitespace().filter(|t| *t != ">>") {
            assert!(decoded.contains(token), "missing token {token}");
        }
        assert_eq!(exported.suggested_filename, "call.txt");
        assert!(decoded.contains("TRANSCRIPT"));
        assert!(decoded.contains("END OF TRANSCRIPT"));
    }

    #[test]
    fn docx_export_is_a_zip_container() {
        let exported = export("hello docx", ExportFormat::Docx, None).unwrap();
        // DOCX is a ZIP: PK magic.
        assert_eq!(&exported.bytes[..2], b"PK");
        assert!(exported.suggested_filename.ends_with(".docx"));
    }

    #[test]
    fn pdf_export_has_pdf_header() {
        let exported = export("hello pdf\n>> speaker line", ExportFormat::Pdf, None).unwrap();
        assert_eq!(&exported.bytes[..5], b"%PDF-");
        assert!(exported.suggested_filename.ends_with(".pdf"));
    }
}
