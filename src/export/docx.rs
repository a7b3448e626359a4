// DOCX rendering via docx-rs. Font sizes are half-points.

use docx_rs::{AlignmentType, Docx, Paragraph, Run};

use super::{Line, DIVIDER, GRAY, MUTED, NAVY};

const DIVIDER_RUN: &str = "────────────────────────────────────";

fn hex(color: (u8, u8, u8)) -> String {
    format!("{:02X}{:02X}{:02X}", color.0, color.1, color.2)
}

pub(crate) fn render(title: &str, subtitle: &str, lines: &[Line]) -> anyhow::Result<Vec<u8>> {
    let mut docx = Docx::new()
        .add_paragraph(
            Paragraph::new()
                .align(AlignmentType::Center)
                .add_run(Run::new().add_text("TRANSCRIPT").size(20).color(hex(MUTED))),
        )
        .add_paragraph(
            Paragraph::new()
                .align(AlignmentType::Center)
                .add_run(Run::new().add_text(title).size(40).bold().color(hex(NAVY))),
        )
        .add_paragraph(
            Paragraph::new()
                .align(AlignmentType::Center)
                .add_run(Run::new().add_text(subtitle).size(26).italic().color(hex(GRAY))),
        )
        .add_paragraph(
            Paragraph::new()
                .align(AlignmentType::Center)
                .add_run(Run::new().add_text(DIVIDER_RUN).color(hex(DIVIDER))),
        );

    for line in lines {
        let paragraph = match line {
            Line::Blank => Paragraph::new(),
            Line::Speaker(text) => Paragraph::new()
                .add_run(Run::new().add_text(text.as_str()).size(22).bold().color(hex(GRAY))),
            Line::Body(text) => Paragraph::new()
                .add_run(Run::new().add_text(text.as_str()).size(22).color(hex(GRAY))),
        };
        docx = docx.add_paragraph(paragraph);
    }

    docx = docx
        .add_paragraph(
            Paragraph::new()
                .align(AlignmentType::Center)
                .add_run(Run::new().add_text(DIVIDER_RUN).color(hex(DIVIDER))),
        )
        .add_paragraph(
            Paragraph::new()
                .align(AlignmentType::Center)
                .add_run(Run::new().add_text("END OF TRANSCRIPT").size(18).color(hex(MUTED))),
        );

    let mut buffer = std::io::Cursor::new(Vec::new());
    docx.build().pack(&mut buffer)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_produces_zip_bytes() {
        let bytes = render(
            "Weekly Sync",
            "August 01, 2026",
            &[Line::Speaker("hi".into()), Line::Body("notes".into())],
        )
        .unwrap();
        assert_eq!(&bytes[..2], b"PK");
    }

    #[test]
    fn palette_serializes_as_hex() {
        assert_eq!(hex(NAVY), "1A365D");
        assert_eq!(hex(DIVIDER), "CBD5E0");
    }
}
