// PDF rendering via printpdf with the builtin Helvetica faces. Layout is a
// simple cursor walk down A4 pages with naive word wrapping.

use printpdf::{
    BuiltinFont, Color, IndirectFontRef, Line as PdfLine, Mm, PdfDocument, PdfLayerReference,
    Point, Rgb,
};

use super::{Line, DIVIDER, GRAY, MUTED, NAVY};

const PAGE_WIDTH_MM: f32 = 210.0;
const PAGE_HEIGHT_MM: f32 = 297.0;
const MARGIN_MM: f32 = 25.0;

/// Rough Helvetica advance: ~0.5 em per character.
const CHAR_WIDTH_EM: f32 = 0.5;
const PT_TO_MM: f32 = 0.352_778;

const BODY_WRAP_CHARS: usize = 88;

fn rgb(color: (u8, u8, u8)) -> Color {
    Color::Rgb(Rgb::new(
        color.0 as f32 / 255.0,
        color.1 as f32 / 255.0,
        color.2 as f32 / 255.0,
        None,
    ))
}

struct Cursor {
    doc: printpdf::PdfDocumentReference,
    layer: PdfLayerReference,
    y: f32,
}

impl Cursor {
    fn advance(&mut self, line_height_mm: f32) {
        self.y -= line_height_mm;
        if self.y < MARGIN_MM {
            let (page, layer) = self
                .doc
                .add_page(Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "layer");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = PAGE_HEIGHT_MM - MARGIN_MM;
        }
    }

    fn text(&mut self, text: &str, size_pt: f32, x: f32, color: (u8, u8, u8), font: &IndirectFontRef) {
        self.layer.set_fill_color(rgb(color));
        self.layer.use_text(text, size_pt, Mm(x), Mm(self.y), font);
    }

    fn centered(&mut self, text: &str, size_pt: f32, color: (u8, u8, u8), font: &IndirectFontRef) {
        let width_mm = text.chars().count() as f32 * CHAR_WIDTH_EM * size_pt * PT_TO_MM;
        let x = ((PAGE_WIDTH_MM - width_mm) / 2.0).max(MARGIN_MM);
        self.text(text, size_pt, x, color, font);
    }

    fn divider(&mut self) {
        self.layer.set_outline_color(rgb(DIVIDER));
        self.layer.set_outline_thickness(0.5);
        let line = PdfLine {
            points: vec![
                (Point::new(Mm(40.0), Mm(self.y)), false),
                (Point::new(Mm(PAGE_WIDTH_MM - 40.0), Mm(self.y)), false),
            ],
            is_closed: false,
        };
        self.layer.add_line(line);
    }
}

pub(crate) fn render(title: &str, subtitle: &str, lines: &[Line]) -> anyhow::Result<Vec<u8>> {
    let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH_MM), Mm(PAGE_HEIGHT_MM), "layer");
    let regular = doc.add_builtin_font(BuiltinFont::Helvetica)?;
    let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold)?;
    let italic = doc.add_builtin_font(BuiltinFont::HelveticaOblique)?;

    let layer = doc.get_page(page).get_layer(layer);
    let mut cursor = Cursor {
        doc,
        layer,
        y: PAGE_HEIGHT_MM - MARGIN_MM,
    };

    cursor.centered("TRANSCRIPT", 10.0, MUTED, &regular);
    cursor.advance(8.0);
    cursor.centered(title, 20.0, NAVY, &bold);
    cursor.advance(8.0);
    cursor.centered(subtitle, 13.0, GRAY, &italic);
    cursor.advance(8.0);
    cursor.divider();
    cursor.advance(10.0);

    for line in lines {
        match line {
            Line::Blank => cursor.advance(4.0),
            Line::Speaker(text) => {
                cursor.advance(2.0);
                for wrapped in wrap(text, BODY_WRAP_CHARS) {
                    cursor.text(&wrapped, 11.0, MARGIN_MM, GRAY, &bold);
                    cursor.advance(6.0);
                }
            }
            Line::Body(text) => {
                for wrapped in wrap(text, BODY_WRAP_CHARS) {
                    cursor.text(&wrapped, 11.0, MARGIN_MM + 7.0, GRAY, &regular);
                    cursor.advance(6.0);
                }
            }
        }
    }

    cursor.advance(6.0);
    cursor.divider();
    cursor.advance(8.0);
    cursor.centered("END OF TRANSCRIPT", 9.0, MUTED, &regular);

    let mut bytes = Vec::new();
    cursor
        .doc
        .save(&mut std::io::BufWriter::new(&mut bytes))?;
    Ok(bytes)
}

/// Greedy word wrap on a character budget.
fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max_chars {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        out.push(current);
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_respects_character_budget() {
        let wrapped = wrap("one two three four five", 9);
        assert_eq!(wrapped, vec!["one two", "three", "four five"]);
        assert_eq!(wrap("", 10), vec![String::new()]);
    }

    #[test]
    fn long_transcripts_paginate() {
        let body: Vec<Line> = (0..400)
            .map(|i| Line::Body(format!("line number {i} with some content")))
            .collect();
        let bytes = render("Big", "August 01, 2026", &body).unwrap();
        assert_eq!(&bytes[..5], b"%PDF-");
    }
}
