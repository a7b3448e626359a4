// Plain-text rendering: fixed 70-column layout with centered header and
// footer.

use super::Line;

const WIDTH: usize = 70;

pub(crate) fn render(title: &str, subtitle: &str, lines: &[Line]) -> Vec<u8> {
    let divider = "\u{2500}".repeat(WIDTH);
    let mut out: Vec<String> = Vec::new();

    out.push(String::new());
    out.push(center("TRANSCRIPT"));
    out.push(center(title));
    out.push(center(subtitle));
    out.push(String::new());
    out.push(divider.clone());
    out.push(String::new());

    for line in lines {
        match line {
            Line::Blank => out.push(String::new()),
            Line::Speaker(text) => out.push(format!("  {text}")),
            Line::Body(text) => out.push(format!("    {text}")),
        }
    }

    out.push(String::new());
    out.push(divider);
    out.push(center("END OF TRANSCRIPT"));
    out.push(String::new());

    out.join("\n").into_bytes()
}

fn center(text: &str) -> String {
    let len = text.chars().count();
    if len >= WIDTH {
        return text.to_string();
    }
    let pad = (WIDTH - len) / 2;
    format!("{}{}", " ".repeat(pad), text)
}
