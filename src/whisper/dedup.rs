// Post-processing safety net for transcription output.
//
// whisper.cpp occasionally gets stuck repeating itself, especially on
// overlapped windows and near-silence. Two passes run on every response:
// consecutive-segment dedup, then an 8-word sliding-window scan over the
// concatenated text.

use super::client::TranscriptionSegment;

/// Words per n-gram window. Inputs shorter than two windows pass through.
const NGRAM_WORDS: usize = 8;

/// Containment check only kicks in for segments at least this long.
const CONTAINMENT_MIN_CHARS: usize = 10;

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Drop consecutive segments that repeat (or are contained in) the previous
/// segment's text.
pub fn dedupe_segments(segments: Vec<TranscriptionSegment>) -> Vec<TranscriptionSegment> {
    let mut out: Vec<TranscriptionSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        let norm = normalize(&segment.text);
        if norm.is_empty() {
            out.push(segment);
            continue;
        }
        if let Some(prev) = out.last() {
            let prev_norm = normalize(&prev.text);
            if norm == prev_norm {
                continue;
            }
            if norm.len() >= CONTAINMENT_MIN_CHARS && prev_norm.contains(&norm) {
                continue;
            }
        }
        out.push(segment);
    }
    out
}

/// Remove repeated 8-word windows from running text.
///
/// The scan keeps the first occurrence of every lowercased 8-gram; when a
/// window repeats, the whole window is skipped. Texts shorter than sixteen
/// words are returned unchanged.
pub fn dedupe_ngrams(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < NGRAM_WORDS * 2 {
        return text.to_string();
    }

    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<&str> = Vec::with_capacity(words.len());
    let mut i = 0;
    while i < words.len() {
        if i + NGRAM_WORDS <= words.len() {
            let gram = words[i..i + NGRAM_WORDS].join(" ").to_lowercase();
            if !seen.insert(gram) {
                i += NGRAM_WORDS;
                continue;
            }
        }
        kept.push(words[i]);
        i += 1;
    }
    kept.join(" ")
}

/// Apply both passes; returns the cleaned text/segments and how many
/// characters were dropped so callers can log pathological cases.
pub fn dedupe_transcription(
    text: &str,
    segments: Vec<TranscriptionSegment>,
) -> (String, Vec<TranscriptionSegment>, usize) {
    let original_len = text.chars().count();

    let segments = dedupe_segments(segments);
    let joined = if segments.is_empty() {
        text.to_string()
    } else {
        segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };

    let cleaned = dedupe_ngrams(&joined);
    let removed = original_len.saturating_sub(cleaned.chars().count());
    (cleaned, segments, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(text: &str) -> TranscriptionSegment {
        TranscriptionSegment {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn consecutive_duplicate_segments_are_dropped() {
        let segments = vec![seg("Hello world"), seg(" hello world "), seg("and more")];
        let out = dedupe_segments(segments);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].text, "and more");
    }

    #[test]
    fn contained_long_segment_is_dropped() {
        let segments = vec![
            seg("thanks for calling customer support today"),
            seg("customer support today"),
        ];
        let out = dedupe_segments(segments);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn short_contained_segment_survives() {
        // Under 10 chars, containment must not fire ("no" is inside "not now").
        let segments = vec![seg("well not now"), seg("no")];
        let out = dedupe_segments(segments);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn ngram_dedup_removes_repeated_window() {
        let gram = "one two three four five six seven eight";
        let text = format!("{gram} {gram} nine");
        let out = dedupe_ngrams(&text);
        assert_eq!(out, format!("{gram} nine"));
    }

    #[test]
    fn ngram_dedup_short_input_unchanged() {
        let text = "only a handful of words here nothing repeats";
        assert_eq!(dedupe_ngrams(text), text);
    }

    #[test]
    fn ngram_dedup_is_idempotent() {
        let gram = "alpha beta gamma delta epsilon zeta eta theta";
        let text = format!("{gram} filler words in the middle {gram} {gram} tail");
        let once = dedupe_ngrams(&text);
        let twice = dedupe_ngrams(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn dedupe_transcription_reports_removed_chars() {
        let gram = "a b c d e f g h";
        let text = format!("{gram} {gram}");
        let (cleaned, _, removed) = dedupe_transcription(&text, Vec::new());
        assert_eq!(cleaned, gram);
        assert!(removed > 0);
    }
}
