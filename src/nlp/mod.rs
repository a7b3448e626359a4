// Rule-based NLP: keyword extraction, lexicon sentiment, pattern-scored
// intent and keyword-counted risk. Deliberately deterministic and offline.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::db::models::NewAnalysis;

const MAX_KEYWORDS: usize = 10;

/// Compound-score normalization constant (the usual lexicon alpha).
const SENTIMENT_ALPHA: f64 = 15.0;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9']+").expect("token regex"));
static SPECIALS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s.,!?-]").expect("specials regex"));
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "am", "and", "or", "but", "if", "then", "else", "for", "to",
    "of", "in", "on", "with", "by", "as", "at", "this", "that", "these", "those", "be", "been",
    "being", "it", "its", "we", "you", "they", "he", "she", "i", "me", "my", "our", "your",
    "their",
];

/// Intent labels with their scoring patterns, in priority order for ties.
const INTENT_PATTERNS: &[(&str, &[&str])] = &[
    (
        "customer support request",
        &[
            "help", "support", "assist", "problem", "issue", "trouble", "broken", "not working",
            "error", "fix", "repair",
        ],
    ),
    (
        "sales inquiry",
        &[
            "price", "cost", "buy", "purchase", "order", "quote", "discount", "deal", "offer",
            "sale", "promotion",
        ],
    ),
    (
        "complaint or issue",
        &[
            "complaint", "angry", "furious", "unhappy", "dissatisfied", "wrong", "bad",
            "terrible", "horrible", "unacceptable",
        ],
    ),
    (
        "general information",
        &[
            "what", "how", "when", "where", "why", "information", "details", "explain",
            "tell me", "question",
        ],
    ),
    (
        "appointment booking",
        &[
            "appointment", "schedule", "book", "reservation", "meeting", "time", "date",
            "calendar", "available",
        ],
    ),
    (
        "technical problem",
        &[
            "technical", "system", "software", "hardware", "network", "connection", "login",
            "password", "access", "download",
        ],
    ),
    (
        "billing question",
        &[
            "bill", "payment", "charge", "invoice", "account", "money", "refund", "credit",
            "debit", "subscription",
        ],
    ),
    (
        "product inquiry",
        &[
            "product", "feature", "specification", "model", "version", "compatibility",
            "requirement", "specs",
        ],
    ),
];

const HIGH_RISK_KEYWORDS: &[&str] = &[
    "urgent", "emergency", "critical", "immediately", "asap", "complaint", "sue", "lawyer",
    "legal", "escalate", "cancel", "refund", "money back", "dispute", "wrong", "angry",
    "furious", "unacceptable", "terrible", "horrible",
];

const COMPLIANCE_KEYWORDS: &[&str] = &[
    "privacy", "data", "personal", "confidential", "secure", "breach", "hack", "unauthorized",
    "access", "information",
];

const URGENCY_KEYWORDS: &[&str] = &[
    "urgent", "emergency", "critical", "immediately", "asap", "now", "today", "deadline",
    "time sensitive",
];

const POSITIVE_WORDS: &[&str] = &[
    "good", "great", "excellent", "amazing", "wonderful", "fantastic", "happy", "pleased",
    "love", "loved", "perfect", "helpful", "thanks", "thank", "appreciate", "awesome", "best",
    "nice", "glad", "satisfied", "resolved", "easy", "quick", "friendly",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "horrible", "awful", "angry", "furious", "hate", "hated", "worst",
    "broken", "useless", "unacceptable", "disappointed", "disappointing", "frustrated",
    "frustrating", "unhappy", "dissatisfied", "wrong", "slow", "rude", "never", "problem",
    "complaint", "cancel",
];

#[derive(Debug, Clone, Serialize)]
pub struct SentimentResult {
    pub sentiment: String,
    pub sentiment_score: i64,
    pub compound: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentResult {
    pub intent: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskResult {
    pub escalation_risk: String,
    pub risk_score: i64,
    pub urgency_level: String,
    pub compliance_risk: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub keywords: Vec<String>,
    pub sentiment: SentimentResult,
    pub intent: IntentResult,
    pub risk: RiskResult,
    pub text_length: usize,
}

impl AnalysisOutcome {
    pub fn to_new_analysis(&self) -> NewAnalysis {
        NewAnalysis {
            intent: self.intent.intent.clone(),
            intent_confidence: (self.intent.confidence * 100.0).round() as i64,
            sentiment: self.sentiment.sentiment.clone(),
            sentiment_score: self.sentiment.sentiment_score,
            escalation_risk: self.risk.escalation_risk.clone(),
            risk_score: self.risk.risk_score,
            urgency_level: self.risk.urgency_level.clone(),
            compliance_risk: self.risk.compliance_risk.clone(),
            keywords: self.keywords.clone(),
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NlpProcessor;

impl NlpProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Lowercase, drop special characters (keeping basic punctuation),
    /// collapse whitespace.
    pub fn preprocess(&self, text: &str) -> String {
        let lowered = text.to_lowercase();
        let stripped = SPECIALS_RE.replace_all(&lowered, "");
        let collapsed = WHITESPACE_RE.replace_all(&stripped, " ");
        collapsed
            .trim()
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .trim()
            .to_string()
    }

    /// Ten most frequent content tokens; ties keep first-seen order.
    pub fn extract_keywords(&self, text: &str) -> Vec<String> {
        let clean = self.preprocess(text);
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut order = 0usize;

        for token in TOKEN_RE.find_iter(&clean) {
            let token = token.as_str();
            if token.len() <= 2
                || STOP_WORDS.contains(&token)
                || token.chars().all(|c| c.is_ascii_digit())
            {
                continue;
            }
            let entry = counts.entry(token.to_string()).or_insert_with(|| {
                order += 1;
                (0, order)
            });
            entry.0 += 1;
        }

        let mut ranked: Vec<(String, usize, usize)> = counts
            .into_iter()
            .map(|(word, (count, first))| (word, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        ranked
            .into_iter()
            .take(MAX_KEYWORDS)
            .map(|(word, _, _)| word)
            .collect()
    }

    /// Lexicon sentiment with the standard compound normalization.
    pub fn analyze_sentiment(&self, text: &str) -> SentimentResult {
        let clean = self.preprocess(text);
        let mut raw = 0.0_f64;
        for token in TOKEN_RE.find_iter(&clean) {
            let token = token.as_str();
            if POSITIVE_WORDS.contains(&token) {
                raw += 1.0;
            } else if NEGATIVE_WORDS.contains(&token) {
                raw -= 1.0;
            }
        }

        let compound = if raw == 0.0 {
            0.0
        } else {
            raw / (raw * raw + SENTIMENT_ALPHA).sqrt()
        };

        let sentiment = if compound >= 0.05 {
            "positive"
        } else if compound <= -0.05 {
            "negative"
        } else {
            "neutral"
        };

        SentimentResult {
            sentiment: sentiment.to_string(),
            sentiment_score: (compound * 100.0).round() as i64,
            compound,
        }
    }

    /// Pattern scoring over the fixed label set; confidence is the match
    /// count scaled by the largest pattern list.
    pub fn detect_intent(&self, text: &str) -> IntentResult {
        let clean = self.preprocess(text);

        let max_pattern_len = INTENT_PATTERNS
            .iter()
            .map(|(_, keywords)| keywords.len())
            .max()
            .unwrap_or(1) as f64;

        let mut best: Option<(&str, usize)> = None;
        for (label, keywords) in INTENT_PATTERNS {
            let score = keywords.iter().filter(|k| clean.contains(**k)).count();
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((label, score)),
            }
        }

        match best {
            Some((label, score)) if score > 0 => IntentResult {
                intent: label.to_string(),
                confidence: (score as f64 / max_pattern_len).min(1.0),
            },
            _ => IntentResult {
                intent: "general information".to_string(),
                confidence: 0.1,
            },
        }
    }

    /// Keyword-counted risk with a sentiment bump.
    pub fn assess_risk(&self, text: &str, sentiment: &SentimentResult) -> RiskResult {
        let clean = self.preprocess(text);

        let high_risk = count_matches(&clean, HIGH_RISK_KEYWORDS);
        let urgency = count_matches(&clean, URGENCY_KEYWORDS);
        let compliance = count_matches(&clean, COMPLIANCE_KEYWORDS);

        let (mut escalation_risk, mut risk_score) = if high_risk >= 3 {
            ("high", 80)
        } else if high_risk >= 1 {
            ("medium", 50)
        } else {
            ("low", 0)
        };

        let urgency_level = if urgency >= 2 {
            "critical"
        } else if urgency >= 1 {
            "high"
        } else {
            "low"
        };

        let compliance_risk = if compliance >= 2 {
            "high"
        } else if compliance >= 1 {
            "medium"
        } else {
            "none"
        };

        if sentiment.sentiment == "negative" {
            risk_score = (risk_score + 20).min(100);
            if escalation_risk == "low" {
                escalation_risk = "medium";
            }
        }

        RiskResult {
            escalation_risk: escalation_risk.to_string(),
            risk_score,
            urgency_level: urgency_level.to_string(),
            compliance_risk: compliance_risk.to_string(),
        }
    }

    /// Full analysis used by the pipeline and re-analyze endpoint.
    pub fn analyze(&self, text: &str) -> AnalysisOutcome {
        let keywords = self.extract_keywords(text);
        let sentiment = self.analyze_sentiment(text);
        let intent = self.detect_intent(text);
        let risk = self.assess_risk(text, &sentiment);

        AnalysisOutcome {
            keywords,
            sentiment,
            intent,
            risk,
            text_length: text.len(),
        }
    }

    /// Labels a caller can expect back from intent detection.
    pub fn known_intents() -> Vec<&'static str> {
        INTENT_PATTERNS.iter().map(|(label, _)| *label).collect()
    }
}

fn count_matches(text: &str, keywords: &[&str]) -> usize {
    keywords.iter().filter(|k| text.contains(**k)).count()
}
