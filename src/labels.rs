use crate::types::SentimentLabel;

/// Source vocabulary reported by the classifier. Keys are upper-case.
const LABEL_TABLE: &[(&str, SentimentLabel)] = &[
    ("LABEL_0", SentimentLabel::Negative),
    ("LABEL_1", SentimentLabel::Neutral),
    ("LABEL_2", SentimentLabel::Positive),
    ("NEGATIVE", SentimentLabel::Negative),
    ("NEUTRAL", SentimentLabel::Neutral),
    ("POSITIVE", SentimentLabel::Positive),
];

impl SentimentLabel {
    /// Maps a provider label onto the canonical set. Lookup is case-insensitive;
    /// anything outside the vocabulary is `Neutral`.
    pub fn from_provider(raw: &str) -> Self {
        let upper = raw.to_uppercase();
        LABEL_TABLE
            .iter()
            .find(|(key, _)| *key == upper)
            .map(|(_, label)| *label)
            .unwrap_or(SentimentLabel::Neutral)
    }
}
