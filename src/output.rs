//! Decoding of raw classifier output.
//!
//! Text-classification pipelines do not agree on one output shape: depending
//! on version and on whether every class score is requested, the same
//! prediction comes back as `[{..}]`, `[[{..}, {..}, ..]]` or a bare `{..}`.
//! [`ProviderOutput`] names those three shapes; anything else is rejected
//! with [`AnalyzeError::Shape`].

use serde_json::{Map, Value};

use crate::error::{AnalyzeError, Result};
use crate::types::{SentimentLabel, SentimentResult};

/// One (label, score) pair as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub label: Option<String>,
    pub score: Option<f64>,
}

impl Candidate {
    fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            label: map.get("label").and_then(label_text),
            score: map.get("score").and_then(score_value),
        }
    }

    /// Score used for ranking and for the final result.
    pub fn score_or_default(&self) -> f64 {
        self.score.unwrap_or(0.0)
    }

    pub fn to_result(&self) -> SentimentResult {
        let label = self
            .label
            .as_deref()
            .map(SentimentLabel::from_provider)
            .unwrap_or(SentimentLabel::Neutral);
        SentimentResult::new(label, self.score_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderOutput {
    /// `[{label, score}]`: the provider already picked the best class.
    SingleCandidate(Candidate),
    /// `[[{label, score}, ...]]`: the full class distribution.
    CandidateList(Vec<Candidate>),
    /// `{label, score}` with no enclosing sequence.
    BareCandidate(Candidate),
}

impl ProviderOutput {
    pub fn decode(raw: &Value) -> Result<Self> {
        match raw {
            Value::Array(items) => {
                let first = items
                    .first()
                    .ok_or_else(|| AnalyzeError::Shape("empty sequence".to_string()))?;
                match first {
                    Value::Object(map) => Ok(Self::SingleCandidate(Candidate::from_map(map))),
                    Value::Array(distribution) => {
                        if distribution.is_empty() {
                            return Err(AnalyzeError::Shape(
                                "empty class distribution".to_string(),
                            ));
                        }
                        distribution
                            .iter()
                            .map(|entry| match entry {
                                Value::Object(map) => Ok(Candidate::from_map(map)),
                                other => Err(AnalyzeError::Shape(format!(
                                    "class distribution entry is {}",
                                    kind_of(other)
                                ))),
                            })
                            .collect::<Result<Vec<_>>>()
                            .map(Self::CandidateList)
                    }
                    other => Err(AnalyzeError::Shape(format!(
                        "first element is {}",
                        kind_of(other)
                    ))),
                }
            }
            Value::Object(map) => Ok(Self::BareCandidate(Candidate::from_map(map))),
            other => Err(AnalyzeError::Shape(format!("output is {}", kind_of(other)))),
        }
    }

    /// The candidate that represents the prediction. For a class distribution
    /// this is the highest score, first one wins on ties.
    pub fn into_candidate(self) -> Candidate {
        match self {
            Self::SingleCandidate(candidate) | Self::BareCandidate(candidate) => candidate,
            Self::CandidateList(candidates) => candidates
                .into_iter()
                .reduce(|best, candidate| {
                    if candidate.score_or_default() > best.score_or_default() {
                        candidate
                    } else {
                        best
                    }
                })
                // decode never builds an empty list
                .unwrap_or_default(),
        }
    }
}

fn label_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// NaN and infinities count as no score at all.
fn score_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|score: &f64| score.is_finite())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
