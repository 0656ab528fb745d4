use metrics::counter;
use std::sync::Arc;

use crate::error::{AnalyzeError, Result};
use crate::output::ProviderOutput;
use crate::provider::ProviderHandle;
use crate::types::SentimentResult;

/// Reduces whatever the provider returns to a [`SentimentResult`].
#[derive(Clone)]
pub struct Normalizer {
    provider: Arc<ProviderHandle>,
    max_input_chars: usize,
}

impl Normalizer {
    pub fn new(provider: Arc<ProviderHandle>, max_input_chars: usize) -> Self {
        Self {
            provider,
            max_input_chars,
        }
    }

    #[tracing::instrument(skip(self, text), fields(text_len = text.len()))]
    pub async fn normalize(&self, text: &str) -> Result<SentimentResult> {
        if is_blank(text) {
            tracing::debug!("Blank input, skipping inference");
            counter!("analyze_empty_input_total").increment(1);
            return Ok(SentimentResult::neutral());
        }

        let provider = self.provider.get().await?;
        let raw = provider
            .infer(truncate_chars(text, self.max_input_chars).to_string())
            .await
            .map_err(AnalyzeError::Provider)?;
        tracing::trace!(raw = %raw, "Provider output");

        let output = ProviderOutput::decode(&raw)?;
        Ok(output.into_candidate().to_result())
    }
}

/// Unicode whitespace plus the ASCII separators U+001C..=U+001F, which
/// Python's `str.strip` also removes.
fn is_blank(text: &str) -> bool {
    text.chars()
        .all(|c| c.is_whitespace() || ('\x1c'..='\x1f').contains(&c))
}

/// The first `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InferenceProvider;
    use crate::types::SentimentLabel;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    /// Returns a canned output and records every text it receives.
    struct StubProvider {
        output: Value,
        received: Mutex<Vec<String>>,
    }

    impl StubProvider {
        fn new(output: Value) -> Arc<Self> {
            Arc::new(Self {
                output,
                received: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceProvider for StubProvider {
        async fn infer(&self, text: String) -> anyhow::Result<Value> {
            self.received.lock().unwrap().push(text);
            Ok(self.output.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl InferenceProvider for FailingProvider {
        async fn infer(&self, _text: String) -> anyhow::Result<Value> {
            anyhow::bail!("CUDA out of memory")
        }
    }

    fn normalizer(provider: Arc<dyn InferenceProvider>) -> Normalizer {
        Normalizer::new(Arc::new(ProviderHandle::ready(provider)), 512)
    }

    #[tokio::test]
    async fn blank_input_skips_provider() {
        let stub = StubProvider::new(json!([{"label": "LABEL_2", "score": 0.9}]));
        let normalizer = normalizer(stub.clone());

        for text in ["", " ", "\n\t  ", "\u{3000}"] {
            let result = normalizer.normalize(text).await.unwrap();
            assert_eq!(result, SentimentResult::new(SentimentLabel::Neutral, 0.0));
        }
        assert!(stub.calls().is_empty());
    }

    #[tokio::test]
    async fn separator_controls_count_as_blank() {
        let stub = StubProvider::new(json!([{"label": "LABEL_2", "score": 0.9}]));
        let normalizer = normalizer(stub.clone());

        for text in ["\x1f", "\x1c \x1d", "\u{3000}\x1e"] {
            let result = normalizer.normalize(text).await.unwrap();
            assert_eq!(result, SentimentResult::neutral());
        }
        assert!(stub.calls().is_empty());

        normalizer.normalize("\x1fok").await.unwrap();
        assert_eq!(stub.calls(), vec!["\x1fok".to_string()]);
    }

    #[tokio::test]
    async fn blank_input_does_not_load_provider() {
        let handle = Arc::new(ProviderHandle::new(|| async {
            Err::<Arc<dyn InferenceProvider>, _>(anyhow::anyhow!("must not load"))
        }));
        let normalizer = Normalizer::new(handle.clone(), 512);

        assert!(normalizer.normalize("   ").await.is_ok());
        assert!(!handle.is_loaded());
    }

    #[tokio::test]
    async fn single_candidate() {
        let stub = StubProvider::new(json!([{"label": "LABEL_2", "score": 0.93}]));
        let result = normalizer(stub.clone()).normalize("great!").await.unwrap();

        assert_eq!(result, SentimentResult::new(SentimentLabel::Positive, 0.93));
        assert_eq!(stub.calls(), vec!["great!".to_string()]);
    }

    #[tokio::test]
    async fn class_distribution() {
        let stub = StubProvider::new(json!([[
            {"label": "LABEL_0", "score": 0.1},
            {"label": "LABEL_1", "score": 0.2},
            {"label": "LABEL_2", "score": 0.7}
        ]]));
        let result = normalizer(stub).normalize("nice").await.unwrap();

        assert_eq!(result, SentimentResult::new(SentimentLabel::Positive, 0.7));
    }

    #[tokio::test]
    async fn unknown_or_missing_label_is_neutral() {
        let stub = StubProvider::new(json!([{"label": "weird_tag", "score": 0.5}]));
        let result = normalizer(stub).normalize("hmm").await.unwrap();
        assert_eq!(result, SentimentResult::new(SentimentLabel::Neutral, 0.5));

        let stub = StubProvider::new(json!([{"score": 0.4}]));
        let result = normalizer(stub).normalize("hmm").await.unwrap();
        assert_eq!(result, SentimentResult::new(SentimentLabel::Neutral, 0.4));
    }

    #[tokio::test]
    async fn scalar_element_is_shape_error() {
        let stub = StubProvider::new(json!([42]));
        let err = normalizer(stub).normalize("text").await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Shape(_)));
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let err = normalizer(Arc::new(FailingProvider))
            .normalize("text")
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::Provider(_)));
        assert!(err.to_string().contains("CUDA out of memory"));
    }

    #[tokio::test]
    async fn long_input_is_truncated() {
        let stub = StubProvider::new(json!([{"label": "LABEL_1", "score": 0.6}]));
        let text = "é".repeat(2000);
        let result = normalizer(stub.clone()).normalize(&text).await.unwrap();

        assert_eq!(result.label, SentimentLabel::Neutral);
        let calls = stub.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].chars().count(), 512);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 512), "short");
        assert_eq!(truncate_chars("", 3), "");
    }
}
