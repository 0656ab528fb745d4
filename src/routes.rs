use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use futures::FutureExt;
use metrics::counter;
use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::error::AnalyzeError;
use crate::normalizer::{Normalizer, truncate_chars};
use crate::types::{AnalyzeRequest, Health, SentimentLabel, SentimentResult};

/// Upper bound on the `trace` field of a degraded response.
pub const MAX_TRACE_CHARS: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    normalizer: Normalizer,
}

impl AppState {
    pub fn new(normalizer: Normalizer) -> Self {
        Self { normalizer }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/analyze", post(analyze_handler))
        .with_state(state)
}

async fn health_handler() -> Json<Health> {
    Json(Health { ok: true })
}

/// Always answers 200 with a sentiment-shaped body. Failures come back as a
/// neutral result carrying `error` and `trace`.
#[tracing::instrument(
    skip(state, request),
    fields(request_id = %uuid::Uuid::new_v4().simple(), text_len = request.text.len())
)]
async fn analyze_handler(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Json<SentimentResult> {
    counter!("analyze_requests_total").increment(1);

    let outcome = AssertUnwindSafe(state.normalizer.normalize(&request.text))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(AnalyzeError::Panicked(panic_message(&*panic))));

    match outcome {
        Ok(result) => {
            counter!("analyze_label_total", "label" => result.label.as_str()).increment(1);
            tracing::info!(label = %result.label, score = result.score, "Analysis completed");
            Json(result)
        }
        Err(err) => Json(degraded(&err)),
    }
}

pub fn degraded(err: &AnalyzeError) -> SentimentResult {
    counter!("analyze_degraded_total", "kind" => err.kind()).increment(1);
    if err.is_expected() {
        tracing::warn!(kind = err.kind(), error = %err, "Returning degraded result");
    } else {
        tracing::error!(kind = err.kind(), error = %err, "Returning degraded result");
    }

    SentimentResult {
        label: SentimentLabel::Neutral,
        score: 0.0,
        error: Some(err.to_string()),
        trace: Some(truncate_chars(&err.diagnostic(), MAX_TRACE_CHARS).to_string()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
