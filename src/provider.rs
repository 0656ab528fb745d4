use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::AnalyzeError;

/// A text classifier. Output is the raw, shape-ambiguous JSON a
/// text-classification pipeline produces; see [`crate::output`].
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, text: String) -> Result<Value>;
}

type Loader = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn InferenceProvider>>> + Send + Sync>;

/// Lazily constructed, process-lifetime provider.
///
/// Construction runs at most once even when several requests arrive before it
/// finishes; they all wait on the same load. A failed load is not cached.
pub struct ProviderHandle {
    cell: OnceCell<Arc<dyn InferenceProvider>>,
    loader: Loader,
}

impl ProviderHandle {
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn InferenceProvider>>> + Send + 'static,
    {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(move || loader().boxed()),
        }
    }

    /// Handle around an already constructed provider.
    #[cfg(test)]
    pub fn ready(provider: Arc<dyn InferenceProvider>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(provider)),
            loader: Box::new(|| {
                async { Err::<Arc<dyn InferenceProvider>, _>(anyhow::anyhow!("preloaded")) }
                    .boxed()
            }),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn InferenceProvider>, AnalyzeError> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!("Loading inference provider");
                counter!("provider_loads_total").increment(1);
                let provider = (self.loader)().await?;
                tracing::info!("Inference provider loaded");
                Ok::<_, anyhow::Error>(provider)
            })
            .await
            .cloned()
            .map_err(|e| {
                tracing::error!(error = %e, "Inference provider failed to load");
                AnalyzeError::ProviderInit(e)
            })
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixed;

    #[async_trait]
    impl InferenceProvider for Fixed {
        async fn infer(&self, _text: String) -> Result<Value> {
            Ok(json!([{"label": "LABEL_1", "score": 1.0}]))
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counted = loads.clone();
        let handle = Arc::new(ProviderHandle::new(move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, anyhow::Error>(Arc::new(Fixed) as Arc<dyn InferenceProvider>)
            }
        }));

        assert!(!handle.is_loaded());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.get().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(handle.is_loaded());
    }

    #[tokio::test]
    async fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counted = attempts.clone();
        let handle = ProviderHandle::new(move || {
            let attempt = counted.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("weights not found");
                }
                Ok(Arc::new(Fixed) as Arc<dyn InferenceProvider>)
            }
        });

        let err = handle.get().await.err().unwrap();
        assert!(matches!(err, AnalyzeError::ProviderInit(_)));
        assert!(err.to_string().contains("weights not found"));
        assert!(!handle.is_loaded());

        assert!(handle.get().await.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
