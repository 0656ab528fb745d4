use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    /// Provider output nested in a form outside the accepted shapes.
    #[error("unexpected provider output: {0}")]
    Shape(String),

    #[error("failed to load inference provider: {0:#}")]
    ProviderInit(anyhow::Error),

    #[error("inference failed: {0:#}")]
    Provider(anyhow::Error),

    #[error("analysis panicked: {0}")]
    Panicked(String),
}

impl AnalyzeError {
    /// Stable tag for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shape(_) => "shape",
            Self::ProviderInit(_) => "provider_init",
            Self::Provider(_) => "provider",
            Self::Panicked(_) => "panic",
        }
    }

    /// Shape violations are an expected normalization failure; everything else
    /// means the provider or the process misbehaved.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Shape(_))
    }

    /// Untruncated diagnostic text: the cause chain, plus a backtrace when
    /// `RUST_BACKTRACE` enabled one.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::ProviderInit(err) | Self::Provider(err) => format!("{}: {err:?}", self.kind()),
            Self::Shape(_) | Self::Panicked(_) => format!("{}: {self}", self.kind()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalyzeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn only_shape_errors_are_expected() {
        assert!(AnalyzeError::Shape("number".into()).is_expected());
        assert!(!AnalyzeError::Provider(anyhow::anyhow!("oom")).is_expected());
        assert!(!AnalyzeError::Panicked("boom".into()).is_expected());
    }

    #[test]
    fn diagnostic_includes_cause_chain() {
        let err: anyhow::Result<()> = Err(anyhow::anyhow!("out of memory"));
        let err = AnalyzeError::Provider(err.context("forward pass").unwrap_err());
        let diagnostic = err.diagnostic();
        assert!(diagnostic.starts_with("provider: forward pass"));
        assert!(diagnostic.contains("out of memory"));
    }
}
