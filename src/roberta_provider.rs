use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_nn::ops::softmax;
use candle_transformers::models::xlm_roberta::{
    Config as RobertaConfig, XLMRobertaForSequenceClassification,
};
use hf_hub::{Repo, RepoType, api::tokio::Api, api::tokio::ApiRepo};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::models::bpe::BPE;
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::processors::roberta::RobertaProcessing;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

use crate::provider::InferenceProvider;

#[derive(Debug, Clone)]
pub struct RobertaConfigOptions {
    pub model_id: String,
    pub model_path: Option<PathBuf>,
    pub revision: String,
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
    pub id2label: Option<HashMap<u32, String>>,
    /// Emit only the best class instead of the whole distribution.
    pub top_only: bool,
}

/// Where model files come from: a local directory or a hub repo.
enum ModelSource {
    Local(PathBuf),
    Hub(ApiRepo),
}

#[derive(Debug, PartialEq)]
enum TokenizerFiles {
    Json(PathBuf),
    /// Checkpoints that predate `tokenizer.json` ship the byte-level BPE files.
    Bpe { vocab: PathBuf, merges: PathBuf },
}

#[derive(Debug, PartialEq)]
enum WeightsFile {
    Safetensors(PathBuf),
    Pth(PathBuf),
}

#[derive(Debug)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: TokenizerFiles,
    weights: WeightsFile,
}

impl ModelSource {
    async fn fetch(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Local(base_path) => {
                let path = base_path.join(name);
                if !path.is_file() {
                    bail!("{} not found", path.display());
                }
                Ok(path)
            }
            Self::Hub(api) => api
                .get(name)
                .await
                .with_context(|| format!("fetching {name}")),
        }
    }

    async fn resolve(&self, use_pth: bool) -> Result<ModelFiles> {
        let config = self.fetch("config.json").await?;

        let tokenizer = match self.fetch("tokenizer.json").await {
            Ok(path) => TokenizerFiles::Json(path),
            Err(e) => {
                tracing::info!(error = %e, "No tokenizer.json, using vocab.json and merges.txt");
                TokenizerFiles::Bpe {
                    vocab: self.fetch("vocab.json").await?,
                    merges: self.fetch("merges.txt").await?,
                }
            }
        };

        let weights = if use_pth {
            WeightsFile::Pth(self.fetch("pytorch_model.bin").await?)
        } else {
            match self.fetch("model.safetensors").await {
                Ok(path) => WeightsFile::Safetensors(path),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "No safetensors weights, falling back to pytorch_model.bin"
                    );
                    WeightsFile::Pth(self.fetch("pytorch_model.bin").await?)
                }
            }
        };

        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }
}

struct Classifier {
    model: XLMRobertaForSequenceClassification,
    tokenizer: Tokenizer,
    device: Device,
    id2label: HashMap<u32, String>,
}

/// RoBERTa sequence classifier producing text-classification pipeline output.
pub struct RobertaProvider {
    classifier: Arc<Classifier>,
    top_only: bool,
}

impl RobertaProvider {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    #[tracing::instrument(skip(config), fields(model_id = %config.model_id, cpu = config.cpu))]
    pub async fn new(config: RobertaConfigOptions) -> Result<Self> {
        let device = Self::device(config.cpu)?;

        // Local directory wins over the hub
        let source = match &config.model_path {
            Some(base_path) => {
                if !base_path.is_dir() {
                    bail!("Model path {} is not a directory.", base_path.display());
                }
                ModelSource::Local(base_path.clone())
            }
            None => {
                let repo = Repo::with_revision(
                    config.model_id.clone(),
                    RepoType::Model,
                    config.revision.clone(),
                );
                ModelSource::Hub(Api::new()?.repo(repo))
            }
        };
        let files = source.resolve(config.use_pth).await?;
        tracing::debug!(?files, "Model files resolved");

        let raw_config: Value = serde_json::from_str(
            &std::fs::read_to_string(&files.config)
                .with_context(|| format!("reading {}", files.config.display()))?,
        )?;

        // Command-line id2label takes precedence over the model config's.
        let id2label = match config.id2label {
            Some(id2label) => id2label,
            None => config_id2label(&raw_config).context(
                "Id2Label not found in the model configuration nor specified as a parameter",
            )?,
        };
        let pad_token_id = pad_token_id(&raw_config)?;
        let model_config = model_config(raw_config)?;

        let mut tokenizer = match &files.tokenizer {
            TokenizerFiles::Json(path) => Tokenizer::from_file(path)
                .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?,
            TokenizerFiles::Bpe { vocab, merges } => bpe_tokenizer(vocab, merges)?,
        };
        tokenizer.with_padding(Some(PaddingParams {
            pad_id: pad_token_id,
            pad_token: "<pad>".to_string(),
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_sequence_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;

        let vb = match &files.weights {
            WeightsFile::Pth(path) => VarBuilder::from_pth(path, DType::F32, &device)?,
            // SAFETY: the weights file is not modified while mapped.
            WeightsFile::Safetensors(path) => unsafe {
                VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)?
            },
        };

        let num_labels = id2label.keys().max().map_or(0, |&max| max as usize + 1);
        let model = XLMRobertaForSequenceClassification::new(num_labels, &model_config, vb)?;
        tracing::info!(num_labels, "Sentiment model constructed");

        Ok(Self {
            classifier: Arc::new(Classifier {
                model,
                tokenizer,
                device,
                id2label,
            }),
            top_only: config.top_only,
        })
    }
}

/// Byte-level BPE tokenizer with RoBERTa's `<s> .. </s>` framing.
fn bpe_tokenizer(vocab: &Path, merges: &Path) -> Result<Tokenizer> {
    let bpe = BPE::from_file(&vocab.to_string_lossy(), &merges.to_string_lossy())
        .unk_token("<unk>".to_string())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build BPE model: {e}"))?;

    let mut tokenizer = Tokenizer::new(bpe);
    let special = |token: &str| {
        tokenizer
            .token_to_id(token)
            .map(|id| (token.to_string(), id))
            .with_context(|| format!("{token} missing from {}", vocab.display()))
    };
    let (cls, sep) = (special("<s>")?, special("</s>")?);

    tokenizer.with_pre_tokenizer(Some(ByteLevel::default().add_prefix_space(false)));
    tokenizer.with_decoder(Some(ByteLevel::default()));
    tokenizer.with_post_processor(Some(
        RobertaProcessing::new(sep, cls)
            .trim_offsets(true)
            .add_prefix_space(false),
    ));
    Ok(tokenizer)
}

fn config_id2label(raw_config: &Value) -> Option<HashMap<u32, String>> {
    let map = raw_config.get("id2label")?.as_object()?;
    let id2label: HashMap<u32, String> = map
        .iter()
        .filter_map(|(id, label)| Some((id.parse().ok()?, label.as_str()?.to_string())))
        .collect();
    (!id2label.is_empty()).then_some(id2label)
}

/// RoBERTa pads with id 1 unless the config says otherwise.
fn pad_token_id(raw_config: &Value) -> Result<u32> {
    match raw_config.get("pad_token_id") {
        None | Some(Value::Null) => Ok(1),
        Some(value) => {
            let id = value
                .as_u64()
                .with_context(|| format!("pad_token_id {value} is not an unsigned integer"))?;
            u32::try_from(id).with_context(|| format!("pad_token_id {id} does not fit in u32"))
        }
    }
}

/// Older RoBERTa checkpoints predate `position_embedding_type`.
fn model_config(mut raw_config: Value) -> Result<RobertaConfig> {
    if let Some(object) = raw_config.as_object_mut() {
        object
            .entry("position_embedding_type")
            .or_insert_with(|| json!("absolute"));
    }
    serde_json::from_value(raw_config).context("parsing model config")
}

impl Classifier {
    /// Softmax probabilities over the classes.
    fn probabilities(&self, text: String) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let attention_mask =
            Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;
        // RoBERTa has no segment embeddings in use
        let token_type_ids = input_ids.zeros_like()?;

        let logits = self
            .model
            .forward(&input_ids, &attention_mask, &token_type_ids)?;
        Ok(softmax(&logits, 1)?.squeeze(0)?.to_vec1::<f32>()?)
    }
}

fn label_name(id2label: &HashMap<u32, String>, index: usize) -> String {
    id2label
        .get(&(index as u32))
        .cloned()
        .unwrap_or_else(|| format!("LABEL_{index}"))
}

/// `[[{label, score}, ..]]` for the whole distribution, `[{label, score}]` for
/// the best class only.
fn pipeline_output(id2label: &HashMap<u32, String>, probs: &[f32], top_only: bool) -> Value {
    let entry = |index: usize, score: f32| json!({"label": label_name(id2label, index), "score": score});

    if top_only {
        let best = probs
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (index, &score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((index, score)),
            });
        match best {
            Some((index, score)) => json!([entry(index, score)]),
            None => json!([]),
        }
    } else {
        let distribution: Vec<Value> = probs
            .iter()
            .enumerate()
            .map(|(index, &score)| entry(index, score))
            .collect();
        json!([distribution])
    }
}

#[async_trait]
impl InferenceProvider for RobertaProvider {
    #[tracing::instrument(skip(self, text), fields(text_len = text.len()))]
    async fn infer(&self, text: String) -> Result<Value> {
        let classifier = self.classifier.clone();
        let top_only = self.top_only;

        // Forward passes block, keep them off the runtime threads
        tokio::task::spawn_blocking(move || -> Result<Value> {
            let probs = classifier.probabilities(text)?;
            Ok(pipeline_output(&classifier.id2label, &probs, top_only))
        })
        .await?
    }
}
