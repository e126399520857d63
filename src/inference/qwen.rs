use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, slice};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::qwen2::{Config as QwenConfig, ModelForCausalLM as Qwen};
use hf_hub::api::sync::Api;
use tokenizers::Tokenizer;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::ServerConfig;
use crate::inference::ChatModel;

const EOS_TOKENS: &[&str] = &["<|im_end|>", "<|endoftext|>"];

/// Resolved paths for one model snapshot, either a local directory or files
/// fetched into the hub cache.
pub struct ModelFiles {
    pub snapshot_dir: PathBuf,
    pub tokenizer: PathBuf,
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn resolve(config: &ServerConfig) -> Result<Self> {
        match &config.model_dir {
            Some(dir) => Self::from_local(dir),
            None => Self::from_hub(&config.model_id),
        }
    }

    fn from_local(dir: &Path) -> Result<Self> {
        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.exists() {
            let index: serde_json::Value = serde_json::from_slice(&fs::read(&index_path)?)?;
            shard_files_from_index(&index)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };

        Ok(Self {
            snapshot_dir: dir.to_path_buf(),
            tokenizer: dir.join("tokenizer.json"),
            config: dir.join("config.json"),
            weights,
        })
    }

    fn from_hub(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.model(model_id.to_string());

        let tokenizer = repo.get("tokenizer.json")?;
        let config = repo.get("config.json")?;

        // Sharded checkpoints carry an index file; small models ship a
        // single safetensors file.
        let weights = match repo.get("model.safetensors.index.json") {
            Ok(index_path) => {
                let index: serde_json::Value = serde_json::from_slice(&fs::read(&index_path)?)?;
                shard_files_from_index(&index)?
                    .iter()
                    .map(|name| repo.get(name))
                    .collect::<Result<Vec<_>, _>>()?
            }
            Err(_) => vec![repo.get("model.safetensors")?],
        };

        let snapshot_dir = tokenizer
            .parent()
            .context("tokenizer path has no parent directory")?
            .to_path_buf();

        Ok(Self {
            snapshot_dir,
            tokenizer,
            config,
            weights,
        })
    }
}

fn shard_files_from_index(index: &serde_json::Value) -> Result<Vec<String>> {
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("model.safetensors.index.json: weight_map is not an object"))?;

    let files: BTreeSet<&str> = weight_map
        .values()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| anyhow!("invalid shard entry in weight index"))
        })
        .collect::<Result<_>>()?;

    Ok(files.into_iter().map(String::from).collect())
}

/// Qwen2 causal LM plus its tokenizer, loaded once and shared across
/// requests. The mutex guards the KV cache inside the model.
pub struct QwenEngine {
    model: Arc<Mutex<Qwen>>,
    tokenizer: Arc<Tokenizer>,
    device: Device,
    eos_ids: Vec<u32>,
    temperature: Option<f64>,
    top_p: Option<f64>,
}

impl QwenEngine {
    pub fn load(files: &ModelFiles, config: &ServerConfig) -> Result<Self> {
        let device = pick_device()?;
        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };

        let tokenizer = Arc::new(
            Tokenizer::from_file(&files.tokenizer).map_err(|e| anyhow!("tokenizer error: {e}"))?,
        );

        let cfg: QwenConfig = serde_json::from_slice(&fs::read(&files.config)?)
            .context("failed to parse model config.json")?;

        info!(
            shards = files.weights.len(),
            ?device,
            "mmapping model weights"
        );
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
        let model = Qwen::new(&cfg, vb)?;

        let eos_ids = EOS_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_to_id(t))
            .collect::<Vec<_>>();
        if eos_ids.is_empty() {
            return Err(anyhow!("tokenizer defines none of {EOS_TOKENS:?}"));
        }

        info!(model_id = %config.model_id, "model loaded");

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer,
            device,
            eos_ids,
            temperature: (config.temperature > 0.0).then_some(config.temperature),
            top_p: config.top_p,
        })
    }
}

#[async_trait]
impl ChatModel for QwenEngine {
    async fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<String> {
        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("tokenizer encode error: {e}"))?;
        let prompt_tokens = enc.get_ids().to_vec();
        if prompt_tokens.is_empty() {
            return Err(anyhow!("prompt tokenized to an empty sequence"));
        }

        let mut lp = LogitsProcessor::new(seed(), self.temperature, self.top_p);

        // The KV cache inside the model belongs to exactly one request at a
        // time, so the lock is held across the whole generation.
        let tokens = {
            let mut m = self.model.lock().await;
            decode_tokens(
                &mut *m,
                &self.device,
                &prompt_tokens,
                max_new_tokens,
                &mut lp,
                &self.eos_ids,
            )?
        };

        let generated = new_tokens(&tokens, prompt_tokens.len());
        if generated.is_empty() {
            return Ok(String::new());
        }

        let text = self
            .tokenizer
            .decode(generated, true)
            .map_err(|e| anyhow!("tokenizer decode error: {e}"))?;

        Ok(text)
    }
}

/// Minimal surface of a causal LM with an internal KV cache. Lets the
/// decode loop run against a scripted stand-in under test.
trait CausalLm {
    fn clear_kv_cache(&mut self);
    fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor>;
}

impl CausalLm for Qwen {
    fn clear_kv_cache(&mut self) {
        Qwen::clear_kv_cache(self)
    }

    fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor> {
        Qwen::forward(self, input, pos)
    }
}

/// One full generation against an exclusively borrowed model: reset the KV
/// cache, feed the prompt, then extend token by token until EOS or the
/// budget runs out. Returns prompt plus generated tokens.
fn decode_tokens<M: CausalLm>(
    lm: &mut M,
    device: &Device,
    prompt: &[u32],
    max_new_tokens: usize,
    lp: &mut LogitsProcessor,
    eos_ids: &[u32],
) -> Result<Vec<u32>> {
    lm.clear_kv_cache();

    let mut tokens = prompt.to_vec();
    let mut pos = 0usize;

    for _ in 0..max_new_tokens {
        // First step feeds the whole prompt, later steps only the last
        // token; the KV cache holds the rest.
        let ctx: &[u32] = if pos == 0 {
            &tokens
        } else {
            slice::from_ref(tokens.last().unwrap())
        };

        let input = Tensor::new(ctx, device)?.unsqueeze(0)?;

        let out = lm.forward(&input, pos)?;
        let seq_len = out.dim(1)?;
        let logits = out.i((0, seq_len - 1))?.to_dtype(DType::F32)?;

        pos += ctx.len();

        let next = lp.sample(&logits)?;
        tokens.push(next);

        if eos_ids.contains(&next) {
            break;
        }
    }

    Ok(tokens)
}

/// Tokens produced after the input sequence. Decoding only this slice is
/// what keeps the caller's prompt out of the response.
fn new_tokens(tokens: &[u32], prompt_len: usize) -> &[u32] {
    &tokens[prompt_len.min(tokens.len())..]
}

fn pick_device() -> Result<Device> {
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shard_index_dedupes_and_sorts_files() {
        let index = json!({
            "weight_map": {
                "model.embed_tokens.weight": "model-00001-of-00002.safetensors",
                "model.layers.0.mlp.down_proj.weight": "model-00001-of-00002.safetensors",
                "lm_head.weight": "model-00002-of-00002.safetensors",
            }
        });
        let files = shard_files_from_index(&index).unwrap();
        assert_eq!(
            files,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn shard_index_rejects_missing_weight_map() {
        let index = json!({ "metadata": {} });
        assert!(shard_files_from_index(&index).is_err());
    }

    /// Emits a fixed token sequence and records how it was driven.
    struct ScriptedLm {
        script: Vec<u32>,
        step: usize,
        vocab: usize,
        cache_clears: usize,
        ctx_lens: Vec<usize>,
        positions: Vec<usize>,
    }

    impl ScriptedLm {
        fn new(script: Vec<u32>, vocab: usize) -> Self {
            Self {
                script,
                step: 0,
                vocab,
                cache_clears: 0,
                ctx_lens: Vec::new(),
                positions: Vec::new(),
            }
        }
    }

    impl CausalLm for ScriptedLm {
        fn clear_kv_cache(&mut self) {
            self.cache_clears += 1;
        }

        fn forward(&mut self, input: &Tensor, pos: usize) -> candle_core::Result<Tensor> {
            self.ctx_lens.push(input.dim(1)?);
            self.positions.push(pos);

            let next = self.script[self.step.min(self.script.len() - 1)];
            self.step += 1;

            let mut logits = vec![0f32; self.vocab];
            logits[next as usize] = 10.0;
            Tensor::new(logits.as_slice(), &Device::Cpu)?.reshape((1, 1, self.vocab))
        }
    }

    fn greedy() -> LogitsProcessor {
        LogitsProcessor::new(0, None, None)
    }

    #[test]
    fn decode_stops_at_eos() {
        let mut lm = ScriptedLm::new(vec![7, 8, 9], 16);
        let tokens = decode_tokens(&mut lm, &Device::Cpu, &[1, 2, 3], 512, &mut greedy(), &[9])
            .unwrap();
        assert_eq!(tokens, vec![1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn decode_respects_the_token_budget() {
        let mut lm = ScriptedLm::new(vec![7], 16);
        let tokens =
            decode_tokens(&mut lm, &Device::Cpu, &[1, 2], 4, &mut greedy(), &[9]).unwrap();
        assert_eq!(tokens.len(), 2 + 4);
    }

    #[test]
    fn decode_owns_the_cache_for_one_full_generation() {
        // The cache is reset exactly once, the prompt is fed whole at
        // position 0 and every later step extends it by one token. A second
        // request interleaving on the same cache would break this shape.
        let mut lm = ScriptedLm::new(vec![7, 8, 9], 16);
        decode_tokens(&mut lm, &Device::Cpu, &[1, 2, 3], 512, &mut greedy(), &[9]).unwrap();

        assert_eq!(lm.cache_clears, 1);
        assert_eq!(lm.ctx_lens, vec![3, 1, 1]);
        assert_eq!(lm.positions, vec![0, 3, 4]);
    }

    #[test]
    fn new_tokens_excludes_the_prompt() {
        let tokens = vec![1, 2, 3, 7, 8, 9];
        assert_eq!(new_tokens(&tokens, 3), &[7, 8, 9]);
    }

    #[test]
    fn new_tokens_is_empty_when_nothing_was_generated() {
        assert!(new_tokens(&[1, 2], 2).is_empty());
        assert!(new_tokens(&[], 0).is_empty());
    }
}
