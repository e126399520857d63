pub mod qwen;

use anyhow::Result;
use async_trait::async_trait;

/// Seam between the HTTP layer and the loaded model. Handlers depend only
/// on this trait; tests substitute a fake implementation.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run generation on an already-formatted prompt and return only the
    /// newly generated text, with model control tokens stripped.
    async fn generate(&self, prompt: &str, max_new_tokens: usize) -> Result<String>;
}
