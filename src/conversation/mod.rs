use std::{env, fs, path::Path, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use minijinja::{context, Environment};
use tracing::{info, warn};

use crate::model::message::Message;

const CHAT_TEMPLATE_NAME: &str = "hf_chat_template";

/// ChatML layout used by the Qwen2 instruct models. Kept byte-compatible
/// with the template shipped in the upstream tokenizer config: a default
/// system turn is injected when the transcript does not start with one.
const DEFAULT_CHAT_TEMPLATE: &str = "{% if messages[0].role != 'system' %}<|im_start|>system\nYou are a helpful assistant<|im_end|>\n{% endif %}{% for message in messages %}<|im_start|>{{ message.role }}\n{{ message.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

/// Append the incoming prompt to the prior turns as a final user message.
/// Ordering of the history is preserved as received.
pub fn build_transcript(history: &[Message], prompt: &str) -> Vec<Message> {
    let mut transcript = Vec::with_capacity(history.len() + 1);
    transcript.extend_from_slice(history);
    transcript.push(Message::user(prompt));
    transcript
}

/// Compiled chat template. Built once at startup and shared read-only with
/// every request.
pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    /// Resolution order: CHAT_TEMPLATE_PATH, chat_template.jinja next to the
    /// model snapshot, then the built-in ChatML template.
    pub fn load(snapshot_dir: Option<&Path>) -> Result<Self> {
        match locate_chat_template(snapshot_dir) {
            Some(path) => {
                info!(path = %path.display(), "using chat template from file");
                let raw = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read chat template {}", path.display()))?;
                Self::from_source(raw)
            }
            None => Self::builtin(),
        }
    }

    pub fn builtin() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(CHAT_TEMPLATE_NAME, DEFAULT_CHAT_TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn from_source(source: String) -> Result<Self> {
        let source = Box::leak(source.into_boxed_str());
        let mut env = Environment::new();
        env.add_template(CHAT_TEMPLATE_NAME, source)
            .map_err(|e| anyhow!("failed to compile chat template: {e}"))?;
        Ok(Self { env })
    }

    /// Linearize a transcript into the single prompt string the model was
    /// trained on. With `add_generation_prompt` the rendered text ends with
    /// the opening marker of an assistant turn.
    pub fn render(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, minijinja::Error> {
        self.env.get_template(CHAT_TEMPLATE_NAME)?.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
        })
    }
}

fn locate_chat_template(snapshot_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(explicit) = env::var_os("CHAT_TEMPLATE_PATH") {
        let candidate = PathBuf::from(explicit);
        if candidate.exists() {
            return Some(candidate);
        }
        warn!(
            path = %candidate.display(),
            "CHAT_TEMPLATE_PATH does not exist"
        );
    }

    let candidate = snapshot_dir?.join("chat_template.jinja");
    candidate.exists().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> Message {
        Message {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn empty_history_yields_single_user_message() {
        let transcript = build_transcript(&[], "Hello");
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, "user");
        assert_eq!(transcript[0].content, "Hello");
    }

    #[test]
    fn prompt_is_appended_after_history_in_order() {
        let history = vec![
            msg("user", "Tell me a story"),
            msg("assistant", "Once upon a time..."),
        ];
        let transcript = build_transcript(&history, "And then?");
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[0].content, "Tell me a story");
        assert_eq!(transcript[1].content, "Once upon a time...");
        assert_eq!(transcript[2].role, "user");
        assert_eq!(transcript[2].content, "And then?");
    }

    #[test]
    fn builtin_template_renders_chatml_turns() {
        let template = ChatTemplate::builtin().unwrap();
        let transcript = build_transcript(&[], "Hello");
        let rendered = template.render(&transcript, true).unwrap();

        assert!(rendered.starts_with("<|im_start|>system\nYou are a helpful assistant<|im_end|>\n"));
        assert!(rendered.contains("<|im_start|>user\nHello<|im_end|>\n"));
        assert!(rendered.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn builtin_template_keeps_existing_system_turn() {
        let template = ChatTemplate::builtin().unwrap();
        let transcript = build_transcript(&[msg("system", "Be terse")], "Hi");
        let rendered = template.render(&transcript, true).unwrap();

        assert!(rendered.starts_with("<|im_start|>system\nBe terse<|im_end|>\n"));
        assert!(!rendered.contains("You are a helpful assistant"));
    }

    #[test]
    fn generation_prompt_marker_is_optional() {
        let template = ChatTemplate::builtin().unwrap();
        let transcript = build_transcript(&[], "Hello");
        let rendered = template.render(&transcript, false).unwrap();
        assert!(!rendered.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn custom_template_source_is_used() {
        let template = ChatTemplate::from_source(
            "{% for message in messages %}{{ message.role }}:{{ message.content }};{% endfor %}"
                .into(),
        )
        .unwrap();
        let transcript = build_transcript(&[msg("user", "a"), msg("assistant", "b")], "c");
        let rendered = template.render(&transcript, true).unwrap();
        assert_eq!(rendered, "user:a;assistant:b;user:c;");
    }
}
