use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{anyhow, Result};

pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2-7B-Instruct";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Hugging Face model id, e.g. "Qwen/Qwen2-7B-Instruct".
    pub model_id: String,
    /// Local snapshot directory. When set, nothing is fetched from the hub.
    pub model_dir: Option<PathBuf>,
    pub bind_addr: String,
    pub static_dir: PathBuf,
    pub max_new_tokens: usize,
    /// Sampling temperature; 0 switches to greedy decoding.
    pub temperature: f64,
    pub top_p: Option<f64>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let model_id = env::var("MODEL_ID").unwrap_or_else(|_| DEFAULT_MODEL_ID.into());
        let model_dir = env::var_os("MODEL_DIR").map(PathBuf::from);
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());
        let static_dir = env::var_os("STATIC_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("static"));

        let max_new_tokens = parse_env("MAX_NEW_TOKENS", 512usize)?;
        let temperature = parse_env("TEMPERATURE", 0.7f64)?;
        let top_p = match env::var("TOP_P") {
            Ok(raw) => Some(
                raw.parse::<f64>()
                    .map_err(|e| anyhow!("invalid TOP_P {raw:?}: {e}"))?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            model_id,
            model_dir,
            bind_addr,
            static_dir,
            max_new_tokens,
            temperature,
            top_p,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    parse_value(key, env::var(key).ok(), default)
}

fn parse_value<T>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {key} {raw:?}: {e}")),
        None => Ok(default),
    }
}
