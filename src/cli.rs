use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use genwire_core::params::{GenerationParams, LoraSlot};

/// Client for a remote image generation backend.
#[derive(Parser, Debug)]
#[command(name = "genwire", version, about = "Image generation backend client")]
pub struct Cli {
    /// Settings file (defaults to ~/.genwire/settings.json).
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Backend base URL, overriding settings.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the current session, fetching one if needed.
    Session,
    /// Call an API method with a JSON object body.
    Call {
        method: String,
        #[arg(long, default_value = "{}")]
        body: String,
    },
    /// Generate images, streaming progress to the log.
    Generate(GenerateArgs),
    /// Forget the persisted session.
    Logout,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    #[arg(long)]
    pub prompt: String,
    #[arg(long)]
    pub negative_prompt: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub images: Option<u32>,
    #[arg(long)]
    pub steps: Option<u32>,
    #[arg(long)]
    pub seed: Option<i64>,
    #[arg(long)]
    pub cfg_scale: Option<f64>,
    #[arg(long)]
    pub width: Option<u32>,
    #[arg(long)]
    pub height: Option<u32>,
    /// `name:weight`, repeatable.
    #[arg(long = "lora", value_parser = parse_lora)]
    pub loras: Vec<LoraSlot>,
    /// Raw backend parameter as `key=value`; JSON values are parsed, anything
    /// else is sent as a string.
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, Value)>,
    /// Stream open timeout, overriding settings.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Fail instead of retrying over HTTP when the stream will not open.
    #[arg(long)]
    pub no_fallback: bool,
}

impl GenerateArgs {
    pub fn to_params(&self) -> GenerationParams {
        GenerationParams {
            negative_prompt: self.negative_prompt.clone(),
            model: self.model.clone(),
            images: self.images,
            steps: self.steps,
            seed: self.seed,
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            loras: self.loras.clone(),
            extra: self.params.iter().cloned().collect(),
            ..GenerationParams::new(self.prompt.clone())
        }
    }
}

fn parse_lora(raw: &str) -> Result<LoraSlot, String> {
    let (name, weight) = match raw.rsplit_once(':') {
        Some((name, weight)) => {
            let weight = weight
                .parse::<f64>()
                .map_err(|_| format!("invalid lora weight in {raw:?}"))?;
            (name, weight)
        }
        None => (raw, 1.0),
    };
    if name.is_empty() {
        return Err(format!("missing lora name in {raw:?}"));
    }
    Ok(LoraSlot::new(name, weight))
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(format!("missing key in {raw:?}"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((key.to_string(), value))
}
