//! Structured generation parameters and their flat wire form.
//!
//! The backend takes a single-level string-keyed record. Repeated slots are
//! numbered from 1 (`lora1`, `lora1weight`, `controlnet2strength`, ...).
//! Optional fields that are unset are omitted rather than sent as null.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type FlatParams = Map<String, Value>;

/// Key carrying the requested image count.
pub const IMAGES_KEY: &str = "images";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub images: Option<u32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default)]
    pub cfg_scale: Option<f64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub sampler: Option<String>,
    #[serde(default)]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub loras: Vec<LoraSlot>,
    #[serde(default)]
    pub controlnets: Vec<ControlNetSlot>,
    /// Copied verbatim after every structured field, so it can override them.
    #[serde(default)]
    pub extra: FlatParams,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoraSlot {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub textenc_weight: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlNetSlot {
    pub model: String,
    pub strength: f64,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub start: Option<f64>,
    #[serde(default)]
    pub end: Option<f64>,
}

impl LoraSlot {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            textenc_weight: None,
        }
    }
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn flatten(&self) -> FlatParams {
        let mut flat = FlatParams::new();
        flat.insert("prompt".into(), Value::from(self.prompt.clone()));
        insert_opt(&mut flat, "negativeprompt", self.negative_prompt.clone());
        insert_opt(&mut flat, "model", self.model.clone());
        insert_opt(&mut flat, IMAGES_KEY, self.images);
        insert_opt(&mut flat, "seed", self.seed);
        insert_opt(&mut flat, "steps", self.steps);
        insert_opt(&mut flat, "cfgscale", self.cfg_scale);
        insert_opt(&mut flat, "width", self.width);
        insert_opt(&mut flat, "height", self.height);
        insert_opt(&mut flat, "sampler", self.sampler.clone());
        insert_opt(&mut flat, "scheduler", self.scheduler.clone());

        for (i, lora) in self.loras.iter().enumerate() {
            let n = i + 1;
            flat.insert(format!("lora{n}"), Value::from(lora.name.clone()));
            flat.insert(format!("lora{n}weight"), Value::from(lora.weight));
            insert_opt(&mut flat, &format!("lora{n}textencweight"), lora.textenc_weight);
        }

        for (i, cn) in self.controlnets.iter().enumerate() {
            let n = i + 1;
            flat.insert(format!("controlnet{n}"), Value::from(cn.model.clone()));
            flat.insert(format!("controlnet{n}strength"), Value::from(cn.strength));
            insert_opt(&mut flat, &format!("controlnet{n}image"), cn.image.clone());
            insert_opt(&mut flat, &format!("controlnet{n}start"), cn.start);
            insert_opt(&mut flat, &format!("controlnet{n}end"), cn.end);
        }

        for (key, value) in &self.extra {
            flat.insert(key.clone(), value.clone());
        }
        flat
    }
}

fn insert_opt<T: Into<Value>>(flat: &mut FlatParams, key: &str, value: Option<T>) {
    if let Some(v) = value {
        flat.insert(key.to_string(), v.into());
    }
}

/// Remove the image count from a flat bag, defaulting to 1.
///
/// Accepts numbers and numeric strings; anything else counts as unset.
pub fn take_image_count(flat: &mut FlatParams) -> u64 {
    let count = match flat.remove(IMAGES_KEY) {
        Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    count.filter(|c| *c > 0).unwrap_or(1)
}
