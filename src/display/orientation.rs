//! Panel orientation, derived once from the printer model.

use log::{debug, info};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How the panel is mounted relative to the framebuffer scan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    /// KS1, KS1M
    Flip180,
    /// K2P, K3, K3V2
    Rotate90,
    /// K3M
    Rotate270,
}

pub const ALL_ORIENTATIONS: [Orientation; 4] = [
    Orientation::Normal,
    Orientation::Flip180,
    Orientation::Rotate90,
    Orientation::Rotate270,
];

impl Orientation {
    pub fn name(self) -> &'static str {
        match self {
            Orientation::Normal => "normal",
            Orientation::Flip180 => "flip-180",
            Orientation::Rotate90 => "rotate-90",
            Orientation::Rotate270 => "rotate-270",
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Orientation::Rotate90 | Orientation::Rotate270)
    }

    /// Output (width, height) for a source of `width` x `height`.
    pub fn output_dims(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Orientation for an Anycubic model id.
    pub fn for_model(model_id: &str) -> Self {
        match model_id {
            "20025" | "20029" => Orientation::Flip180,
            "20026" => Orientation::Rotate270,
            "20021" | "20024" | "20027" => Orientation::Rotate90,
            _ => Orientation::Normal,
        }
    }

    /// Read the model id from `api.cfg` and map it. Falls back to
    /// `Normal` when the file or the key is missing.
    pub fn detect(model_config: &Path) -> Self {
        let contents = match std::fs::read_to_string(model_config) {
            Ok(c) => c,
            Err(e) => {
                info!(
                    "cannot read {} ({}), using default orientation",
                    model_config.display(),
                    e
                );
                return Orientation::Normal;
            }
        };

        match model_id(&contents) {
            Some(id) => {
                let orientation = Self::for_model(&id);
                info!("detected model id {}, orientation {}", id, orientation);
                orientation
            }
            None => {
                info!("model id not found, using default orientation");
                Orientation::Normal
            }
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" | "0" => Ok(Orientation::Normal),
            "flip-180" | "flip180" | "180" => Ok(Orientation::Flip180),
            "rotate-90" | "rotate90" | "90" => Ok(Orientation::Rotate90),
            "rotate-270" | "rotate270" | "270" => Ok(Orientation::Rotate270),
            other => Err(format!("unknown orientation '{}'", other)),
        }
    }
}

/// `modelId` from the config contents.
///
/// The file is JSON on every firmware seen so far; a line scan covers
/// files that the vendor tooling left slightly broken.
fn model_id(contents: &str) -> Option<String> {
    if let Ok(json) = serde_json::from_str::<Value>(contents) {
        if let Some(id) = find_key(&json, "modelId") {
            return Some(id);
        }
    }

    debug!("api.cfg is not valid JSON, scanning lines");
    contents.lines().find_map(|line| {
        let rest = &line[line.find("\"modelId\"")? + "\"modelId\"".len()..];
        let rest = rest.trim_start().strip_prefix(':')?.trim_start();
        let rest = rest.strip_prefix('"')?;
        let end = rest.find('"')?;
        Some(rest[..end].to_string()).filter(|id| !id.is_empty())
    })
}

fn find_key(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return match v {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                };
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}
