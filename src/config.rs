use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Default config per dataset, in lookup priority order.
///
/// The model identifier is matched case-sensitively against each key in turn;
/// the first hit wins and an identifier matching none falls back to the first
/// entry.
pub const DEFAULT_CONFIGS: [(&str, &str); 3] = [
    ("nyu", "cfgs/nyu.yaml"),
    ("scannet", "cfgs/scannet.yaml"),
    ("kitti", "cfgs/kitti.yaml"),
];

pub fn resolve_config_path(model: &Path, explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    let identifier = model.to_string_lossy();
    let (dataset, path) = DEFAULT_CONFIGS
        .iter()
        .copied()
        .find(|(dataset, _)| identifier.contains(dataset))
        .unwrap_or(DEFAULT_CONFIGS[0]);

    debug!(model = %identifier, dataset, "resolved default config");
    PathBuf::from(path)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct InputConfig {
    pub height: usize,
    pub width: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct StructureConfig {
    pub features: usize,
    pub min_depth: f32,
    pub max_depth: f32,
    pub init_depth: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct MotionConfig {
    pub hidden: usize,
    pub step_scale: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields)]
pub struct Deepv2dConfig {
    pub input: InputConfig,
    pub structure: StructureConfig,
    pub motion: MotionConfig,
}

impl Default for Deepv2dConfig {
    fn default() -> Self {
        Self {
            input: InputConfig {
                height: 240,
                width: 320,
            },
            structure: StructureConfig {
                features: 32,
                min_depth: 0.1,
                max_depth: 10.0,
                init_depth: 2.0,
            },
            motion: MotionConfig {
                hidden: 64,
                step_scale: 0.1,
            },
        }
    }
}

impl Deepv2dConfig {
    /// Loads a YAML file and merges it over the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        let config = Self::from_yaml(&text).map_err(|err| match err {
            Error::Config { source, .. } => Error::Config {
                path: path.to_path_buf(),
                source,
            },
            Error::UnknownConfigKey { key, .. } => Error::UnknownConfigKey {
                path: path.to_path_buf(),
                key,
            },
            other => other,
        })?;

        info!(
            path = %path.display(),
            height = config.input.height,
            width = config.input.width,
            "loaded config"
        );
        Ok(config)
    }

    /// Only keys that exist in the defaults may be overridden.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let to_error = |source| Error::Config {
            path: PathBuf::new(),
            source,
        };

        let overlay: Value = serde_yaml::from_str(text).map_err(to_error)?;
        let mut merged = serde_yaml::to_value(Self::default()).map_err(to_error)?;
        merge_value(&mut merged, overlay, "")?;
        serde_yaml::from_value(merged).map_err(to_error)
    }
}

fn merge_value(base: &mut Value, overlay: Value, path: &str) -> Result<()> {
    match (base, overlay) {
        (_, Value::Null) => Ok(()),
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let name = match key.as_str() {
                    Some(name) => name.to_string(),
                    None => format!("{key:?}"),
                };
                let child = if path.is_empty() {
                    name
                } else {
                    format!("{path}.{name}")
                };

                match base_map.get_mut(&key) {
                    Some(slot) => merge_value(slot, value, &child)?,
                    None => {
                        return Err(Error::UnknownConfigKey {
                            path: PathBuf::new(),
                            key: child,
                        });
                    }
                }
            }
            Ok(())
        }
        (slot, value) => {
            *slot = value;
            Ok(())
        }
    }
}
