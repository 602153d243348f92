use serde::{Deserialize, Serialize};

use super::structs::FeatureType;

/// Environment variable naming a TOML file read by [`DriverConfig::from_env`].
pub const CONFIG_ENV: &str = "RHI_CONFIG";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlConfig {
    /// Minimum GLES major version accepted on ES contexts.
    pub required_gles_major: u32,
}

impl Default for GlConfig {
    fn default() -> Self {
        Self {
            required_gles_major: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Keep CPU copies of texture uploads so content survives device loss.
    pub retain_texture_data: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retain_texture_data: true,
        }
    }
}

/// Options for the software device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftConfig {
    pub features: Vec<FeatureType>,
    pub max_texture_size: u32,
    pub max_samples: u32,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            features: vec![
                FeatureType::Vao,
                FeatureType::PackedDepthStencil,
                FeatureType::Depth24,
                FeatureType::Mapbuffer,
                FeatureType::ImgFormatBgra8888,
            ],
            max_texture_size: 4096,
            max_samples: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub surface: SurfaceConfig,
    pub gl: GlConfig,
    pub recovery: RecoveryConfig,
    pub soft: SoftConfig,
}

impl DriverConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        if !path.ends_with(".toml") {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        if !path.ends_with(".toml") {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Load from the file named by `RHI_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = DriverConfig::from_toml_str(
            r#"
            [surface]
            width = 256

            [soft]
            features = ["ETC2", "ASTC"]
            "#,
        )
        .unwrap();
        assert_eq!(config.surface.width, 256);
        assert_eq!(config.surface.height, 720);
        assert_eq!(config.soft.features, vec![FeatureType::Etc2, FeatureType::Astc]);
        assert!(config.recovery.retain_texture_data);
        assert_eq!(config.gl.required_gles_major, 3);
    }

    #[test]
    fn rejects_unknown_extensions() {
        assert!(matches!(
            DriverConfig::load_from_file("driver.yaml"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
