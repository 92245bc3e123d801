//! Model configuration.
//!
//! The defaults reproduce the reference FSFNet: a 3-channel input, a 32/64
//! channel stem, four FSF blocks per stage on 64, 96 and 128 channels, and a
//! 224x224 output map.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

/// One FSF block: its dropout probability and dilation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub dropout: f32,
    pub dilation: usize,
}

impl BlockConfig {
    pub fn new(dropout: f32, dilation: usize) -> Self {
        Self { dropout, dilation }
    }
}

/// A cascade of FSF blocks working at one downsampling rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Channels of every block in the stage.
    pub channels: usize,
    pub kernel_size: usize,
    pub blocks: Vec<BlockConfig>,
}

impl StageConfig {
    /// Blocks with dilations 1, 2, 4, 8 and the given dropout probabilities.
    pub fn cascade(channels: usize, kernel_size: usize, dropouts: [f32; 4]) -> Self {
        let blocks = dropouts
            .iter()
            .zip([1, 2, 4, 8])
            .map(|(&p, d)| BlockConfig::new(p, d))
            .collect();
        Self { channels, kernel_size, blocks }
    }

    fn validate(&self, stage: &str) -> Result<()> {
        if self.channels == 0 {
            return Err(invalid(format!("{}.channels", stage), "must be non-zero"));
        }
        if self.kernel_size == 0 {
            return Err(invalid(format!("{}.kernel_size", stage), "must be non-zero"));
        }
        for (i, block) in self.blocks.iter().enumerate() {
            if !(0.0..1.0).contains(&block.dropout) {
                return Err(invalid(
                    format!("{}.blocks[{}].dropout", stage, i),
                    format!("must be in [0, 1), got {}", block.dropout),
                ));
            }
            if block.dilation == 0 {
                return Err(invalid(format!("{}.blocks[{}].dilation", stage, i), "must be non-zero"));
            }
        }
        Ok(())
    }
}

/// Complete description of an FSFNet instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsfNetConfig {
    pub num_classes: usize,
    pub in_channels: usize,
    /// Output channels of the first stem convolution.
    pub stem_channels: usize,
    pub stage_8: StageConfig,
    pub stage_16: StageConfig,
    pub stage_32: StageConfig,
    pub bn_eps: f32,
    pub bn_momentum: f32,
    /// Spatial size the encoder output is resized to.
    pub output_size: (usize, usize),
    /// Adds a 1x1 prediction convolution with this many outputs at the end
    /// of the encoder.
    pub encoder_classes: Option<usize>,
    /// Adds a stride-1 average pool of this window size after the encoder.
    pub feature_pool: Option<usize>,
    /// Seed for parameter initialization and dropout masks.
    pub seed: u64,
}

impl Default for FsfNetConfig {
    fn default() -> Self {
        Self {
            num_classes: 1,
            in_channels: 3,
            stem_channels: 32,
            stage_8: StageConfig::cascade(64, 3, [0.01, 0.02, 0.03, 0.04]),
            stage_16: StageConfig::cascade(96, 3, [0.05, 0.06, 0.07, 0.08]),
            stage_32: StageConfig::cascade(128, 1, [0.05, 0.06, 0.07, 0.08]),
            bn_eps: 1e-3,
            bn_momentum: 0.1,
            output_size: (224, 224),
            encoder_classes: None,
            feature_pool: None,
            seed: 0,
        }
    }
}

impl FsfNetConfig {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes, ..Default::default() }
    }

    pub fn with_in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    pub fn with_output_size(mut self, height: usize, width: usize) -> Self {
        self.output_size = (height, width);
        self
    }

    pub fn with_encoder_classes(mut self, classes: usize) -> Self {
        self.encoder_classes = Some(classes);
        self
    }

    pub fn with_feature_pool(mut self, window: usize) -> Self {
        self.feature_pool = Some(window);
        self
    }

    pub fn with_bn_eps(mut self, eps: f32) -> Self {
        self.bn_eps = eps;
        self
    }

    pub fn with_bn_momentum(mut self, momentum: f32) -> Self {
        self.bn_momentum = momentum;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets every block's dropout probability to zero.
    pub fn without_dropout(mut self) -> Self {
        for stage in [&mut self.stage_8, &mut self.stage_16, &mut self.stage_32] {
            for block in &mut stage.blocks {
                block.dropout = 0.0;
            }
        }
        self
    }

    /// Channels of the tensor the classifier receives.
    pub fn feature_channels(&self) -> usize {
        self.encoder_classes.unwrap_or(self.stage_32.channels)
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("num_classes", self.num_classes),
            ("in_channels", self.in_channels),
            ("stem_channels", self.stem_channels),
            ("output_size.0", self.output_size.0),
            ("output_size.1", self.output_size.1),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(invalid(field, "must be non-zero"));
            }
        }

        self.stage_8.validate("stage_8")?;
        self.stage_16.validate("stage_16")?;
        self.stage_32.validate("stage_32")?;

        if !(self.bn_eps > 0.0) {
            return Err(invalid("bn_eps", format!("must be positive, got {}", self.bn_eps)));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(invalid("bn_momentum", format!("must be in [0, 1], got {}", self.bn_momentum)));
        }
        if self.encoder_classes == Some(0) {
            return Err(invalid("encoder_classes", "must be non-zero"));
        }
        if let Some(window) = self.feature_pool {
            let (h, w) = self.output_size;
            if window == 0 || window > h || window > w {
                return Err(invalid(
                    "feature_pool",
                    format!("window {} does not fit the {}x{} output", window, h, w),
                ));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_reference_network() {
        let config = FsfNetConfig::new(21);
        assert_eq!(config.num_classes, 21);
        assert_eq!(config.stage_8.channels, 64);
        assert_eq!(config.stage_16.kernel_size, 3);
        assert_eq!(config.stage_32.kernel_size, 1);
        let dilations: Vec<_> = config.stage_16.blocks.iter().map(|b| b.dilation).collect();
        assert_eq!(dilations, [1, 2, 4, 8]);
        assert_eq!(config.stage_8.blocks[3].dropout, 0.04);
        assert_eq!(config.feature_channels(), 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = FsfNetConfig::new(2);
        config.stage_16.blocks[1].dropout = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { ref field, .. }) if field == "stage_16.blocks[1].dropout"
        ));

        let config = FsfNetConfig::new(0);
        assert!(config.validate().is_err());

        let config = FsfNetConfig::new(2).with_output_size(4, 4).with_feature_pool(7);
        assert!(config.validate().is_err());

        let config = FsfNetConfig::new(2).with_bn_eps(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_and_partial_json() {
        let config = FsfNetConfig::new(5).with_output_size(32, 48).with_encoder_classes(7).without_dropout();
        let json = config.to_json_string().unwrap();
        assert_eq!(FsfNetConfig::from_json_str(&json).unwrap(), config);

        let partial = FsfNetConfig::from_json_str(r#"{ "num_classes": 4, "seed": 9 }"#).unwrap();
        assert_eq!(partial.num_classes, 4);
        assert_eq!(partial.seed, 9);
        assert_eq!(partial.output_size, (224, 224));
    }
}
