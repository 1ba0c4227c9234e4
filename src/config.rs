//! Operator attribute configuration
//!
//! Supports YAML and JSON formats. Attribute names follow the operator
//! attribute names (`num_heads`, `kv_num_heads`, `mask_filter_value`, ...).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::parallel::ThreadPool;

/// Value added to the logits of masked-out positions unless overridden.
pub const DEFAULT_MASK_FILTER_VALUE: f32 = -10000.0;

/// Attention operator attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub num_heads: usize,

    /// Key/value heads for grouped-query attention; `None` means `num_heads`.
    #[serde(default)]
    pub kv_num_heads: Option<usize>,

    #[serde(default = "default_mask_filter_value")]
    pub mask_filter_value: f32,

    /// Softmax scale. `0.0` selects `1 / sqrt(head_size)`.
    #[serde(default)]
    pub scale: f32,

    /// Causal masking
    #[serde(default)]
    pub unidirectional: bool,

    /// Past and present KV share one fixed-capacity buffer updated in place.
    #[serde(default)]
    pub past_present_share_buffer: bool,

    /// Emit the scaled pre-softmax scores as an extra output.
    #[serde(default)]
    pub output_qk: bool,

    /// Worker threads for a dedicated pool; `None` uses the global pool.
    #[serde(default)]
    pub num_threads: Option<usize>,
}

fn default_mask_filter_value() -> f32 {
    DEFAULT_MASK_FILTER_VALUE
}

impl AttentionConfig {
    pub fn new(num_heads: usize) -> Self {
        Self {
            num_heads,
            kv_num_heads: None,
            mask_filter_value: DEFAULT_MASK_FILTER_VALUE,
            scale: 0.0,
            unidirectional: false,
            past_present_share_buffer: false,
            output_qk: false,
            num_threads: None,
        }
    }

    pub fn with_kv_num_heads(mut self, kv_num_heads: usize) -> Self {
        self.kv_num_heads = Some(kv_num_heads);
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_mask_filter_value(mut self, value: f32) -> Self {
        self.mask_filter_value = value;
        self
    }

    pub fn unidirectional(mut self, enabled: bool) -> Self {
        self.unidirectional = enabled;
        self
    }

    pub fn share_buffer(mut self, enabled: bool) -> Self {
        self.past_present_share_buffer = enabled;
        self
    }

    pub fn output_qk(mut self, enabled: bool) -> Self {
        self.output_qk = enabled;
        self
    }

    pub fn kv_heads(&self) -> usize {
        self.kv_num_heads.unwrap_or(self.num_heads)
    }

    /// Effective softmax scale for `head_size`.
    pub fn resolved_scale(&self, head_size: usize) -> f32 {
        resolve_scale(self.scale, head_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 {
            return Err(Error::Config {
                reason: "num_heads must be > 0".into(),
            });
        }
        if let Some(kv) = self.kv_num_heads {
            if kv == 0 || self.num_heads % kv != 0 {
                return Err(Error::Config {
                    reason: format!(
                        "num_heads ({}) must be a multiple of kv_num_heads ({kv})",
                        self.num_heads
                    ),
                });
            }
        }
        if !self.scale.is_finite() || self.scale < 0.0 {
            return Err(Error::Config {
                reason: format!("scale must be finite and >= 0, got {}", self.scale),
            });
        }
        if !self.mask_filter_value.is_finite() {
            return Err(Error::Config {
                reason: format!(
                    "mask_filter_value must be finite, got {}",
                    self.mask_filter_value
                ),
            });
        }
        if self.num_threads == Some(0) {
            return Err(Error::Config {
                reason: "num_threads must be > 0 when set".into(),
            });
        }
        Ok(())
    }

    /// Worker pool described by `num_threads`.
    pub fn thread_pool(&self) -> Result<ThreadPool> {
        match self.num_threads {
            None => Ok(ThreadPool::default()),
            Some(n) => ThreadPool::new(n),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| Error::Config {
            reason: format!("JSON parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| Error::Config {
            reason: format!("YAML parse error: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json_str(&read_config(path.as_ref())?)
    }

    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml_str(&read_config(path.as_ref())?)
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::Config {
        reason: format!("IO error reading {}: {e}", path.display()),
    })
}

/// `scale == 0` selects `1 / sqrt(head_size)`.
pub fn resolve_scale(scale: f32, head_size: usize) -> f32 {
    if scale == 0.0 {
        (head_size as f32).sqrt().recip()
    } else {
        scale
    }
}
