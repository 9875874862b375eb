//! Elevation layer configuration schema and I/O.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CachePolicy;
use crate::cache::memory::DEFAULT_MEMORY_BUDGET_MB;
use crate::error::{ElevationError, ElevationResult};

/// What to do with samples that are still no data after compositing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NoDataPolicy {
    /// Fill gaps from neighbouring valid samples
    #[default]
    #[serde(rename = "interpolate", alias = "default")]
    Interpolate,
    /// Treat gaps as sea level
    #[serde(rename = "msl", alias = "mean_sea_level")]
    MeanSeaLevel,
}

/// Options for one elevation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationLayerOptions {
    /// Human-readable layer name, used in log messages
    pub name: String,

    pub enabled: bool,

    /// Layer supplies relief added on top of the base elevation
    pub offset: bool,

    /// Vertical datum override for the source's profile (e.g., "egm96")
    #[serde(alias = "vsrs", skip_serializing_if = "Option::is_none")]
    pub vdatum: Option<String>,

    pub nodata_policy: NoDataPolicy,

    /// Raw value the source uses for "no data"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_data_value: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_valid_value: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_valid_value: Option<f32>,

    /// Requests below this level are not served by the layer
    pub min_level: u32,

    /// Deepest level the layer reads; deeper keys resolve to ancestors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_data_level: Option<u32>,

    /// Overrides the source's native tile size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_size: Option<u32>,

    pub cache_policy: CachePolicy,

    /// Memory tier budget in MB; 0 disables the tier
    pub memory_cache_mb: u32,

    /// Allow `write_height_field` to reach the source
    pub writing_requested: bool,
}

impl Default for ElevationLayerOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            offset: false,
            vdatum: None,
            nodata_policy: NoDataPolicy::default(),
            no_data_value: Some(-32767.0),
            min_valid_value: Some(-32766.0),
            max_valid_value: Some(32768.0),
            min_level: 0,
            max_data_level: None,
            tile_size: None,
            cache_policy: CachePolicy::default(),
            memory_cache_mb: DEFAULT_MEMORY_BUDGET_MB,
            writing_requested: false,
        }
    }
}

impl ElevationLayerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> ElevationResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn load(path: &Path) -> ElevationResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Save options to a JSON file
    pub fn save(&self, path: &Path) -> ElevationResult<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> ElevationResult<()> {
        if let (Some(min), Some(max)) = (self.min_valid_value, self.max_valid_value) {
            if min > max {
                return Err(ElevationError::config(format!(
                    "min_valid_value {} exceeds max_valid_value {}",
                    min, max
                )));
            }
        }
        if let Some(max_level) = self.max_data_level {
            if max_level < self.min_level {
                return Err(ElevationError::config(format!(
                    "max_data_level {} is below min_level {}",
                    max_level, self.min_level
                )));
            }
        }
        if let Some(size) = self.tile_size {
            if size < 2 {
                return Err(ElevationError::config(format!("tile_size {} is too small", size)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheUsage;

    #[test]
    fn test_defaults() {
        let options = ElevationLayerOptions::from_json("{}").unwrap();
        assert!(options.enabled);
        assert!(!options.offset);
        assert_eq!(options.nodata_policy, NoDataPolicy::Interpolate);
        assert_eq!(options.cache_policy.usage, CacheUsage::ReadWrite);
    }

    #[test]
    fn test_nodata_policy_aliases() {
        for (text, expected) in [
            ("default", NoDataPolicy::Interpolate),
            ("interpolate", NoDataPolicy::Interpolate),
            ("msl", NoDataPolicy::MeanSeaLevel),
        ] {
            let json = format!(r#"{{"nodata_policy": "{}"}}"#, text);
            let options = ElevationLayerOptions::from_json(&json).unwrap();
            assert_eq!(options.nodata_policy, expected);
        }
        assert!(ElevationLayerOptions::from_json(r#"{"nodata_policy": "zero"}"#).is_err());
    }

    #[test]
    fn test_vsrs_is_accepted_for_vdatum() {
        let options = ElevationLayerOptions::from_json(r#"{"vsrs": "egm96", "offset": true}"#).unwrap();
        assert_eq!(options.vdatum.as_deref(), Some("egm96"));
        assert!(options.offset);
    }

    #[test]
    fn test_validation() {
        assert!(ElevationLayerOptions::from_json(
            r#"{"min_valid_value": 10.0, "max_valid_value": -10.0}"#
        )
        .is_err());
        assert!(ElevationLayerOptions::from_json(r#"{"min_level": 5, "max_data_level": 3}"#).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.json");
        let mut options = ElevationLayerOptions::new("srtm");
        options.vdatum = Some("egm96".into());
        options.max_data_level = Some(12);
        options.save(&path).unwrap();

        let loaded = ElevationLayerOptions::load(&path).unwrap();
        assert_eq!(loaded, options);
    }
}
