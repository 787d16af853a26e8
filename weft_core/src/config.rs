use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GenerationSettings {
    /// Hard cap substituted for unbounded subnode quantities.
    #[serde(default = "default_infinity_limit")]
    pub infinity_limit: u64,
    /// Depth at which recursive generator expansion is cut off.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

pub fn default_infinity_limit() -> u64 {
    30
}
pub fn default_max_depth() -> u32 {
    64
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            infinity_limit: default_infinity_limit(),
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AbsorptionSettings {
    /// Upper bound on component match attempts for one absorption call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
}

pub fn default_max_attempts() -> u64 {
    4096
}

impl Default for AbsorptionSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub absorption: AbsorptionSettings,
}

impl EngineConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.generation.infinity_limit, 30);
        assert_eq!(config.generation.max_depth, 64);
        assert_eq!(config.absorption.max_attempts, 4096);
    }

    #[test]
    fn load_from_file_reads_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[generation]").unwrap();
        writeln!(file, "infinity-limit = 5").unwrap();
        let config = EngineConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.generation.infinity_limit, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.generation.max_depth, 64);
        assert_eq!(config.absorption.max_attempts, 4096);
    }

    #[test]
    fn load_from_file_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[generation]").unwrap();
        writeln!(file, "no-such-knob = 1").unwrap();
        let result = EngineConfig::load_from_file(&file.path().to_path_buf());
        assert!(result.is_err(), "unknown fields should be rejected");
    }
}
