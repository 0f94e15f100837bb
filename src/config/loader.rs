//! Configuration loader for YAML files

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::EngineError;

use super::types::EngineConfig;

/// Load configuration from a YAML file
///
/// # Arguments
/// * `path` - Path to the configuration YAML file
///
/// # Returns
/// * `Ok(EngineConfig)` - Successfully loaded and validated configuration
/// * `Err(EngineError)` - File not found, parse error, or validation failure
pub fn load_config(path: &Path) -> Result<EngineConfig, EngineError> {
    if !path.exists() {
        return Err(EngineError::Config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let config: EngineConfig = serde_yaml::from_reader(reader).map_err(|e| {
        EngineError::Config(format!("YAML parse error in '{}': {}", path.display(), e))
    })?;

    config.validate()?;

    Ok(config)
}

/// Load configuration from a YAML string (useful for testing)
pub fn load_config_from_str(yaml_content: &str) -> Result<EngineConfig, EngineError> {
    let config: EngineConfig = serde_yaml::from_str(yaml_content)
        .map_err(|e| EngineError::Config(format!("YAML parse error: {}", e)))?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const VALID_CONFIG_YAML: &str = r#"
instruments:
  - market: DCE
    code: i<00>
    period_seconds: 900
    required_sources: [quote, reference]
    periods:
      ema_fast: 12
      ema_slow: 26
      extrema_capacity: 20
  - market: SHFE
    code: cu<00>
    period_seconds: 900
    required_sources: [quote]
checkpoint:
  dir: data/checkpoints
  warmup_cycles: 5
tolerances:
  indicator_abs: 1e-6
  indicator_rel: 1e-5
  price_abs: 1e-3
  price_rel: 1e-4
"#;

    #[test]
    fn test_load_config_from_str_valid() {
        let config = load_config_from_str(VALID_CONFIG_YAML).unwrap();
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.instruments[0].market, "DCE");
        assert_eq!(config.instruments[0].required_sources.len(), 2);
        assert_eq!(config.checkpoint.warmup_cycles, 5);
    }

    #[test]
    fn test_load_config_from_str_invalid_yaml() {
        let result = load_config_from_str("invalid: yaml: content: [");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("YAML parse error"));
    }

    #[test]
    fn test_load_config_from_str_validation_failure() {
        let invalid = r#"
instruments:
  - market: DCE
    code: i<00>
    period_seconds: 900
    required_sources: [reference]
"#;
        let result = load_config_from_str(invalid);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("must include quote"));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.yaml"));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Configuration file not found"));
    }

    #[test]
    fn test_load_config_from_file_valid() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(VALID_CONFIG_YAML.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.instruments.len(), 2);
    }

    #[test]
    fn test_defaults_apply_when_sections_omitted() {
        let minimal = r#"
instruments:
  - market: DCE
    code: i<00>
    period_seconds: 900
    required_sources: [quote]
"#;
        let config = load_config_from_str(minimal).unwrap();
        assert_eq!(config.checkpoint.warmup_cycles, 5);
        assert!((config.tolerances.indicator_abs - 1e-6).abs() < 1e-18);
    }
}
