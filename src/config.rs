//! TOML configuration parsing and validation.
//!
//! A single file describes where documents come from, how they are
//! converted to markdown, which model extracts the patient record, and
//! where the exported table lives. See `config/intake.example.toml`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_INSTRUCTION: &str = "Please extract patient information from the intake form.";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    pub filesystem: Option<FilesystemSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.txt".to_string(),
        "**/*.md".to_string(),
    ]
}

/// Converter backend selection.
///
/// `behavior_version` is part of every conversion cache key: bump it when
/// the converter's output would change for the same input.
#[derive(Debug, Deserialize, Clone)]
pub struct ConversionConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_behavior_version")]
    pub behavior_version: u32,
    #[serde(default = "default_conversion_timeout")]
    pub timeout_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            command: Vec::new(),
            behavior_version: default_behavior_version(),
            timeout_secs: default_conversion_timeout(),
        }
    }
}

fn default_backend() -> String {
    "builtin".to_string()
}
fn default_behavior_version() -> u32 {
    1
}
fn default_conversion_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_instruction")]
    pub instruction: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            instruction: default_instruction(),
            max_retries: default_max_retries(),
            timeout_secs: default_extraction_timeout(),
            temperature: 0.0,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_instruction() -> String {
    DEFAULT_INSTRUCTION.to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_extraction_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.concurrency == 0 {
        anyhow::bail!("pipeline.concurrency must be >= 1");
    }

    if config.conversion.behavior_version == 0 {
        anyhow::bail!("conversion.behavior_version must be >= 1");
    }

    match config.conversion.backend.as_str() {
        "builtin" => {}
        "command" => {
            if config.conversion.command.is_empty() {
                anyhow::bail!("conversion.command must be set when backend is 'command'");
            }
        }
        other => anyhow::bail!(
            "Unknown conversion backend: '{}'. Must be builtin or command.",
            other
        ),
    }

    match config.extraction.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.extraction.model.is_none() {
                anyhow::bail!("extraction.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.extraction.instruction.trim().is_empty() {
        anyhow::bail!("extraction.instruction must not be empty");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/intake.sqlite\"\n").unwrap();
        assert_eq!(config.conversion.backend, "builtin");
        assert_eq!(config.conversion.behavior_version, 1);
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(config.extraction.provider, "disabled");
        assert_eq!(config.extraction.instruction, DEFAULT_INSTRUCTION);
    }

    #[test]
    fn command_backend_requires_command() {
        let err = parse("[db]\npath = \"x\"\n[conversion]\nbackend = \"command\"\n").unwrap_err();
        assert!(err.to_string().contains("conversion.command"));
    }

    #[test]
    fn openai_requires_model() {
        let err = parse("[db]\npath = \"x\"\n[extraction]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("extraction.model"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = parse("[db]\npath = \"x\"\n[pipeline]\nconcurrency = 0\n").unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn unknown_backend_rejected() {
        let err = parse("[db]\npath = \"x\"\n[conversion]\nbackend = \"ocr\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown conversion backend"));
    }
}
