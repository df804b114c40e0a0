use crate::application::validation::{FieldKind, FieldSpec, SchemaSpec};
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_MAX_TURNS: usize = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CONFIG_PATH: &str = "config/extractor.toml";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub geocoder_url: String,
    pub max_turns: usize,
    pub request_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub schema: SchemaSpec,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    base_url: Option<String>,
    api_key_env: Option<String>,
    geocoder_url: Option<String>,
    max_turns: Option<usize>,
    request_timeout_secs: Option<u64>,
    tool_timeout_secs: Option<u64>,
    schema: Option<SchemaSpec>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            geocoder_url: DEFAULT_GEOCODER_URL.to_string(),
            max_turns: DEFAULT_MAX_TURNS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            schema: default_schema(),
        }
    }

    /// Credential sourcing: a directly supplied key wins, otherwise the
    /// environment variable named by the config provides the default.
    pub fn api_key(&self, supplied: Option<String>) -> Option<String> {
        if let Some(key) = supplied.filter(|key| !key.trim().is_empty()) {
            return Some(key);
        }
        match env::var(&self.api_key_env) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    env_var = self.api_key_env.as_str(),
                    %err,
                    "API key environment variable is not set"
                );
                None
            }
        }
    }
}

/// The deployment default: the minimal observed schema variant. Deployments
/// wanting production-company fields add them in the config file.
fn default_schema() -> SchemaSpec {
    SchemaSpec::new(vec![
        FieldSpec {
            name: "date".into(),
            kind: FieldKind::String,
        },
        FieldSpec {
            name: "projectName".into(),
            kind: FieldKind::String,
        },
        FieldSpec {
            name: "locations".into(),
            kind: FieldKind::Array,
        },
    ])
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading extractor configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let defaults = AppConfig::default();
    Ok(AppConfig {
        model: parsed.model.unwrap_or(defaults.model),
        base_url: parsed.base_url.unwrap_or(defaults.base_url),
        api_key_env: parsed.api_key_env.unwrap_or(defaults.api_key_env),
        geocoder_url: parsed.geocoder_url.unwrap_or(defaults.geocoder_url),
        max_turns: parsed.max_turns.unwrap_or(defaults.max_turns),
        request_timeout_secs: parsed
            .request_timeout_secs
            .unwrap_or(defaults.request_timeout_secs),
        tool_timeout_secs: parsed.tool_timeout_secs.unwrap_or(defaults.tool_timeout_secs),
        schema: parsed.schema.unwrap_or(defaults.schema),
    })
}
