use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MODEL_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";
pub const DEFAULT_VISION_MODEL: &str = "qwen-vl-max-latest";
pub const DEFAULT_CHAT_MODEL: &str = "qwen-plus";

pub const DEFAULT_PERSONA_PROMPT: &str = "You are Mino. Answer the user's questions in English, \
in Mino's voice and manner: warm, patient and concise. Mino is a companion for people with \
low vision, helping them understand the world around them.";

pub const DEFAULT_VISION_INSTRUCTION: &str = "Describe the content of the image briefly in vivid, \
accessible language, in under 100 characters.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub endpoint: String,
    pub bucket: String,
    pub domain: String,
    pub region: String,
    pub force_path_style: bool,
}

impl StoreConfig {
    pub fn has_credentials(&self) -> bool {
        !self.access_key_id.is_empty() && !self.access_key_secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: String,
    pub base_url: String,
    pub vision_model: String,
    pub chat_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub persona_system_prompt: String,
    pub vision_instruction: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            persona_system_prompt: DEFAULT_PERSONA_PROMPT.to_string(),
            vision_instruction: DEFAULT_VISION_INSTRUCTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub jpeg_quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 1024,
            jpeg_quality: 85,
        }
    }
}

/// Optional YAML overlay for the settings that are not secrets.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub prompts: PromptConfig,
    pub image: ImageConfig,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = serde_yaml::from_str(raw)?;
        if config.image.max_width == 0 || config.image.max_height == 0 {
            return Err(ConfigError::Invalid {
                name: "image.max_width/max_height",
                reason: "must be greater than zero".to_string(),
            });
        }
        if config.image.jpeg_quality == 0 || config.image.jpeg_quality > 100 {
            return Err(ConfigError::Invalid {
                name: "image.jpeg_quality",
                reason: format!("{} is outside 1..=100", config.image.jpeg_quality),
            });
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: Option<String>,
    pub store: StoreConfig,
    pub model: ModelConfig,
    pub prompts: PromptConfig,
    pub image: ImageConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));

        let port = match lookup("PORT") {
            Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                reason: e.to_string(),
            })?,
            None => DEFAULT_PORT,
        };

        let force_path_style = match lookup("OSS_FORCE_PATH_STYLE") {
            Some(raw) => parse_bool("OSS_FORCE_PATH_STYLE", &raw)?,
            None => false,
        };

        let store = StoreConfig {
            access_key_id: required("OSS_ACCESS_KEY_ID")?,
            access_key_secret: required("OSS_ACCESS_KEY_SECRET")?,
            endpoint: validate_url("OSS_ENDPOINT", required("OSS_ENDPOINT")?)?,
            bucket: required("OSS_BUCKET_NAME")?,
            domain: validate_url("OSS_DOMAIN", required("OSS_DOMAIN")?)?,
            region: lookup("OSS_REGION").unwrap_or_else(|| "oss-cn-shanghai".to_string()),
            force_path_style,
        };

        let model = ModelConfig {
            api_key: required("MODEL_API_KEY")?,
            base_url: validate_url(
                "MODEL_BASE_URL",
                lookup("MODEL_BASE_URL").unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string()),
            )?,
            vision_model: lookup("VISION_MODEL").unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
            chat_model: lookup("CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
        };

        let file = match lookup("RELAY_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };

        Ok(Self {
            host: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            static_dir: lookup("STATIC_DIR").filter(|dir| !dir.is_empty()),
            store,
            model,
            prompts: file.prompts,
            image: file.image,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn validate_url(name: &'static str, value: String) -> Result<String, ConfigError> {
    Url::parse(&value).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    Ok(value.trim_end_matches('/').to_string())
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, got {}", other),
        }),
    }
}
