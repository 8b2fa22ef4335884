use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::model::{ModelConfig, ModelName, ReasoningEffort};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub memory: MemoryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
    pub models: Vec<ModelConfig>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_tool_rounds: u32,
    pub max_attempts_per_model: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub mode: MemoryMode,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    Disabled,
    InProcess,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub models: Option<Vec<ModelConfig>>,
    pub max_tool_rounds: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub memory_mode: Option<MemoryMode>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://banter.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                api_key: None,
                timeout_secs: 30,
                models: vec![default_model("llama3.1", 0)],
            },
            agent: AgentConfig {
                system_prompt: "You are a helpful assistant. Use the available tools when they \
                                help you answer accurately."
                    .to_string(),
                max_tool_rounds: 8,
                max_attempts_per_model: 3,
                retry_base_delay_ms: 1_000,
            },
            memory: MemoryConfig { mode: MemoryMode::Disabled },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn default_model(name: &str, position: usize) -> ModelConfig {
    ModelConfig {
        name: ModelName(name.to_string()),
        position,
        temperature: 0.7,
        max_output_tokens: 1_024,
        reasoning_effort: None,
        supports_tools: true,
        supports_streaming: true,
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for MemoryMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "in_process" => Ok(Self::InProcess),
            other => Err(ConfigError::Validation(format!(
                "unsupported memory mode `{other}` (expected disabled|in_process)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("banter.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(models) = llm.models {
                self.llm.models = models
                    .into_iter()
                    .enumerate()
                    .map(|(position, entry)| entry.into_model(position))
                    .collect();
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(system_prompt) = agent.system_prompt {
                self.agent.system_prompt = system_prompt;
            }
            if let Some(max_tool_rounds) = agent.max_tool_rounds {
                self.agent.max_tool_rounds = max_tool_rounds;
            }
            if let Some(max_attempts_per_model) = agent.max_attempts_per_model {
                self.agent.max_attempts_per_model = max_attempts_per_model;
            }
            if let Some(retry_base_delay_ms) = agent.retry_base_delay_ms {
                self.agent.retry_base_delay_ms = retry_base_delay_ms;
            }
        }

        if let Some(memory) = patch.memory {
            if let Some(mode) = memory.mode {
                self.memory.mode = mode;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("BANTER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("BANTER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("BANTER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("BANTER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("BANTER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BANTER_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("BANTER_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("BANTER_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("BANTER_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("BANTER_LLM_MODELS") {
            self.llm.models = value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .enumerate()
                .map(|(position, name)| default_model(name, position))
                .collect();
        }

        if let Some(value) = read_env("BANTER_AGENT_SYSTEM_PROMPT") {
            self.agent.system_prompt = value;
        }
        if let Some(value) = read_env("BANTER_AGENT_MAX_TOOL_ROUNDS") {
            self.agent.max_tool_rounds = parse_u32("BANTER_AGENT_MAX_TOOL_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("BANTER_AGENT_MAX_ATTEMPTS_PER_MODEL") {
            self.agent.max_attempts_per_model =
                parse_u32("BANTER_AGENT_MAX_ATTEMPTS_PER_MODEL", &value)?;
        }
        if let Some(value) = read_env("BANTER_AGENT_RETRY_BASE_DELAY_MS") {
            self.agent.retry_base_delay_ms =
                parse_u64("BANTER_AGENT_RETRY_BASE_DELAY_MS", &value)?;
        }

        if let Some(value) = read_env("BANTER_MEMORY_MODE") {
            self.memory.mode = value.parse()?;
        }

        if let Some(value) = read_env("BANTER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("BANTER_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("BANTER_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("BANTER_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("BANTER_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("BANTER_LOGGING_LEVEL").or_else(|| read_env("BANTER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("BANTER_LOGGING_FORMAT").or_else(|| read_env("BANTER_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = llm_base_url;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(models) = overrides.models {
            self.llm.models = models
                .into_iter()
                .enumerate()
                .map(|(position, mut model)| {
                    model.position = position;
                    model
                })
                .collect();
        }
        if let Some(max_tool_rounds) = overrides.max_tool_rounds {
            self.agent.max_tool_rounds = max_tool_rounds;
        }
        if let Some(retry_base_delay_ms) = overrides.retry_base_delay_ms {
            self.agent.retry_base_delay_ms = retry_base_delay_ms;
        }
        if let Some(memory_mode) = overrides.memory_mode {
            self.memory.mode = memory_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_agent(&self.agent)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("banter.toml"), PathBuf::from("config/banter.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let base_url = llm.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if let Some(api_key) = &llm.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "llm.api_key must not be blank when provided".to_string(),
            ));
        }
    }

    if llm.models.is_empty() {
        return Err(ConfigError::Validation(
            "llm.models must contain at least one model entry; all invocations would fail"
                .to_string(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for model in &llm.models {
        let name = model.name.0.trim();
        if name.is_empty() {
            return Err(ConfigError::Validation(
                "llm.models entries must have a non-empty name".to_string(),
            ));
        }
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Validation(format!(
                "llm.models contains duplicate model name `{name}`"
            )));
        }
        if !(0.0..=2.0).contains(&model.temperature) {
            return Err(ConfigError::Validation(format!(
                "llm.models[{name}].temperature must be in range 0.0..=2.0"
            )));
        }
        if model.max_output_tokens == 0 {
            return Err(ConfigError::Validation(format!(
                "llm.models[{name}].max_output_tokens must be greater than zero"
            )));
        }
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_tool_rounds == 0 {
        return Err(ConfigError::Validation(
            "agent.max_tool_rounds must be greater than zero".to_string(),
        ));
    }

    if agent.max_attempts_per_model == 0 {
        return Err(ConfigError::Validation(
            "agent.max_attempts_per_model must be greater than zero".to_string(),
        ));
    }

    if agent.retry_base_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "agent.retry_base_delay_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    agent: Option<AgentPatch>,
    memory: Option<MemoryPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    models: Option<Vec<ModelPatch>>,
}

#[derive(Debug, Deserialize)]
struct ModelPatch {
    name: String,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    reasoning_effort: Option<ReasoningEffort>,
    supports_tools: Option<bool>,
    supports_streaming: Option<bool>,
}

impl ModelPatch {
    fn into_model(self, position: usize) -> ModelConfig {
        let defaults = default_model(&self.name, position);
        ModelConfig {
            name: ModelName(self.name),
            position,
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_output_tokens: self.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            reasoning_effort: self.reasoning_effort,
            supports_tools: self.supports_tools.unwrap_or(defaults.supports_tools),
            supports_streaming: self.supports_streaming.unwrap_or(defaults.supports_streaming),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    system_prompt: Option<String>,
    max_tool_rounds: Option<u32>,
    max_attempts_per_model: Option<u32>,
    retry_base_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryPatch {
    mode: Option<MemoryMode>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use crate::domain::model::ReasoningEffort;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, MemoryMode};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation_and_model_entries() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_LLM_API_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("banter.toml");
            fs::write(
                &path,
                r#"
[llm]
base_url = "https://gateway.example.com/v1"
api_key = "${TEST_LLM_API_KEY}"

[[llm.models]]
name = "flagship"
temperature = 0.2
max_output_tokens = 4096
reasoning_effort = "high"

[[llm.models]]
name = "compact"
supports_tools = false
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let api_key = config.llm.api_key.as_ref().ok_or("api key should be set")?;
            ensure(
                api_key.expose_secret() == "sk-from-env",
                "api key should be loaded from environment",
            )?;
            ensure(config.llm.models.len() == 2, "both model entries should be loaded")?;
            ensure(
                config.llm.models[0].reasoning_effort == Some(ReasoningEffort::High),
                "reasoning effort should parse from the file",
            )?;
            ensure(
                config.llm.models[1].position == 1 && !config.llm.models[1].supports_tools,
                "second entry should keep file order and its capability flag",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_LLM_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BANTER_LOG_LEVEL", "warn");
        env::set_var("BANTER_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["BANTER_LOG_LEVEL", "BANTER_LOG_FORMAT"]);
        result
    }

    #[test]
    fn model_list_env_override_replaces_registry_order() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BANTER_LLM_MODELS", "primary, backup");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.models.len() == 2, "model list should come from env override")?;
            ensure(
                config.llm.models[0].name.0 == "primary" && config.llm.models[0].position == 0,
                "first env model should sit at position zero",
            )?;
            ensure(
                config.llm.models[1].name.0 == "backup" && config.llm.models[1].position == 1,
                "second env model should sit at position one",
            )?;
            Ok(())
        })();

        clear_vars(&["BANTER_LLM_MODELS"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BANTER_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("banter.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            Ok(())
        })();

        clear_vars(&["BANTER_DATABASE_URL"]);
        result
    }

    #[test]
    fn validation_rejects_empty_model_list() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let error = match AppConfig::load(LoadOptions {
            overrides: ConfigOverrides { models: Some(Vec::new()), ..ConfigOverrides::default() },
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };

        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("llm.models")
        );
        ensure(has_message, "validation failure should mention llm.models")
    }

    #[test]
    fn validation_rejects_duplicate_model_names() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BANTER_LLM_MODELS", "twin,twin");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("duplicate model name")
            );
            ensure(has_message, "validation failure should mention the duplicate name")
        })();

        clear_vars(&["BANTER_LLM_MODELS"]);
        result
    }

    #[test]
    fn memory_mode_parses_from_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BANTER_MEMORY_MODE", "in_process");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                matches!(config.memory.mode, MemoryMode::InProcess),
                "memory mode should parse from env",
            )
        })();

        clear_vars(&["BANTER_MEMORY_MODE"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BANTER_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["BANTER_LLM_API_KEY"]);
        result
    }
}
