use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::engine::EngineSettings;
use crate::domain::draft::DEFAULT_VAT_RATE;

/// Longest webhook retry window worth remembering message ids for: one day.
pub const MAX_DEDUP_WINDOW_SECS: u64 = 86_400;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub whatsapp: WhatsAppConfig,
    pub email: EmailConfig,
    pub llm: LlmConfig,
    pub documents: DocumentsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Twilio WhatsApp sender. Replies are dropped (and logged) while `enabled` is false.
#[derive(Clone, Debug)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub account_sid: String,
    pub auth_token: SecretString,
    pub sender: String,
    pub api_base_url: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EmailConfig {
    pub enabled: bool,
    pub api_key: Option<SecretString>,
    pub from_address: String,
    pub api_base_url: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub line_item_extraction: bool,
}

#[derive(Clone, Debug)]
pub struct DocumentsConfig {
    pub vat_rate: Decimal,
    pub company_name: String,
    pub archive_dir: PathBuf,
    pub public_base_url: String,
    pub wkhtmltopdf_path: Option<PathBuf>,
    pub template_dir: Option<PathBuf>,
    pub build_timeout_secs: u64,
    pub store_retries: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub dedup_window_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub line_item_extraction: Option<bool>,
    pub whatsapp_enabled: Option<bool>,
    pub archive_dir: Option<PathBuf>,
    pub server_port: Option<u16>,
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
                url: "sqlite://vocario.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            whatsapp: WhatsAppConfig {
                enabled: false,
                account_sid: String::new(),
                auth_token: String::new().into(),
                sender: String::new(),
                api_base_url: "https://api.twilio.com".to_string(),
                timeout_secs: 15,
            },
            email: EmailConfig {
                enabled: false,
                api_key: None,
                from_address: "devis@vocario.fr".to_string(),
                api_base_url: "https://api.resend.com".to_string(),
                timeout_secs: 15,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
                line_item_extraction: false,
            },
            documents: DocumentsConfig {
                vat_rate: DEFAULT_VAT_RATE,
                company_name: "Vocario".to_string(),
                archive_dir: PathBuf::from("data/documents"),
                public_base_url: "http://127.0.0.1:8080/documents".to_string(),
                wkhtmltopdf_path: None,
                template_dir: None,
                build_timeout_secs: 30,
                store_retries: 3,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                dedup_window_secs: 300,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl FromStr for LogFormat {
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("vocario.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Settings the conversation engine needs out of the full configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            vat_rate: self.documents.vat_rate,
            line_item_extraction: self.llm.line_item_extraction,
            company_name: self.documents.company_name.clone(),
        }
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

        if let Some(whatsapp) = patch.whatsapp {
            if let Some(enabled) = whatsapp.enabled {
                self.whatsapp.enabled = enabled;
            }
            if let Some(account_sid) = whatsapp.account_sid {
                self.whatsapp.account_sid = account_sid;
            }
            if let Some(auth_token) = whatsapp.auth_token {
                self.whatsapp.auth_token = secret_value(auth_token);
            }
            if let Some(sender) = whatsapp.sender {
                self.whatsapp.sender = sender;
            }
            if let Some(api_base_url) = whatsapp.api_base_url {
                self.whatsapp.api_base_url = api_base_url;
            }
            if let Some(timeout_secs) = whatsapp.timeout_secs {
                self.whatsapp.timeout_secs = timeout_secs;
            }
        }

        if let Some(email) = patch.email {
            if let Some(enabled) = email.enabled {
                self.email.enabled = enabled;
            }
            if let Some(api_key) = email.api_key {
                self.email.api_key = Some(secret_value(api_key));
            }
            if let Some(from_address) = email.from_address {
                self.email.from_address = from_address;
            }
            if let Some(api_base_url) = email.api_base_url {
                self.email.api_base_url = api_base_url;
            }
            if let Some(timeout_secs) = email.timeout_secs {
                self.email.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(line_item_extraction) = llm.line_item_extraction {
                self.llm.line_item_extraction = line_item_extraction;
            }
        }

        if let Some(documents) = patch.documents {
            if let Some(vat_rate) = documents.vat_rate {
                self.documents.vat_rate = vat_rate;
            }
            if let Some(company_name) = documents.company_name {
                self.documents.company_name = company_name;
            }
            if let Some(archive_dir) = documents.archive_dir {
                self.documents.archive_dir = archive_dir;
            }
            if let Some(public_base_url) = documents.public_base_url {
                self.documents.public_base_url = public_base_url;
            }
            if let Some(wkhtmltopdf_path) = documents.wkhtmltopdf_path {
                self.documents.wkhtmltopdf_path = Some(wkhtmltopdf_path);
            }
            if let Some(template_dir) = documents.template_dir {
                self.documents.template_dir = Some(template_dir);
            }
            if let Some(build_timeout_secs) = documents.build_timeout_secs {
                self.documents.build_timeout_secs = build_timeout_secs;
            }
            if let Some(store_retries) = documents.store_retries {
                self.documents.store_retries = store_retries;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(dedup_window_secs) = server.dedup_window_secs {
                self.server.dedup_window_secs = dedup_window_secs;
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
        if let Some(value) = read_env("VOCARIO_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("VOCARIO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("VOCARIO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("VOCARIO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("VOCARIO_WHATSAPP_ENABLED") {
            self.whatsapp.enabled = parse_env("VOCARIO_WHATSAPP_ENABLED", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_WHATSAPP_ACCOUNT_SID") {
            self.whatsapp.account_sid = value;
        }
        if let Some(value) = read_env("VOCARIO_WHATSAPP_AUTH_TOKEN") {
            self.whatsapp.auth_token = secret_value(value);
        }
        if let Some(value) = read_env("VOCARIO_WHATSAPP_SENDER") {
            self.whatsapp.sender = value;
        }
        if let Some(value) = read_env("VOCARIO_WHATSAPP_API_BASE_URL") {
            self.whatsapp.api_base_url = value;
        }

        if let Some(value) = read_env("VOCARIO_EMAIL_ENABLED") {
            self.email.enabled = parse_env("VOCARIO_EMAIL_ENABLED", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_EMAIL_API_KEY") {
            self.email.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("VOCARIO_EMAIL_FROM_ADDRESS") {
            self.email.from_address = value;
        }
        if let Some(value) = read_env("VOCARIO_EMAIL_API_BASE_URL") {
            self.email.api_base_url = value;
        }

        if let Some(value) = read_env("VOCARIO_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("VOCARIO_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("VOCARIO_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("VOCARIO_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("VOCARIO_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("VOCARIO_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_env("VOCARIO_LLM_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_LLM_LINE_ITEM_EXTRACTION") {
            self.llm.line_item_extraction =
                parse_env("VOCARIO_LLM_LINE_ITEM_EXTRACTION", &value)?;
        }

        if let Some(value) = read_env("VOCARIO_DOCUMENTS_VAT_RATE") {
            self.documents.vat_rate = parse_env("VOCARIO_DOCUMENTS_VAT_RATE", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_DOCUMENTS_COMPANY_NAME") {
            self.documents.company_name = value;
        }
        if let Some(value) = read_env("VOCARIO_DOCUMENTS_ARCHIVE_DIR") {
            self.documents.archive_dir = PathBuf::from(value);
        }
        if let Some(value) = read_env("VOCARIO_DOCUMENTS_PUBLIC_BASE_URL") {
            self.documents.public_base_url = value;
        }
        if let Some(value) = read_env("VOCARIO_DOCUMENTS_WKHTMLTOPDF_PATH") {
            self.documents.wkhtmltopdf_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("VOCARIO_DOCUMENTS_TEMPLATE_DIR") {
            self.documents.template_dir = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("VOCARIO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("VOCARIO_SERVER_PORT") {
            self.server.port = parse_env("VOCARIO_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("VOCARIO_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("VOCARIO_SERVER_DEDUP_WINDOW_SECS") {
            self.server.dedup_window_secs = parse_env("VOCARIO_SERVER_DEDUP_WINDOW_SECS", &value)?;
        }

        let log_level = read_env("VOCARIO_LOGGING_LEVEL").or_else(|| read_env("VOCARIO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("VOCARIO_LOGGING_FORMAT").or_else(|| read_env("VOCARIO_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(line_item_extraction) = overrides.line_item_extraction {
            self.llm.line_item_extraction = line_item_extraction;
        }
        if let Some(whatsapp_enabled) = overrides.whatsapp_enabled {
            self.whatsapp.enabled = whatsapp_enabled;
        }
        if let Some(archive_dir) = overrides.archive_dir {
            self.documents.archive_dir = archive_dir;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_whatsapp(&self.whatsapp)?;
        validate_email(&self.email)?;
        validate_llm(&self.llm)?;
        validate_documents(&self.documents)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("vocario.toml"), PathBuf::from("config/vocario.toml")]
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

/// Replaces `${VAR}` with the variable's value; unset variables are an error.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let key = &after[..end];
        let value = env::var(key)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.to_owned() })?;
        output.push_str(&value);
        rest = &after[end + 1..];
    }
    output.push_str(rest);

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

fn validate_whatsapp(whatsapp: &WhatsAppConfig) -> Result<(), ConfigError> {
    if !whatsapp.enabled {
        return Ok(());
    }

    if !whatsapp.account_sid.starts_with("AC") {
        return Err(ConfigError::Validation(
            "whatsapp.account_sid must start with `AC`. Find it on the Twilio console dashboard"
                .to_string(),
        ));
    }
    if whatsapp.auth_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "whatsapp.auth_token is required when whatsapp.enabled is true".to_string(),
        ));
    }
    if whatsapp.sender.trim().is_empty() {
        return Err(ConfigError::Validation(
            "whatsapp.sender is required, e.g. `whatsapp:+14155238886`".to_string(),
        ));
    }
    require_http_url("whatsapp.api_base_url", &whatsapp.api_base_url)?;
    require_timeout("whatsapp.timeout_secs", whatsapp.timeout_secs)
}

fn validate_email(email: &EmailConfig) -> Result<(), ConfigError> {
    if !email.enabled {
        return Ok(());
    }

    let missing =
        email.api_key.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true);
    if missing {
        return Err(ConfigError::Validation(
            "email.api_key is required when email.enabled is true".to_string(),
        ));
    }
    if !email.from_address.contains('@') {
        return Err(ConfigError::Validation(
            "email.from_address must be an email address".to_string(),
        ));
    }
    require_http_url("email.api_base_url", &email.api_base_url)?;
    require_timeout("email.timeout_secs", email.timeout_secs)
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    require_timeout("llm.timeout_secs", llm.timeout_secs)?;
    if !llm.line_item_extraction {
        return Ok(());
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_documents(documents: &DocumentsConfig) -> Result<(), ConfigError> {
    if documents.vat_rate.is_sign_negative() || documents.vat_rate > Decimal::ONE_HUNDRED {
        return Err(ConfigError::Validation(
            "documents.vat_rate must be a percentage in range 0..=100".to_string(),
        ));
    }
    if documents.company_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "documents.company_name must not be empty".to_string(),
        ));
    }
    require_http_url("documents.public_base_url", &documents.public_base_url)?;
    require_timeout("documents.build_timeout_secs", documents.build_timeout_secs)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    if server.dedup_window_secs == 0 || server.dedup_window_secs > MAX_DEDUP_WINDOW_SECS {
        return Err(ConfigError::Validation(format!(
            "server.dedup_window_secs must be in range 1..={MAX_DEDUP_WINDOW_SECS}"
        )));
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

fn require_http_url(key: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must start with http:// or https://")))
    }
}

fn require_timeout(key: &str, secs: u64) -> Result<(), ConfigError> {
    if secs == 0 || secs > 300 {
        return Err(ConfigError::Validation(format!("{key} must be in range 1..=300")));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    whatsapp: Option<WhatsAppPatch>,
    email: Option<EmailPatch>,
    llm: Option<LlmPatch>,
    documents: Option<DocumentsPatch>,
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
struct WhatsAppPatch {
    enabled: Option<bool>,
    account_sid: Option<String>,
    auth_token: Option<String>,
    sender: Option<String>,
    api_base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EmailPatch {
    enabled: Option<bool>,
    api_key: Option<String>,
    from_address: Option<String>,
    api_base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    line_item_extraction: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentsPatch {
    vat_rate: Option<Decimal>,
    company_name: Option<String>,
    archive_dir: Option<PathBuf>,
    public_base_url: Option<String>,
    wkhtmltopdf_path: Option<PathBuf>,
    template_dir: Option<PathBuf>,
    build_timeout_secs: Option<u64>,
    store_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    dedup_window_secs: Option<u64>,
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

    use rust_decimal::Decimal;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

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
    fn defaults_are_valid_without_a_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(!config.whatsapp.enabled, "whatsapp delivery is off by default")?;
        ensure(config.documents.vat_rate == Decimal::new(20, 0), "default vat rate is 20%")?;
        ensure(config.server.dedup_window_secs == 300, "dedup window defaults to 5 minutes")?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_TWILIO_SID", "AC0123456789");
        env::set_var("TEST_TWILIO_TOKEN", "twilio-token-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("vocario.toml");
            fs::write(
                &path,
                r#"
[whatsapp]
enabled = true
account_sid = "${TEST_TWILIO_SID}"
auth_token = "${TEST_TWILIO_TOKEN}"
sender = "whatsapp:+14155238886"

[documents]
vat_rate = 10
company_name = "Carrelage Martin"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.whatsapp.account_sid == "AC0123456789", "sid should be interpolated")?;
            ensure(
                config.whatsapp.auth_token.expose_secret() == "twilio-token-from-env",
                "auth token should be loaded from environment",
            )?;
            let settings = config.engine_settings();
            ensure(settings.vat_rate == Decimal::new(10, 0), "vat rate should come from file")?;
            ensure(
                settings.company_name == "Carrelage Martin",
                "company name should come from file",
            )
        })();

        clear_vars(&["TEST_TWILIO_SID", "TEST_TWILIO_TOKEN"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("vocario.toml");
        fs::write(&path, "[email]\napi_key = \"${VOCARIO_TEST_UNSET_KEY}\"\n")
            .map_err(|err| err.to_string())?;

        match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Err(ConfigError::MissingEnvInterpolation { var }) => {
                ensure(var == "VOCARIO_TEST_UNSET_KEY", "error should name the variable")
            }
            other => Err(format!("expected interpolation failure, got {other:?}")),
        }
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("VOCARIO_LOG_LEVEL", "warn");
        env::set_var("VOCARIO_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["VOCARIO_LOG_LEVEL", "VOCARIO_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("VOCARIO_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("VOCARIO_DOCUMENTS_VAT_RATE", "5.5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("vocario.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[documents]
vat_rate = 20

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
            ensure(
                config.documents.vat_rate == Decimal::new(55, 1),
                "env vat rate should win over file and defaults",
            )
        })();

        clear_vars(&["VOCARIO_DATABASE_URL", "VOCARIO_DOCUMENTS_VAT_RATE"]);
        result
    }

    #[test]
    fn enabled_whatsapp_requires_credentials() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("VOCARIO_WHATSAPP_ENABLED", "true");
        env::set_var("VOCARIO_WHATSAPP_ACCOUNT_SID", "bad");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("whatsapp.account_sid")
            );
            ensure(has_message, "validation failure should mention whatsapp.account_sid")
        })();

        clear_vars(&["VOCARIO_WHATSAPP_ENABLED", "VOCARIO_WHATSAPP_ACCOUNT_SID"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("VOCARIO_SERVER_PORT", "eighty");
        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "VOCARIO_SERVER_PORT", "error should name the variable")
            }
            other => Err(format!("expected invalid override, got {other:?}")),
        };

        clear_vars(&["VOCARIO_SERVER_PORT"]);
        result
    }

    #[test]
    fn dedup_window_is_bounded_to_a_day() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let mut outcomes = Vec::new();
        for value in ["0", "86401", "18446744073709551615"] {
            env::set_var("VOCARIO_SERVER_DEDUP_WINDOW_SECS", value);
            outcomes.push(AppConfig::load(LoadOptions::default()));
        }
        env::set_var("VOCARIO_SERVER_DEDUP_WINDOW_SECS", "86400");
        let widest = AppConfig::load(LoadOptions::default());
        clear_vars(&["VOCARIO_SERVER_DEDUP_WINDOW_SECS"]);

        for outcome in outcomes {
            let rejected = matches!(
                outcome,
                Err(ConfigError::Validation(ref message))
                    if message.contains("server.dedup_window_secs")
            );
            ensure(rejected, "out-of-range dedup windows should fail validation")?;
        }
        let widest = widest.map_err(|err| format!("one day should be accepted: {err}"))?;
        ensure(widest.server.dedup_window_secs == 86_400, "one-day window should be kept")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("VOCARIO_WHATSAPP_AUTH_TOKEN", "twilio-secret-value");
        env::set_var("VOCARIO_EMAIL_API_KEY", "re_secret_value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("twilio-secret-value"),
                "debug output should not contain the twilio token",
            )?;
            ensure(!debug.contains("re_secret_value"), "debug output should not contain email key")
        })();

        clear_vars(&["VOCARIO_WHATSAPP_AUTH_TOKEN", "VOCARIO_EMAIL_API_KEY"]);
        result
    }
}
