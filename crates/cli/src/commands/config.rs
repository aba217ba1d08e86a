use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use toml::Value;
use vocario_core::config::{AppConfig, LoadOptions};

struct Entry {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

impl Entry {
    fn new(key: &'static str, env_key: &'static str, value: impl Into<String>) -> Self {
        Self { key, env_key, value: value.into() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries(&config) {
        let source = field_source(
            entry.key,
            entry.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }
    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<Entry> {
    let documents = &config.documents;
    vec![
        Entry::new("database.url", "VOCARIO_DATABASE_URL", &config.database.url),
        Entry::new(
            "database.max_connections",
            "VOCARIO_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        Entry::new(
            "whatsapp.enabled",
            "VOCARIO_WHATSAPP_ENABLED",
            config.whatsapp.enabled.to_string(),
        ),
        Entry::new(
            "whatsapp.account_sid",
            "VOCARIO_WHATSAPP_ACCOUNT_SID",
            redact_identifier(&config.whatsapp.account_sid),
        ),
        Entry::new(
            "whatsapp.auth_token",
            "VOCARIO_WHATSAPP_AUTH_TOKEN",
            redact_secret(config.whatsapp.auth_token.expose_secret()),
        ),
        Entry::new("whatsapp.sender", "VOCARIO_WHATSAPP_SENDER", or_unset(&config.whatsapp.sender)),
        Entry::new("email.enabled", "VOCARIO_EMAIL_ENABLED", config.email.enabled.to_string()),
        Entry::new(
            "email.api_key",
            "VOCARIO_EMAIL_API_KEY",
            config.email.api_key.as_ref().map_or("<unset>".to_string(), |key| {
                redact_secret(key.expose_secret())
            }),
        ),
        Entry::new("email.from_address", "VOCARIO_EMAIL_FROM_ADDRESS", &config.email.from_address),
        Entry::new("llm.provider", "VOCARIO_LLM_PROVIDER", format!("{:?}", config.llm.provider)),
        Entry::new("llm.model", "VOCARIO_LLM_MODEL", &config.llm.model),
        Entry::new(
            "llm.base_url",
            "VOCARIO_LLM_BASE_URL",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
        ),
        Entry::new(
            "llm.api_key",
            "VOCARIO_LLM_API_KEY",
            if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" },
        ),
        Entry::new(
            "llm.line_item_extraction",
            "VOCARIO_LLM_LINE_ITEM_EXTRACTION",
            config.llm.line_item_extraction.to_string(),
        ),
        Entry::new(
            "documents.vat_rate",
            "VOCARIO_DOCUMENTS_VAT_RATE",
            documents.vat_rate.to_string(),
        ),
        Entry::new(
            "documents.company_name",
            "VOCARIO_DOCUMENTS_COMPANY_NAME",
            &documents.company_name,
        ),
        Entry::new(
            "documents.archive_dir",
            "VOCARIO_DOCUMENTS_ARCHIVE_DIR",
            documents.archive_dir.display().to_string(),
        ),
        Entry::new(
            "documents.public_base_url",
            "VOCARIO_DOCUMENTS_PUBLIC_BASE_URL",
            &documents.public_base_url,
        ),
        Entry::new(
            "documents.wkhtmltopdf_path",
            "VOCARIO_DOCUMENTS_WKHTMLTOPDF_PATH",
            documents
                .wkhtmltopdf_path
                .as_ref()
                .map_or("<PATH lookup>".to_string(), |path| path.display().to_string()),
        ),
        Entry::new(
            "server.bind_address",
            "VOCARIO_SERVER_BIND_ADDRESS",
            &config.server.bind_address,
        ),
        Entry::new("server.port", "VOCARIO_SERVER_PORT", config.server.port.to_string()),
        Entry::new(
            "server.dedup_window_secs",
            "VOCARIO_SERVER_DEDUP_WINDOW_SECS",
            config.server.dedup_window_secs.to_string(),
        ),
        Entry::new("logging.level", "VOCARIO_LOGGING_LEVEL", &config.logging.level),
        Entry::new(
            "logging.format",
            "VOCARIO_LOGGING_FORMAT",
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["vocario.toml", "config/vocario.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn or_unset(value: &str) -> String {
    if value.trim().is_empty() {
        "<unset>".to_string()
    } else {
        value.to_string()
    }
}

fn redact_secret(secret: &str) -> String {
    if secret.trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}

/// Keeps the first four characters of account identifiers such as `AC12...`.
fn redact_identifier(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "<unset>".to_string();
    }
    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_identifier, redact_secret};

    #[test]
    fn nested_keys_are_found_in_the_file() {
        let doc: Value = "[whatsapp]\nsender = \"whatsapp:+14155238886\"".parse().expect("toml");

        assert!(contains_path(&doc, "whatsapp.sender"));
        assert!(!contains_path(&doc, "whatsapp.auth_token"));
        assert!(!contains_path(&doc, "email.enabled"));
    }

    #[test]
    fn secrets_never_leak() {
        assert_eq!(redact_secret("f00dfeed"), "<redacted>");
        assert_eq!(redact_secret("  "), "<empty>");
        assert_eq!(redact_identifier("AC0123456789abcdef"), "AC01***");
        assert_eq!(redact_identifier(""), "<unset>");
    }
}
