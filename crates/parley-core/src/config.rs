//! Configuration management for parley.
//!
//! Loads configuration from ${PARLEY_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::credentials::CredentialMode;
use crate::providers::{ProviderKind, resolve_api_key};
use crate::store::RetentionWindow;

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Merges user config values into the default template.
///
/// New comments and sections from the template are kept while the user's
/// values win.
fn merge_with_template(user_config: &str) -> Result<String> {
    use toml_edit::DocumentMut;

    let mut doc: DocumentMut = default_config_template()
        .parse()
        .context("Failed to parse default config template")?;
    let user_doc: DocumentMut = user_config.parse().context("Failed to parse user config")?;

    merge_items(doc.as_table_mut(), user_doc.as_table());

    Ok(doc.to_string())
}

fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

pub mod paths {
    //! Path resolution for parley configuration and data.
    //!
    //! `PARLEY_HOME` environment variable if set, else `~/.config/parley`.

    use std::path::PathBuf;

    use crate::store::STORE_FILE;

    pub fn parley_home() -> PathBuf {
        if let Ok(home) = std::env::var("PARLEY_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".parley"),
            |home| home.join(".config").join("parley"),
        )
    }

    pub fn config_path() -> PathBuf {
        parley_home().join("config.toml")
    }

    /// Local key-value store (trial counters, saved transcripts).
    pub fn store_path() -> PathBuf {
        parley_home().join(STORE_FILE)
    }

    pub fn logs_dir() -> PathBuf {
        parley_home().join("logs")
    }
}

/// Provider configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Optional API key (overrides the environment variable).
    pub api_key: Option<String>,
    /// Optional API base URL (for proxies and tests).
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Returns the API key if set and non-empty.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns the base URL if set and non-empty.
    pub fn effective_base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ProvidersConfig {
    pub gemini: ProviderConfig,
    pub openai: ProviderConfig,
    pub openrouter: ProviderConfig,
    pub anthropic: ProviderConfig,
}

impl ProvidersConfig {
    pub fn get(&self, kind: ProviderKind) -> &ProviderConfig {
        match kind {
            ProviderKind::Gemini => &self.gemini,
            ProviderKind::OpenAI => &self.openai,
            ProviderKind::OpenRouter => &self.openrouter,
            ProviderKind::Anthropic => &self.anthropic,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Provider id for new messages
    pub provider: String,
    /// Model name; `None` selects the provider's default model
    pub model: Option<String>,
    pub mode: CredentialMode,
    /// Assistant whose prompt is fetched from the prompt store
    pub assistant: String,
    /// Web-search grounding (Gemini only)
    pub grounding: bool,
    pub max_tokens: u32,
    /// Backend for trial keys, prompts and telemetry
    pub issuer_url: Option<String>,
    /// Fallback system prompt
    pub default_system_prompt: String,
    pub watchdog_secs: u64,
    pub key_validation_debounce_ms: u64,
    pub auto_delete_hours: RetentionWindow,
    pub trial_provider: String,
    pub trial_uses: u32,
    pub log_level: String,
    pub providers: ProvidersConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Gemini.id().to_string(),
            model: None,
            mode: CredentialMode::Personal,
            assistant: Self::DEFAULT_ASSISTANT.to_string(),
            grounding: false,
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            issuer_url: None,
            default_system_prompt: Self::DEFAULT_SYSTEM_PROMPT.to_string(),
            watchdog_secs: Self::DEFAULT_WATCHDOG_SECS,
            key_validation_debounce_ms: Self::DEFAULT_DEBOUNCE_MS,
            auto_delete_hours: RetentionWindow::default(),
            trial_provider: ProviderKind::Gemini.id().to_string(),
            trial_uses: Self::DEFAULT_TRIAL_USES,
            log_level: "info".to_string(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl Config {
    const DEFAULT_ASSISTANT: &str = "general";
    const DEFAULT_MAX_TOKENS: u32 = 2048;
    const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
    const DEFAULT_WATCHDOG_SECS: u64 = 10;
    const DEFAULT_DEBOUNCE_MS: u64 = 600;
    const DEFAULT_TRIAL_USES: u32 = 10;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but is unreadable or invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but is unreadable or invalid.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Saves a provider API key, preserving other fields and comments.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn save_api_key(provider: ProviderKind, api_key: &str) -> Result<()> {
        Self::save_api_key_to(&paths::config_path(), provider, api_key)
    }

    /// Saves a provider API key to a specific config file path.
    ///
    /// Creates the file from the template if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn save_api_key_to(path: &Path, provider: ProviderKind, api_key: &str) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        let contents = if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            merge_with_template(&user_config)?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        doc["providers"][provider.id()]["api_key"] = value(api_key.trim());

        Self::write_config(path, &doc.to_string())
    }

    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    /// # Errors
    /// Returns an error for an unknown provider id.
    pub fn provider_kind(&self) -> Result<ProviderKind> {
        ProviderKind::parse(&self.provider).context("Invalid `provider` in config")
    }

    /// # Errors
    /// Returns an error for an unknown provider id.
    pub fn trial_provider_kind(&self) -> Result<ProviderKind> {
        ProviderKind::parse(&self.trial_provider).context("Invalid `trial_provider` in config")
    }

    /// Model for `kind`: the configured one, else the catalog default.
    pub fn model_for(&self, kind: ProviderKind) -> String {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map_or_else(
                || kind.provider().default_model().name.to_string(),
                str::to_string,
            )
    }

    /// Personal API key for `kind` (config > env).
    pub fn api_key_for(&self, kind: ProviderKind) -> Option<String> {
        resolve_api_key(
            self.providers.get(kind).effective_api_key(),
            kind.api_key_env_var(),
        )
    }

    /// Base URL for `kind` (env > config > default).
    ///
    /// # Errors
    /// Returns an error if an override is not a valid URL.
    pub fn base_url_for(&self, kind: ProviderKind) -> Result<String> {
        kind.resolve_base_url(self.providers.get(kind).effective_base_url())
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }

    pub fn validation_debounce(&self) -> Duration {
        Duration::from_millis(self.key_validation_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();

        assert_eq!(config.provider, "gemini");
        assert_eq!(config.mode, CredentialMode::Personal);
        assert_eq!(config.watchdog(), Duration::from_secs(10));
        assert_eq!(config.validation_debounce(), Duration::from_millis(600));
        assert_eq!(config.auto_delete_hours, RetentionWindow::Hours(24));
    }

    #[test]
    fn partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "provider = \"anthropic\"\nmode = \"shared\"\nauto_delete_hours = \"never\"\n\n[providers.anthropic]\nbase_url = \"http://localhost:1\"\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.provider_kind().unwrap(), ProviderKind::Anthropic);
        assert_eq!(config.mode, CredentialMode::Shared);
        assert_eq!(config.auto_delete_hours, RetentionWindow::Never);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(
            config.providers.anthropic.effective_base_url(),
            Some("http://localhost:1")
        );
        assert_eq!(config.model_for(ProviderKind::Anthropic), "claude-sonnet-4-5");
    }

    #[test]
    fn template_parses_to_defaults() {
        let from_template: Config = toml::from_str(default_config_template()).unwrap();
        let defaults = Config::default();

        assert_eq!(from_template.provider, defaults.provider);
        assert_eq!(from_template.max_tokens, defaults.max_tokens);
        assert_eq!(from_template.watchdog_secs, defaults.watchdog_secs);
        assert_eq!(from_template.trial_uses, defaults.trial_uses);
        assert_eq!(from_template.providers, defaults.providers);
    }

    #[test]
    fn init_creates_file_and_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("subdir").join("config.toml");

        Config::init(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("# model = \"gemini-2.5-flash\""));

        assert!(Config::init(&path).is_err());
    }

    #[test]
    fn save_api_key_preserves_user_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "# mine\nprovider = \"openai\"\nmax_tokens = 99\n").unwrap();

        Config::save_api_key_to(&path, ProviderKind::OpenAI, " sk-new ").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.provider, "openai");
        assert_eq!(config.max_tokens, 99);
        assert_eq!(config.providers.openai.effective_api_key(), Some("sk-new"));
        assert_eq!(config.api_key_for(ProviderKind::OpenAI).as_deref(), Some("sk-new"));
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let config = Config {
            provider: "mystery".to_string(),
            ..Config::default()
        };
        assert!(config.provider_kind().is_err());
    }
}
