//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::config::{self, paths};
use parley_core::credentials::CredentialMode;
use parley_core::logging;
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Streaming chat with Gemini, OpenAI, OpenRouter and Anthropic")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    overrides: Overrides,

    /// Keep the transcript and trial counters in memory only
    #[arg(long = "no-persist", global = true)]
    no_persist: bool,
}

/// Per-invocation overrides of config values.
#[derive(clap::Args, Debug, Clone, Default)]
struct Overrides {
    /// Provider id (gemini, openai, openrouter, anthropic)
    #[arg(long, global = true, env = "PARLEY_PROVIDER")]
    provider: Option<String>,

    /// Model name (default: the provider's first catalog model)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Credential mode (personal, shared)
    #[arg(long, global = true, env = "PARLEY_MODE")]
    mode: Option<CredentialMode>,

    /// Assistant whose system prompt is used
    #[arg(long, global = true)]
    assistant: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut config::Config) {
        if let Some(provider) = &self.provider {
            // A new provider's default model beats a model pinned for the old one.
            if self.model.is_none() && !provider.eq_ignore_ascii_case(&config.provider) {
                config.model = None;
            }
            config.provider.clone_from(provider);
        }
        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(assistant) = &self.assistant {
            config.assistant.clone_from(assistant);
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Sends one prompt and streams the reply to stdout
    Send {
        /// The prompt to send
        #[arg(short, long)]
        prompt: String,

        /// Attach a file (png, jpeg, gif, webp, pdf, txt); repeatable
        #[arg(short, long, value_name = "FILE")]
        attach: Vec<String>,
    },
    /// Check or save personal API keys
    Keys {
        #[command(subcommand)]
        command: KeysCommands,
    },
    /// Lists providers and their models
    Providers,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum KeysCommands {
    /// Probes a key against the provider
    Check {
        /// Key to probe (default: the configured key)
        #[arg(long)]
        key: Option<String>,
    },
    /// Probes a key and saves it to the config file when valid
    Set {
        /// Key to save
        #[arg(long)]
        key: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        overrides,
        no_persist,
    } = cli;

    match command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let config = load_config(&overrides)?;
            let _log_guard = init_logging(&config);
            commands::chat::run(&config, no_persist).await
        }
        Commands::Send { prompt, attach } => {
            let config = load_config(&overrides)?;
            let _log_guard = init_logging(&config);
            commands::send::run(&config, no_persist, &prompt, &attach).await
        }
        Commands::Keys { command } => {
            let config = load_config(&overrides)?;
            let _log_guard = init_logging(&config);
            match command {
                KeysCommands::Check { key } => {
                    commands::keys::check(&config, key.as_deref()).await
                }
                KeysCommands::Set { key } => commands::keys::set(&config, &key).await,
            }
        }
        Commands::Providers => commands::providers::list(&load_config(&overrides)?),
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}

fn load_config(overrides: &Overrides) -> Result<config::Config> {
    let mut config = config::Config::load().context("load config")?;
    overrides.apply(&mut config);
    Ok(config)
}

/// Logging is best-effort.
fn init_logging(config: &config::Config) -> Option<WorkerGuard> {
    match logging::init(&paths::logs_dir(), &config.log_level) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("Warning: logging disabled: {err:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_provider_override_resets_pinned_model() {
        let mut config = config::Config {
            provider: "gemini".to_string(),
            model: Some("gemini-2.5-pro".to_string()),
            ..config::Config::default()
        };
        let overrides = Overrides {
            provider: Some("openai".to_string()),
            ..Overrides::default()
        };

        overrides.apply(&mut config);

        assert_eq!(config.provider, "openai");
        assert_eq!(config.model, None);
    }

    #[test]
    fn test_mode_override_parses_trial_alias() {
        let cli = Cli::try_parse_from(["parley", "--mode", "trial", "providers"]).unwrap();
        assert_eq!(cli.overrides.mode, Some(CredentialMode::Shared));
    }
}
