//! Key command handlers.

use anyhow::{Context, Result, bail};
use parley_core::config::{Config, paths};
use parley_core::credentials::{KeyStatus, check_key};
use parley_core::providers::ProviderKind;

pub async fn check(config: &Config, key: Option<&str>) -> Result<()> {
    let provider = config.provider_kind()?;
    let key = match key {
        Some(key) => key.trim().to_string(),
        None => config.api_key_for(provider).with_context(|| {
            format!(
                "No API key for {}; pass --key or set {}",
                provider.label(),
                provider.api_key_env_var()
            )
        })?,
    };

    probe(config, provider, &key).await?;
    println!("{} key is valid", provider.label());
    Ok(())
}

pub async fn set(config: &Config, key: &str) -> Result<()> {
    let provider = config.provider_kind()?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Key is empty");
    }

    probe(config, provider, key).await?;
    Config::save_api_key(provider, key)?;
    println!(
        "Saved {} key to {}",
        provider.label(),
        paths::config_path().display()
    );
    Ok(())
}

async fn probe(config: &Config, provider: ProviderKind, key: &str) -> Result<()> {
    let base_url = config.base_url_for(provider)?;
    let http = reqwest::Client::builder()
        .build()
        .context("build HTTP client")?;

    match check_key(&http, provider, &base_url, key).await {
        KeyStatus::Valid => Ok(()),
        status => bail!("{} key is {status}", provider.label()),
    }
}
