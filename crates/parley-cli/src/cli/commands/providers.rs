//! Provider listing.

use anyhow::Result;
use parley_core::config::Config;
use parley_core::providers::catalog;

pub fn list(config: &Config) -> Result<()> {
    let selected = config.provider_kind()?;
    let selected_model = config.model_for(selected);

    for provider in catalog() {
        let key_state = if config.api_key_for(provider.kind).is_some() {
            "key set"
        } else {
            "no key"
        };
        let trial = if config.trial_provider_kind()? == provider.kind {
            ", trial"
        } else {
            ""
        };
        println!("{} ({}) [{key_state}{trial}]", provider.key, provider.label);

        for model in provider.models {
            let marker = if provider.kind == selected && model.name == selected_model {
                '*'
            } else {
                ' '
            };
            let vision = if model.supports_vision { "  images" } else { "" };
            println!("  {marker} {}{vision}", model.name);
        }
    }
    Ok(())
}
