//! One-shot send: the reply goes to stdout, everything else to stderr.

use anyhow::Result;
use parley_core::chat::TELEMETRY_FLUSH_TIMEOUT;
use parley_core::config::Config;
use parley_core::session::SessionState;

use super::{open_controller, stream_with};
use crate::attach;
use crate::interrupt::InterruptedError;
use crate::renderer::Renderer;

pub async fn run(
    config: &Config,
    no_persist: bool,
    prompt: &str,
    attach: &[String],
) -> Result<()> {
    let prompt = prompt.trim();
    if prompt.is_empty() && attach.is_empty() {
        anyhow::bail!("Prompt is empty");
    }
    let attachments = attach
        .iter()
        .map(|path| attach::load(path))
        .collect::<Result<Vec<_>>>()?;

    let (mut chat, mut events) = open_controller(config, no_persist)?;
    let mut renderer = Renderer::new();

    let result = stream_with(chat.send(prompt, attachments), &mut events, &mut renderer).await;
    chat.flush_telemetry(TELEMETRY_FLUSH_TIMEOUT).await;
    let generation = result?;

    if generation.state == SessionState::Cancelled {
        return Err(InterruptedError.into());
    }
    Ok(())
}
