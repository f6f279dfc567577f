//! CLI command handlers.

pub mod chat;
pub mod config;
pub mod keys;
pub mod providers;
pub mod send;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use parley_core::ChatController;
use parley_core::config::{Config, paths};
use parley_core::events::{ChatEventRx, EventSender, create_event_channel};
use parley_core::store::{FileStore, KvStore, MemoryStore};

use crate::interrupt;
use crate::renderer::Renderer;

/// Builds the controller over the on-disk store, or an in-memory one.
pub fn open_controller(config: &Config, no_persist: bool) -> Result<(ChatController, ChatEventRx)> {
    let store: Arc<dyn KvStore> = if no_persist {
        Arc::new(MemoryStore::new())
    } else {
        let path = paths::store_path();
        Arc::new(
            FileStore::open(&path)
                .with_context(|| format!("open state store at {}", path.display()))?,
        )
    };

    let (tx, rx) = create_event_channel();
    let chat = ChatController::from_config(config, store, EventSender::new(tx))?;
    tracing::info!(
        provider = chat.settings().provider.id(),
        model = %chat.settings().model,
        mode = %chat.settings().mode,
        persist = !no_persist,
        "Chat controller ready"
    );
    interrupt::init(chat.stop_handle())?;
    Ok((chat, rx))
}

/// Drives `generation` while rendering its events as they arrive.
pub async fn stream_with<F, T>(
    generation: F,
    events: &mut ChatEventRx,
    renderer: &mut Renderer,
) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(generation);
    let output = loop {
        tokio::select! {
            output = &mut generation => break output,
            Some(event) = events.recv() => renderer.handle_event(&event),
        }
    };
    renderer.drain(events);
    interrupt::reset();
    output
}
