//! Core Parley library (providers, streaming, transcript, credentials, chat).

pub mod backend;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod logging;
pub mod providers;
pub mod session;
pub mod store;
pub mod stream;
pub mod transcript;

pub use chat::{ChatController, ChatSettings, Generation, StopHandle};
pub use error::ChatError;
