//! Writes chat events to stdout/stderr.
//!
//! # Output contract
//! - `AssistantDelta` → stdout
//! - status lines (`TakingLong`, `Cancelled`, key checks, failure details) → stderr
//!
//! Error messages themselves are printed by the caller from the returned
//! `ChatError`, so a failure is reported once.

use std::io::{Stderr, Stdout, Write, stderr, stdout};

use parley_core::events::{ChatEvent, ChatEventRx};

pub struct Renderer {
    stdout: Stdout,
    stderr: Stderr,
    /// Whether the final newline has been printed after assistant output.
    needs_final_newline: bool,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            stdout: stdout(),
            stderr: stderr(),
            needs_final_newline: false,
        }
    }

    pub fn handle_event(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::TurnStarted { index, regenerate } => {
                if *regenerate {
                    let _ = writeln!(self.stderr, "↻ Regenerating message {index}");
                }
            }
            ChatEvent::AssistantDelta { text, .. } => {
                if !text.is_empty() {
                    let _ = write!(self.stdout, "{text}");
                    let _ = self.stdout.flush();
                    self.needs_final_newline = true;
                }
            }
            ChatEvent::TakingLong { active } => {
                if *active {
                    let _ = writeln!(self.stderr, "… taking longer than usual");
                }
            }
            ChatEvent::Completed { .. } => self.finish_line(),
            ChatEvent::Cancelled { .. } => {
                self.finish_line();
                let _ = writeln!(self.stderr, "^C Stopped.");
            }
            ChatEvent::Failed { details, .. } => {
                self.finish_line();
                if let Some(detail_text) = details {
                    let _ = writeln!(self.stderr, "  Details: {detail_text}");
                }
            }
            ChatEvent::KeyStatusChanged { provider, status } => {
                let _ = writeln!(self.stderr, "{provider} key: {status}");
            }
        }
    }

    /// Renders whatever is already queued without waiting.
    pub fn drain(&mut self, events: &mut ChatEventRx) {
        while let Ok(event) = events.try_recv() {
            self.handle_event(&event);
        }
    }

    fn finish_line(&mut self) {
        if self.needs_final_newline {
            let _ = writeln!(self.stdout);
            let _ = self.stdout.flush();
            self.needs_final_newline = false;
        }
    }
}
