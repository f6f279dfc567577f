//! Interactive chat: a line-oriented loop over the chat controller.

use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use parley_core::ChatController;
use parley_core::chat::TELEMETRY_FLUSH_TIMEOUT;
use parley_core::config::Config;
use parley_core::credentials::CredentialMode;
use parley_core::transcript::{Attachment, Message};

use super::{open_controller, send, stream_with};
use crate::attach;
use crate::renderer::Renderer;

const HELP: &str = "\
Commands:
  :regen [N]      regenerate message N (default: the last reply)
  :delete N       delete message N
  :clear          delete every message
  :history        list the transcript
  :attach FILE    attach a file to the next message
  :key KEY        use KEY for the current provider
  :reload         refetch the assistant's system prompt
  :help           show this help
  :q              quit";

/// One line of interactive input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Empty,
    Send(String),
    Regen(Option<usize>),
    Delete(usize),
    Clear,
    History,
    Attach(String),
    Key(String),
    Reload,
    Help,
    Quit,
}

impl Input {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let Some(command) = line.strip_prefix(':') else {
            return Ok(if line.is_empty() {
                Input::Empty
            } else {
                Input::Send(line.to_string())
            });
        };

        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        let index = |arg: &str| {
            arg.parse::<usize>()
                .map_err(|_| format!("expected a message number, got '{arg}'"))
        };

        match name {
            "q" | "quit" | "exit" => Ok(Input::Quit),
            "regen" | "r" if arg.is_empty() => Ok(Input::Regen(None)),
            "regen" | "r" => index(arg).map(|i| Input::Regen(Some(i))),
            "delete" | "d" => index(arg).map(Input::Delete),
            "clear" => Ok(Input::Clear),
            "history" | "h" => Ok(Input::History),
            "attach" | "a" if !arg.is_empty() => Ok(Input::Attach(arg.to_string())),
            "key" if !arg.is_empty() => Ok(Input::Key(arg.to_string())),
            "reload" => Ok(Input::Reload),
            "help" | "?" => Ok(Input::Help),
            "attach" | "a" | "key" => Err(format!(":{name} needs an argument")),
            other => Err(format!("unknown command ':{other}' (try :help)")),
        }
    }
}

pub async fn run(config: &Config, no_persist: bool) -> Result<()> {
    // If stdin is piped, send it as one prompt instead
    if !std::io::stdin().is_terminal() {
        let mut prompt = String::new();
        std::io::stdin().lock().read_to_string(&mut prompt)?;
        let prompt = prompt.trim();
        if prompt.is_empty() {
            anyhow::bail!("No input provided via pipe");
        }
        return send::run(config, no_persist, prompt, &[]).await;
    }

    let (mut chat, mut events) = open_controller(config, no_persist)?;
    let mut renderer = Renderer::new();
    let mut pending: Vec<Arc<Attachment>> = Vec::new();

    print_banner(&chat);
    if !chat.messages().is_empty() {
        eprintln!(
            "Restored {} messages (:history to list, :clear to start over)",
            chat.messages().len()
        );
    }

    loop {
        chat.poll_key_updates();
        renderer.drain(&mut events);

        let Some(line) = read_line().await? else {
            break;
        };

        let input = match Input::parse(&line) {
            Ok(input) => input,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };

        let result = match input {
            Input::Empty => continue,
            Input::Quit => break,
            Input::Help => {
                eprintln!("{HELP}");
                continue;
            }
            Input::History => {
                print_history(chat.messages());
                continue;
            }
            Input::Attach(path) => {
                match attach::load(&path) {
                    Ok(attachment) => {
                        eprintln!("Attached {} ({})", path, attachment.mime_type);
                        pending.push(attachment);
                    }
                    Err(err) => eprintln!("Error: {err:#}"),
                }
                continue;
            }
            Input::Key(key) => {
                let provider = chat.settings().provider;
                chat.set_personal_key(provider, &key);
                continue;
            }
            Input::Reload => {
                chat.reload_prompts();
                eprintln!("System prompt will be refetched on the next message");
                continue;
            }
            Input::Clear => chat.clear().map(|()| eprintln!("Transcript cleared")),
            Input::Delete(index) => chat
                .delete(index)
                .map(|removed| eprintln!("Deleted {} message {index}", removed.role.as_str())),
            Input::Regen(index) => {
                stream_with(chat.regenerate(index), &mut events, &mut renderer)
                    .await
                    .map(|_| ())
            }
            Input::Send(content) => {
                let attachments = std::mem::take(&mut pending);
                stream_with(chat.send(&content, attachments), &mut events, &mut renderer)
                    .await
                    .map(|_| ())
            }
        };

        if let Err(err) = result {
            eprintln!("Error: {err}");
        }
    }

    chat.flush_telemetry(TELEMETRY_FLUSH_TIMEOUT).await;
    Ok(())
}

fn print_banner(chat: &ChatController) {
    let settings = chat.settings();
    let mode = match settings.mode {
        CredentialMode::Shared => format!(
            "shared, {} trial uses left",
            chat.allocator().remaining_uses()
        ),
        CredentialMode::Personal => "personal".to_string(),
    };
    eprintln!(
        "parley · {} · {} · {mode} · :help for commands",
        settings.provider.label(),
        settings.model
    );
}

fn print_history(messages: &[Message]) {
    if messages.is_empty() {
        eprintln!("(empty)");
        return;
    }
    for (index, message) in messages.iter().enumerate() {
        let attachments = match message.attachments.len() {
            0 => String::new(),
            n => format!(" [{n} attachment(s)]"),
        };
        println!(
            "[{index}] {}{attachments}: {}",
            message.role.as_str(),
            message.content
        );
    }
}

/// Reads one line off the runtime threads. `None` at end of input.
async fn read_line() -> Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "> ");
        let _ = stderr.flush();

        let mut line = String::new();
        let read = std::io::stdin().read_line(&mut line)?;
        Ok::<_, std::io::Error>((read > 0).then_some(line))
    })
    .await
    .context("stdin reader task")?
    .context("read stdin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_are_sent() {
        assert_eq!(
            Input::parse("  hello there \n"),
            Ok(Input::Send("hello there".to_string()))
        );
        assert_eq!(Input::parse("   "), Ok(Input::Empty));
    }

    #[test]
    fn test_commands_parse_with_and_without_arguments() {
        assert_eq!(Input::parse(":regen"), Ok(Input::Regen(None)));
        assert_eq!(Input::parse(":regen 3"), Ok(Input::Regen(Some(3))));
        assert_eq!(Input::parse(":delete 0"), Ok(Input::Delete(0)));
        assert_eq!(Input::parse(":clear"), Ok(Input::Clear));
        assert_eq!(Input::parse(":history"), Ok(Input::History));
        assert_eq!(Input::parse(":q"), Ok(Input::Quit));
        assert_eq!(
            Input::parse(":attach ~/shot.png"),
            Ok(Input::Attach("~/shot.png".to_string()))
        );
        assert_eq!(Input::parse(":key sk-123"), Ok(Input::Key("sk-123".to_string())));
        assert_eq!(Input::parse(":reload"), Ok(Input::Reload));
    }

    #[test]
    fn test_bad_commands_report_errors() {
        assert!(Input::parse(":delete").is_err());
        assert!(Input::parse(":delete two").is_err());
        assert!(Input::parse(":attach").is_err());
        assert!(Input::parse(":bogus").unwrap_err().contains(":help"));
    }
}
