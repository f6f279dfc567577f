//! Transcript state machine: the ordered message log.
//!
//! The transcript owns every message. A generation targets exactly one
//! message at a time (a fresh placeholder or a regenerated message); that
//! message is the only one with `streaming = true`. Deltas are applied to it
//! until it is finalized, rolled back or restored.

use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Inline file attached to a user turn. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    pub base64_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_ref: Option<String>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            base64_data: base64_data.into(),
            preview_ref: None,
        }
    }

    /// Encodes raw bytes as an attachment.
    pub fn from_bytes(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(
            mime_type,
            base64::engine::general_purpose::STANDARD.encode(bytes),
        )
    }

    #[must_use]
    pub fn with_preview(mut self, preview_ref: impl Into<String>) -> Self {
        self.preview_ref = Some(preview_ref.into());
        self
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Opaque, monotonically increasing message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Arc<Attachment>>,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegenerateError {
    #[error("no preceding prompt")]
    NoPrecedingPrompt,
    #[error("no message at index {0}")]
    OutOfRange(usize),
    #[error("message {0} is not an assistant reply")]
    NotAssistant(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    #[error("a generation is already in progress")]
    SessionActive,
    #[error("no generation is in progress")]
    NoActiveSession,
    #[error("a streaming placeholder must follow a user turn")]
    NoPendingUserTurn,
    #[error("the active generation is not an appended exchange")]
    NotAnAppendedExchange,
    #[error("the active generation is not a regeneration")]
    NotARegeneration,
    #[error("no message at index {0}")]
    OutOfRange(usize),
    #[error("message at index {0} is being generated")]
    TargetBusy(usize),
    #[error(transparent)]
    Regenerate(#[from] RegenerateError),
}

/// What the active generation writes into.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ActiveTarget {
    Appended {
        user: MessageId,
        placeholder: MessageId,
    },
    Regenerated {
        target: MessageId,
        previous: String,
    },
}

impl ActiveTarget {
    fn message_id(&self) -> MessageId {
        match self {
            ActiveTarget::Appended { placeholder, .. } => *placeholder,
            ActiveTarget::Regenerated { target, .. } => *target,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    next_id: u64,
    active: Option<ActiveTarget>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a transcript from persisted history.
    ///
    /// Messages that were mid-stream when persisted come back finalized.
    pub fn from_history(mut messages: Vec<Message>) -> Self {
        for message in &mut messages {
            message.streaming = false;
        }
        let next_id = messages.iter().map(|m| m.id.0 + 1).max().unwrap_or(0);
        Self {
            messages,
            next_id,
            active: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether a generation currently targets a message.
    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Index of the message the active generation writes into.
    pub fn active_index(&self) -> Option<usize> {
        let id = self.active.as_ref()?.message_id();
        self.index_of(id)
    }

    /// Messages strictly before `index`.
    pub fn history_before(&self, index: usize) -> &[Message] {
        &self.messages[..index.min(self.messages.len())]
    }

    pub fn last_assistant_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|message| message.role == Role::Assistant)
    }

    /// Clones the finalized history for persistence.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Appends a user turn.
    ///
    /// # Errors
    /// Returns `SessionActive` while a generation is in progress.
    pub fn append_user_turn(
        &mut self,
        content: impl Into<String>,
        attachments: Vec<Arc<Attachment>>,
    ) -> Result<MessageId, TranscriptError> {
        if self.active.is_some() {
            return Err(TranscriptError::SessionActive);
        }
        let id = self.allocate_id();
        self.messages.push(Message {
            id,
            role: Role::User,
            content: content.into(),
            attachments,
            streaming: false,
        });
        Ok(id)
    }

    /// Appends the streaming assistant placeholder right after the user turn.
    ///
    /// # Errors
    /// Returns `SessionActive` while a generation is in progress and
    /// `NoPendingUserTurn` when the last message is not a user turn.
    pub fn append_streaming_placeholder(&mut self) -> Result<usize, TranscriptError> {
        if self.active.is_some() {
            return Err(TranscriptError::SessionActive);
        }
        let user = match self.messages.last() {
            Some(message) if message.role == Role::User => message.id,
            _ => return Err(TranscriptError::NoPendingUserTurn),
        };
        let placeholder = self.allocate_id();
        self.messages.push(Message {
            id: placeholder,
            role: Role::Assistant,
            content: String::new(),
            attachments: Vec::new(),
            streaming: true,
        });
        self.active = Some(ActiveTarget::Appended { user, placeholder });
        Ok(self.messages.len() - 1)
    }

    /// Appends `text` to the active message. Returns whether it applied.
    pub fn apply_delta(&mut self, text: &str) -> bool {
        let Some(index) = self.active_index() else {
            return false;
        };
        let message = &mut self.messages[index];
        if !message.streaming {
            return false;
        }
        message.content.push_str(text);
        true
    }

    /// Finalizes the active message; it becomes immutable history.
    pub fn finalize(&mut self) -> Option<&Message> {
        let index = self.active_index();
        self.active = None;
        let message = &mut self.messages[index?];
        message.streaming = false;
        Some(message)
    }

    /// Removes the placeholder and the user turn that triggered it.
    ///
    /// # Errors
    /// Returns `NoActiveSession` with nothing to roll back and
    /// `NotAnAppendedExchange` for a regeneration.
    pub fn rollback_last_exchange(&mut self) -> Result<(), TranscriptError> {
        let (user, placeholder) = match &self.active {
            None => return Err(TranscriptError::NoActiveSession),
            Some(ActiveTarget::Regenerated { .. }) => {
                return Err(TranscriptError::NotAnAppendedExchange);
            }
            Some(ActiveTarget::Appended { user, placeholder }) => (*user, *placeholder),
        };
        self.active = None;
        self.messages
            .retain(|message| message.id != placeholder && message.id != user);
        Ok(())
    }

    /// Checks the regenerate precondition without mutating anything.
    ///
    /// # Errors
    /// Returns `NoPrecedingPrompt` when `index == 0` or the message before
    /// `index` is not a user turn, and `NotAssistant` when the target itself
    /// is not a reply.
    pub fn check_regenerate(&self, index: usize) -> Result<(), RegenerateError> {
        if index >= self.messages.len() {
            return Err(RegenerateError::OutOfRange(index));
        }
        match index.checked_sub(1).map(|prev| self.messages[prev].role) {
            Some(Role::User) => {}
            _ => return Err(RegenerateError::NoPrecedingPrompt),
        }
        if self.messages[index].role != Role::Assistant {
            return Err(RegenerateError::NotAssistant(index));
        }
        Ok(())
    }

    /// Resets the message at `index` to an empty streaming target in place.
    ///
    /// # Errors
    /// Returns `SessionActive` during a generation and a `RegenerateError`
    /// when the precondition fails. The transcript is untouched on error.
    pub fn regenerate_at(&mut self, index: usize) -> Result<MessageId, TranscriptError> {
        if self.active.is_some() {
            return Err(TranscriptError::SessionActive);
        }
        self.check_regenerate(index)?;

        let message = &mut self.messages[index];
        let previous = std::mem::take(&mut message.content);
        message.streaming = true;
        let target = message.id;
        self.active = Some(ActiveTarget::Regenerated { target, previous });
        Ok(target)
    }

    /// Puts back the content a failed regeneration replaced.
    ///
    /// # Errors
    /// Returns `NoActiveSession` or `NotARegeneration`.
    pub fn restore_regenerated(&mut self) -> Result<(), TranscriptError> {
        let (target, previous) = match self.active.take() {
            None => return Err(TranscriptError::NoActiveSession),
            Some(ActiveTarget::Regenerated { target, previous }) => (target, previous),
            Some(other) => {
                self.active = Some(other);
                return Err(TranscriptError::NotARegeneration);
            }
        };
        if let Some(index) = self.index_of(target) {
            let message = &mut self.messages[index];
            message.content = previous;
            message.streaming = false;
        }
        Ok(())
    }

    /// Removes the message at `index`.
    ///
    /// # Errors
    /// Returns `OutOfRange` or `TargetBusy` when a generation writes there.
    pub fn delete_at(&mut self, index: usize) -> Result<Message, TranscriptError> {
        if index >= self.messages.len() {
            return Err(TranscriptError::OutOfRange(index));
        }
        if self.active_index() == Some(index) {
            return Err(TranscriptError::TargetBusy(index));
        }
        if let Some(ActiveTarget::Appended { user, .. }) = &self.active
            && self.messages[index].id == *user
        {
            return Err(TranscriptError::TargetBusy(index));
        }
        Ok(self.messages.remove(index))
    }

    /// Removes every message.
    ///
    /// # Errors
    /// Returns `SessionActive` while a generation is in progress.
    pub fn clear(&mut self) -> Result<(), TranscriptError> {
        if self.active.is_some() {
            return Err(TranscriptError::SessionActive);
        }
        self.messages.clear();
        Ok(())
    }

    fn index_of(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }

    fn allocate_id(&mut self) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streaming_count(transcript: &Transcript) -> usize {
        transcript.messages().iter().filter(|m| m.streaming).count()
    }

    fn exchange(transcript: &mut Transcript, prompt: &str, reply: &str) {
        transcript.append_user_turn(prompt, Vec::new()).unwrap();
        transcript.append_streaming_placeholder().unwrap();
        transcript.apply_delta(reply);
        transcript.finalize();
    }

    #[test]
    fn deltas_concatenate_into_finalized_message() {
        let mut transcript = Transcript::new();
        transcript.append_user_turn("greet me", Vec::new()).unwrap();
        transcript.append_streaming_placeholder().unwrap();

        for delta in ["Hel", "lo, ", "world!"] {
            assert!(transcript.apply_delta(delta));
        }
        let message = transcript.finalize().unwrap();

        assert_eq!(message.content, "Hello, world!");
        assert!(!message.streaming);
        assert_eq!(streaming_count(&transcript), 0);
    }

    #[test]
    fn apply_delta_after_finalize_is_noop() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q", "answer");

        assert!(!transcript.apply_delta(" late"));
        assert_eq!(transcript.messages()[1].content, "answer");
    }

    #[test]
    fn rollback_removes_exactly_two_messages() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "first", "one");
        transcript.append_user_turn("second", Vec::new()).unwrap();
        transcript.append_streaming_placeholder().unwrap();
        transcript.apply_delta("partial");

        transcript.rollback_last_exchange().unwrap();

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[0].content, "first");
        assert_eq!(transcript.messages()[1].content, "one");
        assert!(!transcript.is_streaming());
    }

    #[test]
    fn rollback_without_active_exchange_fails() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q", "a");
        assert_eq!(
            transcript.rollback_last_exchange(),
            Err(TranscriptError::NoActiveSession)
        );
        assert_eq!(transcript.len(), 2);
    }

    #[test]
    fn regenerate_preserves_length_id_and_position() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q1", "a1");
        exchange(&mut transcript, "q2", "a2");
        let id_before = transcript.messages()[1].id;

        let id = transcript.regenerate_at(1).unwrap();

        assert_eq!(id, id_before);
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript.messages()[1].content, "");
        assert!(transcript.messages()[1].streaming);
        assert_eq!(transcript.active_index(), Some(1));

        transcript.apply_delta("fresh");
        transcript.finalize();
        assert_eq!(transcript.messages()[1].content, "fresh");
        assert_eq!(transcript.messages()[1].id, id_before);
        assert_eq!(transcript.messages()[3].content, "a2");
    }

    #[test]
    fn regenerate_requires_preceding_user_turn() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q1", "a1");
        let before = transcript.snapshot();

        assert_eq!(
            transcript.regenerate_at(0),
            Err(TranscriptError::Regenerate(RegenerateError::NoPrecedingPrompt))
        );

        transcript.append_user_turn("q2", Vec::new()).unwrap();
        // index 2 is a user turn preceded by an assistant turn
        assert_eq!(
            transcript.regenerate_at(2),
            Err(TranscriptError::Regenerate(RegenerateError::NoPrecedingPrompt))
        );
        assert_eq!(&transcript.messages()[..2], &before[..]);
        assert!(!transcript.is_streaming());
    }

    #[test]
    fn regenerate_rejects_user_turn_left_behind_by_delete() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q1", "a1");
        exchange(&mut transcript, "q2", "a2");
        transcript.delete_at(1).unwrap();
        // [q1, q2, a2]: index 1 is a user turn after a user turn
        let before = transcript.snapshot();

        assert_eq!(
            transcript.regenerate_at(1),
            Err(TranscriptError::Regenerate(RegenerateError::NotAssistant(1)))
        );
        assert!(!transcript.apply_delta("model output"));
        assert_eq!(transcript.messages(), &before[..]);
        assert_eq!(transcript.messages()[1].role, Role::User);
        assert_eq!(transcript.messages()[1].content, "q2");
        assert!(transcript.regenerate_at(2).is_ok());
    }

    #[test]
    fn restore_regenerated_puts_previous_content_back() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q", "original");
        transcript.regenerate_at(1).unwrap();
        transcript.apply_delta("half");

        transcript.restore_regenerated().unwrap();

        assert_eq!(transcript.messages()[1].content, "original");
        assert!(!transcript.messages()[1].streaming);
        assert!(!transcript.is_streaming());
    }

    #[test]
    fn delete_and_clear_respect_active_target() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q1", "a1");
        transcript.append_user_turn("q2", Vec::new()).unwrap();
        transcript.append_streaming_placeholder().unwrap();

        assert_eq!(transcript.delete_at(3), Err(TranscriptError::TargetBusy(3)));
        assert_eq!(transcript.delete_at(2), Err(TranscriptError::TargetBusy(2)));
        assert_eq!(transcript.clear(), Err(TranscriptError::SessionActive));

        // Deleting an earlier message keeps the active target addressable.
        transcript.delete_at(0).unwrap();
        assert_eq!(transcript.active_index(), Some(2));
        assert!(transcript.apply_delta("ok"));
        transcript.finalize();
        assert_eq!(transcript.messages()[2].content, "ok");

        transcript.clear().unwrap();
        assert!(transcript.is_empty());
        assert_eq!(transcript.delete_at(0), Err(TranscriptError::OutOfRange(0)));
    }

    #[test]
    fn at_most_one_message_streams_across_operation_sequences() {
        let mut transcript = Transcript::new();
        for round in 0..6 {
            transcript
                .append_user_turn(format!("q{round}"), Vec::new())
                .unwrap();
            transcript.append_streaming_placeholder().unwrap();
            assert_eq!(streaming_count(&transcript), 1);

            // A second target is refused while one is active.
            assert!(transcript.append_user_turn("x", Vec::new()).is_err());
            assert!(transcript.regenerate_at(1).is_err());
            assert_eq!(streaming_count(&transcript), 1);

            transcript.apply_delta("a");
            if round % 3 == 0 {
                transcript.rollback_last_exchange().unwrap();
            } else {
                transcript.finalize();
            }
            assert_eq!(streaming_count(&transcript), 0);

            if let Some(index) = transcript.last_assistant_index() {
                transcript.regenerate_at(index).unwrap();
                assert_eq!(streaming_count(&transcript), 1);
                transcript.finalize();
            }
            assert_eq!(streaming_count(&transcript), 0);
        }
    }

    #[test]
    fn from_history_clears_streaming_and_continues_ids() {
        let mut transcript = Transcript::new();
        exchange(&mut transcript, "q", "a");
        let mut history = transcript.snapshot();
        history[1].streaming = true;

        let mut restored = Transcript::from_history(history);
        assert_eq!(streaming_count(&restored), 0);
        let id = restored.append_user_turn("next", Vec::new()).unwrap();
        assert_eq!(id, MessageId(2));
    }

    #[test]
    fn placeholder_requires_user_turn() {
        let mut transcript = Transcript::new();
        assert_eq!(
            transcript.append_streaming_placeholder(),
            Err(TranscriptError::NoPendingUserTurn)
        );
    }

    #[test]
    fn attachment_from_bytes_encodes_base64() {
        let attachment = Attachment::from_bytes("image/png", &[1, 2, 3]);
        assert_eq!(attachment.base64_data, "AQID");
        assert!(attachment.is_image());
        assert!(!Attachment::new("application/pdf", "").is_image());
    }
}
