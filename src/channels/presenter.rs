//! Presents one run as a single live-edited chat message.
//!
//! The first render is sent silently as a reply. Later renders are coalesced
//! and edited in at most once per debounce interval; identical text is never
//! re-sent. The final render either edits the progress message in place or,
//! when the user should be notified or the text no longer fits, goes out as a
//! new message and the progress message is deleted.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::channels::channel::{SendOptions, Transport};
use crate::error::TransportError;
use crate::render::markup::{MarkupRenderer, PlainText};
use crate::render::progress::MessageParts;
use crate::render::truncate::{PreparedMessage, TELEGRAM_MAX_LEN, is_oversized, prepare_message};

/// Default minimum time between progress edits.
pub const DEFAULT_EDIT_EVERY: Duration = Duration::from_secs(1);

/// Presenter knobs.
#[derive(Debug, Clone)]
pub struct PresenterOptions {
    /// Message the progress message replies to.
    pub reply_to: Option<i64>,
    pub limit: usize,
    pub edit_every: Duration,
    /// Always deliver the final answer as a new, notifying message.
    pub final_notify: bool,
}

impl Default for PresenterOptions {
    fn default() -> Self {
        Self {
            reply_to: None,
            limit: TELEGRAM_MAX_LEN,
            edit_every: DEFAULT_EDIT_EVERY,
            final_notify: false,
        }
    }
}

pub struct ProgressPresenter {
    transport: Arc<dyn Transport>,
    markup: Arc<dyn MarkupRenderer>,
    chat_id: i64,
    options: PresenterOptions,
    message_id: Option<i64>,
    last_text: Option<String>,
    last_edit_at: Option<Instant>,
    pending: Option<MessageParts>,
}

impl std::fmt::Debug for ProgressPresenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressPresenter")
            .field("transport", &self.transport.name())
            .field("chat_id", &self.chat_id)
            .field("message_id", &self.message_id)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

impl ProgressPresenter {
    pub fn new(transport: Arc<dyn Transport>, chat_id: i64, options: PresenterOptions) -> Self {
        Self {
            transport,
            markup: Arc::new(PlainText),
            chat_id,
            options,
            message_id: None,
            last_text: None,
            last_edit_at: None,
            pending: None,
        }
    }

    pub fn with_markup(mut self, markup: Arc<dyn MarkupRenderer>) -> Self {
        self.markup = markup;
        self
    }

    /// Id of the live progress message, once sent.
    pub fn message_id(&self) -> Option<i64> {
        self.message_id
    }

    fn prepare(&self, parts: &MessageParts) -> PreparedMessage {
        prepare_message(parts, self.options.limit, self.markup.as_ref())
    }

    /// Send the progress message silently. Returns its id.
    pub async fn start(&mut self, parts: &MessageParts) -> Result<i64, TransportError> {
        if let Some(id) = self.message_id {
            return Ok(id);
        }
        let prepared = self.prepare(parts);
        let id = self
            .transport
            .send(
                self.chat_id,
                &prepared.text,
                SendOptions::silent_reply(self.options.reply_to).with_entities(prepared.entities),
            )
            .await?;
        self.message_id = Some(id);
        self.last_text = Some(prepared.text);
        self.last_edit_at = Some(Instant::now());
        Ok(id)
    }

    /// Queue a new render, editing right away when the interval allows.
    pub async fn update(&mut self, parts: MessageParts) -> Result<(), TransportError> {
        if self.message_id.is_none() {
            self.start(&parts).await?;
            return Ok(());
        }
        self.pending = Some(parts);
        if self.next_flush_at().is_some_and(|at| at <= Instant::now()) {
            self.flush().await?;
        }
        Ok(())
    }

    /// When the pending render may be edited in, if one is waiting.
    pub fn next_flush_at(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        Some(match self.last_edit_at {
            Some(at) => at + self.options.edit_every,
            None => Instant::now(),
        })
    }

    /// Edit in the pending render. Returns whether an edit was made.
    pub async fn flush(&mut self) -> Result<bool, TransportError> {
        let (Some(parts), Some(id)) = (self.pending.take(), self.message_id) else {
            return Ok(false);
        };
        let prepared = self.prepare(&parts);
        if self.last_text.as_deref() == Some(prepared.text.as_str()) {
            return Ok(false);
        }
        self.transport
            .edit(self.chat_id, id, &prepared.text, prepared.entities)
            .await?;
        self.last_text = Some(prepared.text);
        self.last_edit_at = Some(Instant::now());
        Ok(true)
    }

    /// Deliver the final render. Returns the id of the message holding it.
    pub async fn finish(&mut self, parts: &MessageParts) -> Result<i64, TransportError> {
        self.pending = None;
        let oversized = is_oversized(parts, self.options.limit);
        let prepared = self.prepare(parts);

        match self.message_id {
            Some(id) if !self.options.final_notify && !oversized => {
                if self.last_text.as_deref() != Some(prepared.text.as_str()) {
                    self.transport
                        .edit(self.chat_id, id, &prepared.text, prepared.entities)
                        .await?;
                    self.last_text = Some(prepared.text);
                }
                Ok(id)
            }
            previous => {
                let final_id = self
                    .transport
                    .send(
                        self.chat_id,
                        &prepared.text,
                        SendOptions::loud_reply(self.options.reply_to)
                            .with_entities(prepared.entities),
                    )
                    .await?;
                if let Some(old) = previous {
                    if let Err(e) = self.transport.delete(self.chat_id, old).await {
                        tracing::warn!(
                            message_id = old,
                            "Failed to delete progress message: {}",
                            e
                        );
                    }
                }
                self.message_id = Some(final_id);
                self.last_text = Some(prepared.text);
                Ok(final_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::channels::channel::testing::{Call, RecordingTransport};

    fn parts(header: &str) -> MessageParts {
        MessageParts {
            header: header.to_string(),
            body: None,
            footer: None,
        }
    }

    fn presenter(transport: &Arc<RecordingTransport>, final_notify: bool) -> ProgressPresenter {
        ProgressPresenter::new(
            transport.clone(),
            7,
            PresenterOptions {
                reply_to: Some(42),
                final_notify,
                ..PresenterOptions::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_render_is_silent_reply() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, true);

        presenter.update(parts("working · codex · 0s")).await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![Call::Send {
                chat_id: 7,
                text: "working · codex · 0s".into(),
                reply_to: Some(42),
                silent: true,
                entities: None,
            }]
        );
        assert_eq!(presenter.message_id(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_are_debounced_and_coalesced() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, true);
        let start = Instant::now();
        presenter.start(&parts("p0")).await.unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        presenter.update(parts("p1")).await.unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        presenter.update(parts("p2")).await.unwrap();
        assert!(transport.edits().is_empty());
        assert_eq!(presenter.next_flush_at(), Some(start + Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(presenter.flush().await.unwrap());
        assert_eq!(
            transport.edits(),
            vec![Call::Edit {
                message_id: 1,
                text: "p2".into(),
                entities: None,
            }]
        );
        assert_eq!(presenter.next_flush_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_due_update_edits_immediately() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, true);
        presenter.start(&parts("p0")).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        presenter.update(parts("p1")).await.unwrap();
        assert_eq!(transport.edits().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_text_is_not_edited() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, true);
        presenter.start(&parts("same")).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        presenter.update(parts("same")).await.unwrap();
        assert!(transport.edits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_notify_sends_new_message_and_deletes_progress() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, true);
        presenter.start(&parts("working")).await.unwrap();

        let id = presenter.finish(&parts("done")).await.unwrap();

        assert_eq!(id, 2);
        let sends = transport.sends();
        assert_eq!(sends.len(), 2);
        assert!(matches!(
            &sends[1],
            Call::Send { silent: false, reply_to: Some(42), text, .. } if text == "done"
        ));
        assert_eq!(transport.deletes(), vec![Call::Delete { message_id: 1 }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_edits_in_place_without_notify() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, false);
        presenter.start(&parts("working")).await.unwrap();

        let id = presenter.finish(&parts("done")).await.unwrap();

        assert_eq!(id, 1);
        assert_eq!(transport.sends().len(), 1);
        assert_eq!(transport.edits().len(), 1);
        assert!(transport.deletes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_final_goes_out_as_new_message() {
        let transport = Arc::new(RecordingTransport::new());
        let mut presenter = presenter(&transport, false);
        presenter.start(&parts("working")).await.unwrap();

        let long = MessageParts {
            header: "done · codex · 1s".into(),
            body: Some("x".repeat(10_000)),
            footer: None,
        };
        presenter.finish(&long).await.unwrap();

        let sends = transport.sends();
        assert_eq!(sends.len(), 2);
        let Call::Send { text, silent, .. } = &sends[1] else {
            unreachable!()
        };
        assert!(!silent);
        assert!(text.chars().count() <= TELEGRAM_MAX_LEN);
        assert_eq!(transport.deletes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_failure_propagates() {
        let transport = Arc::new(RecordingTransport::failing_edits(403));
        let mut presenter = presenter(&transport, false);
        presenter.start(&parts("working")).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = presenter.update(parts("step")).await.unwrap_err();
        assert!(matches!(err, TransportError::Api { code: 403, .. }));
    }
}
