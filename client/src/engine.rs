//! Conversation Sync Engine.
//!
//! Owns the consistency contract for the one conversation the UI shows:
//! REST history and live notifications are reconciled into a single
//! [`MessageTimeline`], and the channel lifecycle follows selection.
//!
//! The engine never performs I/O. Each call to [`SyncEngine::handle`] takes
//! one event and returns the effects the driver must carry out. Every
//! fetch, channel attempt and reconnect timer is identified by a
//! [`RequestTag`]; events whose tag is no longer current are dropped, which
//! is what keeps a late fetch for a previous conversation from touching the
//! one now on screen.
//!
//! The engine also keeps the user's conversation list, refreshed on request
//! and alongside every notification-driven history refetch. The list
//! survives conversation switches.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use tempest_chat_shared::protocol::CLOSE_SUPERSEDED;
use tempest_chat_shared::{
    ClientFrame, Conversation, ErrorKind, Message, SendMessage, ServerFrame,
};

use crate::backoff::Backoff;
use crate::timeline::MessageTimeline;

/// Identifies one piece of in-flight work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestTag {
    pub conversation_id: Uuid,
    /// Bumped on every selection.
    pub epoch: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Nothing selected yet.
    Idle,
    /// First history fetch and channel open in progress.
    Fetching,
    /// Channel open and history in sync.
    Live,
    /// Waiting to reopen the channel.
    Reconnecting { attempt: u32 },
    /// Gave up. Needs `Retry` or a new selection.
    Disconnected,
    /// Conversation deselected; all state discarded.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Select(Uuid),
    Deselect,
    Retry,
    HistoryLoaded {
        tag: RequestTag,
        messages: Vec<Message>,
    },
    HistoryFailed {
        tag: RequestTag,
        kind: ErrorKind,
    },
    /// The channel is registered on the gateway (its `ready` frame arrived).
    ChannelOpened { tag: RequestTag },
    ChannelClosed {
        tag: RequestTag,
        code: Option<u16>,
    },
    /// The connect attempt itself failed.
    ChannelFailed { tag: RequestTag },
    Frame {
        tag: RequestTag,
        frame: ServerFrame,
    },
    ReconnectDue { tag: RequestTag },
    /// Reload the conversation list.
    RefreshConversations,
    ConversationsLoaded {
        seq: u64,
        conversations: Vec<Conversation>,
    },
    ConversationsFailed {
        seq: u64,
        kind: ErrorKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    FetchHistory(RequestTag),
    CancelFetch(RequestTag),
    OpenChannel(RequestTag),
    CloseChannel(RequestTag),
    ScheduleReconnect { tag: RequestTag, delay: Duration },
    CancelReconnect(RequestTag),
    FetchConversations(u64),
}

/// Why a send was refused before reaching the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no conversation is open")]
    NoConversation,
    #[error("message text is empty")]
    EmptyText,
    #[error("chat is not connected ({0:?})")]
    NotLive(SyncStatus),
    #[error("chat session has stopped")]
    SessionGone,
}

/// A send the gateway rejected after it left the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub request_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug)]
struct Active {
    conversation_id: Uuid,
    timeline: MessageTimeline,
    fetch: Option<RequestTag>,
    refetch_queued: bool,
    history_loaded: bool,
    channel: Option<RequestTag>,
    channel_open: bool,
    /// Set on every channel open until a fetch started after it completes.
    awaiting_resync: bool,
    reconnect: Option<RequestTag>,
    attempt: u32,
    participant_id: Option<Uuid>,
}

impl Active {
    fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            timeline: MessageTimeline::new(conversation_id),
            fetch: None,
            refetch_queued: false,
            history_loaded: false,
            channel: None,
            channel_open: false,
            awaiting_resync: false,
            reconnect: None,
            attempt: 0,
            participant_id: None,
        }
    }
}

#[derive(Debug)]
pub struct SyncEngine {
    backoff: Backoff,
    epoch: u64,
    seq: u64,
    status: SyncStatus,
    active: Option<Active>,
    last_error: Option<ErrorKind>,
    send_failure: Option<SendFailure>,
    sends: u64,
    conversations: Vec<Conversation>,
    list_fetch: Option<u64>,
    list_queued: bool,
}

impl SyncEngine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            epoch: 0,
            seq: 0,
            status: SyncStatus::Idle,
            active: None,
            last_error: None,
            send_failure: None,
            sends: 0,
            conversations: Vec::new(),
            list_fetch: None,
            list_queued: false,
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.conversation_id)
    }

    pub fn messages(&self) -> &[Message] {
        self.active
            .as_ref()
            .map(|a| a.timeline.messages())
            .unwrap_or_default()
    }

    /// Why the engine is `Disconnected`, or the last transient failure.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn send_failure(&self) -> Option<&SendFailure> {
        self.send_failure.as_ref()
    }

    /// Tag of the channel currently open, if any.
    pub fn live_channel(&self) -> Option<RequestTag> {
        self.active
            .as_ref()
            .filter(|a| a.channel_open)
            .and_then(|a| a.channel)
    }

    /// The user's conversations, most recently active first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Participant id the gateway reported for this channel.
    pub fn participant_id(&self) -> Option<Uuid> {
        self.active.as_ref().and_then(|a| a.participant_id)
    }

    /// Apply one event and return the work the driver must start.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            Event::Select(conversation_id) => self.select(conversation_id, &mut effects),
            Event::Deselect => {
                self.teardown(&mut effects);
                self.status = SyncStatus::Closed;
                self.last_error = None;
                self.send_failure = None;
            }
            Event::Retry => self.retry(&mut effects),
            Event::HistoryLoaded { tag, messages } => {
                self.history_loaded(tag, messages, &mut effects)
            }
            Event::HistoryFailed { tag, kind } => self.history_failed(tag, kind, &mut effects),
            Event::ChannelOpened { tag } => self.channel_opened(tag, &mut effects),
            Event::ChannelClosed { tag, code } => self.channel_closed(tag, code, &mut effects),
            Event::ChannelFailed { tag } => {
                if self.is_current_channel(tag) {
                    tracing::debug!(?tag, "Channel connect failed");
                    if let Some(active) = self.active.as_mut() {
                        active.channel = None;
                        active.channel_open = false;
                    }
                    self.last_error = Some(ErrorKind::ChannelLost);
                    self.schedule_reconnect(&mut effects);
                }
            }
            Event::Frame { tag, frame } => {
                if self.is_current_channel(tag) {
                    self.frame(frame, &mut effects);
                }
            }
            Event::ReconnectDue { tag } => {
                let due = self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.reconnect == Some(tag));
                if due {
                    if let Some(active) = self.active.as_mut() {
                        active.reconnect = None;
                    }
                    self.open_channel(&mut effects);
                }
            }
            Event::RefreshConversations => self.request_conversations(&mut effects),
            Event::ConversationsLoaded { seq, conversations } => {
                if self.list_fetch == Some(seq) {
                    self.list_fetch = None;
                    self.conversations = conversations;
                    if std::mem::take(&mut self.list_queued) {
                        self.start_conversations(&mut effects);
                    }
                }
            }
            Event::ConversationsFailed { seq, kind } => {
                if self.list_fetch == Some(seq) {
                    // Keep the stale list; the next notification retries
                    tracing::warn!(seq, %kind, "Conversation list fetch failed");
                    self.list_fetch = None;
                    self.list_queued = false;
                }
            }
        }
        self.settle();
        effects
    }

    /// Build the frame for a user send. Only allowed while `Live`; the
    /// rejection is returned immediately and nothing is queued.
    pub fn prepare_send(&mut self, text: &str) -> Result<ClientFrame, SendError> {
        let conversation_id = self.conversation_id().ok_or(SendError::NoConversation)?;
        if self.status != SyncStatus::Live {
            return Err(SendError::NotLive(self.status));
        }
        if text.trim().is_empty() {
            return Err(SendError::EmptyText);
        }

        self.sends += 1;
        self.send_failure = None;
        Ok(ClientFrame::SendMessage(SendMessage {
            conversation_id: Some(conversation_id),
            sender_id: None,
            text: text.to_string(),
            request_id: Some(format!("{}-{}", self.epoch, self.sends)),
        }))
    }

    fn next_tag(&mut self, conversation_id: Uuid) -> RequestTag {
        self.seq += 1;
        RequestTag {
            conversation_id,
            epoch: self.epoch,
            seq: self.seq,
        }
    }

    fn select(&mut self, conversation_id: Uuid, effects: &mut Vec<Effect>) {
        if self.conversation_id() == Some(conversation_id) {
            if self.status == SyncStatus::Disconnected {
                self.retry(effects);
            }
            return;
        }

        self.teardown(effects);
        self.epoch += 1;
        self.last_error = None;
        self.send_failure = None;
        self.active = Some(Active::new(conversation_id));
        self.status = SyncStatus::Fetching;
        tracing::debug!(conversation_id = %conversation_id, epoch = self.epoch, "Conversation selected");

        self.start_fetch(effects);
        self.open_channel(effects);
    }

    /// Cancel everything in flight and drop the active conversation.
    fn teardown(&mut self, effects: &mut Vec<Effect>) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Some(tag) = active.fetch {
            effects.push(Effect::CancelFetch(tag));
        }
        if let Some(tag) = active.channel {
            effects.push(Effect::CloseChannel(tag));
        }
        if let Some(tag) = active.reconnect {
            effects.push(Effect::CancelReconnect(tag));
        }
    }

    fn retry(&mut self, effects: &mut Vec<Effect>) {
        if self.status != SyncStatus::Disconnected {
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.attempt = 0;
        self.last_error = None;
        self.status = SyncStatus::Fetching;
        self.open_channel(effects);
    }

    fn start_fetch(&mut self, effects: &mut Vec<Effect>) {
        let Some(conversation_id) = self.conversation_id() else {
            return;
        };
        let tag = self.next_tag(conversation_id);
        if let Some(active) = self.active.as_mut() {
            active.fetch = Some(tag);
            active.refetch_queued = false;
            effects.push(Effect::FetchHistory(tag));
        }
    }

    /// Fetch now, or once the fetch in flight completes.
    fn request_fetch(&mut self, effects: &mut Vec<Effect>) {
        match self.active.as_mut() {
            Some(active) if active.fetch.is_some() => active.refetch_queued = true,
            Some(_) => self.start_fetch(effects),
            None => {}
        }
    }

    /// Reload the list now, or once the reload in flight completes.
    fn request_conversations(&mut self, effects: &mut Vec<Effect>) {
        if self.list_fetch.is_some() {
            self.list_queued = true;
        } else {
            self.start_conversations(effects);
        }
    }

    fn start_conversations(&mut self, effects: &mut Vec<Effect>) {
        self.seq += 1;
        self.list_fetch = Some(self.seq);
        self.list_queued = false;
        effects.push(Effect::FetchConversations(self.seq));
    }

    fn open_channel(&mut self, effects: &mut Vec<Effect>) {
        let Some(conversation_id) = self.conversation_id() else {
            return;
        };
        let tag = self.next_tag(conversation_id);
        if let Some(active) = self.active.as_mut() {
            if let Some(old) = active.channel.replace(tag) {
                effects.push(Effect::CloseChannel(old));
            }
            active.channel_open = false;
            effects.push(Effect::OpenChannel(tag));
        }
    }

    fn is_current_fetch(&self, tag: RequestTag) -> bool {
        self.active.as_ref().is_some_and(|a| a.fetch == Some(tag))
    }

    fn is_current_channel(&self, tag: RequestTag) -> bool {
        self.active.as_ref().is_some_and(|a| a.channel == Some(tag))
    }

    fn history_loaded(&mut self, tag: RequestTag, messages: Vec<Message>, effects: &mut Vec<Effect>) {
        if !self.is_current_fetch(tag) {
            tracing::debug!(?tag, "Discarding stale history");
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.fetch = None;
        active.timeline.replace(messages);
        active.history_loaded = true;

        if active.refetch_queued {
            self.start_fetch(effects);
        } else {
            active.awaiting_resync = false;
        }
    }

    fn history_failed(&mut self, tag: RequestTag, kind: ErrorKind, effects: &mut Vec<Effect>) {
        if !self.is_current_fetch(tag) {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.fetch = None;
            active.refetch_queued = false;
        }
        tracing::warn!(?tag, %kind, "History fetch failed");
        self.last_error = Some(kind);

        if is_terminal(kind) {
            self.disconnect(kind, effects);
            return;
        }

        // Drop the channel and recover through reconnect-refetch.
        if let Some(active) = self.active.as_mut() {
            if let Some(channel) = active.channel.take() {
                effects.push(Effect::CloseChannel(channel));
            }
            active.channel_open = false;
        }
        if self.active.as_ref().is_some_and(|a| a.reconnect.is_none()) {
            self.schedule_reconnect(effects);
        }
    }

    fn channel_opened(&mut self, tag: RequestTag, effects: &mut Vec<Effect>) {
        if !self.is_current_channel(tag) {
            effects.push(Effect::CloseChannel(tag));
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.channel_open = true;
            active.awaiting_resync = true;
        }
        tracing::debug!(?tag, "Channel open, resyncing history");
        self.request_fetch(effects);
    }

    fn channel_closed(&mut self, tag: RequestTag, code: Option<u16>, effects: &mut Vec<Effect>) {
        if !self.is_current_channel(tag) {
            return;
        }
        if let Some(active) = self.active.as_mut() {
            active.channel = None;
            active.channel_open = false;
        }

        let terminal = code.and_then(|c| match c {
            CLOSE_SUPERSEDED => Some(ErrorKind::ChannelLost),
            other => ErrorKind::from_close_code(other),
        });
        if let Some(kind) = terminal {
            tracing::info!(?tag, ?code, %kind, "Channel closed for good");
            self.last_error = Some(kind);
            self.disconnect(kind, effects);
            return;
        }

        tracing::info!(?tag, ?code, "Channel lost");
        self.last_error = Some(ErrorKind::ChannelLost);
        self.schedule_reconnect(effects);
    }

    fn frame(&mut self, frame: ServerFrame, effects: &mut Vec<Effect>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match frame {
            ServerFrame::Ready { participant_id, .. } => {
                active.participant_id = Some(participant_id);
            }
            ServerFrame::MessageCreated {
                conversation_id,
                message,
            } => {
                if conversation_id != active.conversation_id {
                    return;
                }
                let known = message.as_ref().is_some_and(|m| {
                    active.timeline.contains(m.id)
                        && active.timeline.cursor().is_some_and(|c| m.key() <= c)
                });
                if !known {
                    self.request_fetch(effects);
                    self.request_conversations(effects);
                }
            }
            ServerFrame::SendAccepted { .. } => {}
            ServerFrame::Error {
                request_id,
                kind,
                message,
            } => {
                tracing::debug!(?request_id, %kind, "Send rejected by gateway");
                self.send_failure = Some(SendFailure {
                    request_id,
                    kind,
                    message,
                });
            }
        }
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        let Some(conversation_id) = self.conversation_id() else {
            return;
        };
        let attempt = self.active.as_ref().map_or(0, |a| a.attempt) + 1;
        let Some(delay) = self.backoff.delay(attempt) else {
            tracing::warn!(conversation_id = %conversation_id, "Reconnect attempts exhausted");
            self.disconnect(ErrorKind::ChannelLost, effects);
            return;
        };

        let tag = self.next_tag(conversation_id);
        if let Some(active) = self.active.as_mut() {
            active.attempt = attempt;
            if let Some(old) = active.reconnect.replace(tag) {
                effects.push(Effect::CancelReconnect(old));
            }
        }
        effects.push(Effect::ScheduleReconnect { tag, delay });
    }

    /// Stop all work but keep the timeline on screen.
    fn disconnect(&mut self, kind: ErrorKind, effects: &mut Vec<Effect>) {
        self.last_error = Some(kind);
        self.status = SyncStatus::Disconnected;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Some(tag) = active.fetch.take() {
            effects.push(Effect::CancelFetch(tag));
        }
        if let Some(tag) = active.channel.take() {
            effects.push(Effect::CloseChannel(tag));
        }
        if let Some(tag) = active.reconnect.take() {
            effects.push(Effect::CancelReconnect(tag));
        }
        active.refetch_queued = false;
        active.channel_open = false;
    }

    fn settle(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if matches!(self.status, SyncStatus::Disconnected | SyncStatus::Closed) {
            return;
        }
        self.status = if active.channel_open && active.history_loaded && !active.awaiting_resync {
            active.attempt = 0;
            SyncStatus::Live
        } else if active.attempt > 0 {
            SyncStatus::Reconnecting {
                attempt: active.attempt,
            }
        } else {
            SyncStatus::Fetching
        };
    }
}

fn is_terminal(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::AuthenticationFailed | ErrorKind::Forbidden | ErrorKind::NotFound
    )
}
