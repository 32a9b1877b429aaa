//! Async driver for a [`SyncEngine`].
//!
//! One task owns the engine. UI calls arrive as commands, transport
//! results arrive as events, and every effect the engine returns is turned
//! into a spawned task keyed by its [`RequestTag`] so it can be cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tempest_chat_shared::{ClientFrame, Conversation, ErrorKind, Message, ServerFrame};

use crate::backoff::Backoff;
use crate::engine::{Effect, Event, RequestTag, SendError, SendFailure, SyncEngine, SyncStatus};
use crate::transport::{ChannelConnector, ChannelEvent, ChannelHandle, HistorySource};

#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub backoff: Backoff,
}

/// Read-only view of the active conversation and the conversation list.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    pub conversation_id: Option<Uuid>,
    pub status: SyncStatus,
    pub messages: Arc<Vec<Message>>,
    /// The current user as the gateway identified them on the open channel.
    pub participant_id: Option<Uuid>,
    pub conversations: Arc<Vec<Conversation>>,
    pub last_error: Option<ErrorKind>,
    pub send_failure: Option<SendFailure>,
}

impl SyncSnapshot {
    fn of(engine: &SyncEngine) -> Self {
        Self {
            conversation_id: engine.conversation_id(),
            status: engine.status(),
            messages: Arc::new(engine.messages().to_vec()),
            participant_id: engine.participant_id(),
            conversations: Arc::new(engine.conversations().to_vec()),
            last_error: engine.last_error(),
            send_failure: engine.send_failure().cloned(),
        }
    }

    /// Backoff exhausted or access refused, as opposed to an empty chat.
    pub fn is_unreachable(&self) -> bool {
        self.status == SyncStatus::Disconnected
    }
}

enum Command {
    Select(Uuid),
    Deselect,
    Retry,
    RefreshConversations,
    Send {
        text: String,
        reply: oneshot::Sender<Result<String, SendError>>,
    },
}

enum Internal {
    Engine(Event),
    Connected(RequestTag, ChannelHandle),
}

/// UI-side handle. Dropping every clone stops the session.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<SyncSnapshot>,
}

impl SyncHandle {
    pub fn select(&self, conversation_id: Uuid) {
        let _ = self.commands.send(Command::Select(conversation_id));
    }

    pub fn deselect(&self) {
        let _ = self.commands.send(Command::Deselect);
    }

    /// Reconnect after the session gave up.
    pub fn retry(&self) {
        let _ = self.commands.send(Command::Retry);
    }

    /// Reload the conversation list.
    pub fn refresh_conversations(&self) {
        let _ = self.commands.send(Command::RefreshConversations);
    }

    /// Send text on the live channel. Resolves as soon as the frame is
    /// queued, or fails right away when the chat is not live. Returns the
    /// request id the gateway echoes back.
    pub async fn send(&self, text: impl Into<String>) -> Result<String, SendError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.into(),
                reply,
            })
            .map_err(|_| SendError::SessionGone)?;
        rx.await.map_err(|_| SendError::SessionGone)?
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshots.clone()
    }
}

/// Start the driver task.
pub fn spawn_session<H, C>(
    history: H,
    connector: C,
    config: SyncConfig,
) -> (SyncHandle, JoinHandle<()>)
where
    H: HistorySource,
    C: ChannelConnector,
{
    let engine = SyncEngine::new(config.backoff);
    let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::of(&engine));
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let driver = Driver {
        engine,
        history: Arc::new(history),
        connector: Arc::new(connector),
        snapshots: snapshot_tx,
        internal: mpsc::unbounded_channel(),
        tasks: HashMap::new(),
        list_task: None,
        channels: HashMap::new(),
    };
    let join = tokio::spawn(driver.run(command_rx));

    (
        SyncHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        },
        join,
    )
}

struct Driver<H, C> {
    engine: SyncEngine,
    history: Arc<H>,
    connector: Arc<C>,
    snapshots: watch::Sender<SyncSnapshot>,
    internal: (
        mpsc::UnboundedSender<Internal>,
        mpsc::UnboundedReceiver<Internal>,
    ),
    tasks: HashMap<RequestTag, JoinHandle<()>>,
    list_task: Option<JoinHandle<()>>,
    channels: HashMap<RequestTag, mpsc::UnboundedSender<ClientFrame>>,
}

impl<H: HistorySource, C: ChannelConnector> Driver<H, C> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.command(command),
                    None => break,
                },
                Some(internal) = self.internal.1.recv() => self.on_internal(internal),
            }
        }

        for (_, task) in self.tasks.drain() {
            task.abort();
        }
        if let Some(task) = self.list_task.take() {
            task.abort();
        }
        self.channels.clear();
        tracing::debug!("Sync session stopped");
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::Select(id) => self.apply(Event::Select(id)),
            Command::Deselect => self.apply(Event::Deselect),
            Command::Retry => self.apply(Event::Retry),
            Command::RefreshConversations => self.apply(Event::RefreshConversations),
            Command::Send { text, reply } => {
                let result = self.send(&text);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "Send refused");
                }
                let _ = reply.send(result);
                self.publish();
            }
        }
    }

    fn send(&mut self, text: &str) -> Result<String, SendError> {
        let frame = self.engine.prepare_send(text)?;
        let ClientFrame::SendMessage(ref send) = frame;
        let request_id = send.request_id.clone().unwrap_or_default();

        let outbound = self
            .engine
            .live_channel()
            .and_then(|tag| self.channels.get(&tag))
            .ok_or(SendError::NotLive(self.engine.status()))?;
        outbound
            .send(frame)
            .map_err(|_| SendError::NotLive(self.engine.status()))?;
        Ok(request_id)
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Engine(event) => {
                match &event {
                    Event::HistoryLoaded { tag, .. }
                    | Event::HistoryFailed { tag, .. }
                    | Event::ChannelFailed { tag }
                    | Event::ReconnectDue { tag } => {
                        self.tasks.remove(tag);
                    }
                    Event::ChannelClosed { tag, .. } => {
                        self.tasks.remove(tag);
                        self.channels.remove(tag);
                    }
                    Event::ConversationsLoaded { .. } | Event::ConversationsFailed { .. } => {
                        self.list_task = None;
                    }
                    _ => {}
                }
                self.apply(event)
            }
            Internal::Connected(tag, handle) => self.connected(tag, handle),
        }
    }

    fn connected(&mut self, tag: RequestTag, handle: ChannelHandle) {
        let ChannelHandle {
            participant_id,
            outbound,
            mut inbound,
        } = handle;
        self.channels.insert(tag, outbound);

        // Forward channel traffic for as long as this tag is current.
        let events = self.internal.0.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let event = match event {
                    ChannelEvent::Frame(frame) => Event::Frame { tag, frame },
                    ChannelEvent::Closed { code } => Event::ChannelClosed { tag, code },
                };
                if events.send(Internal::Engine(event)).is_err() {
                    return;
                }
            }
        });
        self.tasks.insert(tag, forwarder);

        self.apply(Event::ChannelOpened { tag });
        self.apply(Event::Frame {
            tag,
            frame: ServerFrame::Ready {
                conversation_id: tag.conversation_id,
                participant_id,
            },
        });
    }

    fn apply(&mut self, event: Event) {
        let effects = self.engine.handle(event);
        for effect in effects {
            self.effect(effect);
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(SyncSnapshot::of(&self.engine));
    }

    fn effect(&mut self, effect: Effect) {
        let events = self.internal.0.clone();
        match effect {
            Effect::FetchHistory(tag) => {
                let history = self.history.clone();
                let task = tokio::spawn(async move {
                    let event = match history.fetch_history(tag.conversation_id).await {
                        Ok(messages) => Event::HistoryLoaded { tag, messages },
                        Err(e) => {
                            tracing::warn!(error = %e, "History fetch failed");
                            Event::HistoryFailed {
                                tag,
                                kind: e.kind(),
                            }
                        }
                    };
                    let _ = events.send(Internal::Engine(event));
                });
                self.tasks.insert(tag, task);
            }
            Effect::OpenChannel(tag) => {
                let connector = self.connector.clone();
                let task = tokio::spawn(async move {
                    let internal = match connector.connect(tag.conversation_id).await {
                        Ok(handle) => Internal::Connected(tag, handle),
                        Err(e) => {
                            tracing::warn!(error = %e, "Channel connect failed");
                            match e.close_code() {
                                Some(code) => Internal::Engine(Event::ChannelClosed {
                                    tag,
                                    code: Some(code),
                                }),
                                None => Internal::Engine(Event::ChannelFailed { tag }),
                            }
                        }
                    };
                    let _ = events.send(internal);
                });
                self.tasks.insert(tag, task);
            }
            Effect::ScheduleReconnect { tag, delay } => {
                tracing::info!(?delay, "Reconnecting");
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(Internal::Engine(Event::ReconnectDue { tag }));
                });
                self.tasks.insert(tag, task);
            }
            Effect::FetchConversations(seq) => {
                let history = self.history.clone();
                // Only one reload is ever in flight
                self.list_task = Some(tokio::spawn(async move {
                    let event = match history.fetch_conversations().await {
                        Ok(conversations) => Event::ConversationsLoaded { seq, conversations },
                        Err(e) => Event::ConversationsFailed { seq, kind: e.kind() },
                    };
                    let _ = events.send(Internal::Engine(event));
                }));
            }
            Effect::CancelFetch(tag) | Effect::CancelReconnect(tag) => self.cancel(tag),
            Effect::CloseChannel(tag) => {
                self.cancel(tag);
                // Dropping the sender makes the writer close the socket.
                self.channels.remove(&tag);
            }
        }
    }

    fn cancel(&mut self, tag: RequestTag) {
        if let Some(task) = self.tasks.remove(&tag) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use tempest_chat_shared::Participant;

    use crate::error::ClientError;

    /// History backed by shared vectors.
    #[derive(Clone, Default)]
    struct FakeHistory {
        messages: Arc<Mutex<Vec<Message>>>,
        list_fetches: Arc<Mutex<usize>>,
    }

    impl HistorySource for FakeHistory {
        async fn fetch_history(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
            let all = self.messages.lock().unwrap().clone();
            Ok(all
                .into_iter()
                .filter(|m| m.conversation_id == conversation_id)
                .collect())
        }

        async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
            *self.list_fetches.lock().unwrap() += 1;
            let all = self.messages.lock().unwrap().clone();
            let mut ids: Vec<Uuid> = all.iter().map(|m| m.conversation_id).collect();
            ids.dedup();
            Ok(ids
                .into_iter()
                .map(|id| Conversation {
                    id,
                    landlord: Participant {
                        id: Uuid::from_u128(2),
                        username: "host".into(),
                    },
                    guest: Participant {
                        id: Uuid::from_u128(1),
                        username: "guest".into(),
                    },
                    reservation_id: None,
                    created_at: Utc::now(),
                    last_message: all.iter().rev().find(|m| m.conversation_id == id).cloned(),
                })
                .collect())
        }
    }

    /// Hands out channels whose server side the test keeps.
    #[derive(Clone, Default)]
    struct FakeConnector {
        servers: Arc<Mutex<Vec<FakeServerSide>>>,
        refuse_with: Arc<Mutex<Option<u16>>>,
    }

    struct FakeServerSide {
        conversation_id: Uuid,
        events: mpsc::UnboundedSender<ChannelEvent>,
        frames: mpsc::UnboundedReceiver<ClientFrame>,
    }

    impl ChannelConnector for FakeConnector {
        async fn connect(&self, conversation_id: Uuid) -> Result<ChannelHandle, ClientError> {
            if let Some(code) = *self.refuse_with.lock().unwrap() {
                return Err(ClientError::Closed { code: Some(code) });
            }
            let (outbound, frames) = mpsc::unbounded_channel();
            let (events, inbound) = mpsc::unbounded_channel();
            self.servers.lock().unwrap().push(FakeServerSide {
                conversation_id,
                events,
                frames,
            });
            Ok(ChannelHandle {
                participant_id: Uuid::from_u128(1),
                outbound,
                inbound,
            })
        }
    }

    fn message(conversation_id: Uuid, text: &str) -> Message {
        Message {
            id: Uuid::now_v7(),
            conversation_id,
            sender: Participant {
                id: Uuid::from_u128(2),
                username: "host".into(),
            },
            text: text.into(),
            created_at: Utc::now(),
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<SyncSnapshot>,
        pred: impl Fn(&SyncSnapshot) -> bool,
    ) -> SyncSnapshot {
        let snapshot = tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for snapshot")
            .expect("session stopped");
        snapshot.clone()
    }

    fn texts(snapshot: &SyncSnapshot) -> Vec<&str> {
        snapshot.messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[tokio::test]
    async fn notification_drives_a_refetch() {
        let history = FakeHistory::default();
        let connector = FakeConnector::default();
        let (handle, _join) = spawn_session(history.clone(), connector.clone(), SyncConfig::default());
        let mut rx = handle.subscribe();
        let c = Uuid::new_v4();

        handle.select(c);
        wait_for(&mut rx, |s| s.status == SyncStatus::Live).await;

        let hello = message(c, "hello");
        history.messages.lock().unwrap().push(hello.clone());
        let events = connector.servers.lock().unwrap()[0].events.clone();
        events
            .send(ChannelEvent::Frame(ServerFrame::MessageCreated {
                conversation_id: c,
                message: None,
            }))
            .unwrap();

        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 1).await;
        assert_eq!(texts(&snapshot), ["hello"]);
    }

    #[tokio::test]
    async fn notification_refreshes_the_conversation_list() {
        let history = FakeHistory::default();
        let connector = FakeConnector::default();
        let (handle, _join) = spawn_session(history.clone(), connector.clone(), SyncConfig::default());
        let mut rx = handle.subscribe();
        let c = Uuid::new_v4();

        handle.select(c);
        let snapshot = wait_for(&mut rx, |s| s.status == SyncStatus::Live).await;
        assert_eq!(snapshot.participant_id, Some(Uuid::from_u128(1)));
        assert!(snapshot.conversations.is_empty());
        assert_eq!(*history.list_fetches.lock().unwrap(), 0);

        history.messages.lock().unwrap().push(message(c, "first"));
        let events = connector.servers.lock().unwrap()[0].events.clone();
        events
            .send(ChannelEvent::Frame(ServerFrame::MessageCreated {
                conversation_id: c,
                message: None,
            }))
            .unwrap();

        let snapshot = wait_for(&mut rx, |s| !s.conversations.is_empty()).await;
        let preview = snapshot.conversations[0].last_message.as_ref().unwrap();
        assert_eq!(preview.text, "first");

        // The list outlives the conversation on screen
        handle.deselect();
        let snapshot = wait_for(&mut rx, |s| s.status == SyncStatus::Closed).await;
        assert_eq!(snapshot.conversations.len(), 1);
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn send_goes_out_on_the_live_channel() {
        let connector = FakeConnector::default();
        let (handle, _join) =
            spawn_session(FakeHistory::default(), connector.clone(), SyncConfig::default());
        let mut rx = handle.subscribe();
        let c = Uuid::new_v4();

        assert_eq!(handle.send("early").await, Err(SendError::NoConversation));

        handle.select(c);
        wait_for(&mut rx, |s| s.status == SyncStatus::Live).await;
        let request_id = handle.send("hi there").await.unwrap();

        let mut server = connector.servers.lock().unwrap().remove(0);
        assert_eq!(server.conversation_id, c);
        let ClientFrame::SendMessage(sent) = server.frames.try_recv().unwrap();
        assert_eq!(sent.text, "hi there");
        assert_eq!(sent.request_id.as_deref(), Some(request_id.as_str()));
    }

    #[tokio::test]
    async fn refused_channel_surfaces_disconnected() {
        let connector = FakeConnector::default();
        *connector.refuse_with.lock().unwrap() = Some(4003);
        let (handle, _join) = spawn_session(FakeHistory::default(), connector, SyncConfig::default());
        let mut rx = handle.subscribe();

        handle.select(Uuid::new_v4());
        let snapshot = wait_for(&mut rx, |s| s.status == SyncStatus::Disconnected).await;
        assert!(snapshot.is_unreachable());
        assert_eq!(snapshot.last_error, Some(ErrorKind::Forbidden));
        assert!(matches!(
            handle.send("hello").await,
            Err(SendError::NotLive(SyncStatus::Disconnected))
        ));
    }

    #[tokio::test]
    async fn lost_channel_reconnects_and_refetches() {
        let history = FakeHistory::default();
        let connector = FakeConnector::default();
        let config = SyncConfig {
            backoff: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                max_attempts: 5,
            },
        };
        let (handle, _join) = spawn_session(history.clone(), connector.clone(), config);
        let mut rx = handle.subscribe();
        let c = Uuid::new_v4();

        handle.select(c);
        wait_for(&mut rx, |s| s.status == SyncStatus::Live).await;

        // A message is stored but its notification never arrives
        history.messages.lock().unwrap().push(message(c, "missed"));
        let first = connector.servers.lock().unwrap().remove(0);
        first
            .events
            .send(ChannelEvent::Closed { code: Some(1001) })
            .unwrap();

        let snapshot = wait_for(&mut rx, |s| {
            s.status == SyncStatus::Live && !s.messages.is_empty()
        })
        .await;
        assert_eq!(texts(&snapshot), ["missed"]);
    }

    #[tokio::test]
    async fn deselect_discards_state() {
        let (handle, _join) = spawn_session(
            FakeHistory::default(),
            FakeConnector::default(),
            SyncConfig::default(),
        );
        let mut rx = handle.subscribe();

        handle.select(Uuid::new_v4());
        wait_for(&mut rx, |s| s.status == SyncStatus::Live).await;
        handle.deselect();
        let snapshot = wait_for(&mut rx, |s| s.status == SyncStatus::Closed).await;
        assert_eq!(snapshot.conversation_id, None);
        assert!(snapshot.messages.is_empty());
    }
}
