pub mod groups;
pub mod router;
pub mod state;
pub mod transport;
pub mod typing;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::client::ChatDirectory;
use crate::api::events::{self, IncomingFrame, OutgoingFrame};
use crate::api::models::{Conversation, Identity, Message, MessageDraft};
use crate::error::{ApiError, SendError};
use crate::store::SharedStore;
use crate::utils;

use groups::{GroupEvent, GroupLifecycleHandler};
use router::{MessageRouter, Routed};
use state::{backoff_delay, classify_close, CloseKind, ConnectionStatus, SessionSettings, Transition, CLOSE_NORMAL};
use transport::{Connector, Link, TransportEvent, TransportSink};
use typing::{TypingIndicator, TypingSignal};

const NOTICE_CAPACITY: usize = 256;

/// Everything the session loop reacts to.
pub enum LoopEvent {
    Transport { generation: u64, event: TransportEvent },
    ReconnectDue { ticket: u64 },
    TypingIdle { conversation_id: String, ticket: u64 },
    /// Refetched conversation list, stamped with the identity epoch it was
    /// requested under.
    ConversationsRefreshed { epoch: u64, result: Result<Vec<Conversation>, ApiError> },
    Command(Command),
}

pub enum Command {
    Connect,
    Disconnect,
    /// Install an identity and connect with it.
    SignIn(Identity),
    SignOut,
    SendMessage {
        conversation_id: String,
        draft: MessageDraft,
        reply: oneshot::Sender<Result<String, SendError>>,
    },
    CreateGroup {
        name: String,
        members: Vec<String>,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    JoinGroup {
        group_id: String,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Input { conversation_id: String, text: String },
    Shutdown,
}

/// Store-level changes made by the loop, for presentation layers.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    MessageAdded { conversation_id: String, message: Message },
    MessageConfirmed { conversation_id: String, message_id: String },
    ConversationsReplaced,
    ServerError(String),
}

struct ReconnectTimer {
    ticket: u64,
    delay: Duration,
    task: JoinHandle<()>,
}

struct LiveLink {
    generation: u64,
    link: Box<dyn Link>,
}

pub struct SessionManager {
    settings: SessionSettings,
    identity: Option<Identity>,
    status: ConnectionStatus,
    reconnect_attempt: u32,
    reconnect_timer: Option<ReconnectTimer>,
    next_ticket: u64,
    identity_epoch: u64,
    link: Option<LiveLink>,
    generation: u64,
    connector: Box<dyn Connector>,
    router: MessageRouter,
    groups: GroupLifecycleHandler,
    typing: TypingIndicator,
    events: mpsc::UnboundedSender<LoopEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        store: SharedStore,
        directory: Arc<dyn ChatDirectory>,
        connector: Box<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let manager = Self {
            router: MessageRouter::new(store.clone(), settings.language.clone()),
            groups: GroupLifecycleHandler::new(directory, store),
            typing: TypingIndicator::new(settings.typing_idle),
            settings,
            identity: None,
            status: ConnectionStatus::Disconnected,
            reconnect_attempt: 0,
            reconnect_timer: None,
            next_ticket: 0,
            identity_epoch: 0,
            link: None,
            generation: 0,
            connector,
            events,
            status_tx,
            notices,
        };
        (manager, rx)
    }

    /// Run the loop on the current runtime and hand back its handle.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<LoopEvent>) -> SessionHandle {
        let handle = SessionHandle {
            tx: self.events.clone(),
            status: self.status_tx.subscribe(),
            notices: self.notices.clone(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.disconnect();
        debug!("Session loop stopped");
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    pub fn pending_reconnect_delay(&self) -> Option<Duration> {
        self.reconnect_timer.as_ref().map(|t| t.delay)
    }

    /// Returns false when the loop should stop.
    pub fn handle(&mut self, event: LoopEvent) -> bool {
        match event {
            LoopEvent::Transport { generation, event } => self.on_transport(generation, event),
            LoopEvent::ReconnectDue { ticket } => self.on_reconnect_due(ticket),
            LoopEvent::TypingIdle { conversation_id, ticket } => {
                if self.typing.on_idle(&conversation_id, ticket) == Some(TypingSignal::Stop) {
                    self.send_typing(&conversation_id, false);
                }
            }
            LoopEvent::ConversationsRefreshed { epoch, result } => {
                if epoch != self.identity_epoch {
                    debug!("Dropping conversation refresh requested before identity change");
                } else if self.groups.apply_refresh(result) {
                    self.notify(SessionNotice::ConversationsReplaced);
                }
            }
            LoopEvent::Command(cmd) => return self.on_command(cmd),
        }
        true
    }

    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::SignIn(identity) => {
                self.sign_in(identity);
                self.connect();
            }
            Command::SignOut => self.sign_out(),
            Command::SendMessage {
                conversation_id,
                draft,
                reply,
            } => {
                let _ = reply.send(self.send_message(&conversation_id, draft));
            }
            Command::CreateGroup { name, members, reply } => {
                let _ = reply.send(self.create_group(name, members));
            }
            Command::JoinGroup { group_id, reply } => {
                let _ = reply.send(self.join_group(group_id));
            }
            Command::Input { conversation_id, text } => self.on_input(&conversation_id, &text),
            Command::Shutdown => return false,
        }
        true
    }

    fn transition(&mut self, transition: Transition) -> bool {
        match self.status.apply(transition) {
            Ok(next) => {
                if next != self.status {
                    debug!("Connection status {} -> {}", self.status, next);
                    self.status = next;
                    self.status_tx.send_replace(next);
                }
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Install the signed-in user. A different identity tears down whatever
    /// the previous one had open.
    pub fn sign_in(&mut self, identity: Identity) {
        if self.identity.as_ref() == Some(&identity) {
            return;
        }
        if self.identity.is_some() {
            self.disconnect();
        }
        info!("Session identity set to {}", identity.user_id);
        self.identity = Some(identity);
        self.identity_epoch += 1;
        self.reconnect_attempt = 0;
        self.transition(Transition::IdentityChanged);
    }

    pub fn sign_out(&mut self) {
        self.disconnect();
        self.typing.clear();
        if self.identity.take().is_some() {
            info!("Session identity cleared");
        }
        self.identity_epoch += 1;
        self.reconnect_attempt = 0;
        self.transition(Transition::IdentityChanged);
    }

    /// Open a transport if there is an identity to open it with and none is
    /// open or opening already.
    pub fn connect(&mut self) {
        let Some(identity) = self.identity.as_ref() else {
            debug!("Not connecting: no signed-in user");
            return;
        };
        if identity.token.is_empty() {
            debug!("Not connecting: empty token");
            return;
        }
        if self.link.is_some() || self.status.is_live() {
            debug!("WebSocket already connected/connecting, skipping");
            return;
        }
        if self.status == ConnectionStatus::AuthFailed {
            warn!("Not connecting: authentication failed, sign in again");
            return;
        }
        let url = match utils::ws_url(&self.settings.api_base_url, &identity.token, &self.settings.language) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot build connection url: {}", e);
                return;
            }
        };

        self.cancel_reconnect_timer();
        if !self.transition(Transition::Dial) {
            return;
        }
        self.generation += 1;
        let sink = TransportSink::new(self.generation, self.events.clone());
        let link = self.connector.open(url, sink);
        self.link = Some(LiveLink {
            generation: self.generation,
            link,
        });
    }

    /// Close the transport normally and stop any pending reconnect.
    pub fn disconnect(&mut self) {
        self.cancel_reconnect_timer();
        if let Some(mut live) = self.link.take() {
            live.link.close(CLOSE_NORMAL, "Manual disconnect");
        }
        self.transition(Transition::Reset);
    }

    fn on_transport(&mut self, generation: u64, event: TransportEvent) {
        if self.link.as_ref().map(|l| l.generation) != Some(generation) {
            debug!("Ignoring {:?} from stale transport #{}", event, generation);
            return;
        }
        match event {
            TransportEvent::Opened => {
                if self.transition(Transition::Opened) {
                    self.reconnect_attempt = 0;
                    info!("WebSocket connected");
                }
            }
            TransportEvent::Frame(text) => self.on_frame(&text),
            TransportEvent::Closed { code, reason } => {
                self.link = None;
                info!("WebSocket closed: {} {}", code, reason);
                match classify_close(code, &reason) {
                    CloseKind::AuthFailure => {
                        warn!("WebSocket closed due to authentication failure - not reconnecting");
                        self.cancel_reconnect_timer();
                        self.reconnect_attempt = u32::MAX;
                        self.transition(Transition::AuthRejected);
                    }
                    CloseKind::Normal => {
                        self.transition(Transition::ClosedNormally);
                    }
                    CloseKind::Abnormal => self.schedule_reconnect(),
                }
            }
            TransportEvent::Error(message) => {
                error!("WebSocket error: {}", message);
                self.link = None;
                self.transition(Transition::Faulted);
                self.schedule_reconnect();
            }
        }
    }

    pub(crate) fn schedule_reconnect(&mut self) {
        if self.identity.is_none() {
            info!("User no longer authenticated - stopping reconnection");
            self.transition(Transition::Reset);
            return;
        }
        if self.status == ConnectionStatus::AuthFailed {
            return;
        }
        if self.reconnect_attempt >= self.settings.max_reconnect_attempts {
            warn!("Max reconnection attempts reached");
            self.cancel_reconnect_timer();
            self.transition(Transition::RetriesExhausted);
            return;
        }

        let delay = backoff_delay(self.reconnect_attempt, self.settings.base_delay, self.settings.max_delay);
        self.reconnect_attempt += 1;
        if !self.transition(Transition::BackoffScheduled) {
            return;
        }
        self.cancel_reconnect_timer();

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let tx = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LoopEvent::ReconnectDue { ticket });
        });
        info!(
            "Scheduling WebSocket reconnection attempt {} in {}ms",
            self.reconnect_attempt,
            delay.as_millis()
        );
        self.reconnect_timer = Some(ReconnectTimer { ticket, delay, task });
    }

    fn on_reconnect_due(&mut self, ticket: u64) {
        match &self.reconnect_timer {
            Some(timer) if timer.ticket == ticket => {
                self.reconnect_timer = None;
                self.connect();
            }
            _ => debug!("Ignoring cancelled reconnect timer {}", ticket),
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.task.abort();
        }
    }

    fn ensure_connected(&self) -> Result<(), SendError> {
        if self.status != ConnectionStatus::Connected || self.link.is_none() {
            return Err(SendError::NotConnected(self.status));
        }
        Ok(())
    }

    fn transmit(&mut self, frame: &OutgoingFrame) -> Result<(), SendError> {
        let text = events::encode(frame)?;
        let live = self
            .link
            .as_mut()
            .ok_or(SendError::NotConnected(self.status))?;
        live.link.send_text(text)?;
        Ok(())
    }

    /// Send a chat message. The optimistic entry is in the store before the
    /// frame is written; nothing is stored when the send is refused.
    pub fn send_message(&mut self, conversation_id: &str, draft: MessageDraft) -> Result<String, SendError> {
        if let Err(e) = self.ensure_connected() {
            warn!("Cannot send message: {}", e);
            return Err(e);
        }
        let identity = self.identity.as_ref().ok_or(SendError::NoIdentity)?;
        let plan = self.router.plan_send(identity, conversation_id, draft).inspect_err(|e| {
            error!("Cannot send message: {}", e);
        })?;
        let text = events::encode(&plan.frame)?;

        self.router.commit_optimistic(&plan);
        self.notify(SessionNotice::MessageAdded {
            conversation_id: plan.conversation_id.clone(),
            message: plan.optimistic.clone(),
        });

        let sent = match self.link.as_mut() {
            Some(live) => live.link.send_text(text).map_err(SendError::from),
            None => Err(SendError::NotConnected(self.status)),
        };
        if let Err(e) = sent {
            error!("Failed to send WebSocket message: {}", e);
            self.router.mark_failed(&plan.conversation_id, &plan.optimistic.id);
            return Err(e);
        }
        debug!("Sent message {} to {}", plan.optimistic.id, plan.conversation_id);
        Ok(plan.optimistic.id)
    }

    pub fn create_group(&mut self, name: String, members: Vec<String>) -> Result<(), SendError> {
        if let Err(e) = self.ensure_connected() {
            warn!("Cannot create group: {}", e);
            return Err(e);
        }
        let frame = OutgoingFrame::CreateGroup { name, members };
        self.transmit(&frame)?;
        info!("Sent group creation request");
        Ok(())
    }

    pub fn join_group(&mut self, group_id: String) -> Result<(), SendError> {
        if let Err(e) = self.ensure_connected() {
            warn!("Cannot join group: {}", e);
            return Err(e);
        }
        self.transmit(&OutgoingFrame::JoinGroup { group_id })?;
        Ok(())
    }

    fn on_input(&mut self, conversation_id: &str, text: &str) {
        if self.typing.on_input(conversation_id, text, &self.events) == Some(TypingSignal::Start) {
            self.send_typing(conversation_id, true);
        }
    }

    // The server has no typing fan-out yet; the intent is only logged.
    fn send_typing(&self, conversation_id: &str, is_typing: bool) {
        if self.ensure_connected().is_err() {
            return;
        }
        info!(
            "Typing indicator: {} typing in {}",
            if is_typing { "start" } else { "stop" },
            conversation_id
        );
    }

    fn on_frame(&mut self, text: &str) {
        let frame = match events::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to parse WebSocket message: {}", e);
                return;
            }
        };
        match frame {
            IncomingFrame::Message(msg) => {
                let me = self.identity.as_ref().map(|i| i.user_id.as_str());
                match self.router.route_inbound(me, msg) {
                    Routed::Appended { conversation_id, message } => {
                        self.notify(SessionNotice::MessageAdded { conversation_id, message });
                    }
                    Routed::Confirmed {
                        conversation_id,
                        message_id,
                    } => {
                        self.notify(SessionNotice::MessageConfirmed {
                            conversation_id,
                            message_id,
                        });
                    }
                    Routed::Dropped => {}
                }
            }
            IncomingFrame::GroupCreated(notice) => {
                self.groups.on_notice(GroupEvent::Created, &notice, self.identity_epoch, &self.events);
            }
            IncomingFrame::JoinedGroup(notice) => {
                self.groups.on_notice(GroupEvent::Joined, &notice, self.identity_epoch, &self.events);
            }
            IncomingFrame::Error { error } => {
                error!("WebSocket error message: {}", error);
                self.notify(SessionNotice::ServerError(error));
            }
            IncomingFrame::Unknown { kind } => info!("Unknown message type: {}", kind),
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
    status: watch::Receiver<ConnectionStatus>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    fn command(&self, cmd: Command) -> bool {
        self.tx.send(LoopEvent::Command(cmd)).is_ok()
    }

    pub fn connect(&self) -> bool {
        self.command(Command::Connect)
    }

    pub fn disconnect(&self) -> bool {
        self.command(Command::Disconnect)
    }

    pub fn sign_in(&self, identity: Identity) -> bool {
        self.command(Command::SignIn(identity))
    }

    pub fn sign_out(&self) -> bool {
        self.command(Command::SignOut)
    }

    pub fn input(&self, conversation_id: &str, text: &str) -> bool {
        self.command(Command::Input {
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
        })
    }

    pub fn shutdown(&self) -> bool {
        self.command(Command::Shutdown)
    }

    pub async fn send_message(&self, conversation_id: &str, draft: MessageDraft) -> Result<String, SendError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::SendMessage {
            conversation_id: conversation_id.to_string(),
            draft,
            reply,
        };
        if !self.command(cmd) {
            return Err(SendError::SessionGone);
        }
        rx.await.map_err(|_| SendError::SessionGone)?
    }

    pub async fn create_group(&self, name: &str, members: Vec<String>) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::CreateGroup {
            name: name.to_string(),
            members,
            reply,
        };
        if !self.command(cmd) {
            return Err(SendError::SessionGone);
        }
        rx.await.map_err(|_| SendError::SessionGone)?
    }

    pub async fn join_group(&self, group_id: &str) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::JoinGroup {
            group_id: group_id.to_string(),
            reply,
        };
        if !self.command(cmd) {
            return Err(SendError::SessionGone);
        }
        rx.await.map_err(|_| SendError::SessionGone)?
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}
