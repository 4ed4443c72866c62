//! `KikClient`: the handle applications hold, and the connection task
//! behind it.
//!
//! The client is an actor. One Tokio task owns everything mutable: the
//! [`StateMachine`], the [`Dispatcher`], the tracked roster, and the
//! current transport. [`KikClient`] handles talk to it through an mpsc
//! channel and get answers back on oneshot channels.
//!
//! Inbound bytes are read by a small pump task per transport instance
//! and forwarded into the same actor, so stanzas are processed one at a
//! time in wire order. Each forwarded chunk is tagged with the
//! [`ConnectionId`] it came from; chunks from a transport that has since
//! been torn down are discarded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use kikwire_protocol::{
    CorrelationId, Credentials, Frame, Group, Jid, Request, Stanza, StanzaReader, User, classify,
    codec, inbound, requests,
};
use kikwire_session::{Session, SessionStore};
use kikwire_transport::{Connection, ConnectionId, Connector, TransportError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::dispatcher::{Dispatcher, Reply};
use crate::machine::{Action, StateMachine};
use crate::roster::RosterTracker;
use crate::{
    ClientConfig, ClientError, ClientEvent, ConnectionPhase, EventStream, KikError, RequestError,
    TrackedRoster,
};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring and starting a [`KikClient`].
///
/// # Example
///
/// ```rust,ignore
/// use kikwire::prelude::*;
///
/// let client = KikClient::builder(Credentials::new("alice", "hunter2"))
///     .track_user_info(true)
///     .build(TcpConnector::default(), JsonFileStore::new("sessions"))?;
/// client.connect().await?;
/// ```
pub struct KikClientBuilder {
    config: ClientConfig,
}

impl KikClientBuilder {
    /// Creates a builder with default settings for the given account.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            config: ClientConfig::new(credentials),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn track_user_info(mut self, on: bool) -> Self {
        self.config.track_user_info = on;
        self
    }

    pub fn track_friend_info(mut self, on: bool) -> Self {
        self.config.track_friend_info = on;
        self
    }

    pub fn fetch_roster_on_login(mut self, on: bool) -> Self {
        self.config.fetch_roster_on_login = on;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.config.command_capacity = capacity;
        self
    }

    /// Loads (or creates) the account's session and spawns the
    /// connection task. Nothing is sent until [`KikClient::connect`].
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// [`KikError::Session`] if the session can't be loaded or the fresh
    /// one can't be saved.
    pub fn build<C, S>(self, connector: C, store: S) -> Result<KikClient, KikError>
    where
        C: Connector<Error = TransportError>,
        C::Connection: Connection<Error = TransportError>,
        S: SessionStore,
    {
        let config = self.config;
        let account = config.account().to_string();
        let session = store.load_or_create(&account)?;
        tracing::info!(
            %account,
            has_node = session.has_node(),
            "client session ready"
        );

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (link_tx, link_rx) = mpsc::channel(64);

        let actor = ClientActor {
            machine: StateMachine::new(config.credentials.clone(), session),
            roster: RosterTracker::new(config.track_user_info, config.track_friend_info),
            dispatcher: Dispatcher::new(),
            account,
            config,
            connector,
            store,
            link: None,
            queued: VecDeque::new(),
            events: event_tx.clone(),
            commands: command_rx,
            link_tx,
            link_rx,
        };
        tokio::spawn(actor.run());

        Ok(KikClient {
            commands: command_tx,
            events: event_tx,
        })
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Ack = oneshot::Sender<Result<(), KikError>>;

enum Command {
    Connect { reply: Ack },
    Disconnect { reply: Ack },
    SetNode { node: String, reply: Ack },
    ResolveCaptcha { response: String, reply: Ack },
    Request { request: Request, reply: oneshot::Sender<Reply> },
    Send { stanza: Stanza, reply: Ack },
    Phase { reply: oneshot::Sender<ConnectionPhase> },
    Session { reply: oneshot::Sender<Session> },
    Roster { reply: oneshot::Sender<TrackedRoster> },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to a running client. Cheap to clone.
///
/// The connection task stops once every handle has been dropped.
#[derive(Clone)]
pub struct KikClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl KikClient {
    pub fn builder(credentials: Credentials) -> KikClientBuilder {
        KikClientBuilder::new(credentials)
    }

    /// Subscribes to broadcast events. Subscribe before `connect()` to
    /// see the handshake.
    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.events.subscribe())
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, KikError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| ClientError::ClientClosed)?;
        Ok(reply_rx.await.map_err(|_| ClientError::ClientClosed)?)
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Opens a transport and starts the handshake.
    ///
    /// Returns once the transport is open; handshake progress is reported
    /// through events ([`ClientEvent::Authenticated`],
    /// [`ClientEvent::CaptchaChallenge`], ...).
    ///
    /// A failure to open the transport is returned here and not
    /// broadcast. Transport failures with no caller to return to (a
    /// rebuild after a node change, a failed write or read) arrive as
    /// [`ClientEvent::Error`] instead.
    ///
    /// # Errors
    /// [`ClientError::AlreadyConnected`] if a transport is already open,
    /// or the transport's connect error.
    pub async fn connect(&self) -> Result<(), KikError> {
        self.call(|reply| Command::Connect { reply }).await?
    }

    /// Closes the transport. Pending requests fail with
    /// [`RequestError::ConnectionReset`].
    pub async fn disconnect(&self) -> Result<(), KikError> {
        self.call(|reply| Command::Disconnect { reply }).await?
    }

    /// Stores a routing node and, if connected, rebuilds the transport to
    /// authenticate against it.
    pub async fn set_node(&self, node: impl Into<String>) -> Result<(), KikError> {
        let node = node.into();
        self.call(|reply| Command::SetNode { node, reply }).await?
    }

    /// Answers a captcha challenge.
    ///
    /// # Errors
    /// [`ClientError::InvalidPhase`] unless a challenge is outstanding.
    pub async fn resolve_captcha(&self, response: impl Into<String>) -> Result<(), KikError> {
        let response = response.into();
        self.call(|reply| Command::ResolveCaptcha { response, reply })
            .await?
    }

    pub async fn phase(&self) -> Result<ConnectionPhase, KikError> {
        self.call(|reply| Command::Phase { reply }).await
    }

    /// A copy of the in-memory session.
    pub async fn session(&self) -> Result<Session, KikError> {
        self.call(|reply| Command::Session { reply }).await
    }

    /// A snapshot of the tracked roster.
    pub async fn roster(&self) -> Result<TrackedRoster, KikError> {
        self.call(|reply| Command::Roster { reply }).await
    }

    // -- Raw sends ----------------------------------------------------------

    /// Sends a request and waits for its reply.
    ///
    /// Requests made during the handshake are held until it completes.
    /// Time spent held counts against the request timeout, so a request
    /// stuck behind an unsolved captcha still times out.
    ///
    /// # Errors
    /// A [`RequestError`] if the client is disconnected, the server
    /// answers with an error, the transport resets, or no reply arrives
    /// in time.
    pub async fn send_request(&self, request: Request) -> Result<Stanza, KikError> {
        Ok(self
            .call(|reply| Command::Request { request, reply })
            .await??)
    }

    /// Sends a stanza without waiting for any reply.
    pub async fn send(&self, stanza: Stanza) -> Result<(), KikError> {
        self.call(|reply| Command::Send { stanza, reply }).await?
    }

    // -- Operations ---------------------------------------------------------

    /// Fetches the roster. The reply goes to this caller only; it is not
    /// broadcast.
    pub async fn get_roster(&self) -> Result<(Vec<Group>, Vec<User>), KikError> {
        let reply = self.send_request(requests::get_roster()).await?;
        Ok(inbound::parse_roster(&reply)?)
    }

    /// Looks up profile information for a batch of JIDs.
    pub async fn get_jid_info(&self, jids: &[Jid]) -> Result<Vec<User>, KikError> {
        let reply = self.send_request(requests::get_jid_info(jids)).await?;
        Ok(inbound::parse_users(&reply)?)
    }

    /// Sends a chat message to a user or group. Returns the message id.
    pub async fn send_message(&self, to: &Jid, body: &str) -> Result<CorrelationId, KikError> {
        let request = requests::send_chat_message(to, body);
        let id = request.id.clone();
        self.send(request.stanza).await?;
        Ok(id)
    }

    pub async fn add_friend(&self, jid: &Jid) -> Result<(), KikError> {
        self.send(requests::add_friend(jid)).await
    }

    pub async fn remove_friend(&self, jid: &Jid) -> Result<(), KikError> {
        self.send(requests::remove_friend(jid)).await
    }

    pub async fn set_admin(&self, group: &Jid, user: &Jid, admin: bool) -> Result<(), KikError> {
        self.send(requests::set_admin(group, user, admin)).await
    }

    pub async fn set_banned(&self, group: &Jid, user: &Jid, banned: bool) -> Result<(), KikError> {
        self.send(requests::set_banned(group, user, banned)).await
    }

    /// Adds `user` to `group`, or removes them when `member` is false.
    pub async fn set_group_member(
        &self,
        group: &Jid,
        user: &Jid,
        member: bool,
    ) -> Result<(), KikError> {
        self.send(requests::set_group_member(group, user, member))
            .await
    }

    pub async fn set_group_name(&self, group: &Jid, name: &str) -> Result<(), KikError> {
        self.send(requests::set_group_name(group, name)).await
    }

    pub async fn leave_group(&self, group: &Jid) -> Result<(), KikError> {
        self.send(requests::leave_group(group)).await
    }

    pub async fn set_profile_name(&self, first: &str, last: &str) -> Result<(), KikError> {
        self.send(requests::set_profile_name(first, last)).await
    }

    pub async fn set_email(&self, email: &str, password: &str) -> Result<(), KikError> {
        self.send(requests::set_email(email, password)).await
    }

    pub async fn set_password(&self, old: &str, new: &str) -> Result<(), KikError> {
        self.send(requests::set_password(old, new)).await
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// What the pump saw on one transport instance.
enum LinkEvent {
    Data(Vec<u8>),
    Closed,
    Failed(TransportError),
}

struct Link<T> {
    conn: Arc<T>,
    reader: StanzaReader,
    pump: JoinHandle<()>,
}

/// A stanza waiting for the handshake to finish.
struct Outbound {
    stanza: Stanza,
    waiter: Option<(CorrelationId, oneshot::Sender<Reply>)>,
    submitted_at: Instant,
}

struct ClientActor<C: Connector, S> {
    account: String,
    config: ClientConfig,
    connector: C,
    store: S,
    machine: StateMachine,
    dispatcher: Dispatcher,
    roster: RosterTracker,
    link: Option<Link<C::Connection>>,
    queued: VecDeque<Outbound>,
    events: broadcast::Sender<ClientEvent>,
    commands: mpsc::Receiver<Command>,
    link_tx: mpsc::Sender<(ConnectionId, LinkEvent)>,
    link_rx: mpsc::Receiver<(ConnectionId, LinkEvent)>,
}

impl<C, S> ClientActor<C, S>
where
    C: Connector<Error = TransportError>,
    C::Connection: Connection<Error = TransportError>,
    S: SessionStore,
{
    /// Runs the actor loop until every handle is dropped.
    async fn run(mut self) {
        tracing::info!(account = %self.account, "client task started");
        let mut sweep =
            tokio::time::interval(self.config.sweep_interval.max(Duration::from_millis(10)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some((conn_id, event)) = self.link_rx.recv() => {
                    self.handle_link_event(conn_id, event).await;
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.dispatcher.expire(now, self.config.request_timeout);
                    self.expire_queued(now);
                }
            }
        }

        self.close_link().await;
        self.dispatcher.fail_all(RequestError::ConnectionReset);
        self.fail_queued(RequestError::ConnectionReset);
        tracing::info!(account = %self.account, "client task stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                tracing::info!(account = %self.account, "disconnect requested");
                let actions = self.machine.transport_lost();
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::SetNode { node, reply } => {
                let actions = self.machine.set_node(node);
                self.apply(actions).await;
                let _ = reply.send(Ok(()));
            }
            Command::ResolveCaptcha { response, reply } => {
                match self.machine.resolve_captcha(&response) {
                    Ok(actions) => {
                        self.apply(actions).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Command::Request { request, reply } => {
                let outbound = Outbound {
                    stanza: request.stanza,
                    waiter: Some((request.id, reply)),
                    submitted_at: Instant::now(),
                };
                self.submit(outbound).await;
            }
            Command::Send { stanza, reply } => {
                if self.machine.phase() == ConnectionPhase::Disconnected {
                    let _ = reply.send(Err(RequestError::NotConnected.into()));
                    return;
                }
                self.submit(Outbound {
                    stanza,
                    waiter: None,
                    submitted_at: Instant::now(),
                })
                .await;
                let _ = reply.send(Ok(()));
            }
            Command::Phase { reply } => {
                let _ = reply.send(self.machine.phase());
            }
            Command::Session { reply } => {
                let _ = reply.send(self.machine.session().clone());
            }
            Command::Roster { reply } => {
                let _ = reply.send(self.roster.snapshot());
            }
        }
    }

    async fn connect(&mut self) -> Result<(), KikError> {
        if self.link.is_some() {
            return Err(ClientError::AlreadyConnected.into());
        }
        self.open_link().await?;
        let actions = self.machine.transport_ready();
        self.apply(actions).await;
        Ok(())
    }

    /// Sends now when authenticated, holds during the handshake, rejects
    /// when disconnected.
    async fn submit(&mut self, outbound: Outbound) {
        match self.machine.phase() {
            ConnectionPhase::Authenticated => {
                if let Some(action) = self.prepare(outbound) {
                    self.apply(vec![action]).await;
                }
            }
            ConnectionPhase::Disconnected => {
                if let Some((_, reply)) = outbound.waiter {
                    let _ = reply.send(Err(RequestError::NotConnected));
                }
            }
            phase => {
                tracing::debug!(%phase, "holding stanza until authenticated");
                self.queued.push_back(outbound);
            }
        }
    }

    /// Registers the waiter (if any) and turns the stanza into a send.
    /// `None` if registration failed; the waiter has been told why.
    ///
    /// The timeout clock keeps running from submission, so time spent
    /// held counts against `request_timeout`.
    fn prepare(&mut self, outbound: Outbound) -> Option<Action> {
        if let Some((id, reply)) = outbound.waiter {
            self.dispatcher
                .register(id, reply, outbound.submitted_at)
                .ok()?;
        }
        Some(Action::Send {
            stanza: outbound.stanza,
            restart_stream: false,
        })
    }

    /// Times out held requests, e.g. ones stuck behind an unsolved
    /// captcha. Held fire-and-forget stanzas stay queued.
    fn expire_queued(&mut self, now: Instant) {
        let timeout = self.config.request_timeout;
        let (expired, kept): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.queued).into_iter().partition(|o| {
                o.waiter.is_some() && now.saturating_duration_since(o.submitted_at) >= timeout
            });
        self.queued = kept;
        for outbound in expired {
            if let Some((id, reply)) = outbound.waiter {
                tracing::warn!(%id, ?timeout, "held request timed out");
                let _ = reply.send(Err(RequestError::Timeout(timeout)));
            }
        }
    }

    fn fail_queued(&mut self, err: RequestError) {
        for outbound in self.queued.drain(..) {
            if let Some((_, reply)) = outbound.waiter {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    // -- Actions ------------------------------------------------------------

    /// Performs actions in order. Follow-up actions (from a rebuilt
    /// transport, a published event, or a failure) are appended to the
    /// same queue.
    async fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send {
                    stanza,
                    restart_stream,
                } => {
                    if let Err(e) = self.write(&stanza, restart_stream).await {
                        queue.clear();
                        queue.extend(self.link_lost(e.into()));
                    }
                }
                Action::Persist(session) => {
                    if let Err(e) = self.store.save(&self.account, &session) {
                        tracing::error!(account = %self.account, error = %e, "failed to persist session");
                        self.publish_raw(ClientEvent::error(e));
                    }
                }
                Action::Reconnect => {
                    let reset = self.dispatcher.fail_all(RequestError::ConnectionReset);
                    tracing::info!(
                        account = %self.account,
                        reset,
                        "rebuilding transport"
                    );
                    self.close_link().await;
                    match self.open_link().await {
                        Ok(()) => queue.extend(self.machine.transport_ready()),
                        Err(e) => queue.extend(self.link_lost(e)),
                    }
                }
                Action::Disconnect => {
                    self.close_link().await;
                    self.dispatcher.fail_all(RequestError::ConnectionReset);
                    self.fail_queued(RequestError::NotConnected);
                }
                Action::Emit(event) => queue.extend(self.publish(event)),
            }
        }
    }

    /// Reports a failure and tears everything down. No reconnect.
    fn link_lost(&mut self, err: KikError) -> Vec<Action> {
        tracing::warn!(account = %self.account, error = %err, "connection lost");
        let mut actions = vec![Action::Emit(ClientEvent::error(err))];
        actions.extend(self.machine.transport_lost());
        actions
    }

    /// Feeds the event to the roster tracker, broadcasts it, and returns
    /// any follow-up sends.
    fn publish(&mut self, event: ClientEvent) -> Vec<Action> {
        let mut follow_up: Vec<Action> = self
            .roster
            .apply(&event)
            .into_iter()
            .map(|lookup| Action::Send {
                stanza: lookup.stanza,
                restart_stream: false,
            })
            .collect();

        if matches!(event, ClientEvent::Authenticated) {
            let held = std::mem::take(&mut self.queued);
            if !held.is_empty() {
                tracing::debug!(count = held.len(), "flushing held stanzas");
            }
            follow_up.extend(held.into_iter().filter_map(|o| self.prepare(o)));

            if self.config.fetch_roster_on_login {
                // Not registered: the reply is broadcast as RosterReceived.
                follow_up.push(Action::Send {
                    stanza: requests::get_roster().stanza,
                    restart_stream: false,
                });
            }
        }

        self.publish_raw(event);
        follow_up
    }

    fn publish_raw(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -- Transport ----------------------------------------------------------

    async fn open_link(&mut self) -> Result<(), KikError> {
        let conn = Arc::new(self.connector.connect().await?);
        let conn_id = conn.id();
        tracing::info!(account = %self.account, %conn_id, "transport open");

        let pump = tokio::spawn(pump(Arc::clone(&conn), self.link_tx.clone()));
        self.link = Some(Link {
            conn,
            reader: StanzaReader::new(),
            pump,
        });
        Ok(())
    }

    async fn close_link(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        link.pump.abort();
        if let Err(e) = link.conn.close().await {
            tracing::debug!(error = %e, "error closing transport");
        }
        tracing::info!(account = %self.account, conn_id = %link.conn.id(), "transport closed");
    }

    async fn write(&mut self, stanza: &Stanza, restart_stream: bool) -> Result<(), TransportError> {
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::ConnectionClosed("no transport".into()));
        };
        let bytes = if restart_stream {
            link.reader.reset();
            codec::encode_open(stanza)
        } else {
            codec::encode(stanza)
        };
        tracing::trace!(conn_id = %link.conn.id(), out = %bytes, "send");
        link.conn.send(bytes.as_bytes()).await
    }

    async fn handle_link_event(&mut self, conn_id: ConnectionId, event: LinkEvent) {
        if self.link.as_ref().map(|l| l.conn.id()) != Some(conn_id) {
            tracing::debug!(%conn_id, "dropping event from stale transport");
            return;
        }

        match event {
            LinkEvent::Data(bytes) => self.on_data(conn_id, &bytes).await,
            LinkEvent::Closed => {
                let actions = self.link_lost(
                    TransportError::ConnectionClosed("closed by server".into()).into(),
                );
                self.apply(actions).await;
            }
            LinkEvent::Failed(e) => {
                let actions = self.link_lost(e.into());
                self.apply(actions).await;
            }
        }
    }

    async fn on_data(&mut self, conn_id: ConnectionId, bytes: &[u8]) {
        if let Some(link) = self.link.as_mut() {
            link.reader.feed(bytes);
        }

        loop {
            // A frame may rebuild or drop the transport; whatever is left
            // in the old buffer belongs to a dead stream.
            let next = match self.link.as_mut() {
                Some(link) if link.conn.id() == conn_id => link.reader.next_frame(),
                _ => return,
            };
            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    let actions = self.link_lost(e.into());
                    self.apply(actions).await;
                    return;
                }
            };
            self.on_frame(frame).await;
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        let frame = match frame {
            Frame::Stanza(stanza) => match self.dispatcher.route(stanza) {
                Some(unclaimed) => Frame::Stanza(unclaimed),
                None => return,
            },
            other => other,
        };
        let inbound = classify(frame);
        tracing::trace!(phase = %self.machine.phase(), ?inbound, "inbound");
        let actions = self.machine.handle(inbound);
        self.apply(actions).await;
    }
}

/// Reads from one transport instance until it closes or fails.
async fn pump<T>(conn: Arc<T>, tx: mpsc::Sender<(ConnectionId, LinkEvent)>)
where
    T: Connection<Error = TransportError>,
{
    let conn_id = conn.id();
    loop {
        let event = match conn.recv().await {
            Ok(Some(data)) => LinkEvent::Data(data),
            Ok(None) => LinkEvent::Closed,
            Err(e) => LinkEvent::Failed(e),
        };
        let last = !matches!(event, LinkEvent::Data(_));
        if tx.send((conn_id, event)).await.is_err() || last {
            break;
        }
    }
}
