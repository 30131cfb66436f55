//! Session controller.
//!
//! One task owns the connection, the token, the pending-request registry and
//! every timer. Inbound frames, client commands and timer wake-ups are
//! multiplexed by a single `select!` loop, so no state is shared with other
//! tasks except the published [`SessionState`].
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Connected ─▶ Authenticating ─▶ Authenticated
//!                    │              │               │                 │ ⟲ refresh
//!                    └──────────────┴───────┬───────┴─────────────────┘
//!                                           ▼
//!                                        Failed ──(reconnect policy)──▶ Connecting
//! ```
//!
//! On entering `Authenticated` the controller configures the server
//! heartbeat and (re)subscribes every desired channel.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use dlink_core::prelude::*;
use dlink_core::{SessionEvent, SessionState};

use super::client::ClientCommand;
use super::credentials::{
    AuthMode, CredentialExchanger, Credentials, FormPoster, LifetimePolicy, TokenState,
};
use super::heartbeat::{HeartbeatResponder, MIN_HEARTBEAT_INTERVAL};
use super::protocol::{
    decode, preview, JsonRpcRequest, Message, Notification, PendingRequests, RequestKind,
    RpcResponse,
};
use super::refresh::{RefreshDecision, RefreshPolicy, RefreshScheduler};
use super::subscriptions::SubscriptionManager;
use super::transport::{Connection, Connector, TransportEvent};

/// Deribit test environment.
pub const DEFAULT_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";

/// How often unanswered requests are swept.
const STALE_REQUEST_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do after the transport fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// The session ends in `Failed`.
    #[default]
    Never,
    /// Retry with exponential backoff: `initial * 2^(n-1)`, capped at `max`.
    Backoff {
        max_attempts: u32,
        initial: Duration,
        max: Duration,
    },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-indexed), or `None` when
    /// no further attempt should be made.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff {
                max_attempts,
                initial,
                max,
            } => {
                if attempt == 0 || attempt > max_attempts {
                    return None;
                }
                Some(compute_backoff(attempt, initial, max))
            }
        }
    }
}

/// `initial * 2^(attempt-1)`, capped at `max`.
fn compute_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    // checked_shl returns None once the shift would overflow.
    let exponent = attempt.saturating_sub(1);
    let multiplier: u32 = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    initial.saturating_mul(multiplier).min(max)
}

/// Static configuration of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub credentials: Credentials,
    pub auth_mode: AuthMode,
    /// Bound on the initial grant and on each refresh.
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub refresh_policy: RefreshPolicy,
    pub lifetime: LifetimePolicy,
    /// Channels subscribed on every (re)authentication.
    pub channels: Vec<String>,
    /// Unanswered subscribe requests older than this are reported failed.
    pub ack_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            ..Self::default()
        }
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            credentials: Credentials::default(),
            auth_mode: AuthMode::InBand,
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: MIN_HEARTBEAT_INTERVAL,
            refresh_policy: RefreshPolicy::default(),
            lifetime: LifetimePolicy::default(),
            channels: Vec::new(),
            ack_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Why a connection's serve loop ended.
#[derive(Debug)]
enum Exit {
    /// Explicit shutdown or the client handle was dropped.
    Shutdown,
    /// Transport or authentication failure.
    Failed(Error),
}

/// Entry point of the background task spawned by
/// [`SessionClient::start`](super::SessionClient::start).
pub(crate) async fn run_session<C, P>(
    config: SessionConfig,
    connector: C,
    poster: P,
    cmd_rx: mpsc::Receiver<ClientCommand>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<RwLock<SessionState>>,
) where
    C: Connector + Sync,
    P: FormPoster + Sync,
{
    let mut session = Session::new(config, event_tx, state);
    session.run(&connector, &poster, cmd_rx).await;
    debug!("Session task exiting");
}

struct Session {
    config: SessionConfig,
    exchanger: CredentialExchanger,
    heartbeat: HeartbeatResponder,
    refresh: RefreshScheduler,
    subscriptions: SubscriptionManager,
    pending: PendingRequests,
    token: Option<TokenState>,
    auth_deadline: Option<Instant>,
    reconnect_attempt: u32,
    state: SessionState,
    shared_state: Arc<RwLock<SessionState>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Session {
    fn new(
        config: SessionConfig,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        shared_state: Arc<RwLock<SessionState>>,
    ) -> Self {
        if config.credentials.is_incomplete() {
            warn!("API key or secret is empty; authentication will be rejected");
        }
        let exchanger = CredentialExchanger::new(
            config.credentials.clone(),
            config.auth_mode.clone(),
            config.lifetime,
        );
        Self {
            exchanger,
            heartbeat: HeartbeatResponder::new(config.heartbeat_interval),
            refresh: RefreshScheduler::new(config.refresh_policy, config.auth_timeout),
            subscriptions: SubscriptionManager::with_channels(config.channels.iter().cloned()),
            pending: PendingRequests::new(),
            token: None,
            auth_deadline: None,
            reconnect_attempt: 0,
            state: SessionState::Disconnected,
            shared_state,
            event_tx,
            config,
        }
    }

    async fn run<C, P>(
        &mut self,
        connector: &C,
        poster: &P,
        mut cmd_rx: mpsc::Receiver<ClientCommand>,
    ) where
        C: Connector + Sync,
        P: FormPoster + Sync,
    {
        loop {
            match self.serve_connection(connector, poster, &mut cmd_rx).await {
                Exit::Shutdown => {
                    self.shutdown();
                    return;
                }
                Exit::Failed(err) => {
                    error!("Session failed: {}", err);
                    self.teardown();
                    self.set_state(SessionState::Failed);
                    self.emit(SessionEvent::Closed {
                        reason: err.to_string(),
                    });

                    self.reconnect_attempt += 1;
                    let Some(delay) = self.config.reconnect.delay(self.reconnect_attempt) else {
                        if self.config.reconnect != ReconnectPolicy::Never {
                            error!(
                                "Giving up after {} reconnect attempt(s)",
                                self.reconnect_attempt - 1
                            );
                        }
                        return;
                    };

                    warn!(
                        "Reconnecting in {:?} (attempt {})",
                        delay, self.reconnect_attempt
                    );
                    if !self.wait_before_reconnect(delay, &mut cmd_rx).await {
                        self.shutdown();
                        return;
                    }
                }
            }
        }
    }

    /// Open one connection, authenticate, and serve it until it ends.
    async fn serve_connection<C, P>(
        &mut self,
        connector: &C,
        poster: &P,
        cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    ) -> Exit
    where
        C: Connector + Sync,
        P: FormPoster + Sync,
    {
        self.set_state(SessionState::Connecting);

        // Out-of-band grant happens before the socket is opened.
        let mut granted = None;
        if let AuthMode::OutOfBand { .. } = self.exchanger.mode() {
            let exchanger = self.exchanger.clone();
            let timeout = self.config.auth_timeout;
            let exchange =
                tokio::time::timeout(timeout, exchanger.authenticate_out_of_band(poster, Instant::now));
            tokio::pin!(exchange);

            let outcome = loop {
                tokio::select! {
                    outcome = &mut exchange => break outcome,
                    cmd = cmd_rx.recv() => {
                        if !self.queue_command(cmd) {
                            return Exit::Shutdown;
                        }
                    }
                }
            };
            match outcome {
                Ok(Ok(token)) => granted = Some(token),
                Ok(Err(e)) => return Exit::Failed(e),
                Err(_) => {
                    return Exit::Failed(Error::auth_failed(format!(
                        "no token response within {timeout:?}"
                    )))
                }
            }
        }

        let url = self.config.url.clone();
        info!("Connecting to {}", url);
        let connect = connector.connect(&url);
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                result = &mut connect => break result,
                cmd = cmd_rx.recv() => {
                    if !self.queue_command(cmd) {
                        return Exit::Shutdown;
                    }
                }
            }
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => return Exit::Failed(e),
        };

        self.set_state(SessionState::Connected);
        self.set_state(SessionState::Authenticating);

        match granted {
            Some(token) => self.on_authenticated(token, &conn),
            None => {
                let request = self.exchanger.auth_request();
                if let Err(e) = self.send_request(&conn, RequestKind::Auth, request, Vec::new()) {
                    return Exit::Failed(e);
                }
                self.auth_deadline = Some(Instant::now() + self.config.auth_timeout);
            }
        }

        let mut cleanup_interval = tokio::time::interval(STALE_REQUEST_CLEANUP_INTERVAL);
        cleanup_interval.tick().await; // consume the immediate first tick

        loop {
            let refresh_at = self.refresh.next_wake(self.token.as_ref().map(|t| t.expiry));
            let auth_deadline = self.auth_deadline;

            tokio::select! {
                // Inbound frames first so heartbeat acks never queue behind timers.
                biased;

                // ── Incoming frame ───────────────────────────────────────────
                event = conn.recv() => {
                    match event {
                        Some(TransportEvent::Frame(text)) => match self.handle_frame(&text, &conn) {
                            Ok(()) => {}
                            Err(e) if e.is_recoverable() => {
                                warn!("Discarding frame: {} ({})", e, preview(&text));
                            }
                            Err(e) => return Exit::Failed(e),
                        },
                        Some(TransportEvent::Closed(reason)) => {
                            return Exit::Failed(Error::closed(reason));
                        }
                        None => return Exit::Failed(Error::closed("transport dropped")),
                    }
                }

                // ── Command from the client handle ──────────────────────────
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Subscribe { channels }) => {
                            self.handle_subscribe(channels, &conn);
                        }
                        Some(ClientCommand::Shutdown) | None => return Exit::Shutdown,
                    }
                }

                // ── Initial authentication timeout ──────────────────────────
                _ = sleep_until_opt(auth_deadline) => {
                    return Exit::Failed(Error::auth_failed(format!(
                        "no response to {} within {:?}",
                        RequestKind::Auth.method(),
                        self.config.auth_timeout
                    )));
                }

                // ── Refresh scheduler ───────────────────────────────────────
                _ = sleep_until_opt(refresh_at) => self.on_refresh_wake(&conn),

                // ── Periodic stale request cleanup ──────────────────────────
                _ = cleanup_interval.tick() => self.sweep_stale(),
            }
        }
    }

    /// Handle a command that arrives while no connection is usable.
    ///
    /// Returns `false` when the session should stop.
    fn queue_command(&mut self, cmd: Option<ClientCommand>) -> bool {
        match cmd {
            Some(ClientCommand::Subscribe { channels }) => {
                let added = self.subscriptions.desire(channels);
                debug!("Queued subscription for {:?} until authenticated", added);
                true
            }
            Some(ClientCommand::Shutdown) | None => false,
        }
    }

    /// Sleep out a reconnect delay. Returns `false` on shutdown.
    async fn wait_before_reconnect(
        &mut self,
        delay: Duration,
        cmd_rx: &mut mpsc::Receiver<ClientCommand>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = cmd_rx.recv() => {
                    if !self.queue_command(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    // ── Inbound dispatch ──────────────────────────────────────────────────

    /// Route one inbound frame.
    ///
    /// A frame that does not decode comes back as a recoverable
    /// `MalformedMessage`; a rejected initial authentication is fatal.
    fn handle_frame(&mut self, text: &str, conn: &Connection) -> Result<()> {
        match decode(text)? {
            Message::Notification(notification) => {
                self.handle_notification(notification, conn);
                Ok(())
            }
            Message::Response(response) => self.handle_response(response, conn),
        }
    }

    fn handle_notification(&mut self, notification: Notification, conn: &Connection) {
        if let Some(ack) = self.heartbeat.on_notification(&notification) {
            if let Err(e) = self.send_request(conn, RequestKind::HeartbeatAck, ack, Vec::new()) {
                warn!("Heartbeat acknowledgement not sent: {}", e);
            }
            return;
        }

        match notification.subscription() {
            Some((channel, data)) => self.emit(SessionEvent::Notification { channel, data }),
            None => debug!("Ignoring notification {}", notification.method),
        }
    }

    fn handle_response(&mut self, response: RpcResponse, conn: &Connection) -> Result<()> {
        let Some(entry) = self.pending.complete(response.id) else {
            debug!("Response for unknown request id {}", response.id);
            return Ok(());
        };

        match entry.kind {
            RequestKind::Auth => {
                self.auth_deadline = None;
                let token = self.exchanger.complete(response, Instant::now())?;
                self.on_authenticated(token, conn);
            }
            RequestKind::Refresh => {
                // Another refresh still queued under the same id means this
                // answer belongs to one abandoned after its timeout.
                let superseded = self.pending.contains_kind(RequestKind::Refresh);
                self.on_refresh_response(response, superseded);
            }
            RequestKind::HeartbeatConfig => self.heartbeat.on_setup_response(response.into_result()),
            RequestKind::HeartbeatAck => {
                if let Err(e) = response.into_result() {
                    debug!("public/test answered with error: {}", e);
                }
            }
            RequestKind::Subscribe => {
                let requested = entry.channels.clone();
                match self.subscriptions.on_ack(entry.channels, response.into_result()) {
                    Ok(channels) => {
                        info!("Subscribed to {:?}", channels);
                        self.emit(SessionEvent::Subscribed { channels });
                    }
                    Err(e) => {
                        warn!("Subscribe to {:?} rejected: {}", requested, e);
                        self.emit(SessionEvent::SubscribeFailed {
                            channels: requested,
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn on_authenticated(&mut self, token: TokenState, conn: &Connection) {
        let now = Instant::now();
        let valid_for = token.remaining(now);
        self.auth_deadline = None;
        self.token = Some(token);
        self.reconnect_attempt = 0;

        self.set_state(SessionState::Authenticated);
        info!("Authenticated, token trusted for {}s", valid_for.as_secs());
        self.emit(SessionEvent::Authenticated {
            refreshed: false,
            valid_for_secs: valid_for.as_secs(),
        });
        self.refresh.start(now);

        let setup = self.heartbeat.setup_request();
        if let Err(e) = self.send_request(conn, RequestKind::HeartbeatConfig, setup, Vec::new()) {
            warn!("Heartbeat setup not sent: {}", e);
        }

        if let Some((request, channels)) = self.subscriptions.replay() {
            if let Err(e) = self.send_request(conn, RequestKind::Subscribe, request, channels) {
                warn!("Subscription replay not sent: {}", e);
            }
        }
    }

    fn on_refresh_response(&mut self, response: RpcResponse, superseded: bool) {
        let now = Instant::now();
        match self.exchanger.complete(response, now) {
            Ok(token) if superseded => {
                // The newer refresh stays in flight; only the token is taken.
                debug!("Late answer to an abandoned refresh, adopting its token");
                self.token = Some(token);
            }
            Err(e) if superseded => {
                debug!("Late failure of an abandoned refresh ignored: {}", e);
            }
            Ok(token) => {
                let valid_for = token.remaining(now);
                self.token = Some(token);
                self.refresh.complete(now);
                // Authenticated -> Authenticated: no state change is published.
                self.set_state(SessionState::Authenticated);
                info!("Access token refreshed, trusted for {}s", valid_for.as_secs());
                self.emit(SessionEvent::Authenticated {
                    refreshed: true,
                    valid_for_secs: valid_for.as_secs(),
                });
            }
            Err(e) => {
                warn!("Token refresh failed, keeping current token: {}", e);
                self.refresh.fail(now);
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────

    fn handle_subscribe(&mut self, channels: Vec<String>, conn: &Connection) {
        if self.state != SessionState::Authenticated {
            let added = self.subscriptions.desire(channels);
            debug!("Queued subscription for {:?} until authenticated", added);
            return;
        }
        if let Some((request, channels)) = self.subscriptions.subscribe(channels) {
            if let Err(e) = self.send_request(conn, RequestKind::Subscribe, request, channels) {
                warn!("Subscribe not sent: {}", e);
            }
        }
    }

    fn on_refresh_wake(&mut self, conn: &Connection) {
        let now = Instant::now();
        let Some(token) = &self.token else {
            return;
        };

        match self.refresh.on_wake(now, token.expiry) {
            RefreshDecision::Refresh => {
                let request = self.exchanger.refresh_request(&token.tokens.refresh_token);
                info!("Refreshing access token");
                if let Err(e) = self.send_request(conn, RequestKind::Refresh, request, Vec::new()) {
                    warn!("Refresh not sent: {}", e);
                    self.refresh.fail(now);
                }
            }
            RefreshDecision::InFlight => debug!("Refresh already in flight"),
            RefreshDecision::NotDue => {}
        }
    }

    /// Encode, enqueue and register one request.
    fn send_request(
        &mut self,
        conn: &Connection,
        kind: RequestKind,
        request: JsonRpcRequest,
        channels: Vec<String>,
    ) -> Result<()> {
        let frame = request.encode()?;
        conn.send(frame)?;
        self.pending.register(kind, channels, Instant::now());
        trace!("Sent {} request (id {})", kind, kind.id());
        Ok(())
    }

    fn sweep_stale(&mut self) {
        let stale = self
            .pending
            .cleanup_stale(self.config.ack_timeout, Instant::now());
        for entry in stale {
            match entry.kind {
                RequestKind::Subscribe => {
                    warn!("No acknowledgement for subscribe {:?}", entry.channels);
                    self.emit(SessionEvent::SubscribeFailed {
                        channels: entry.channels,
                        message: Error::timeout("subscribe acknowledgement").to_string(),
                    });
                }
                RequestKind::HeartbeatAck => trace!("Dropping unanswered heartbeat ack"),
                kind => debug!("Dropping unanswered {} request", kind),
            }
        }
    }

    // ── State ─────────────────────────────────────────────────────────────

    fn set_state(&mut self, next: SessionState) {
        let from = self.state;
        if !from.can_transition_to(next) {
            warn!("Ignoring illegal state transition {} -> {}", from, next);
            return;
        }
        if from == next {
            return;
        }

        self.state = next;
        {
            let mut guard = self.shared_state.write().unwrap_or_else(|e| e.into_inner());
            *guard = next;
        }
        debug!("Session state {} -> {}", from, next);
        self.emit(SessionEvent::StateChanged { from, to: next });
    }

    /// Clear everything tied to the connection that just ended.
    fn teardown(&mut self) {
        let abandoned = self.pending.pending_count();
        if abandoned > 0 {
            debug!("Abandoning {} pending request(s)", abandoned);
        }
        debug!(
            "{} heartbeat(s) acknowledged on this connection",
            self.heartbeat.acks_sent()
        );
        self.token = None;
        self.auth_deadline = None;
        self.pending.clear();
        self.refresh.reset();
        self.heartbeat.reset();
        self.subscriptions.reset_confirmed();
    }

    fn shutdown(&mut self) {
        info!("Session shutting down");
        self.set_state(SessionState::Closing);
        self.teardown();
        self.set_state(SessionState::Disconnected);
        self.emit(SessionEvent::Closed {
            reason: "shutdown".to_string(),
        });
    }

    /// Hand an event to the client. Nothing is dropped while the receiver
    /// is alive.
    fn emit(&self, event: SessionEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("Event receiver gone");
        }
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SessionClient;
    use crate::refresh::MIN_REFRESH_INTERVAL;
    use crate::test_utils::{CannedPoster, ConnectionPeer, ScriptedConnector};
    use serde_json::{json, Value};

    const BOOK: &str = "book.BTC-PERPETUAL.100ms";
    const WAIT: Duration = Duration::from_secs(600);

    fn config() -> SessionConfig {
        SessionConfig::new("wss://mock.test/ws/api/v2", Credentials::new("key", "secret"))
            .with_channels([BOOK])
    }

    fn token_result(id: u64, access: &str, expires_in: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "access_token": access,
                "refresh_token": format!("ref-{access}"),
                "expires_in": expires_in,
                "scope": "connection",
            },
        })
    }

    async fn next_event<F>(client: &mut SessionClient, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = client
                    .event_receiver()
                    .recv()
                    .await
                    .expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn next_frame(peer: &mut ConnectionPeer) -> Value {
        tokio::time::timeout(WAIT, peer.next_frame())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    /// Start a client and complete in-band authentication.
    async fn authenticated(cfg: SessionConfig) -> (SessionClient, ConnectionPeer) {
        authenticated_for(cfg, 300).await
    }

    /// Like [`authenticated`], with a token that expires in `expires_in` seconds.
    async fn authenticated_for(
        cfg: SessionConfig,
        expires_in: u64,
    ) -> (SessionClient, ConnectionPeer) {
        let connector = ScriptedConnector::new();
        let mut peer = connector.push_pair();
        let mut client = SessionClient::start(cfg, connector, CannedPoster::unused());

        let auth = next_frame(&mut peer).await;
        assert_eq!(auth["method"], "public/auth");
        peer.push_json(token_result(9929, "tok1", expires_in)).await;

        next_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
        (client, peer)
    }

    // -- ReconnectPolicy -----------------------------------------------------

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::Backoff {
            max_attempts: 10,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(5), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay(6), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(11), None);
    }

    #[test]
    fn test_backoff_large_attempt_does_not_overflow() {
        let max = Duration::from_secs(30);
        assert_eq!(compute_backoff(u32::MAX, Duration::from_secs(1), max), max);
    }

    #[test]
    fn test_never_policy_has_no_delay() {
        assert_eq!(ReconnectPolicy::Never.delay(1), None);
    }

    // -- Authentication ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_in_band_auth_then_heartbeat_setup_and_subscribe() {
        let connector = ScriptedConnector::new();
        let mut peer = connector.push_pair();
        let mut client = SessionClient::start(config(), connector, CannedPoster::unused());

        let auth = next_frame(&mut peer).await;
        assert_eq!(auth["id"], 9929);
        assert_eq!(auth["params"]["grant_type"], "client_credentials");
        assert_eq!(client.state(), SessionState::Authenticating);

        peer.push_json(token_result(9929, "tok1", 300)).await;

        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
        match event {
            SessionEvent::Authenticated {
                refreshed,
                valid_for_secs,
            } => {
                assert!(!refreshed);
                assert_eq!(valid_for_secs, 300 - 240);
            }
            other => panic!("Expected Authenticated, got {:?}", other),
        }
        assert_eq!(client.state(), SessionState::Authenticated);

        let setup = next_frame(&mut peer).await;
        assert_eq!(setup["id"], 9098);
        assert_eq!(setup["params"]["interval"], 10);

        let subscribe = next_frame(&mut peer).await;
        assert_eq!(subscribe["id"], 42);
        assert_eq!(subscribe["params"]["channels"], json!([BOOK]));

        peer.push_json(json!({"jsonrpc": "2.0", "id": 42, "result": [BOOK]}))
            .await;
        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Subscribed { .. })).await;
        assert!(matches!(event, SessionEvent::Subscribed { channels } if channels == vec![BOOK]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_initial_auth_fails_session() {
        let connector = ScriptedConnector::new();
        let mut peer = connector.push_pair();
        let mut client = SessionClient::start(config(), connector, CannedPoster::unused());

        next_frame(&mut peer).await;
        peer.push_json(json!({
            "jsonrpc": "2.0",
            "id": 9929,
            "error": {"code": 13004, "message": "invalid_credentials"},
        }))
        .await;

        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("invalid_credentials")));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_auth_times_out() {
        let connector = ScriptedConnector::new();
        let mut peer = connector.push_pair();
        let mut client = SessionClient::start(config(), connector, CannedPoster::unused());
        next_frame(&mut peer).await;

        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("Authentication failed")));
        assert_eq!(client.state(), SessionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_band_auth_skips_public_auth() {
        let mut cfg = config();
        cfg.auth_mode = AuthMode::OutOfBand {
            token_url: "https://mock.test/api/v2/public/auth".into(),
        };
        let poster = CannedPoster::new(
            r#"{"jsonrpc":"2.0","result":{"access_token":"a","refresh_token":"r","expires_in":900}}"#,
        );
        let connector = ScriptedConnector::new();
        let mut peer = connector.push_pair();
        let mut client = SessionClient::start(cfg, connector, poster);

        let first = next_frame(&mut peer).await;
        assert_eq!(first["method"], "public/set_heartbeat");
        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
        assert!(matches!(event, SessionEvent::Authenticated { valid_for_secs: 660, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_fails_session() {
        let connector = ScriptedConnector::new();
        connector.push_failure("dns lookup failed");
        let mut client = SessionClient::start(config(), connector, CannedPoster::unused());

        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("dns lookup failed")));
        assert_eq!(client.state(), SessionState::Failed);
    }

    // -- Heartbeat -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_acknowledged_with_exact_frame() {
        let (_client, mut peer) = authenticated(config()).await;
        peer.drain();

        peer.push(r#"{"method":"heartbeat"}"#).await;
        let text = tokio::time::timeout(WAIT, peer.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            text,
            r#"{"jsonrpc":"2.0","id":8212,"method":"public/test","params":{}}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ack_precedes_refresh() {
        let (_client, mut peer) = authenticated(config()).await;
        peer.drain();

        // The heartbeat is already queued when the token deadline passes.
        peer.push(r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#)
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let first = next_frame(&mut peer).await;
        let second = next_frame(&mut peer).await;
        assert_eq!(first["id"], 8212);
        assert_eq!(second["id"], 9929);
        assert_eq!(second["params"]["grant_type"], "refresh_token");
        assert_eq!(second["params"]["refresh_token"], "ref-tok1");
    }

    // -- Refresh -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_refresh_issued_once_while_in_flight() {
        let (mut client, mut peer) = authenticated(config()).await;
        peer.drain();

        let refresh = next_frame(&mut peer).await;
        assert_eq!(refresh["params"]["grant_type"], "refresh_token");

        // Still inside the auth timeout: no second refresh.
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(peer.drain().iter().all(|f| f["method"] != "public/auth"));

        peer.push_json(token_result(9929, "tok2", 300)).await;
        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
        assert!(matches!(
            event,
            SessionEvent::Authenticated { refreshed: true, valid_for_secs: 60 }
        ));
        assert_eq!(client.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_session_authenticated() {
        let (client, mut peer) = authenticated(config()).await;
        peer.drain();

        next_frame(&mut peer).await;
        peer.push_json(json!({
            "jsonrpc": "2.0",
            "id": 9929,
            "error": {"code": 13009, "message": "invalid_token"},
        }))
        .await;

        // The retry comes one auth timeout later, on the same connection.
        let retry = next_frame(&mut peer).await;
        assert_eq!(retry["params"]["grant_type"], "refresh_token");
        assert_eq!(client.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_token_refreshes_at_half_its_lifetime() {
        let (mut client, mut peer) = authenticated_for(config(), 100).await;
        peer.drain();

        for round in 2..5 {
            let since = Instant::now();
            let refresh = next_frame(&mut peer).await;
            assert_eq!(refresh["params"]["grant_type"], "refresh_token");
            assert!(since.elapsed() >= Duration::from_secs(50));

            peer.push_json(token_result(9929, &format!("tok{round}"), 100))
                .await;
            let event = next_event(&mut client, |e| {
                matches!(e, SessionEvent::Authenticated { refreshed: true, .. })
            })
            .await;
            assert!(matches!(
                event,
                SessionEvent::Authenticated { valid_for_secs: 50, .. }
            ));
            assert!(peer.drain().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_on_arrival_tokens_do_not_refresh_back_to_back() {
        let (mut client, mut peer) = authenticated_for(config(), 0).await;
        peer.drain();

        for round in 2..6 {
            let since = Instant::now();
            let refresh = next_frame(&mut peer).await;
            assert_eq!(refresh["method"], "public/auth");
            assert!(since.elapsed() >= MIN_REFRESH_INTERVAL);

            peer.push_json(token_result(9929, &format!("tok{round}"), 0))
                .await;
            next_event(&mut client, |e| {
                matches!(e, SessionEvent::Authenticated { refreshed: true, .. })
            })
            .await;
            tokio::task::yield_now().await;
            assert!(peer.drain().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_to_abandoned_refresh_keeps_newer_one_in_flight() {
        let (mut client, mut peer) = authenticated(config()).await;
        peer.drain();

        let first = next_frame(&mut peer).await;
        assert_eq!(first["params"]["grant_type"], "refresh_token");

        // Unanswered for one auth timeout: a second refresh replaces it.
        let second = next_frame(&mut peer).await;
        assert_eq!(second["params"]["grant_type"], "refresh_token");

        // The first one answers late with an already expired token.
        tokio::time::advance(Duration::from_secs(2)).await;
        peer.push_json(token_result(9929, "late", 0)).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert!(peer.drain().iter().all(|f| f["method"] != "public/auth"));

        peer.push_json(token_result(9929, "tok2", 300)).await;
        let event = next_event(&mut client, |e| {
            matches!(e, SessionEvent::Authenticated { refreshed: true, .. })
        })
        .await;
        assert!(matches!(
            event,
            SessionEvent::Authenticated { valid_for_secs: 60, .. }
        ));
        tokio::task::yield_now().await;
        assert!(peer.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_of_abandoned_refresh_is_ignored() {
        let (mut client, mut peer) = authenticated(config()).await;
        peer.drain();

        next_frame(&mut peer).await;
        next_frame(&mut peer).await;

        peer.push_json(json!({
            "jsonrpc": "2.0",
            "id": 9929,
            "error": {"code": 13009, "message": "invalid_token"},
        }))
        .await;
        peer.push_json(token_result(9929, "tok2", 300)).await;

        let event = next_event(&mut client, |e| {
            matches!(e, SessionEvent::Authenticated { refreshed: true, .. })
        })
        .await;
        assert!(matches!(
            event,
            SessionEvent::Authenticated { valid_for_secs: 60, .. }
        ));
        assert_eq!(client.state(), SessionState::Authenticated);
    }

    // -- Subscriptions -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_runtime_subscribe_sends_each_time() {
        let (client, mut peer) = authenticated(config()).await;
        peer.drain();

        client.subscribe(vec!["trades.BTC-PERPETUAL.raw".into()]).await.unwrap();
        client.subscribe(vec!["trades.BTC-PERPETUAL.raw".into()]).await.unwrap();

        for _ in 0..2 {
            let frame = next_frame(&mut peer).await;
            assert_eq!(frame["method"], "public/subscribe");
            assert_eq!(frame["params"]["channels"], json!(["trades.BTC-PERPETUAL.raw"]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_push_is_forwarded_unmodified() {
        let (mut client, peer) = authenticated(config()).await;

        peer.push_json(json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {"channel": BOOK, "data": {"change_id": 9, "bids": [[1.0, 2.0]]}},
        }))
        .await;

        let event = next_event(&mut client, |e| e.channel().is_some()).await;
        match event {
            SessionEvent::Notification { channel, data } => {
                assert_eq!(channel, BOOK);
                assert_eq!(data, json!({"change_id": 9, "bids": [[1.0, 2.0]]}));
            }
            other => panic!("Expected Notification, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_burst_is_delivered_in_full() {
        let (mut client, peer) = authenticated(config()).await;
        while client.event_receiver().try_recv().is_ok() {}

        // Nobody reads events while the burst arrives.
        for n in 0..400 {
            peer.push_json(json!({
                "jsonrpc": "2.0",
                "method": "subscription",
                "params": {"channel": BOOK, "data": {"change_id": n}},
            }))
            .await;
        }

        for n in 0..400 {
            match next_event(&mut client, |e| e.channel().is_some()).await {
                SessionEvent::Notification { data, .. } => assert_eq!(data["change_id"], n),
                other => panic!("Expected Notification, got {:?}", other),
            }
        }
    }

    // -- Failure handling ----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_close_while_authenticated_fails_without_further_sends() {
        let (mut client, mut peer) = authenticated(config()).await;
        peer.drain();

        peer.close("eof").await;
        let event = next_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;
        assert!(matches!(event, SessionEvent::Closed { reason } if reason.contains("eof")));
        assert_eq!(client.state(), SessionState::Failed);

        // The connection was dropped without another frame.
        assert_eq!(peer.outbound.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_skipped() {
        let (mut client, mut peer) = authenticated(config()).await;
        peer.drain();
        while client.event_receiver().try_recv().is_ok() {}

        peer.push("not json").await;
        peer.push(r#"{"jsonrpc":"2.0","id":777,"result":true}"#).await;
        peer.push(r#"{"method":"heartbeat"}"#).await;

        let ack = next_frame(&mut peer).await;
        assert_eq!(ack["id"], 8212);
        assert_eq!(client.state(), SessionState::Authenticated);
        assert!(client.event_receiver().try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_subscriptions() {
        let mut cfg = config();
        cfg.reconnect = ReconnectPolicy::Backoff {
            max_attempts: 3,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        let connector = std::sync::Arc::new(ScriptedConnector::new());
        let mut first = connector.push_pair();
        let mut second = connector.push_pair();
        let mut client = SessionClient::start(cfg, connector.clone(), CannedPoster::unused());

        next_frame(&mut first).await;
        first.push_json(token_result(9929, "tok1", 300)).await;
        next_event(&mut client, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
        client.subscribe(vec!["ticker.BTC-PERPETUAL.raw".into()]).await.unwrap();

        first.close("reset by peer").await;
        next_event(&mut client, |e| matches!(e, SessionEvent::Closed { .. })).await;

        let auth = next_frame(&mut second).await;
        assert_eq!(auth["params"]["grant_type"], "client_credentials");
        second.push_json(token_result(9929, "tok2", 300)).await;

        assert_eq!(next_frame(&mut second).await["method"], "public/set_heartbeat");
        let replay = next_frame(&mut second).await;
        assert_eq!(
            replay["params"]["channels"],
            json!([BOOK, "ticker.BTC-PERPETUAL.raw"])
        );
        assert_eq!(connector.attempts().len(), 2);
        assert_eq!(client.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connection() {
        let (client, mut peer) = authenticated(config()).await;
        peer.drain();

        client.shutdown().await.unwrap();
        assert_eq!(peer.outbound.recv().await, None);
    }
}
