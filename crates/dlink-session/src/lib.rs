//! # dlink-session - Authenticated Deribit WebSocket session
//!
//! Keeps one JSON-RPC-over-WebSocket connection authenticated and alive:
//! client-credential login, heartbeat acknowledgement, token refresh before
//! expiry and channel subscriptions that survive a replaced connection.
//!
//! ## Components
//!
//! - [`protocol`] - JSON-RPC 2.0 codec, fixed request-id table, pending registry
//! - [`credentials`] - client-credential and refresh-token grants, REST boundary
//! - [`heartbeat`] - `public/set_heartbeat` and `public/test` acknowledgements
//! - [`refresh`] - deadline or polling refresh scheduler
//! - [`subscriptions`] - desired/confirmed channel sets
//! - [`transport`] - connection boundary and the `tokio-tungstenite` connector
//! - [`session`] - the controller state machine
//! - [`client`] - [`SessionClient`], the public handle
//!
//! ## Example
//!
//! ```no_run
//! use dlink_session::{Credentials, HttpFormPoster, SessionClient, SessionConfig, WsConnector};
//!
//! # async fn demo() -> dlink_core::Result<()> {
//! let config = SessionConfig::new(
//!     "wss://test.deribit.com/ws/api/v2",
//!     Credentials::new("key", "secret"),
//! )
//! .with_channels(["book.BTC-PERPETUAL.100ms"]);
//!
//! let mut client = SessionClient::start(config, WsConnector, HttpFormPoster::default());
//! while let Some(event) = client.event_receiver().recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod credentials;
pub mod heartbeat;
pub mod protocol;
pub mod refresh;
pub mod session;
pub mod subscriptions;
pub mod transport;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use client::SessionClient;
pub use credentials::{
    AuthMode, CredentialExchanger, Credentials, FormPoster, HttpFormPoster, LifetimePolicy,
    TokenSet, TokenState,
};
pub use heartbeat::{HeartbeatResponder, HeartbeatType, MIN_HEARTBEAT_INTERVAL};
pub use protocol::{JsonRpcRequest, Message, Notification, RequestKind, RpcResponse};
pub use refresh::{RefreshDecision, RefreshPolicy, RefreshScheduler, DEFAULT_POLL_PERIOD};
pub use session::{ReconnectPolicy, SessionConfig, DEFAULT_WS_URL};
pub use subscriptions::SubscriptionManager;
pub use transport::{Connection, Connector, TransportEvent, WsConnector};
