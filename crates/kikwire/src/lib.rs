//! # kikwire
//!
//! Async client core for a Kik-style XML stanza messaging protocol.
//!
//! The interesting part of such a client is not building stanzas (see
//! [`kikwire_protocol::requests`] for that) but the machinery around them:
//!
//! - a **state machine** ([`StateMachine`]) that picks the right handshake
//!   from the persisted session, handles the captcha detour, and rebuilds
//!   the transport when the server assigns a routing node;
//! - a **correlation dispatcher** ([`Dispatcher`]) that hands each reply to
//!   exactly the request waiting for it and turns everything else into a
//!   broadcast [`ClientEvent`];
//! - a **connection task** behind [`KikClient`] that owns both and
//!   processes stanzas in wire order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kikwire::prelude::*;
//!
//! # async fn run() -> Result<(), KikError> {
//! let client = KikClient::builder(Credentials::new("alice", "hunter2"))
//!     .build(TcpConnector::default(), JsonFileStore::new("sessions"))?;
//!
//! let mut events = client.subscribe();
//! client.connect().await?;
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         ClientEvent::CaptchaChallenge { url } => {
//!             println!("solve {url}");
//!             // client.resolve_captcha(answer).await?;
//!         }
//!         ClientEvent::Authenticated => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
pub mod dispatcher;
mod error;
mod events;
pub mod machine;
mod roster;

pub use client::{KikClient, KikClientBuilder};
pub use config::ClientConfig;
pub use dispatcher::Dispatcher;
pub use error::{ClientError, KikError, RequestError};
pub use events::{ClientEvent, EventStream};
pub use machine::{Action, ConnectionPhase, StateMachine};
pub use roster::{RosterTracker, TrackedRoster};

/// Everything most applications need, in one import.
pub mod prelude {
    pub use crate::{
        ClientConfig, ClientError, ClientEvent, ConnectionPhase, EventStream, KikClient,
        KikClientBuilder, KikError, RequestError, TrackedRoster,
    };
    pub use kikwire_protocol::{
        ChatMessage, CorrelationId, Credentials, Group, Jid, Request, Stanza, User, requests,
    };
    pub use kikwire_session::{JsonFileStore, MemoryStore, Session, SessionStore};
    pub use kikwire_transport::{ChannelConnector, ChannelServer, Connector, TcpConnector};
}
