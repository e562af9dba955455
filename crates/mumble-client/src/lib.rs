//! Blocking Mumble client: TLS control channel, server state mirror, and tunnelled voice.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # fn tls() -> Arc<rustls::ClientConfig> { unimplemented!() }
//! let mut config = mumble_client::Config::new();
//! config.username = "alice".to_string();
//! config.attach(mumble_client::AutoBitrate);
//! let client = mumble_client::dial_with_dialer(
//!     &mumble_client::Dialer::default(),
//!     "voice.example.org",
//!     mumble_proto::DEFAULT_PORT,
//!     config,
//!     tls(),
//! )?;
//! client.disconnect();
//! # Ok::<(), mumble_client::ClientError>(())
//! ```

pub mod channels;
mod client;
pub mod config;
mod error;
pub mod event;
pub mod users;

pub use channels::{Channel, ChannelChange, ChannelTree};
pub use client::{Client, PING_INTERVAL, ServerVersion, dial_with_dialer};
pub use config::{Config, Dialer};
pub use error::ClientError;
pub use event::{
    AudioListener, AudioPacket, AutoBitrate, ChannelChangeEvent, ConnectEvent, DisconnectEvent,
    DisconnectType, EventListener, Listener, PermissionDeniedEvent, ServerConfigEvent,
    TextMessageEvent, UserChangeEvent,
};
pub use users::{User, UserChange, Users};
