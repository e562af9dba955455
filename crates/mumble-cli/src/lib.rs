//! Command-line Mumble client: argument and URL resolution, TLS setup, and the session glue
//! between [`mumble_client`] and [`voice_bridge`].

pub mod cli;
pub mod config;
pub mod runtime;
pub mod target;
pub mod tls;
