//! Bridges a [`mumble_client::Client`] to the local sound devices.
//!
//! Capture: input device → mono → (resample to 48 kHz) → Opus → `Client::send_audio`.
//! Playback: incoming packets → per-speaker Opus decode + jitter buffer → mix → (resample) →
//! output device.

pub mod bridge;
pub mod capture;
pub mod codec;
pub mod config;
pub mod device;
pub mod mixer;
pub mod playback;
pub mod queue;
pub mod resample;

pub use bridge::{AudioBridge, setup};
pub use config::AudioConfig;

/// Environment variable holding the log level for this crate (e.g. `debug`), applied when
/// `RUST_LOG` does not already mention `voice_bridge`.
pub const AUDIO_LOG_ENV: &str = "MUMBLE_AUDIO_LOG";

/// Print capture and playback devices of the default host to stdout.
pub fn list_devices() -> anyhow::Result<()> {
    let host = cpal::default_host();
    device::list_devices(&host)
}
