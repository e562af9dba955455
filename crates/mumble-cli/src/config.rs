use std::time::Duration;

use anyhow::{Context, Result};
use voice_bridge::AudioConfig;

use crate::cli::Args;
use crate::target::ServerTarget;
use crate::tls::TlsOptions;

/// Filter used when `RUST_LOG` is unset or empty.
pub const DEFAULT_LOG_FILTER: &str = "info,mumble_cli=info";
/// Level for `voice_bridge` when neither `RUST_LOG` nor the audio variable sets one.
const DEFAULT_AUDIO_LOG_LEVEL: &str = "warn";

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub target: ServerTarget,
    pub tls: TlsOptions,
    pub audio: AudioConfig,
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn from_args(args: &Args) -> Result<Self> {
        let url = args.url.as_deref().context("missing server URL")?;
        let target = ServerTarget::parse(url)?;
        Ok(Self {
            target,
            tls: TlsOptions {
                insecure: args.insecure,
                user_cert: args.user_cert.clone(),
                user_key: args.user_key.clone(),
            },
            audio: AudioConfig {
                mute: args.mute,
                deafen: args.deafen,
                input_device: normalize_device_name(args.input_device.clone()),
                output_device: normalize_device_name(args.output_device.clone()),
                buffer_ms: args.buffer_ms.max(10),
            },
            connect_timeout: Duration::from_secs(args.connect_timeout.max(1)),
        })
    }
}

fn normalize_device_name(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

/// Tracing filter from `RUST_LOG` and the audio log variable.
///
/// The audio level becomes a `voice_bridge` directive unless `RUST_LOG` already has one.
pub fn log_filter(rust_log: Option<&str>, audio_log: Option<&str>) -> String {
    let base = rust_log
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_LOG_FILTER);
    if base.contains("voice_bridge") {
        return base.to_string();
    }
    let level = audio_log
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_AUDIO_LOG_LEVEL);
    format!("{base},voice_bridge={level}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn options_follow_arguments() {
        let args = Args::try_parse_from([
            "mumble",
            "--mute",
            "--input-device",
            "  USB ",
            "--output-device",
            " ",
            "--connect-timeout",
            "3",
            "mumble://bob@voice.example.org/Lobby",
        ])
        .unwrap();
        let opts = ClientOptions::from_args(&args).unwrap();
        assert_eq!(opts.target.host, "voice.example.org");
        assert_eq!(opts.target.username.as_deref(), Some("bob"));
        assert!(opts.audio.mute);
        assert!(!opts.audio.deafen);
        assert_eq!(opts.audio.input_device.as_deref(), Some("USB"));
        assert_eq!(opts.audio.output_device, None);
        assert_eq!(opts.connect_timeout, Duration::from_secs(3));
        assert!(!opts.tls.insecure);
    }

    #[test]
    fn bad_url_fails_option_building() {
        let args = Args::try_parse_from(["mumble", "::nope"]).unwrap();
        assert!(ClientOptions::from_args(&args).is_err());
    }

    #[test]
    fn default_filter_adds_audio_level() {
        assert_eq!(log_filter(None, None), "info,mumble_cli=info,voice_bridge=warn");
        assert_eq!(log_filter(Some(""), Some("debug")), "info,mumble_cli=info,voice_bridge=debug");
    }

    #[test]
    fn rust_log_wins_for_voice_bridge() {
        assert_eq!(log_filter(Some("debug,voice_bridge=trace"), Some("error")), "debug,voice_bridge=trace");
        assert_eq!(log_filter(Some("debug"), None), "debug,voice_bridge=warn");
    }
}
