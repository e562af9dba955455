//! Capture / playback device discovery and stream config selection.

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Rate the voice path runs at; devices are opened at this rate when they support it.
pub const VOICE_RATE: u32 = 48_000;

/// Pick the first input device whose name contains `needle` (case-insensitive), or the default.
pub fn pick_input_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let devices = host.input_devices().context("No input devices")?;
        return find_by_name(devices, needle)
            .ok_or_else(|| anyhow!("No input device matched: {needle}"));
    }
    host.default_input_device()
        .ok_or_else(|| anyhow!("No default input device"))
}

/// Pick the first output device whose name contains `needle` (case-insensitive), or the default.
pub fn pick_output_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    if let Some(needle) = needle {
        let devices = host.output_devices().context("No output devices")?;
        return find_by_name(devices, needle)
            .ok_or_else(|| anyhow!("No output device matched: {needle}"));
    }
    host.default_output_device()
        .ok_or_else(|| anyhow!("No default output device"))
}

fn find_by_name(mut devices: impl Iterator<Item = cpal::Device>, needle: &str) -> Option<cpal::Device> {
    devices.find(|d| {
        d.description()
            .map(|desc| matches_device_name(&desc.name(), needle))
            .unwrap_or(false)
    })
}

/// Best capture config for the voice path: 48 kHz if possible, fewest channels, float first.
pub fn pick_input_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<_> = device
        .supported_input_configs()
        .context("Querying input configs")?
        .collect();
    best_config(ranges, VOICE_RATE).ok_or_else(|| anyhow!("No supported input configs"))
}

/// Best playback config for the voice path: 48 kHz if possible, fewest channels, float first.
pub fn pick_output_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<_> = device
        .supported_output_configs()
        .context("Querying output configs")?
        .collect();
    best_config(ranges, VOICE_RATE).ok_or_else(|| anyhow!("No supported output configs"))
}

fn best_config(
    ranges: Vec<cpal::SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    let mut best: Option<(Candidate, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
        let candidate = Candidate {
            distance: rate.abs_diff(target_rate),
            channels: range.channels(),
            format_rank: sample_format_rank(range.sample_format()),
        };
        if best.as_ref().is_none_or(|(b, _)| candidate.is_better_than(b)) {
            best = Some((candidate, range.with_sample_rate(rate)));
        }
    }
    best.map(|(_, cfg)| cfg)
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    distance: u32,
    channels: u16,
    format_rank: u8,
}

impl Candidate {
    fn is_better_than(&self, other: &Candidate) -> bool {
        (self.distance, self.channels, self.format_rank)
            < (other.distance, other.channels, other.format_rank)
    }
}

fn pick_rate_for_range(min: u32, max: u32, target: u32) -> u32 {
    target.clamp(min, max.max(min))
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I16 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Fixed buffer size close to `target_frames`, when the device reports a range.
///
/// `None` leaves the choice to the backend.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    target_frames: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            Some(cpal::BufferSize::Fixed(target_frames.clamp(*min, (*max).max(*min))))
        }
        cpal::SupportedBufferSize::Unknown => None,
    }
}

/// Print capture and playback devices to stdout, marking the defaults.
pub fn list_devices(host: &cpal::Host) -> Result<()> {
    let default_in = host
        .default_input_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());
    let default_out = host
        .default_output_device()
        .and_then(|d| d.description().ok())
        .map(|d| d.name().to_string());

    println!("Input devices:");
    for (i, d) in host.input_devices().context("No input devices")?.enumerate() {
        let name = d.description()?.name().to_string();
        println!("  #{i}: {name}{}", default_marker(&name, default_in.as_deref()));
    }
    println!("Output devices:");
    for (i, d) in host.output_devices().context("No output devices")?.enumerate() {
        let name = d.description()?.name().to_string();
        println!("  #{i}: {name}{}", default_marker(&name, default_out.as_deref()));
    }
    Ok(())
}

fn default_marker(name: &str, default: Option<&str>) -> &'static str {
    if default == Some(name) { " (default)" } else { "" }
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
