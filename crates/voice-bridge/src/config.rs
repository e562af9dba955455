/// Audio bridge options.
#[derive(Clone, Debug)]
pub struct AudioConfig {
    /// Do not open the input device or send voice.
    pub mute: bool,
    /// Do not open the output device or play received voice.
    pub deafen: bool,
    /// Case-insensitive substring of the capture device name; default device when unset.
    pub input_device: Option<String>,
    /// Case-insensitive substring of the playback device name; default device when unset.
    pub output_device: Option<String>,
    /// Audio buffered ahead of the playback callback.
    pub buffer_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            mute: false,
            deafen: false,
            input_device: None,
            output_device: None,
            buffer_ms: 60,
        }
    }
}
