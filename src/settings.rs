//! HTTP/2 settings management
//!
//! SETTINGS parameters, validation and the 6-byte-pair wire form defined in
//! RFC 7540 Section 6.5. Negotiation timing (when a parameter takes effect)
//! is the connection's responsibility, not this module's.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    /// Maximum size of the header compression table
    HeaderTableSize = 0x1,

    /// SETTINGS_ENABLE_PUSH (0x2)
    /// Used to disable server push
    EnablePush = 0x2,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    /// Maximum number of concurrent streams the sender allows
    MaxConcurrentStreams = 0x3,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    /// Sender's initial window size for stream-level flow control
    InitialWindowSize = 0x4,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    /// Size of the largest frame payload the sender will accept
    MaxFrameSize = 0x5,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    /// Advisory maximum size of a header list
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Get header table size (with default)
    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(4096)
    }

    /// Get enable push (with default)
    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// Get max concurrent streams (None = unlimited)
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    /// Get initial window size (with default)
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(65535)
    }

    /// Get max frame size (with default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(16384)
    }

    /// Get max header list size (None = unlimited)
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        // SETTINGS_INITIAL_WINDOW_SIZE (max 2^31-1)
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > 0x7FFFFFFF {
                return Err(Error::InvalidSettings(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        // SETTINGS_MAX_FRAME_SIZE (16384 to 16777215)
        if let Some(max_frame_size) = self.max_frame_size {
            if !(16384..=16777215).contains(&max_frame_size) {
                return Err(Error::InvalidSettings(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`, last-write-wins)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
    }

    /// Encode to the wire form: a sequence of (16-bit id, 32-bit value)
    /// pairs, one per parameter that is set.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        if let Some(val) = self.header_table_size {
            buf.put_u16(SettingsParameter::HeaderTableSize.as_u16());
            buf.put_u32(val);
        }
        if let Some(val) = self.enable_push {
            buf.put_u16(SettingsParameter::EnablePush.as_u16());
            buf.put_u32(if val { 1 } else { 0 });
        }
        if let Some(val) = self.max_concurrent_streams {
            buf.put_u16(SettingsParameter::MaxConcurrentStreams.as_u16());
            buf.put_u32(val);
        }
        if let Some(val) = self.initial_window_size {
            buf.put_u16(SettingsParameter::InitialWindowSize.as_u16());
            buf.put_u32(val);
        }
        if let Some(val) = self.max_frame_size {
            buf.put_u16(SettingsParameter::MaxFrameSize.as_u16());
            buf.put_u32(val);
        }
        if let Some(val) = self.max_header_list_size {
            buf.put_u16(SettingsParameter::MaxHeaderListSize.as_u16());
            buf.put_u32(val);
        }

        buf.freeze()
    }

    /// Decode from the wire form. Unknown setting ids are ignored per
    /// RFC 7540 Section 6.5.2; a payload that is not a multiple of 6 bytes
    /// is a FRAME_SIZE_ERROR and must be rejected by the caller before
    /// reaching here.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for pair in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([pair[0], pair[1]]);
            let value = u32::from_be_bytes([pair[2], pair[3], pair[4], pair[5]]);

            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => {
                    settings.header_table_size = Some(value)
                }
                Some(SettingsParameter::EnablePush) => {
                    if value > 1 {
                        return Err(Error::InvalidSettings(format!(
                            "ENABLE_PUSH must be 0 or 1, got {}",
                            value
                        )));
                    }
                    settings.enable_push = Some(value != 0);
                }
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    settings.max_concurrent_streams = Some(value)
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    settings.initial_window_size = Some(value)
                }
                Some(SettingsParameter::MaxFrameSize) => settings.max_frame_size = Some(value),
                Some(SettingsParameter::MaxHeaderListSize) => {
                    settings.max_header_list_size = Some(value)
                }
                None => {
                    // Unknown settings are ignored per RFC 7540
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }
}

/// Builder for HTTP/2 settings
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
