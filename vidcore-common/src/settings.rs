// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Video core settings, populated from an INI config file.

use std::path::Path;
use std::str::FromStr;

use ini::{Ini, Properties};
use log::{debug, info, warn};

use crate::error::ConfigError;
use crate::types::{KIB, MIB};

/// Caching page size used by the buffer cache (16 KiB).
const DEFAULT_PAGE_SIZE: u64 = 16 * KIB;

/// Global video core settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub buffer_cache: BufferCacheSettings,

    // Debug
    pub use_debug_logging: bool,
}

/// Tunables for the GPU buffer cache.
///
/// None of these affect correctness. They trade memory for fewer merges
/// and fewer ring-buffer stalls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCacheSettings {
    /// Bytes appended past the end of every newly created buffer.
    pub growth_margin: u64,
    /// Stream score above which a merge grows the buffer aggressively.
    pub stream_leap_threshold: u32,
    /// Bytes added to both ends of a merged range on a stream leap.
    pub stream_leap_growth: u64,
    /// Largest read-only request served from the transient stream buffer.
    pub stream_threshold: u64,
    /// Host-visible upload ring size.
    pub staging_buffer_size: u64,
    /// Host-visible transient per-draw ring size.
    pub stream_buffer_size: u64,
    /// Host-visible readback ring size.
    pub download_buffer_size: u64,
    /// Device-local scratch size.
    pub device_buffer_size: u64,
    /// Global data share buffer size.
    pub gds_buffer_size: u64,
}

impl Default for BufferCacheSettings {
    fn default() -> Self {
        Self {
            growth_margin: 0,
            stream_leap_threshold: 16,
            stream_leap_growth: 256 * DEFAULT_PAGE_SIZE,
            stream_threshold: DEFAULT_PAGE_SIZE,
            staging_buffer_size: 512 * MIB,
            stream_buffer_size: 128 * MIB,
            download_buffer_size: 128 * MIB,
            device_buffer_size: 128 * MIB,
            gds_buffer_size: 64 * KIB,
        }
    }
}

impl Settings {
    /// Load settings from an INI file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        info!("Loading config from: {}", path.display());
        let conf = Ini::load_from_file(path)?;
        Ok(Self::from_ini(&conf))
    }

    /// Parse settings from INI text.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        let conf = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &Ini) -> Self {
        let mut settings = Settings::default();

        // [BufferCache]
        if let Some(section) = conf.section(Some("BufferCache")) {
            let bc = &mut settings.buffer_cache;
            read_value(section, "growth_margin", &mut bc.growth_margin);
            read_value(section, "stream_leap_threshold", &mut bc.stream_leap_threshold);
            read_value(section, "stream_leap_growth", &mut bc.stream_leap_growth);
            read_value(section, "stream_threshold", &mut bc.stream_threshold);
            read_value(section, "staging_buffer_size", &mut bc.staging_buffer_size);
            read_value(section, "stream_buffer_size", &mut bc.stream_buffer_size);
            read_value(section, "download_buffer_size", &mut bc.download_buffer_size);
            read_value(section, "device_buffer_size", &mut bc.device_buffer_size);
            read_value(section, "gds_buffer_size", &mut bc.gds_buffer_size);
            debug!("Buffer cache settings: {:?}", bc);
        }

        // [Debugging]
        if let Some(section) = conf.section(Some("Debugging")) {
            if let Some(value) = section.get("use_debug_logging") {
                settings.use_debug_logging = parse_bool(value);
            }
        }

        settings
    }
}

/// Overwrite `slot` with the parsed value of `key`, keeping the default on
/// parse failure. Integers may be written in decimal or `0x` hex.
fn read_value<T: FromStr>(section: &Properties, key: &str, slot: &mut T) {
    let Some(raw) = section.get(key) else {
        return;
    };
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)
            .ok()
            .and_then(|v| v.to_string().parse().ok()),
        None => raw.parse().ok(),
    };
    match parsed {
        Some(value) => *slot = value,
        None => warn!("Config: invalid value '{}' for '{}', keeping default", raw, key),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "1")
}
