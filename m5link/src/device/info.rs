//! Parsing the device-info reply.
//!
//! Firmware builds answer the info request in one of three shapes:
//!
//! ```text
//! Json:            {"platform": "esp32", "flashSize": 4194304, ...}
//! KeyValue:        platform=esp32
//!                  flash_size=4194304
//! ColonSeparated:  Platform: esp32
//!                  Flash Size: 4MB
//! ```
//!
//! Each shape has its own parser producing key/value pairs; the pairs are
//! then mapped onto [`DeviceInfo`] by one shared key table.

use {
    crate::error::{Error, Result},
    serde_json::Value,
    std::{collections::BTreeMap, fmt},
};

/// Facts reported by the device. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Port name, e.g. `esp32`.
    pub platform: Option<String>,
    /// Firmware version string.
    pub version: Option<String>,
    /// Unique chip identifier.
    pub chip_id: Option<String>,
    /// Flash size in bytes.
    pub flash_size: Option<u64>,
    /// RAM (heap) size in bytes.
    pub ram_size: Option<u64>,
    /// Station MAC address.
    pub mac_address: Option<String>,
    /// Keys the parser did not recognize, normalized.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "BTreeMap::is_empty"))]
    pub extra: BTreeMap<String, String>,
}

/// The reply shapes the parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoFormat {
    /// A JSON object.
    Json,
    /// `key=value` lines (or comma-separated pairs).
    KeyValue,
    /// `Key: value` lines.
    ColonSeparated,
}

impl InfoFormat {
    /// Guess the shape of `text`.
    pub fn detect(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.starts_with('{') {
            Some(Self::Json)
        } else if text.lines().any(|line| line.contains('=')) {
            Some(Self::KeyValue)
        } else if text.lines().any(|line| line.contains(':')) {
            Some(Self::ColonSeparated)
        } else {
            None
        }
    }

    /// Split `text` into raw key/value pairs.
    pub fn pairs(self, text: &str) -> Result<Vec<(String, String)>> {
        match self {
            Self::Json => json_pairs(text),
            Self::KeyValue => Ok(key_value_pairs(text)),
            Self::ColonSeparated => Ok(colon_pairs(text)),
        }
    }
}

impl fmt::Display for InfoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::KeyValue => "key=value",
            Self::ColonSeparated => "colon-separated",
        })
    }
}

fn json_pairs(text: &str) -> Result<Vec<(String, String)>> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| Error::InvalidResponse(format!("device info is not valid JSON: {e}")))?;
    let Value::Object(map) = value else {
        return Err(Error::InvalidResponse(
            "device info JSON is not an object".into(),
        ));
    };

    Ok(map
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

fn key_value_pairs(text: &str) -> Vec<(String, String)> {
    text.lines()
        .flat_map(|line| {
            // several pairs on one line are comma-separated
            if line.matches('=').count() > 1 {
                line.split(',').collect::<Vec<_>>()
            } else {
                vec![line]
            }
        })
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn colon_pairs(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// `chipId`, `Chip ID` and `chip-id` all become `chip_id`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    let mut prev_lower = false;
    for ch in key.trim().chars() {
        if ch.is_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        match ch {
            ' ' | '-' | '.' => out.push('_'),
            c => out.extend(c.to_lowercase()),
        }
    }
    while out.contains("__") {
        out = out.replace("__", "_");
    }
    out.trim_matches('_').to_string()
}

/// Parse a size such as `4194304`, `0x400000`, `4MB` or `320 KiB`.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        return u64::from_str_radix(hex, 16).ok();
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bytes" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

impl DeviceInfo {
    /// Parse an info reply, detecting its shape.
    pub fn parse(text: &str) -> Result<Self> {
        let format = InfoFormat::detect(text).ok_or_else(|| {
            Error::InvalidResponse(format!("unrecognized device info: {:?}", text.trim()))
        })?;
        Self::parse_as(format, text)
    }

    /// Parse an info reply of a known shape.
    pub fn parse_as(format: InfoFormat, text: &str) -> Result<Self> {
        let mut info = Self::default();
        for (key, value) in format.pairs(text)? {
            info.set(&normalize_key(&key), value);
        }
        Ok(info)
    }

    fn set(&mut self, key: &str, value: String) {
        if value.is_empty() {
            return;
        }
        match key {
            "platform" | "board" | "machine" | "sysname" => self.platform = Some(value),
            "version" | "firmware" | "fw_version" | "release" => self.version = Some(value),
            "chip_id" | "unique_id" | "uid" | "id" => self.chip_id = Some(value),
            "flash_size" | "flash" => self.flash_size = parse_size(&value),
            "ram_size" | "ram" | "memory" | "heap_size" => self.ram_size = parse_size(&value),
            "mac_address" | "mac" => self.mac_address = Some(value),
            other => {
                self.extra.insert(other.to_string(), value);
            },
        }
    }
}
