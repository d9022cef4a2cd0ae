use crate::errors::ControlError;
use serde::{Deserialize, Serialize};

/// Highest bus index a device key may carry.
///
/// Multi-drop lines on this hardware address at most 64 drops; anything
/// above that is a wiring-table typo, not a device.
pub const MAX_DEVICE_INDEX: u8 = 63;

/// Registry key: one lowercase family prefix letter plus a bus index.
///
/// Examples: `v0` (valve), `a12` (actuator), `m3` (manometer). Keys are
/// validated at registration time so a malformed wiring table is rejected
/// with a diagnostic instead of silently never being scheduled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    prefix: char,
    index: u8,
}

impl DeviceKey {
    pub fn new(prefix: char, index: u8) -> Result<Self, ControlError> {
        if !prefix.is_ascii_lowercase() {
            return Err(ControlError::InvalidKey(format!(
                "prefix '{prefix}' is not a lowercase ASCII letter. \
                 Device families use single-letter prefixes like 'v' or 'a'."
            )));
        }
        if index > MAX_DEVICE_INDEX {
            return Err(ControlError::InvalidKey(format!(
                "index {index} exceeds the bus maximum of {MAX_DEVICE_INDEX}. \
                 Check the wiring table for a transposed digit."
            )));
        }
        Ok(Self { prefix, index })
    }

    /// Parse the `prefix+index` textual form (e.g. `"v12"`)
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        let mut chars = s.chars();
        let prefix = chars.next().ok_or_else(|| {
            ControlError::InvalidKey("empty key. Expected a form like 'v12'.".into())
        })?;
        let rest = chars.as_str();
        if rest.is_empty() {
            return Err(ControlError::InvalidKey(format!(
                "key '{s}' has no index. Expected a form like '{prefix}0'."
            )));
        }
        let index: u8 = rest.parse().map_err(|_| {
            ControlError::InvalidKey(format!(
                "key '{s}' has a non-numeric or out-of-range index '{rest}'. \
                 Indices are decimal, 0..={MAX_DEVICE_INDEX}."
            ))
        })?;
        Self::new(prefix, index)
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    pub fn index(&self) -> u8 {
        self.index
    }
}

impl std::fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.prefix, self.index)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let key = DeviceKey::parse("v12").unwrap();
        assert_eq!(key.prefix(), 'v');
        assert_eq!(key.index(), 12);
        assert_eq!(key.to_string(), "v12");
    }

    #[test]
    fn test_rejects_uppercase_prefix() {
        let err = DeviceKey::parse("V1").unwrap_err();
        match err {
            ControlError::InvalidKey(msg) => assert!(msg.contains("lowercase")),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_rejects_out_of_range_index() {
        assert!(DeviceKey::parse("v63").is_ok());
        let err = DeviceKey::parse("v64").unwrap_err();
        match err {
            ControlError::InvalidKey(msg) => assert!(msg.contains("exceeds")),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(DeviceKey::parse("").is_err());
        assert!(DeviceKey::parse("v").is_err());
        assert!(DeviceKey::parse("vx").is_err());
        assert!(DeviceKey::parse("v-1").is_err());
        assert!(DeviceKey::parse("v1000").is_err());
    }

    #[test]
    fn test_serialization() {
        let key = DeviceKey::parse("a3").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let deserialized: DeviceKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, deserialized);
    }
}
