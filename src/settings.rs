//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5).

use crate::error::{Error, Result};

/// Identifiers from RFC 7540 Section 6.5.2.
const ID_HEADER_TABLE_SIZE: u16 = 0x1;
const ID_ENABLE_PUSH: u16 = 0x2;
const ID_MAX_CONCURRENT_STREAMS: u16 = 0x3;
const ID_INITIAL_WINDOW_SIZE: u16 = 0x4;
const ID_MAX_FRAME_SIZE: u16 = 0x5;
const ID_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// Connection settings advertised to or received from the peer.
///
/// `None` means "not specified"; getters substitute the RFC defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Header compression table size (default 4096)
    pub header_table_size: Option<u32>,
    /// Whether server push is permitted (default true)
    pub enable_push: Option<bool>,
    /// Maximum concurrent streams (default unlimited)
    pub max_concurrent_streams: Option<u32>,
    /// Initial stream-level flow control window (default 65535)
    pub initial_window_size: Option<u32>,
    /// Largest acceptable frame payload (default 16384)
    pub max_frame_size: Option<u32>,
    /// Advisory maximum header list size (default unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Empty settings: everything at the RFC defaults
    pub fn new() -> Self {
        Settings::default()
    }

    /// Initial window size with default applied
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(65_535)
    }

    /// Max frame size with default applied
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(16_384)
    }

    /// Whether the peer accepts PUSH_PROMISE
    pub fn enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// Reject out-of-range values (RFC 7540 Section 6.5.2)
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.initial_window_size {
            if size > 0x7FFF_FFFF {
                return Err(Error::Protocol(format!(
                    "INITIAL_WINDOW_SIZE out of range: {}",
                    size
                )));
            }
        }
        if let Some(size) = self.max_frame_size {
            if !(16_384..=16_777_215).contains(&size) {
                return Err(Error::Protocol(format!(
                    "MAX_FRAME_SIZE out of range: {}",
                    size
                )));
            }
        }
        Ok(())
    }

    /// Overlay the parameters present in `other` onto this set
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

    /// Encode the present parameters as a SETTINGS payload
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut put = |id: u16, value: u32| {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        };

        if let Some(v) = self.header_table_size {
            put(ID_HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            put(ID_ENABLE_PUSH, v as u32);
        }
        if let Some(v) = self.max_concurrent_streams {
            put(ID_MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            put(ID_INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            put(ID_MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            put(ID_MAX_HEADER_LIST_SIZE, v);
        }
        payload
    }

    /// Decode a SETTINGS payload; unknown identifiers are ignored per
    /// RFC 7540 Section 6.5.2.
    pub fn decode_payload(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(Error::Protocol(
                "SETTINGS payload not a multiple of 6".to_string(),
            ));
        }

        let mut settings = Settings::new();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                ID_HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ID_ENABLE_PUSH => settings.enable_push = Some(value != 0),
                ID_MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                ID_INITIAL_WINDOW_SIZE => settings.initial_window_size = Some(value),
                ID_MAX_FRAME_SIZE => settings.max_frame_size = Some(value),
                ID_MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                _ => {}
            }
        }

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::new();
        assert_eq!(settings.initial_window_size(), 65_535);
        assert_eq!(settings.max_frame_size(), 16_384);
        assert!(settings.enable_push());
    }

    #[test]
    fn test_payload_round_trip() {
        let mut settings = Settings::new();
        settings.enable_push = Some(false);
        settings.initial_window_size = Some(131_072);
        settings.max_concurrent_streams = Some(100);

        let decoded = Settings::decode_payload(&settings.encode_payload()).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_unknown_identifiers_ignored() {
        let mut payload = vec![0xff, 0xff, 0, 0, 0, 1];
        payload.extend_from_slice(&[0, 2, 0, 0, 0, 0]); // ENABLE_PUSH = 0
        let decoded = Settings::decode_payload(&payload).unwrap();
        assert_eq!(decoded.enable_push, Some(false));
        assert_eq!(decoded.header_table_size, None);
    }

    #[test]
    fn test_invalid_payload_length() {
        assert!(Settings::decode_payload(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_out_of_range_values() {
        let payload = [0x0, 0x4, 0x80, 0x0, 0x0, 0x0]; // window > 2^31-1
        assert!(Settings::decode_payload(&payload).is_err());

        let payload = [0x0, 0x5, 0x0, 0x0, 0x0, 0x1]; // frame size < 16384
        assert!(Settings::decode_payload(&payload).is_err());
    }

    #[test]
    fn test_merge_overlays_only_present() {
        let mut base = Settings::new();
        base.enable_push = Some(true);
        base.initial_window_size = Some(65_535);

        let mut update = Settings::new();
        update.enable_push = Some(false);
        base.merge(&update);

        assert_eq!(base.enable_push, Some(false));
        assert_eq!(base.initial_window_size, Some(65_535));
    }
}
