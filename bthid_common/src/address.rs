use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 48-bit Bluetooth device address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteAddress(u64);

impl RemoteAddress {
    const MASK: u64 = 0xffff_ffff_ffff;

    pub const fn new(raw: u64) -> Self {
        Self(raw & Self::MASK)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Most significant byte first, the order addresses are usually written in.
    pub fn bytes(self) -> [u8; 6] {
        let be = self.0.to_be_bytes();
        [be[2], be[3], be[4], be[5], be[6], be[7]]
    }

    /// Instance id of the child device: upper-case hex without separators.
    pub fn instance_id(self) -> String {
        format!("{:X}", self.0)
    }
}

impl From<[u8; 6]> for RemoteAddress {
    fn from(bytes: [u8; 6]) -> Self {
        let mut padded = [0u8; 8];
        padded[2..].copy_from_slice(&bytes);
        Self(u64::from_be_bytes(padded))
    }
}

impl From<u64> for RemoteAddress {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid bluetooth address: {0}")]
pub struct ParseAddressError(String);

impl FromStr for RemoteAddress {
    type Err = ParseAddressError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-..` or bare hex with an optional `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim()
            .trim_start_matches("0x")
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        if digits.is_empty() || digits.len() > 12 {
            return Err(ParseAddressError(s.to_string()));
        }
        u64::from_str_radix(&digits, 16)
            .map(Self::new)
            .map_err(|_| ParseAddressError(s.to_string()))
    }
}
