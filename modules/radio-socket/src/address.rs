use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid radio address {0:?}: expected six hex octets like AA:BB:CC:DD:EE:FF")]
pub struct AddressError(pub String);

/// 48-bit radio transport address, most significant octet first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RadioAddress(pub [u8; 6]);

impl RadioAddress {
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split(|c| c == ':' || c == '-');
        for octet in &mut out {
            let part = parts.next().ok_or_else(|| AddressError(s.into()))?;
            if part.len() != 2 {
                return Err(AddressError(s.into()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| AddressError(s.into()))?;
        }
        if parts.next().is_some() {
            return Err(AddressError(s.into()));
        }
        Ok(RadioAddress(out))
    }

    pub fn as_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

impl fmt::Display for RadioAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for RadioAddress {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RadioAddress {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RadioAddress {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
