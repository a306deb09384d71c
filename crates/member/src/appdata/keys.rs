//! Key shapes accepted by application-data stores
//!
//! Every store is keyed internally by absolute `KeyPath`. A key shape knows
//! how to turn itself into that path relative to the store's base key and
//! back again.

use crate::error::{Error, Result};
use databus_common::{KeyPath, Segment};
use std::fmt;

pub trait KeyShape: Sized + Clone + fmt::Debug {
    fn to_path(&self, base: &KeyPath) -> Result<KeyPath>;
    fn from_path(path: &KeyPath, base: &KeyPath) -> Result<Self>;
}

/// Absolute path; must lie under the store's base key
impl KeyShape for KeyPath {
    fn to_path(&self, base: &KeyPath) -> Result<KeyPath> {
        if !self.is_concrete() {
            return Err(Error::KeyConversion(format!("{self} contains a wildcard")));
        }
        if !self.starts_with(base) {
            return Err(Error::KeyConversion(format!("{self} is outside {base}")));
        }
        Ok(self.clone())
    }

    fn from_path(path: &KeyPath, _base: &KeyPath) -> Result<Self> {
        Ok(path.clone())
    }
}

/// One segment directly below the store's base key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathEntry(pub String);

impl PathEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl KeyShape for PathEntry {
    fn to_path(&self, base: &KeyPath) -> Result<KeyPath> {
        if self.0.is_empty() || self.0 == "*" || self.0.contains('/') {
            return Err(Error::KeyConversion(format!("invalid path entry {:?}", self.0)));
        }
        Ok(base.child(Segment::name(self.0.clone())))
    }

    fn from_path(path: &KeyPath, base: &KeyPath) -> Result<Self> {
        match path.last().and_then(Segment::as_name) {
            Some(name) if path.depth() == base.depth() + 1 && path.starts_with(base) => {
                Ok(PathEntry(name.to_string()))
            }
            _ => Err(Error::KeyConversion(format!(
                "{path} is not a direct child of {base}"
            ))),
        }
    }
}

/// Compact binary key of at most 16 bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MiniKey {
    bytes: [u8; MiniKey::MAX_LEN],
    len: u8,
}

impl MiniKey {
    pub const MAX_LEN: usize = 16;

    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            return Err(Error::KeyConversion(format!(
                "mini key must be 1..={} bytes, got {}",
                Self::MAX_LEN,
                bytes.len()
            )));
        }
        let mut buf = [0u8; Self::MAX_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    fn to_hex(self) -> String {
        self.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
    }

    fn from_hex(s: &str) -> Result<Self> {
        if s.len() % 2 != 0 {
            return Err(Error::KeyConversion(format!("odd-length mini key {s}")));
        }
        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| {
                s.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| Error::KeyConversion(format!("bad mini key {s}")))
            })
            .collect::<Result<Vec<u8>>>()?;
        Self::new(&bytes)
    }
}

impl fmt::Debug for MiniKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MiniKey({})", self.to_hex())
    }
}

impl KeyShape for MiniKey {
    fn to_path(&self, base: &KeyPath) -> Result<KeyPath> {
        Ok(base.child(Segment::Name(self.to_hex())))
    }

    fn from_path(path: &KeyPath, base: &KeyPath) -> Result<Self> {
        let entry = PathEntry::from_path(path, base)?;
        Self::from_hex(&entry.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> KeyPath {
        KeyPath::parse(s).unwrap()
    }

    #[test]
    fn test_keypath_must_be_under_base() {
        let base = key("/cfg");
        assert_eq!(key("/cfg/a").to_path(&base).unwrap(), key("/cfg/a"));
        assert!(matches!(
            key("/other/a").to_path(&base),
            Err(Error::KeyConversion(_))
        ));
        assert!(key("/cfg/*").to_path(&base).is_err());
    }

    #[test]
    fn test_path_entry_is_one_level() {
        let base = key("/cfg");
        let path = PathEntry::new("eth0").to_path(&base).unwrap();
        assert_eq!(path, key("/cfg/eth0"));
        assert_eq!(PathEntry::from_path(&path, &base).unwrap(), PathEntry::new("eth0"));
        assert!(PathEntry::from_path(&key("/cfg/a/b"), &base).is_err());
        assert!(PathEntry::new("a/b").to_path(&base).is_err());
    }

    #[test]
    fn test_mini_key_limits() {
        assert!(MiniKey::new(&[0u8; 16]).is_ok());
        assert!(matches!(MiniKey::new(&[0u8; 17]), Err(Error::KeyConversion(_))));
        assert!(MiniKey::new(&[]).is_err());
    }

    #[test]
    fn test_mini_key_path_form() {
        let base = key("/ids");
        let mk = MiniKey::new(&[0xde, 0xad, 0x01]).unwrap();
        let path = mk.to_path(&base).unwrap();
        assert_eq!(path, key("/ids/dead01"));
        assert_eq!(MiniKey::from_path(&path, &base).unwrap(), mk);
        assert!(MiniKey::from_path(&key("/ids/zz"), &base).is_err());
    }
}
