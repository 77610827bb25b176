//! src/feed.rs
//!
//! Feed identities and the multiserver address format used to point one
//! puppet at another.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::VerifyingKey;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const SIGIL: &str = "@";
const SUFFIX: &str = ".ed25519";

/// A feed reference of the form `@<base64 public key>.ed25519`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(String);

impl FeedId {
    pub fn from_key(key: &VerifyingKey) -> Self {
        Self(format!("{SIGIL}{}{SUFFIX}", STANDARD.encode(key.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare base64 key, without sigil and algorithm suffix.
    pub fn trimmed(&self) -> &str {
        let s = self.0.strip_prefix(SIGIL).unwrap_or(&self.0);
        s.strip_suffix(SUFFIX).unwrap_or(s)
    }
}

fn decode_key(b64: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = STANDARD.decode(b64).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

impl FromStr for FeedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = s
            .strip_prefix(SIGIL)
            .and_then(|rest| rest.strip_suffix(SUFFIX))
            .ok_or_else(|| Error::InvalidFeedId(s.to_string()))?;
        decode_key(key).ok_or_else(|| Error::InvalidFeedId(s.to_string()))?;
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FeedId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FeedId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// `net:localhost:<port>~shs:<key>`
pub fn multiserver_address(port: u16, feed: &FeedId) -> String {
    format!("net:localhost:{}~shs:{}", port, feed.trimmed())
}
