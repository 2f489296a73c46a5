//! Validated, normalised on-chain account address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const HEX_DIGITS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address must start with 0x")]
    MissingPrefix,
    #[error("address must have {HEX_DIGITS} hex digits after 0x, found {found}")]
    BadLength { found: usize },
    #[error("address contains non-hex characters")]
    NonHex,
}

/// A `0x`-prefixed 20-byte account address, stored lowercase.
///
/// Input is accepted case-insensitively (checksummed addresses parse fine)
/// but the stored form never carries mixed case, so two spellings of the
/// same account always map to the same subscription key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .ok_or(AddressError::MissingPrefix)?;
        // Count chars, not bytes, so multi-byte junk reports a sensible length.
        let found = digits.chars().count();
        if found != HEX_DIGITS {
            return Err(AddressError::BadLength { found });
        }
        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AddressError::NonHex);
        }
        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}
