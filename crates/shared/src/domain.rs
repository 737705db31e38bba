use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(InboxId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Ethereum,
    Passkey,
}

/// An externally owned identity (wallet address or passkey) as the messaging
/// network understands it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
}

impl Identifier {
    pub fn ethereum(address: impl Into<String>) -> Self {
        Self {
            kind: IdentifierKind::Ethereum,
            value: address.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendEnv {
    #[default]
    Dev,
    Production,
    Local,
}

impl BackendEnv {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" => Some(Self::Dev),
            "production" | "prod" => Some(Self::Production),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Lower-cases and validates an EVM address (`0x` followed by 40 hex digits).
pub fn normalize_address(raw: &str) -> Option<String> {
    let address = raw.trim().to_ascii_lowercase();
    let hex = address.strip_prefix("0x")?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(address)
}

/// Shortened `0x1234…abcd` form used when no better display identity exists.
pub fn short_address(address: &str) -> String {
    if address.len() <= 12 || !address.is_ascii() {
        return address.to_string();
    }
    format!("{}…{}", &address[..6], &address[address.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_mixed_case_address() {
        assert_eq!(
            normalize_address("  0xABCDEF0123456789abcdef0123456789ABCDEF01 "),
            Some("0xabcdef0123456789abcdef0123456789abcdef01".to_string())
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!(normalize_address(""), None);
        assert_eq!(normalize_address("abcdef0123456789abcdef0123456789abcdef01"), None);
        assert_eq!(normalize_address("0x1234"), None);
        assert_eq!(
            normalize_address("0xZZcdef0123456789abcdef0123456789abcdef01"),
            None
        );
    }

    #[test]
    fn shortens_long_addresses_only() {
        assert_eq!(
            short_address("0xabcdef0123456789abcdef0123456789abcdef01"),
            "0xabcd…ef01"
        );
        assert_eq!(short_address("alice"), "alice");
    }

    #[test]
    fn parses_backend_env_aliases() {
        assert_eq!(BackendEnv::parse("PROD"), Some(BackendEnv::Production));
        assert_eq!(BackendEnv::parse(" dev "), Some(BackendEnv::Dev));
        assert_eq!(BackendEnv::parse("staging"), None);
    }
}
