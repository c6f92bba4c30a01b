use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Wallet connector the presentation layer pairs with, chosen at
/// configuration time. The sync core never touches this; bid submission goes
/// through a separate transaction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletConnector {
    Argent,
    Braavos,
}

impl WalletConnector {
    pub const ALL: [WalletConnector; 2] = [WalletConnector::Argent, WalletConnector::Braavos];

    pub fn id(&self) -> &'static str {
        match self {
            Self::Argent => "argent",
            Self::Braavos => "braavos",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Argent => "Argent",
            Self::Braavos => "Braavos",
        }
    }
}

impl fmt::Display for WalletConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for WalletConnector {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "argent" => Ok(Self::Argent),
            "braavos" => Ok(Self::Braavos),
            other => Err(format!(
                "unknown wallet connector `{other}` (expected argent or braavos)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_connectors_case_insensitively() {
        assert_eq!("argent".parse(), Ok(WalletConnector::Argent));
        assert_eq!("Braavos".parse(), Ok(WalletConnector::Braavos));
        assert!("ledger".parse::<WalletConnector>().is_err());
    }

    #[test]
    fn display_matches_id() {
        for connector in WalletConnector::ALL {
            assert_eq!(connector.to_string(), connector.id());
        }
        assert_eq!(WalletConnector::Argent.display_name(), "Argent");
    }
}
