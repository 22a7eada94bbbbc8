//! Trader model: an upstream leaderboard account whose positions are mirrored.

use serde::{Deserialize, Serialize};

/// Identity of a watched trader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraderProfile {
    /// Unique name within one coordinator
    pub name: String,

    /// Leaderboard account id (Binance `encryptedUid`)
    #[serde(alias = "uid")]
    pub account_id: String,
}

impl TraderProfile {
    pub fn new(name: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            account_id: account_id.into(),
        }
    }

    /// Get display name with truncated account id.
    pub fn display_name(&self) -> String {
        let chars: Vec<char> = self.account_id.chars().collect();
        if chars.len() > 12 {
            let head: String = chars[..6].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{} ({}...{})", self.name, head, tail)
        } else {
            format!("{} ({})", self.name, self.account_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_truncates_long_uid() {
        let t = TraderProfile::new("alpha", "E921F42DCD4D9F6ECC0DFCE3BAB1D11A");
        assert_eq!(t.display_name(), "alpha (E921F4...D11A)");

        let t = TraderProfile::new("beta", "short");
        assert_eq!(t.display_name(), "beta (short)");
    }

    #[test]
    fn test_display_name_handles_multibyte_uid() {
        let t = TraderProfile::new("gamma", "äöüßéèêëàâîïôû");
        assert_eq!(t.display_name(), "gamma (äöüßéè...îïôû)");
    }
}
