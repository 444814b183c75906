//! Network configuration and user-input validation.
//!
//! Everything here is static per-network knowledge: genesis hashes used to
//! validate remote peers, default Electrum servers, default port numbers,
//! and the bounds we accept for multisig quorums.

use std::str::FromStr;

use bitcoin::bip32::Xpub;
use bitcoin::NetworkKind;
use thiserror::Error;

/// Number of confirmations a block needs before we trust it not to be
/// orphaned. Balances are never computed above `tip - MIN_CONFIRMATIONS + 1`.
pub const MIN_CONFIRMATIONS: u32 = 6;

/// Largest multisig quorum we are willing to derive addresses for.
pub const MAX_MULTISIG_KEYS: usize = 20;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),

    #[error("invalid quorum: {0}-of-{1} (need 0 < m <= n <= {MAX_MULTISIG_KEYS})")]
    InvalidQuorum(usize, usize),

    #[error("invalid extended public key {0}: {1}")]
    BadXpub(String, String),

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Bitcoin network a wallet lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            _ => Err(ConfigError::UnknownNetwork(s.to_string())),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

impl Network {
    /// Hash of block 0, used as an identity check on remote peers.
    pub fn genesis_hash(&self) -> &'static str {
        match self {
            Network::Mainnet => {
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
            }
            Network::Testnet => {
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
            }
        }
    }

    /// Default Electrum server used when the user does not pass `--addr`.
    pub fn default_electrum_server(&self) -> (&'static str, &'static str) {
        match self {
            Network::Mainnet => ("electrum.petrkr.net", "s50002"),
            Network::Testnet => ("electrum_testnet_unlimited.criptolayer.net", "s50102"),
        }
    }

    /// Default Electrum ports, (tcp, ssl).
    pub fn default_ports(&self) -> (&'static str, &'static str) {
        match self {
            Network::Mainnet => ("50001", "50002"),
            Network::Testnet => ("50101", "50102"),
        }
    }

    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }
}

/// Check a multisig quorum: 0 < m <= n <= 20.
pub fn verify_m_and_n(m: usize, n: usize) -> Result<(), ConfigError> {
    if m == 0 || m > n || n > MAX_MULTISIG_KEYS {
        return Err(ConfigError::InvalidQuorum(m, n));
    }
    Ok(())
}

/// Determine the network an extended public key belongs to from its
/// serialization magic.
pub fn xpub_network(xpub: &str) -> Result<Network, ConfigError> {
    let key = Xpub::from_str(xpub)
        .map_err(|e| ConfigError::BadXpub(xpub.to_string(), e.to_string()))?;
    match key.network {
        NetworkKind::Main => Ok(Network::Mainnet),
        NetworkKind::Test => Ok(Network::Testnet),
    }
}

/// Determine the network a textual address belongs to.
pub fn address_network(addr: &str) -> Result<Network, ConfigError> {
    let parsed = bitcoin::Address::from_str(addr)
        .map_err(|_| ConfigError::BadAddress(addr.to_string()))?;
    if parsed.is_valid_for_network(bitcoin::Network::Bitcoin) {
        Ok(Network::Mainnet)
    } else if parsed.is_valid_for_network(bitcoin::Network::Testnet) {
        Ok(Network::Testnet)
    } else {
        Err(ConfigError::BadAddress(addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("testnet".parse::<Network>(), Ok(Network::Testnet)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_quorum_bounds() {
        assert!(verify_m_and_n(1, 1).is_ok());
        assert!(verify_m_and_n(2, 4).is_ok());
        assert!(verify_m_and_n(20, 20).is_ok());
        assert!(verify_m_and_n(0, 1).is_err());
        assert!(verify_m_and_n(3, 2).is_err());
        assert!(verify_m_and_n(5, 21).is_err());
    }

    #[test]
    fn test_xpub_network_sniffing() {
        let xpub = "xpub6CjzRxucHWJbmtuNTg6EjPax3V75AhsBRnFKn8MEkc8UFFEhrCoWcQN6oUBhfZWoFKqTyQ21iNVK8KMbC44ifW25uyXaMPWkRtpwcbAWXJx";
        let tpub = "tpubDBrCAXucLxvjC9n9nZGGcYS8pk4X1N97YJmUgdDSwG2p36gbSqeRuytHYCHe2dHxLsV2EchX9ePaFdRwp7cNLrSpnr3PsoPLUQqbvLBDWvh";
        assert_eq!(xpub_network(xpub).unwrap(), Network::Mainnet);
        assert_eq!(xpub_network(tpub).unwrap(), Network::Testnet);
        assert!(xpub_network("not-a-key").is_err());
    }

    #[test]
    fn test_address_network_sniffing() {
        assert_eq!(
            address_network("mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn").unwrap(),
            Network::Testnet
        );
        assert_eq!(
            address_network("1N4VBTZqwLkHEKX79kjJ1WaYvX4c3txioz").unwrap(),
            Network::Mainnet
        );
        assert!(address_network("garbage").is_err());
    }
}
