//! Address derivation for watch-only wallets.
//!
//! Two modes:
//! - single xpub: standard BIP32 non-hardened child derivation of
//!   `change/index`, rendered as P2PKH
//! - N xpubs with an M-of-N quorum: per-xpub child keys, compressed pubkeys
//!   sorted lexicographically, an M-of-N `CHECKMULTISIG` witness script,
//!   rendered as P2SH-wrapped P2WSH
//!
//! Derivation is pure: the same `(change, index)` always yields the same
//! address. A literal address can be configured instead of xpubs, in which
//! case `derive` ignores its arguments and the accounter runs with a
//! lookahead of 1.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::CompressedPublicKey;
use thiserror::Error;

use crate::config::{verify_m_and_n, Network};
use crate::progress;

/// Derivation errors
#[derive(Debug, Error)]
pub enum DeriverError {
    #[error("invalid extended public key {0}: {1}")]
    BadXpub(String, String),

    #[error("no extended public keys provided")]
    NoKeys,

    #[error("invalid quorum: {0}")]
    Quorum(#[from] crate::config::ConfigError),

    #[error("address {0} is not valid on {1}")]
    BadAddress(String, Network),
}

/// A derived wallet address.
///
/// Carries the derivation path, the network-encoded textual form and the
/// hex-encoded output script, which is what the accounter matches
/// transaction outputs against. Two addresses are equal when their textual
/// forms are equal.
#[derive(Debug, Clone)]
pub struct Address {
    path: String,
    addr: String,
    script_hex: String,
    network: Network,
    change: u32,
    index: u32,
}

impl Address {
    /// Rebuild an address from recorded parts (fixture replay). The script
    /// is recomputed from the textual form.
    pub fn from_record(
        path: &str,
        addr: &str,
        network: Network,
        change: u32,
        index: u32,
    ) -> Result<Self, DeriverError> {
        let parsed = bitcoin::Address::from_str(addr)
            .map_err(|_| DeriverError::BadAddress(addr.to_string(), network))?
            .require_network(network.bitcoin_network())
            .map_err(|_| DeriverError::BadAddress(addr.to_string(), network))?;
        Ok(Address {
            path: path.to_string(),
            addr: addr.to_string(),
            script_hex: hex::encode(parsed.script_pubkey().as_bytes()),
            network,
            change,
            index,
        })
    }

    fn from_parsed(
        path: String,
        parsed: bitcoin::Address,
        network: Network,
        change: u32,
        index: u32,
    ) -> Self {
        Address {
            path,
            addr: parsed.to_string(),
            script_hex: hex::encode(parsed.script_pubkey().as_bytes()),
            network,
            change,
            index,
        }
    }

    /// BIP32-style derivation path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Hex encoding of the output script that pays this address
    pub fn script_hex(&self) -> &str {
        &self.script_hex
    }

    /// 0 for the receive stream, 1 for the change stream
    pub fn change(&self) -> u32 {
        self.change
    }

    /// Index within the stream
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for Address {}

/// Derives wallet addresses from one or more extended public keys.
pub struct AddressDeriver {
    secp: Secp256k1<VerifyOnly>,
    network: Network,
    xpubs: Vec<Xpub>,
    m: usize,
    single_address: Option<String>,
}

impl AddressDeriver {
    /// Build a deriver for an M-of-N wallet (N == 1 means plain BIP32).
    pub fn new(network: Network, xpubs: &[String], m: usize) -> Result<Self, DeriverError> {
        if xpubs.is_empty() {
            return Err(DeriverError::NoKeys);
        }
        verify_m_and_n(m, xpubs.len())?;
        let parsed = xpubs
            .iter()
            .map(|s| {
                Xpub::from_str(s).map_err(|e| DeriverError::BadXpub(s.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AddressDeriver {
            secp: Secp256k1::verification_only(),
            network,
            xpubs: parsed,
            m,
            single_address: None,
        })
    }

    /// Build a deriver that always returns one literal address.
    pub fn single_address(network: Network, addr: &str) -> Result<Self, DeriverError> {
        bitcoin::Address::from_str(addr)
            .map_err(|_| DeriverError::BadAddress(addr.to_string(), network))?
            .require_network(network.bitcoin_network())
            .map_err(|_| DeriverError::BadAddress(addr.to_string(), network))?;

        Ok(AddressDeriver {
            secp: Secp256k1::verification_only(),
            network,
            xpubs: Vec::new(),
            m: 0,
            single_address: Some(addr.to_string()),
        })
    }

    /// Derive the address at `(change, index)`. Pure and repeatable.
    pub fn derive(&self, change: u32, index: u32) -> Address {
        if let Some(addr) = &self.single_address {
            return Address::from_record("n/a", addr, self.network, 0, 0)
                .expect("single address was validated at construction");
        }

        let path = format!("m/.../{}/{}", change, index);
        let parsed = if self.xpubs.len() == 1 {
            self.single_derive(change, index)
        } else {
            self.multisig_segwit_derive(change, index)
        };
        Address::from_parsed(path, parsed, self.network, change, index)
    }

    /// Linear scan of the derivation space for a textual address. Only used
    /// by the `find-address` tool; reports progress every 1000 indexes.
    pub fn find_by_string(&self, target: &str) -> Option<(u32, u32)> {
        for index in 0..0x8000_0000u32 {
            for change in [0u32, 1] {
                let addr = self.derive(change, index);
                if addr.to_string() == target {
                    return Some((change, index));
                }
            }
            if index % 1000 == 0 {
                progress!("reached m/.../{{0,1}}/{}", index);
            }
        }
        None
    }

    fn child_pubkey(&self, xpub: &Xpub, change: u32, index: u32) -> CompressedPublicKey {
        let path = [
            ChildNumber::from_normal_idx(change).expect("change is 0 or 1"),
            ChildNumber::from_normal_idx(index).expect("index below 2^31"),
        ];
        let child = xpub
            .derive_pub(&self.secp, &path)
            .expect("non-hardened derivation from xpub");
        child.to_pub()
    }

    fn single_derive(&self, change: u32, index: u32) -> bitcoin::Address {
        let key = self.child_pubkey(&self.xpubs[0], change, index);
        bitcoin::Address::p2pkh(key.pubkey_hash(), self.network.bitcoin_network())
    }

    fn multisig_segwit_derive(&self, change: u32, index: u32) -> bitcoin::Address {
        let mut keys: Vec<[u8; 33]> = self
            .xpubs
            .iter()
            .map(|xpub| self.child_pubkey(xpub, change, index).to_bytes())
            .collect();
        keys.sort_unstable();

        let mut builder = Builder::new().push_int(self.m as i64);
        for key in &keys {
            builder = builder.push_slice(key);
        }
        let witness_script = builder
            .push_int(keys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();

        bitcoin::Address::p2shwsh(&witness_script, self.network.bitcoin_network())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET_XPUB: &str = "xpub6CjzRxucHWJbmtuNTg6EjPax3V75AhsBRnFKn8MEkc8UFFEhrCoWcQN6oUBhfZWoFKqTyQ21iNVK8KMbC44ifW25uyXaMPWkRtpwcbAWXJx";
    const TESTNET_TPUB: &str = "tpubDBrCAXucLxvjC9n9nZGGcYS8pk4X1N97YJmUgdDSwG2p36gbSqeRuytHYCHe2dHxLsV2EchX9ePaFdRwp7cNLrSpnr3PsoPLUQqbvLBDWvh";

    #[test]
    fn test_single_xpub_mainnet() {
        let deriver =
            AddressDeriver::new(Network::Mainnet, &[MAINNET_XPUB.to_string()], 1).unwrap();
        let addr = deriver.derive(0, 5);
        assert_eq!(addr.path(), "m/.../0/5");
        assert_eq!(addr.to_string(), "1N4VBTZqwLkHEKX79kjJ1WaYvX4c3txioz");
        assert_eq!(addr.change(), 0);
        assert_eq!(addr.index(), 5);
        assert_eq!(addr.network(), Network::Mainnet);
        assert_eq!(
            addr.script_hex(),
            "76a914e70369bfda4ba9bdcbb96cfd269a768573d0624c88ac"
        );
    }

    #[test]
    fn test_single_tpub_testnet() {
        let deriver =
            AddressDeriver::new(Network::Testnet, &[TESTNET_TPUB.to_string()], 1).unwrap();
        assert_eq!(
            deriver.derive(0, 0).to_string(),
            "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn"
        );
        assert_eq!(
            deriver.derive(1, 0).to_string(),
            "moHN13u4RoMxujdaPxvuaTaawgWZ3LaGyo"
        );
    }

    #[test]
    fn test_multisig_segwit() {
        let xpubs = [
            "tpubDAiPiLZeUdwo9oJiE9GZnteXj2E2MEMUb4knc4yCD87bL9siDgYcvrZSHZQZcYTyraL3fxVBRCcMiyfr3oQfH1wNo8J5i8aRAN56dDXaZxC",
            "tpubDBYBpkSfvt9iVSfdX2ArZq1Q8bVSro3sotbJhdZCG9rgfjdr4aZp7g7AF1P9w95X5fzuJzdZAqYWWU7nb37c594wR22hPY5VpYziXUN2yez",
            "tpubDAaTEMnf9SPKJweLaptFdy3Vmyhim5DKQxXRbsCxmAaUp8F84YD5GhdfmABwLddjHTftSVvUPuSru6vJ3b5N2hBveiGmZNE5N5yvB6WZ96c",
            "tpubDAXKYCetkje8HRRhAvUbAyuC5iF3SgfFWCVXfmrGCw3H9ExCYZVTEoeg7TjtDhgkS7TNHDRZUQNzGACWVzZCAYXy79vqku5z1geYmnsNLaa",
        ]
        .map(String::from);
        let deriver = AddressDeriver::new(Network::Testnet, &xpubs, 2).unwrap();
        assert_eq!(
            deriver.derive(0, 0).to_string(),
            "2N4TmnHspa8wqFEUfxfjzHoSUAgwoUwNWhr"
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let deriver =
            AddressDeriver::new(Network::Testnet, &[TESTNET_TPUB.to_string()], 1).unwrap();
        for (change, index) in [(0, 0), (0, 17), (1, 3)] {
            let a = deriver.derive(change, index);
            let b = deriver.derive(change, index);
            assert_eq!(a, b);
            assert_eq!(a.script_hex(), b.script_hex());
        }
    }

    #[test]
    fn test_single_address_mode() {
        let deriver =
            AddressDeriver::single_address(Network::Testnet, "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn")
                .unwrap();
        let a = deriver.derive(0, 0);
        let b = deriver.derive(1, 42);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn");
        assert_eq!(a.path(), "n/a");
    }

    #[test]
    fn test_rejects_bad_quorum() {
        let xpubs = [TESTNET_TPUB.to_string()];
        assert!(AddressDeriver::new(Network::Testnet, &xpubs, 2).is_err());
        assert!(AddressDeriver::new(Network::Testnet, &[], 1).is_err());
    }

    #[test]
    fn test_rejects_wrong_network_address() {
        assert!(
            AddressDeriver::single_address(Network::Mainnet, "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn")
                .is_err()
        );
    }
}
