//! Stealth keychain: deterministic per-index receive addresses.
//!
//! An address at index `i` is the pair `(A_i, B_i)` with
//! `B_i = B + m_i·G`, `A_i = a·B_i`, where `a` is the scan secret, `B` the
//! root spend public key and `m_i` a tagged hash of the index and scan
//! secret. View-only keychains carry `B` without the spend secret and can
//! derive addresses but not spend keys.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mw::{hashed_scalar, HashTag, PublicKey, SecretKey};

/// A stealth address: the scan and spend public keys handed to senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealthAddress {
    pub scan: PublicKey,
    pub spend: PublicKey,
}

impl StealthAddress {
    /// Hex rendering of the concatenated scan and spend keys, the wallet
    /// boundary's address encoding.
    pub fn to_hex(&self) -> String {
        let mut bytes = Vec::with_capacity(66);
        bytes.extend_from_slice(&self.scan.0);
        bytes.extend_from_slice(&self.spend.0);
        hex::encode(bytes)
    }
}

/// Wallet key material for scanning and (optionally) spending.
#[derive(Clone)]
pub struct Keychain {
    pub scan: SecretKey,
    pub spend: Option<SecretKey>,
    pub spend_pub: PublicKey,
}

impl Keychain {
    /// A full keychain able to derive spend keys.
    pub fn new(scan: SecretKey, spend: SecretKey) -> Result<Keychain> {
        let spend_pub = spend.public_key()?;
        Ok(Keychain {
            scan,
            spend: Some(spend),
            spend_pub,
        })
    }

    /// A view-only keychain: address derivation and rewind, no spending.
    pub fn view_only(scan: SecretKey, spend_pub: PublicKey) -> Keychain {
        Keychain {
            scan,
            spend: None,
            spend_pub,
        }
    }

    fn index_tweak(&self, index: u32) -> SecretKey {
        let mut data = [0u8; 36];
        data[..4].copy_from_slice(&index.to_le_bytes());
        data[4..].copy_from_slice(&self.scan.0);
        hashed_scalar(HashTag::Address, &data)
    }

    /// The receive address at `index`.
    pub fn address(&self, index: u32) -> Result<StealthAddress> {
        let spend = self.spend_pub.add_scalar(&self.index_tweak(index))?;
        let scan = spend.mul(&self.scan)?;
        Ok(StealthAddress { scan, spend })
    }

    /// The spend secret for the address at `index`; requires the spend
    /// secret to be present.
    pub fn spend_key(&self, index: u32) -> Result<SecretKey> {
        let spend = self.spend.ok_or(Error::MissingSpendKey)?;
        Ok(spend.add(&self.index_tweak(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keychain() -> Keychain {
        Keychain::new(SecretKey::random(), SecretKey::random()).unwrap()
    }

    #[test]
    fn addresses_are_deterministic_and_distinct() {
        let kc = keychain();
        assert_eq!(kc.address(3).unwrap(), kc.address(3).unwrap());
        assert_ne!(kc.address(0).unwrap(), kc.address(1).unwrap());
    }

    #[test]
    fn spend_key_matches_address() {
        let kc = keychain();
        for index in [0, 1, 17] {
            let addr = kc.address(index).unwrap();
            let spend = kc.spend_key(index).unwrap();
            assert_eq!(spend.public_key().unwrap(), addr.spend);
        }
    }

    #[test]
    fn view_only_derives_same_addresses() {
        let kc = keychain();
        let view = Keychain::view_only(kc.scan, kc.spend_pub);
        assert_eq!(kc.address(5).unwrap(), view.address(5).unwrap());
        assert!(matches!(view.spend_key(5), Err(Error::MissingSpendKey)));
    }

    #[test]
    fn scan_key_links_address_halves() {
        let kc = keychain();
        let addr = kc.address(9).unwrap();
        assert_eq!(addr.spend.mul(&kc.scan).unwrap(), addr.scan);
    }
}
