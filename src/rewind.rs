//! Output rewind: recovering the wallet view of a confidential output.
//!
//! Rewind runs the receive pipeline in reverse — ECDH with the key-exchange
//! pubkey, view-tag shortcut, value/nonce unmasking, blind reconstruction —
//! and verifies the result against the on-chain commitment. Any mismatch is
//! [`Error::NotMine`]: the caller skips the output and moves on.
//!
//! Rewinds are cached in a two-level LRU keyed by scan secret then output
//! id. Scan secrets are keyed by value so the cache never borrows from
//! whichever caller owns the secret.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::error::{Error, Result};
use crate::mw::{
    ecdh, hashed, hashed_scalar, switch_commit, BlindingFactor, HashTag, SecretKey,
    StealthAddress,
};
use crate::tx::{Output, OutputId};

/// Scan secrets tracked at once.
const SCAN_CACHE_SIZE: usize = 10;
/// Rewound coins kept per scan secret.
const COIN_CACHE_SIZE: usize = 100;

/// The wallet-side view of an output, recovered by rewind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    /// Pre-switch blinding factor.
    pub blind: BlindingFactor,
    pub value: u64,
    pub output_id: OutputId,
    pub address: StealthAddress,
    /// The per-output derive scalar shared with the sender.
    pub shared_secret: SecretKey,
    /// One-time spend secret; populated on demand from the keychain.
    pub spend_key: Option<SecretKey>,
}

impl Coin {
    /// Derive the one-time spend secret from the keychain spend key for the
    /// address index this coin was received on.
    pub fn calculate_spend_key(&mut self, address_spend_key: SecretKey) {
        let tweak = hashed_scalar(HashTag::OutKey, &self.shared_secret.0);
        self.spend_key = Some(address_spend_key.add(&tweak));
    }
}

/// Rewind a raw output with a scan secret.
pub fn rewind_output(output: &Output, scan: &SecretKey) -> Result<Coin> {
    let shared = ecdh(scan, &output.message.key_exchange_pubkey).map_err(|_| Error::NotMine)?;

    if hashed(HashTag::ViewTag, &shared)[0] != output.message.view_tag {
        return Err(Error::NotMine);
    }

    let t = hashed_scalar(HashTag::Derive, &shared);

    let value_mask = hashed(HashTag::ValueMask, &t.0);
    let mut mask = [0u8; 8];
    mask.copy_from_slice(&value_mask[..8]);
    let value = output.message.masked_value ^ u64::from_le_bytes(mask);

    let blind = BlindingFactor(hashed(HashTag::Blind, &t.0));
    let commitment = switch_commit(&blind, value).map_err(|_| Error::NotMine)?;
    if commitment != output.commitment {
        return Err(Error::NotMine);
    }

    let tweak = hashed_scalar(HashTag::OutKey, &t.0);
    let spend = output
        .receiver_pubkey
        .sub_scalar(&tweak)
        .map_err(|_| Error::NotMine)?;
    let scan_pub = spend.mul(scan).map_err(|_| Error::NotMine)?;

    Ok(Coin {
        blind,
        value,
        output_id: output.id(),
        address: StealthAddress {
            scan: scan_pub,
            spend,
        },
        shared_secret: t,
        spend_key: None,
    })
}

/// Two-level rewind cache: scan secret → output id → coin.
pub struct CoinCache {
    inner: Mutex<LruCache<[u8; 32], LruCache<OutputId, Coin>>>,
}

impl Default for CoinCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CoinCache {
    pub fn new() -> CoinCache {
        CoinCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(SCAN_CACHE_SIZE).expect("nonzero"),
            )),
        }
    }

    /// Rewind through the cache. Returns a cloned coin so the caller may
    /// attach a spend key without mutating the cached entry.
    pub fn rewind(&self, output: &Output, scan: &SecretKey) -> Result<Coin> {
        let id = output.id();
        let mut cache = self.inner.lock().expect("coin cache poisoned");
        let per_scan = match cache.get_mut(&scan.0) {
            Some(per_scan) => per_scan,
            None => {
                cache.put(
                    scan.0,
                    LruCache::new(NonZeroUsize::new(COIN_CACHE_SIZE).expect("nonzero")),
                );
                cache.get_mut(&scan.0).expect("just inserted")
            }
        };
        if let Some(coin) = per_scan.get(&id) {
            return Ok(coin.clone());
        }
        let coin = rewind_output(output, scan)?;
        per_scan.put(id, coin.clone());
        Ok(coin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{create_output, sign_output, Recipient};
    use crate::mw::Keychain;

    fn received_output(kc: &Keychain, index: u32, value: u64) -> Output {
        let sender = SecretKey::random();
        let recipient = Recipient {
            value,
            address: kc.address(index).unwrap(),
        };
        let (mut output, _, _) = create_output(&recipient, &sender).unwrap();
        sign_output(&mut output, &sender).unwrap();
        output
    }

    #[test]
    fn rewind_recovers_value_and_address() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = received_output(&kc, 2, 12_345);
        let coin = rewind_output(&output, &kc.scan).unwrap();
        assert_eq!(coin.value, 12_345);
        assert_eq!(coin.address, kc.address(2).unwrap());
        assert_eq!(coin.output_id, output.id());
        assert_eq!(switch_commit(&coin.blind, coin.value).unwrap(), output.commitment);
    }

    #[test]
    fn rewind_is_idempotent() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = received_output(&kc, 0, 777);
        let first = rewind_output(&output, &kc.scan).unwrap();
        let second = rewind_output(&output, &kc.scan).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn foreign_output_is_not_mine() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let other = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = received_output(&other, 0, 500);
        assert!(matches!(rewind_output(&output, &kc.scan), Err(Error::NotMine)));
    }

    #[test]
    fn spend_key_matches_output_pubkey() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = received_output(&kc, 4, 100);
        let mut coin = rewind_output(&output, &kc.scan).unwrap();
        coin.calculate_spend_key(kc.spend_key(4).unwrap());
        let spend = coin.spend_key.unwrap();
        assert_eq!(spend.public_key().unwrap(), output.receiver_pubkey);
    }

    #[test]
    fn cache_hit_equals_cache_miss() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = received_output(&kc, 1, 42);
        let cache = CoinCache::new();
        let miss = cache.rewind(&output, &kc.scan).unwrap();
        let hit = cache.rewind(&output, &kc.scan).unwrap();
        assert_eq!(miss, hit);
        assert_eq!(miss, rewind_output(&output, &kc.scan).unwrap());
    }

    #[test]
    fn cached_coin_is_not_polluted_by_caller_mutation() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = received_output(&kc, 3, 42);
        let cache = CoinCache::new();
        let mut coin = cache.rewind(&output, &kc.scan).unwrap();
        coin.calculate_spend_key(kc.spend_key(3).unwrap());
        assert!(cache.rewind(&output, &kc.scan).unwrap().spend_key.is_none());
    }
}
