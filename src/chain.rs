//! External chain boundaries.
//!
//! The block-filter sync engine and the wallet database live outside this
//! crate; the core talks to them through the [`ChainBackend`] and
//! [`MempoolStore`] traits. The sync engine pushes [`ChainEvent`]s over a
//! channel from its own thread, which keeps the blocking chain client out
//! of the async runtime.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::tx::{Output, OutputId};

/// Bucket name for the height-zero output store.
pub const MEMPOOL_BUCKET: &str = "mweb-mempool";

// ── Leafset ─────────────────────────────────────────────────────────

/// A bitmap of live leaf positions in the output MMR, MSB-first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leafset {
    pub height: u32,
    pub size: u64,
    pub bits: Vec<u8>,
}

impl Leafset {
    pub fn contains(&self, leaf: u64) -> bool {
        let byte = (leaf / 8) as usize;
        byte < self.bits.len() && self.bits[byte] & (0x80 >> (leaf % 8)) != 0
    }

    pub fn set(&mut self, leaf: u64) {
        let byte = (leaf / 8) as usize;
        if byte >= self.bits.len() {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 0x80 >> (leaf % 8);
        if leaf >= self.size {
            self.size = leaf + 1;
        }
    }
}

// ── Raw and wallet-facing utxos ─────────────────────────────────────

/// A raw confidential output as delivered by the sync engine. A height of
/// zero means the output is unconfirmed.
#[derive(Debug, Clone)]
pub struct NetUtxo {
    pub leaf_index: u64,
    pub height: u32,
    pub block_time: u32,
    pub output_id: OutputId,
    pub output: Output,
}

/// The wallet-facing view of a rewound output. The all-default value is
/// the end-of-catchup sentinel on subscription streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub height: u32,
    pub value: u64,
    pub address: String,
    pub output_id: String,
    pub block_time: u32,
}

impl Utxo {
    /// Whether this is the end-of-catchup sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.output_id.is_empty()
    }
}

// ── Backend traits ──────────────────────────────────────────────────

/// The block-filter sync engine, viewed from the core. Implementations may
/// block on network or disk; callers dispatch through `spawn_blocking`.
pub trait ChainBackend: Send + Sync + 'static {
    /// Best block header height and its timestamp.
    fn chain_tip(&self) -> Result<(u32, u32)>;

    /// Height of the best known extension-block header.
    fn mweb_header_height(&self) -> Result<u32>;

    /// Current leafset snapshot.
    fn leafset(&self) -> Result<Leafset>;

    /// For each height, the number of leaves below it: the first leaf of
    /// height `h` is the mapped value of the greatest key `< h`.
    fn leaves_at_height(&self) -> Result<BTreeMap<u32, u64>>;

    /// Fetch the outputs at the given leaf positions.
    fn fetch_leaves(&self, leaves: &[u64]) -> Result<Vec<NetUtxo>>;

    /// Fetch a confirmed output by id. [`crate::Error::CoinNotFound`] when
    /// absent.
    fn fetch_coin(&self, output_id: &OutputId) -> Result<Output>;

    /// Whether the output is still unspent.
    fn utxo_exists(&self, output_id: &OutputId) -> Result<bool>;

    /// Hand a serialized transaction to the network; returns the txid.
    fn broadcast(&self, raw_tx: &[u8]) -> Result<String>;
}

/// Single-bucket key/value store persisting unconfirmed outputs.
pub trait MempoolStore: Send + Sync + 'static {
    fn put(&self, output_id: &OutputId, output: &[u8]) -> Result<()>;
    fn get(&self, output_id: &OutputId) -> Result<Option<Vec<u8>>>;
    fn delete(&self, output_id: &OutputId) -> Result<()>;
}

// ── Events ──────────────────────────────────────────────────────────

/// Pushed by the sync engine whenever new or newly confirmed outputs
/// arrive. `leafset` is the post-batch snapshot when one is available.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    NewUtxos {
        leafset: Option<Leafset>,
        utxos: Vec<NetUtxo>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leafset_bit_addressing_is_msb_first() {
        let mut lfs = Leafset::default();
        lfs.set(0);
        lfs.set(9);
        assert_eq!(lfs.bits[0], 0x80);
        assert_eq!(lfs.bits[1], 0x40);
        assert!(lfs.contains(0));
        assert!(!lfs.contains(1));
        assert!(lfs.contains(9));
        assert_eq!(lfs.size, 10);
    }

    #[test]
    fn contains_beyond_bitmap_is_false() {
        let lfs = Leafset::default();
        assert!(!lfs.contains(1_000_000));
    }

    #[test]
    fn sentinel_detection() {
        assert!(Utxo::default().is_sentinel());
        let utxo = Utxo {
            output_id: "ab".into(),
            ..Default::default()
        };
        assert!(!utxo.is_sentinel());
    }
}
