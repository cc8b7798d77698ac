//! Shared test fixtures: in-memory chain and store backends, a scripted
//! signer transport, and funding helpers. Promoted here so unit tests and
//! integration tests exercise the same plumbing.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::assembler::{create_output, sign_output, Recipient};
use crate::chain::{ChainBackend, Leafset, MempoolStore, NetUtxo};
use crate::coinswap::MixerClient;
use crate::error::{Error, Result};
use crate::mw::{Keychain, SecretKey};
use crate::onion::Onion;
use crate::rewind::{rewind_output, Coin};
use crate::signer::SignerTransport;
use crate::tx::{Output, OutputId};

/// Create an output paying `value` to the keychain's address at `index`,
/// and the rewound coin with its spend key populated.
pub fn fund_coin(kc: &Keychain, index: u32, value: u64) -> (Output, Coin) {
    let sender = SecretKey::random();
    let recipient = Recipient {
        value,
        address: kc.address(index).expect("address derivation"),
    };
    let (mut output, _, _) = create_output(&recipient, &sender).expect("create output");
    sign_output(&mut output, &sender).expect("sign output");
    let mut coin = rewind_output(&output, &kc.scan).expect("rewind own output");
    coin.calculate_spend_key(kc.spend_key(index).expect("spend key"));
    (output, coin)
}

// ── In-memory chain backend ─────────────────────────────────────────

#[derive(Default)]
struct BackendState {
    tip: (u32, u32),
    mweb_height: u32,
    leafset: Leafset,
    leaves_at_height: BTreeMap<u32, u64>,
    by_leaf: HashMap<u64, NetUtxo>,
    coins: HashMap<OutputId, Output>,
    spent: HashSet<OutputId>,
    next_leaf: u64,
    broadcasts: Vec<Vec<u8>>,
}

/// A chain backend living entirely in memory.
#[derive(Default)]
pub struct MemoryChainBackend {
    state: Mutex<BackendState>,
}

impl MemoryChainBackend {
    /// Build a utxo paying the keychain without touching the leafset, for
    /// feeding the live event path. The output still becomes fetchable by
    /// id.
    pub fn make_utxo(&self, kc: &Keychain, index: u32, value: u64, height: u32) -> NetUtxo {
        let (output, _) = fund_coin(kc, index, value);
        let output_id = output.id();
        let mut state = self.state.lock().expect("backend state");
        let leaf_index = state.next_leaf;
        state.next_leaf += 1;
        state.coins.insert(output_id, output.clone());
        NetUtxo {
            leaf_index,
            height,
            block_time: height.saturating_mul(600),
            output_id,
            output,
        }
    }

    /// Add a confirmed utxo: present in the leafset and fetchable by leaf.
    pub fn add_confirmed(&self, kc: &Keychain, index: u32, value: u64, height: u32) -> NetUtxo {
        let utxo = self.make_utxo(kc, index, value, height);
        let mut state = self.state.lock().expect("backend state");
        state.leafset.set(utxo.leaf_index);
        state.leafset.height = state.leafset.height.max(height);
        state.by_leaf.insert(utxo.leaf_index, utxo.clone());
        state.mweb_height = state.mweb_height.max(height);
        state.tip = (state.tip.0.max(height), height.saturating_mul(600));
        utxo
    }

    /// Like [`add_confirmed`](Self::add_confirmed), also recording the
    /// cumulative leaf count for the block height.
    pub fn add_confirmed_at_height(
        &self,
        kc: &Keychain,
        index: u32,
        value: u64,
        height: u32,
    ) -> NetUtxo {
        let utxo = self.add_confirmed(kc, index, value, height);
        let mut state = self.state.lock().expect("backend state");
        let count = utxo.leaf_index + 1;
        state.leaves_at_height.insert(height, count);
        utxo
    }

    /// Register a foreign output so `fetch_coin` can find it.
    pub fn insert_coin(&self, output: Output) -> OutputId {
        let id = output.id();
        self.state
            .lock()
            .expect("backend state")
            .coins
            .insert(id, output);
        id
    }

    /// Mark an output spent for `utxo_exists`.
    pub fn mark_spent(&self, output_id: &OutputId) {
        self.state
            .lock()
            .expect("backend state")
            .spent
            .insert(*output_id);
    }

    /// Raw transactions handed to `broadcast`.
    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().expect("backend state").broadcasts.clone()
    }
}

impl ChainBackend for MemoryChainBackend {
    fn chain_tip(&self) -> Result<(u32, u32)> {
        Ok(self.state.lock().expect("backend state").tip)
    }

    fn mweb_header_height(&self) -> Result<u32> {
        Ok(self.state.lock().expect("backend state").mweb_height)
    }

    fn leafset(&self) -> Result<Leafset> {
        Ok(self.state.lock().expect("backend state").leafset.clone())
    }

    fn leaves_at_height(&self) -> Result<BTreeMap<u32, u64>> {
        Ok(self
            .state
            .lock()
            .expect("backend state")
            .leaves_at_height
            .clone())
    }

    fn fetch_leaves(&self, leaves: &[u64]) -> Result<Vec<NetUtxo>> {
        let state = self.state.lock().expect("backend state");
        Ok(leaves
            .iter()
            .filter_map(|leaf| state.by_leaf.get(leaf).cloned())
            .collect())
    }

    fn fetch_coin(&self, output_id: &OutputId) -> Result<Output> {
        self.state
            .lock()
            .expect("backend state")
            .coins
            .get(output_id)
            .cloned()
            .ok_or(Error::CoinNotFound)
    }

    fn utxo_exists(&self, output_id: &OutputId) -> Result<bool> {
        let state = self.state.lock().expect("backend state");
        Ok(state.coins.contains_key(output_id) && !state.spent.contains(output_id))
    }

    fn broadcast(&self, raw_tx: &[u8]) -> Result<String> {
        let mut state = self.state.lock().expect("backend state");
        state.broadcasts.push(raw_tx.to_vec());
        Ok(hex::encode(blake3::hash(raw_tx).as_bytes()))
    }
}

// ── In-memory mempool bucket ────────────────────────────────────────

#[derive(Default)]
pub struct MemoryMempool {
    bucket: Mutex<HashMap<OutputId, Vec<u8>>>,
}

impl MempoolStore for MemoryMempool {
    fn put(&self, output_id: &OutputId, output: &[u8]) -> Result<()> {
        self.bucket
            .lock()
            .expect("mempool bucket")
            .insert(*output_id, output.to_vec());
        Ok(())
    }

    fn get(&self, output_id: &OutputId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .bucket
            .lock()
            .expect("mempool bucket")
            .get(output_id)
            .cloned())
    }

    fn delete(&self, output_id: &OutputId) -> Result<()> {
        self.bucket.lock().expect("mempool bucket").remove(output_id);
        Ok(())
    }
}

// ── Scripted signer transport ───────────────────────────────────────

/// Replays canned device responses and records every request, for driving
/// the signer state machine without hardware.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Vec<u8>>>,
    requests: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    pub fn push_response(&self, response: Vec<u8>) {
        self.responses
            .lock()
            .expect("scripted responses")
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().expect("scripted requests").clone()
    }
}

impl SignerTransport for ScriptedTransport {
    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.requests
            .lock()
            .expect("scripted requests")
            .push(request.to_vec());
        self.responses
            .lock()
            .expect("scripted responses")
            .pop_front()
            .ok_or(Error::DeviceRead)
    }
}

// ── Capturing mixer client ──────────────────────────────────────────

/// Records submitted onions instead of reaching a mixer.
#[derive(Default)]
pub struct CapturingMixer {
    submitted: Mutex<Vec<Onion>>,
}

impl CapturingMixer {
    pub fn submitted(&self) -> Vec<Onion> {
        self.submitted.lock().expect("captured onions").clone()
    }
}

impl MixerClient for CapturingMixer {
    fn submit(&self, onion: &Onion) -> Result<()> {
        self.submitted
            .lock()
            .expect("captured onions")
            .push(onion.clone());
        Ok(())
    }
}
