//! `MwebNode` — the daemon-side coordinator.
//!
//! Owns the rewind cache, the subscription mux and the mempool bucket
//! behind a single `&self` API. Blocking chain calls are dispatched via
//! `tokio::task::spawn_blocking` so RPC handlers stay in async land; the
//! sync engine's event channel is pumped into the mux by a background
//! task.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::assembler::{estimate_fee, new_transaction, KernelSigner, Recipient};
use crate::chain::{ChainBackend, ChainEvent, MempoolStore, NetUtxo};
use crate::coinswap::{build_swap_request, MixerClient, MixerNode};
use crate::error::{Error, Result};
use crate::mux::{UtxoMux, UtxoStream};
use crate::mw::{Keychain, PublicKey, SecretKey};
use crate::rewind::{Coin, CoinCache};
use crate::tx::{Output, OutputId, Tx, TxOut};

/// Sync progress of the daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub block_header_height: u32,
    pub mweb_header_height: u32,
    pub mweb_utxos_height: u32,
    pub block_time: u32,
}

/// A coin to spend, addressed by output id and keychain index.
#[derive(Debug, Clone, Copy)]
pub struct CoinRef {
    pub output_id: OutputId,
    pub address_index: u32,
}

/// Everything `create` needs besides the keychain and signer.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub coins: Vec<CoinRef>,
    pub recipients: Vec<Recipient>,
    pub pegouts: Vec<TxOut>,
    pub fee_rate_per_kb: u64,
    pub lock_height: u32,
}

/// Result of `create`: the transaction, the peg-in it requires, and the
/// wallet views of the change/recipient outputs.
pub struct CreateResult {
    pub tx: Tx,
    pub fee: u64,
    pub pegin: u64,
    pub new_coins: Vec<Coin>,
}

pub struct MwebNode<B: ChainBackend, S: MempoolStore> {
    backend: Arc<B>,
    mempool: Arc<S>,
    cache: Arc<CoinCache>,
    mux: Arc<UtxoMux<B, S>>,
}

impl<B: ChainBackend, S: MempoolStore> MwebNode<B, S> {
    pub fn new(backend: Arc<B>, mempool: Arc<S>) -> Arc<MwebNode<B, S>> {
        let cache = Arc::new(CoinCache::new());
        let mux = Arc::new(UtxoMux::new(
            backend.clone(),
            mempool.clone(),
            cache.clone(),
        ));
        Arc::new(MwebNode {
            backend,
            mempool,
            cache,
            mux,
        })
    }

    /// Pump sync-engine events into the mux until the channel closes.
    pub fn start_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChainEvent>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChainEvent::NewUtxos { leafset, utxos } => {
                        node.mux.on_new_utxos(leafset, utxos).await;
                    }
                }
            }
            log::info!("chain event channel closed");
        })
    }

    async fn with_backend<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&B) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || f(&backend))
            .await
            .map_err(|e| Error::Backend(e.to_string()))?
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<Status> {
        self.with_backend(|backend| {
            let (block_header_height, block_time) = backend.chain_tip()?;
            Ok(Status {
                block_header_height,
                mweb_header_height: backend.mweb_header_height()?,
                mweb_utxos_height: backend.leafset()?.height,
                block_time,
            })
        })
        .await
    }

    /// Derive addresses `from..to` for a view-only keychain.
    pub fn addresses(
        &self,
        scan: SecretKey,
        spend_pub: PublicKey,
        from: u32,
        to: u32,
    ) -> Result<Vec<String>> {
        let keychain = Keychain::view_only(scan, spend_pub);
        (from..to)
            .map(|index| Ok(keychain.address(index)?.to_hex()))
            .collect()
    }

    /// Of the given ids, the ones no longer in the UTXO set.
    pub async fn spent(&self, output_ids: Vec<OutputId>) -> Result<Vec<OutputId>> {
        self.with_backend(move |backend| {
            let mut spent = Vec::new();
            for id in output_ids {
                if !backend.utxo_exists(&id)? {
                    spent.push(id);
                }
            }
            Ok(spent)
        })
        .await
    }

    // ── Coin lookup ─────────────────────────────────────────────────

    /// Fetch a raw output by id, retrying with the reversed byte order and
    /// then the mempool bucket. Wire identifiers arrive in either
    /// endianness, so both views are tried and neither is canonicalized.
    pub async fn fetch_coin(&self, output_id: OutputId) -> Result<Output> {
        let direct = self
            .with_backend(move |backend| backend.fetch_coin(&output_id))
            .await;
        match direct {
            Err(Error::CoinNotFound) => {}
            other => return other,
        }
        let reversed = output_id.reversed();
        match self
            .with_backend(move |backend| backend.fetch_coin(&reversed))
            .await
        {
            Err(Error::CoinNotFound) => {}
            other => return other,
        }

        let bytes = match self.mempool.get(&output_id)? {
            Some(bytes) => bytes,
            None => self
                .mempool
                .get(&output_id.reversed())?
                .ok_or(Error::CoinNotFound)?,
        };
        Output::from_bytes(&bytes)
    }

    /// Rewind through the shared cache.
    pub fn rewind_output(&self, output: &Output, scan: &SecretKey) -> Result<Coin> {
        self.cache.rewind(output, scan)
    }

    // ── Transaction construction ────────────────────────────────────

    /// Build a transaction spending the referenced coins. Fee is estimated
    /// from the request; a shortfall becomes a peg-in, an excess is
    /// absorbed into the fee.
    pub async fn create(
        &self,
        keychain: &Keychain,
        request: CreateRequest,
        signer: &dyn KernelSigner,
    ) -> Result<CreateResult> {
        let mut coins = Vec::with_capacity(request.coins.len());
        let mut sum_coins = 0u64;
        for coin_ref in &request.coins {
            let output = self.fetch_coin(coin_ref.output_id).await?;
            let mut coin = self.rewind_output(&output, &keychain.scan)?;
            coin.calculate_spend_key(keychain.spend_key(coin_ref.address_index)?);
            sum_coins += coin.value;
            coins.push(coin);
        }

        let sum_outputs: u64 = request.recipients.iter().map(|r| r.value).sum::<u64>()
            + request.pegouts.iter().map(|p| p.value).sum::<u64>();

        let mut fee = estimate_fee(
            request.recipients.len(),
            &request.pegouts,
            request.fee_rate_per_kb,
        );
        let mut pegin = 0;
        if sum_outputs + fee > sum_coins {
            pegin = sum_outputs + fee - sum_coins;
        } else {
            fee = sum_coins - sum_outputs;
        }

        let (tx, new_coins) = new_transaction(
            &coins,
            &request.recipients,
            fee,
            pegin,
            request.pegouts,
            request.lock_height,
            signer,
        )?;
        log::debug!(
            "created transaction: {} in, {} out, fee {fee}, pegin {pegin}",
            tx.body.inputs.len(),
            tx.body.outputs.len(),
        );
        Ok(CreateResult {
            tx,
            fee,
            pegin,
            new_coins,
        })
    }

    /// Route a coin through the mixers and submit the onion to the first
    /// hop.
    pub async fn coinswap(
        &self,
        keychain: &Keychain,
        output_id: OutputId,
        address_index: u32,
        mixers: &[MixerNode],
        client: &dyn MixerClient,
    ) -> Result<()> {
        let output = self.fetch_coin(output_id).await?;
        let mut coin = self.rewind_output(&output, &keychain.scan)?;
        coin.calculate_spend_key(keychain.spend_key(address_index)?);
        let onion = build_swap_request(&coin, mixers)?;
        client.submit(&onion)
    }

    // ── Broadcast ───────────────────────────────────────────────────

    /// Serialize and broadcast, then self-notify the new outputs as
    /// unconfirmed so subscribers see them before the network echoes them
    /// back.
    pub async fn broadcast(self: &Arc<Self>, tx: &Tx) -> Result<String> {
        let raw = tx.to_bytes();
        let txid = self
            .with_backend(move |backend| backend.broadcast(&raw))
            .await?;

        let utxos: Vec<NetUtxo> = tx
            .body
            .outputs
            .iter()
            .map(|output| NetUtxo {
                leaf_index: 0,
                height: 0,
                block_time: 0,
                output_id: output.id(),
                output: output.clone(),
            })
            .collect();
        if !utxos.is_empty() {
            let node = self.clone();
            tokio::spawn(async move {
                node.mux.on_new_utxos(None, utxos).await;
            });
        }
        log::info!("broadcast transaction {txid}");
        Ok(txid)
    }

    // ── Streaming ───────────────────────────────────────────────────

    /// Open a utxo subscription for `scan` starting at `from_height`.
    pub fn utxos(self: &Arc<Self>, scan: SecretKey, from_height: u32) -> UtxoStream {
        self.mux.subscribe(scan, from_height)
    }

    /// Direct mux access for sync engines that call back without a
    /// channel.
    pub async fn on_new_utxos(&self, leafset: Option<crate::chain::Leafset>, utxos: Vec<NetUtxo>) {
        self.mux.on_new_utxos(leafset, utxos).await;
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn mempool(&self) -> &Arc<S> {
        &self.mempool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::LocalSigner;
    use crate::testing::{fund_coin, CapturingMixer, MemoryChainBackend, MemoryMempool};
    use std::time::Duration;

    fn node() -> (
        Arc<MwebNode<MemoryChainBackend, MemoryMempool>>,
        Arc<MemoryChainBackend>,
    ) {
        let backend = Arc::new(MemoryChainBackend::default());
        let mempool = Arc::new(MemoryMempool::default());
        (MwebNode::new(backend.clone(), mempool), backend)
    }

    fn keychain() -> Keychain {
        Keychain::new(SecretKey::random(), SecretKey::random()).unwrap()
    }

    #[tokio::test]
    async fn fetch_coin_retries_reversed_id() {
        let (node, backend) = node();
        let kc = keychain();
        let (output, _) = fund_coin(&kc, 0, 1_000);
        let id = backend.insert_coin(output.clone());

        assert_eq!(node.fetch_coin(id).await.unwrap(), output);
        assert_eq!(node.fetch_coin(id.reversed()).await.unwrap(), output);
    }

    #[tokio::test]
    async fn fetch_coin_falls_back_to_mempool() {
        let (node, _backend) = node();
        let kc = keychain();
        let (output, _) = fund_coin(&kc, 0, 700);
        let id = output.id();
        node.mempool().put(&id, &output.to_bytes()).unwrap();

        assert_eq!(node.fetch_coin(id).await.unwrap(), output);
        assert_eq!(node.fetch_coin(id.reversed()).await.unwrap(), output);

        let missing = OutputId([9; 32]);
        assert!(matches!(
            node.fetch_coin(missing).await,
            Err(Error::CoinNotFound)
        ));
    }

    #[tokio::test]
    async fn spent_reports_missing_outputs() {
        let (node, backend) = node();
        let kc = keychain();
        let live = backend.insert_coin(fund_coin(&kc, 0, 10).0);
        let gone = backend.insert_coin(fund_coin(&kc, 1, 20).0);
        backend.mark_spent(&gone);

        let spent = node.spent(vec![live, gone]).await.unwrap();
        assert_eq!(spent, vec![gone]);
    }

    #[tokio::test]
    async fn status_reflects_backend() {
        let (node, backend) = node();
        let kc = keychain();
        backend.add_confirmed(&kc, 0, 100, 42);
        let status = node.status().await.unwrap();
        assert_eq!(status.block_header_height, 42);
        assert_eq!(status.mweb_header_height, 42);
        assert_eq!(status.mweb_utxos_height, 42);
    }

    #[tokio::test]
    async fn create_pays_recipient_and_absorbs_excess_fee() {
        let (node, backend) = node();
        let kc = keychain();
        let (output, _) = fund_coin(&kc, 0, 100_000);
        let id = backend.insert_coin(output);

        let result = node
            .create(
                &kc,
                CreateRequest {
                    coins: vec![CoinRef {
                        output_id: id,
                        address_index: 0,
                    }],
                    recipients: vec![Recipient {
                        value: 60_000,
                        address: kc.address(1).unwrap(),
                    }],
                    pegouts: vec![],
                    fee_rate_per_kb: 0,
                    lock_height: 0,
                },
                &LocalSigner,
            )
            .await
            .unwrap();

        // Excess over the recipient goes to fee, nothing pegs in.
        assert_eq!(result.pegin, 0);
        assert_eq!(result.fee, 40_000);
        assert_eq!(result.new_coins.len(), 1);
        assert_eq!(result.tx.body.kernels[0].fee, 40_000);
    }

    #[tokio::test]
    async fn create_pegs_in_on_shortfall() {
        let (node, backend) = node();
        let kc = keychain();
        let (output, _) = fund_coin(&kc, 0, 1_000);
        let id = backend.insert_coin(output);

        let result = node
            .create(
                &kc,
                CreateRequest {
                    coins: vec![CoinRef {
                        output_id: id,
                        address_index: 0,
                    }],
                    recipients: vec![Recipient {
                        value: 50_000,
                        address: kc.address(1).unwrap(),
                    }],
                    pegouts: vec![],
                    fee_rate_per_kb: 0,
                    lock_height: 0,
                },
                &LocalSigner,
            )
            .await
            .unwrap();
        assert_eq!(result.pegin, 50_000 + result.fee - 1_000);
        assert_eq!(result.tx.body.kernels[0].pegin, result.pegin);
    }

    #[tokio::test]
    async fn broadcast_self_notifies_subscribers() {
        let (node, backend) = node();
        let kc = keychain();
        let (output, _) = fund_coin(&kc, 0, 30_000);
        let id = backend.insert_coin(output);

        let mut stream = node.utxos(kc.scan, 0);
        let sentinel = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(sentinel.is_sentinel());

        let result = node
            .create(
                &kc,
                CreateRequest {
                    coins: vec![CoinRef {
                        output_id: id,
                        address_index: 0,
                    }],
                    recipients: vec![Recipient {
                        value: 29_000,
                        address: kc.address(2).unwrap(),
                    }],
                    pegouts: vec![],
                    fee_rate_per_kb: 0,
                    lock_height: 0,
                },
                &LocalSigner,
            )
            .await
            .unwrap();
        node.broadcast(&result.tx).await.unwrap();
        assert_eq!(backend.broadcasts().len(), 1);

        let seen = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.height, 0);
        assert_eq!(seen.output_id, result.new_coins[0].output_id.to_hex());
    }

    #[tokio::test]
    async fn coinswap_submits_signed_onion() {
        let (node, backend) = node();
        let kc = keychain();
        let (output, _) = fund_coin(&kc, 0, 1_000_000);
        let id = backend.insert_coin(output);

        let mut key_bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key_bytes);
        let mixer_key = x25519_dalek::StaticSecret::from(key_bytes);
        let mixers = [MixerNode {
            pubkey: x25519_dalek::PublicKey::from(&mixer_key).to_bytes(),
        }];

        let client = CapturingMixer::default();
        node.coinswap(&kc, id, 0, &mixers, &client).await.unwrap();
        let submitted = client.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].verify_owner());
        assert_eq!(submitted[0].input.output_id, id);
    }

    #[tokio::test]
    async fn addresses_are_derivable_view_only() {
        let (node, _) = node();
        let kc = keychain();
        let addresses = node.addresses(kc.scan, kc.spend_pub, 0, 3).unwrap();
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[1], kc.address(1).unwrap().to_hex());
    }
}
