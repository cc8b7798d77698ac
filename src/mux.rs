//! Per-scan-secret UTXO subscription fan-out.
//!
//! Each subscription gets a catchup pass over the current leafset followed
//! by a live tail of chain events, separated by a sentinel. Delivery to a
//! subscriber is a bounded send raced against its quit signal, so a dead or
//! slow subscriber can never wedge the chain event path. Within one
//! subscription no output id is delivered twice.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::spawn_blocking;

use crate::chain::{ChainBackend, Leafset, MempoolStore, NetUtxo, Utxo};
use crate::error::{Error, Result};
use crate::mw::SecretKey;
use crate::rewind::CoinCache;
use crate::tx::OutputId;

/// Leaves fetched per backend round-trip.
const CATCHUP_BATCH: usize = 1000;

// ── Subscriber bookkeeping ──────────────────────────────────────────

struct SubscriberState {
    /// Leafset snapshot this subscriber has been reconciled against.
    leafset: Option<Leafset>,
    /// Confirmed leaf indices already pushed through the callback path
    /// since the last snapshot; the diff pass skips them.
    seen_leaves: HashSet<u64>,
    /// Deliveries made on this subscription, keyed by id and height so a
    /// mempool sighting and its confirmation are distinct events but
    /// neither is ever repeated.
    delivered: HashSet<(OutputId, u32)>,
}

struct Subscriber {
    tx: mpsc::Sender<Utxo>,
    quit: watch::Receiver<bool>,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    /// Record-then-send with at-most-once semantics. Returns `false` once
    /// the subscriber is gone.
    async fn deliver(&self, id: OutputId, utxo: Utxo) -> bool {
        {
            let mut state = self.state.lock().expect("subscriber state poisoned");
            if !state.delivered.insert((id, utxo.height)) {
                return true;
            }
        }
        let mut quit = self.quit.clone();
        tokio::select! {
            res = self.tx.send(utxo) => res.is_ok(),
            _ = quit.changed() => false,
        }
    }
}

/// A live subscription handle. Dropping it tears the subscription down.
pub struct UtxoStream {
    rx: mpsc::Receiver<Utxo>,
    _quit: watch::Sender<bool>,
}

impl UtxoStream {
    /// Next utxo; the catchup phase ends with a sentinel
    /// ([`Utxo::is_sentinel`]), after which live events follow.
    pub async fn recv(&mut self) -> Option<Utxo> {
        self.rx.recv().await
    }
}

// ── Mux ─────────────────────────────────────────────────────────────

/// Fan-out of chain events to per-scan-secret subscriber streams.
pub struct UtxoMux<B: ChainBackend, S: MempoolStore> {
    backend: Arc<B>,
    mempool: Arc<S>,
    cache: Arc<CoinCache>,
    subscribers: Mutex<HashMap<[u8; 32], Vec<Arc<Subscriber>>>>,
}

impl<B: ChainBackend, S: MempoolStore> UtxoMux<B, S> {
    pub fn new(backend: Arc<B>, mempool: Arc<S>, cache: Arc<CoinCache>) -> UtxoMux<B, S> {
        UtxoMux {
            backend,
            mempool,
            cache,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Rewind a batch for one scan secret, keeping only the wallet's own
    /// outputs.
    fn filter_utxos(&self, scan: &SecretKey, utxos: &[NetUtxo]) -> Vec<(OutputId, Utxo)> {
        utxos
            .iter()
            .filter_map(|u| {
                let coin = self.cache.rewind(&u.output, scan).ok()?;
                Some((
                    u.output_id,
                    Utxo {
                        height: u.height,
                        value: coin.value,
                        address: coin.address.to_hex(),
                        output_id: u.output_id.to_hex(),
                        block_time: u.block_time,
                    },
                ))
            })
            .collect()
    }

    /// Open a subscription: catchup from `from_height`, sentinel, live
    /// tail.
    pub fn subscribe(self: &Arc<Self>, scan: SecretKey, from_height: u32) -> UtxoStream {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (live_tx, live_rx) = mpsc::channel(1);
        let (quit_tx, quit_rx) = watch::channel(false);

        let sub = Arc::new(Subscriber {
            tx: live_tx,
            quit: quit_rx,
            state: Mutex::new(SubscriberState {
                leafset: None,
                seen_leaves: HashSet::new(),
                delivered: HashSet::new(),
            }),
        });
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .entry(scan.0)
            .or_default()
            .push(sub.clone());

        let mux = self.clone();
        tokio::spawn(async move {
            mux.run_subscription(scan, from_height, sub, out_tx, live_rx)
                .await;
        });

        UtxoStream {
            rx: out_rx,
            _quit: quit_tx,
        }
    }

    async fn run_subscription(
        self: Arc<Self>,
        scan: SecretKey,
        from_height: u32,
        sub: Arc<Subscriber>,
        out_tx: mpsc::Sender<Utxo>,
        mut live_rx: mpsc::Receiver<Utxo>,
    ) {
        if let Err(e) = self.catchup(&scan, from_height, &sub, &out_tx).await {
            log::warn!("utxo catchup failed: {e}");
        }
        if out_tx.send(Utxo::default()).await.is_err() {
            return;
        }
        loop {
            tokio::select! {
                item = live_rx.recv() => match item {
                    Some(utxo) => {
                        if out_tx.send(utxo).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = out_tx.closed() => return,
            }
        }
    }

    async fn catchup(
        &self,
        scan: &SecretKey,
        from_height: u32,
        sub: &Arc<Subscriber>,
        out_tx: &mpsc::Sender<Utxo>,
    ) -> Result<()> {
        let backend = self.backend.clone();
        let heights = spawn_blocking(move || backend.leaves_at_height())
            .await
            .map_err(|e| Error::Backend(e.to_string()))??;
        let mut leaf = heights
            .range(..from_height)
            .next_back()
            .map(|(_, first_leaf)| *first_leaf)
            .unwrap_or(0);

        let backend = self.backend.clone();
        let leafset = spawn_blocking(move || backend.leafset())
            .await
            .map_err(|e| Error::Backend(e.to_string()))??;

        let mut batch = Vec::new();
        while leaf < leafset.size {
            if leafset.contains(leaf) {
                batch.push(leaf);
            }
            if batch.len() == CATCHUP_BATCH || leaf == leafset.size - 1 {
                if !batch.is_empty() {
                    let backend = self.backend.clone();
                    let leaves = std::mem::take(&mut batch);
                    let utxos = spawn_blocking(move || backend.fetch_leaves(&leaves))
                        .await
                        .map_err(|e| Error::Backend(e.to_string()))??;
                    for (id, utxo) in self.filter_utxos(scan, &utxos) {
                        {
                            let mut state =
                                sub.state.lock().expect("subscriber state poisoned");
                            if !state.delivered.insert((id, utxo.height)) {
                                continue;
                            }
                        }
                        if out_tx.send(utxo).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            leaf += 1;
        }

        // Adopt the walked snapshot unless a chain event already installed
        // a newer one.
        let mut state = sub.state.lock().expect("subscriber state poisoned");
        if state.leafset.is_none() {
            state.leafset = Some(leafset);
        }
        Ok(())
    }

    /// Chain-event entry point: persist mempool movement, notify every
    /// subscriber, then reconcile any new leafset snapshot. Errors on this
    /// path are logged and swallowed; the chain thread never fails.
    pub async fn on_new_utxos(&self, leafset: Option<Leafset>, utxos: Vec<NetUtxo>) {
        for utxo in &utxos {
            let result = if utxo.height == 0 {
                self.mempool.put(&utxo.output_id, &utxo.output.to_bytes())
            } else {
                self.mempool.delete(&utxo.output_id)
            };
            if let Err(e) = result {
                log::warn!("mempool store update failed for {}: {e}", utxo.output_id);
            }
        }

        let confirmed: Vec<u64> = utxos
            .iter()
            .filter(|u| u.height != 0)
            .map(|u| u.leaf_index)
            .collect();

        let groups: Vec<([u8; 32], Vec<Arc<Subscriber>>)> = self
            .subscribers
            .lock()
            .expect("subscriber map poisoned")
            .iter()
            .map(|(scan, subs)| (*scan, subs.clone()))
            .collect();

        let mut dead: Vec<Arc<Subscriber>> = Vec::new();
        for (scan_bytes, subs) in groups {
            let scan = SecretKey(scan_bytes);
            let filtered = self.filter_utxos(&scan, &utxos);
            for sub in subs {
                let mut alive = true;
                for (id, utxo) in &filtered {
                    if !sub.deliver(*id, utxo.clone()).await {
                        alive = false;
                        break;
                    }
                }
                if alive {
                    let mut state = sub.state.lock().expect("subscriber state poisoned");
                    state.seen_leaves.extend(confirmed.iter().copied());
                }
                if alive {
                    if let Some(lfs) = &leafset {
                        alive = self.reconcile_leafset(&scan, &sub, lfs).await;
                    }
                }
                if !alive {
                    dead.push(sub);
                }
            }
        }

        if !dead.is_empty() {
            let mut map = self.subscribers.lock().expect("subscriber map poisoned");
            for subs in map.values_mut() {
                subs.retain(|s| !dead.iter().any(|d| Arc::ptr_eq(s, d)));
            }
            map.retain(|_, subs| !subs.is_empty());
            log::debug!("pruned {} dead utxo subscribers", dead.len());
        }
    }

    /// Byte-granular diff of the subscriber's last snapshot against the
    /// new one; newly set leaves that did not arrive through the callback
    /// are fetched and delivered. Catches confirmations of outputs the
    /// subscriber had never seen.
    async fn reconcile_leafset(
        &self,
        scan: &SecretKey,
        sub: &Arc<Subscriber>,
        new_lfs: &Leafset,
    ) -> bool {
        let candidates = {
            let mut state = sub.state.lock().expect("subscriber state poisoned");
            let Some(old) = state.leafset.take() else {
                state.leafset = Some(new_lfs.clone());
                return true;
            };
            let mut byte = 0;
            while byte < old.bits.len()
                && byte < new_lfs.bits.len()
                && old.bits[byte] == new_lfs.bits[byte]
            {
                byte += 1;
            }
            let mut candidates = Vec::new();
            for leaf in (byte as u64 * 8)..new_lfs.size {
                if !old.contains(leaf)
                    && new_lfs.contains(leaf)
                    && !state.seen_leaves.contains(&leaf)
                {
                    candidates.push(leaf);
                }
            }
            state.leafset = Some(new_lfs.clone());
            state.seen_leaves.clear();
            candidates
        };

        for chunk in candidates.chunks(CATCHUP_BATCH) {
            let backend = self.backend.clone();
            let leaves = chunk.to_vec();
            let utxos = match spawn_blocking(move || backend.fetch_leaves(&leaves)).await {
                Ok(Ok(utxos)) => utxos,
                Ok(Err(e)) => {
                    log::warn!("leafset reconcile fetch failed: {e}");
                    break;
                }
                Err(e) => {
                    log::warn!("leafset reconcile task failed: {e}");
                    break;
                }
            };
            for (id, utxo) in self.filter_utxos(scan, &utxos) {
                if !sub.deliver(id, utxo).await {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mw::Keychain;
    use crate::testing::{fund_coin, MemoryChainBackend, MemoryMempool};
    use std::time::Duration;

    fn mux_with(
        backend: Arc<MemoryChainBackend>,
    ) -> (Arc<UtxoMux<MemoryChainBackend, MemoryMempool>>, Arc<MemoryMempool>) {
        let mempool = Arc::new(MemoryMempool::default());
        let mux = Arc::new(UtxoMux::new(
            backend,
            mempool.clone(),
            Arc::new(CoinCache::new()),
        ));
        (mux, mempool)
    }

    fn keychain() -> Keychain {
        Keychain::new(SecretKey::random(), SecretKey::random()).unwrap()
    }

    async fn recv_timeout(stream: &mut UtxoStream) -> Option<Utxo> {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("stream stalled")
    }

    #[tokio::test]
    async fn catchup_then_sentinel_then_live() {
        let kc = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        let confirmed = backend.add_confirmed(&kc, 0, 1_000, 10);
        let (mux, _) = mux_with(backend.clone());

        let mut stream = mux.subscribe(kc.scan, 0);
        let first = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(first.output_id, confirmed.output_id.to_hex());
        assert_eq!(first.value, 1_000);
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());

        // Live event after catchup.
        let live = backend.make_utxo(&kc, 1, 2_000, 11);
        mux.on_new_utxos(None, vec![live.clone()]).await;
        let got = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(got.output_id, live.output_id.to_hex());
        assert_eq!(got.height, 11);
    }

    #[tokio::test]
    async fn foreign_outputs_are_filtered() {
        let kc = keychain();
        let other = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        backend.add_confirmed(&other, 0, 500, 5);
        let mine = backend.add_confirmed(&kc, 0, 900, 6);
        let (mux, _) = mux_with(backend);

        let mut stream = mux.subscribe(kc.scan, 0);
        let first = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(first.output_id, mine.output_id.to_hex());
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());
    }

    #[tokio::test]
    async fn mempool_bucket_tracks_confirmations() {
        let kc = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        let (mux, mempool) = mux_with(backend.clone());

        let mut stream = mux.subscribe(kc.scan, 0);
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());

        // Two mempool utxos: persisted in the bucket and delivered at
        // height zero.
        let a = backend.make_utxo(&kc, 0, 100, 0);
        let b = backend.make_utxo(&kc, 1, 200, 0);
        mux.on_new_utxos(None, vec![a.clone(), b.clone()]).await;
        assert_eq!(recv_timeout(&mut stream).await.unwrap().height, 0);
        assert_eq!(recv_timeout(&mut stream).await.unwrap().height, 0);
        assert!(mempool.get(&a.output_id).unwrap().is_some());
        assert!(mempool.get(&b.output_id).unwrap().is_some());

        // The same ids confirm: bucket drained, both confirmations
        // delivered as fresh events.
        let mut a2 = a.clone();
        a2.height = 50;
        let mut b2 = b.clone();
        b2.height = 50;
        mux.on_new_utxos(None, vec![a2, b2]).await;
        assert_eq!(mempool.get(&a.output_id).unwrap(), None);
        assert_eq!(mempool.get(&b.output_id).unwrap(), None);
        let got_a = recv_timeout(&mut stream).await.unwrap();
        let got_b = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(got_a.height, 50);
        assert_eq!(got_b.height, 50);
        let ids = [got_a.output_id, got_b.output_id];
        assert!(ids.contains(&a.output_id.to_hex()));
        assert!(ids.contains(&b.output_id.to_hex()));
    }

    #[tokio::test]
    async fn leafset_diff_catches_unseen_confirmations() {
        let kc = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        let (mux, _) = mux_with(backend.clone());

        let mut stream = mux.subscribe(kc.scan, 0);
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());

        // An output confirms without ever flowing through the callback
        // batch: only the leafset snapshot reveals it.
        let hidden = backend.add_confirmed(&kc, 7, 4_000, 60);
        let snapshot = backend.leafset().unwrap();
        mux.on_new_utxos(Some(snapshot), vec![]).await;
        let got = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(got.output_id, hidden.output_id.to_hex());
    }

    #[tokio::test]
    async fn at_most_once_per_subscription() {
        let kc = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        let utxo = backend.add_confirmed(&kc, 0, 1_500, 20);
        let (mux, _) = mux_with(backend.clone());

        let mut stream = mux.subscribe(kc.scan, 0);
        assert_eq!(
            recv_timeout(&mut stream).await.unwrap().output_id,
            utxo.output_id.to_hex()
        );
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());

        // The same output arrives again via callback and via snapshot
        // diff; neither may be redelivered.
        let snapshot = backend.leafset().unwrap();
        mux.on_new_utxos(Some(snapshot), vec![utxo.clone()]).await;
        let fresh = backend.make_utxo(&kc, 9, 800, 21);
        mux.on_new_utxos(None, vec![fresh.clone()]).await;
        assert_eq!(
            recv_timeout(&mut stream).await.unwrap().output_id,
            fresh.output_id.to_hex()
        );
    }

    #[tokio::test]
    async fn dropped_stream_does_not_block_chain_path() {
        let kc = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        let (mux, _) = mux_with(backend.clone());

        let mut stream = mux.subscribe(kc.scan, 0);
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());
        drop(stream);

        // Two events into a dead subscriber: must complete promptly.
        for i in 0..2 {
            let utxo = backend.make_utxo(&kc, 20 + i, 100, 30);
            tokio::time::timeout(Duration::from_secs(5), mux.on_new_utxos(None, vec![utxo]))
                .await
                .expect("chain path blocked on dead subscriber");
        }
    }

    #[tokio::test]
    async fn catchup_respects_from_height() {
        let kc = keychain();
        let backend = Arc::new(MemoryChainBackend::default());
        backend.add_confirmed_at_height(&kc, 0, 100, 10);
        let late = backend.add_confirmed_at_height(&kc, 1, 200, 90);
        let (mux, _) = mux_with(backend.clone());

        let mut stream = mux.subscribe(kc.scan, 50);
        let first = recv_timeout(&mut stream).await.unwrap();
        assert_eq!(first.output_id, late.output_id.to_hex());
        assert!(recv_timeout(&mut stream).await.unwrap().is_sentinel());
    }
}
