//! Light-client core for the MWEB privacy extension block.
//!
//! The crate covers the wallet-facing cryptographic engine of an
//! extension-block daemon:
//!
//! - **Rewind**: recovering a wallet's view of a confidential output from
//!   its on-chain form with the scan secret, behind a two-level LRU cache.
//! - **Assembly**: building inputs, outputs and kernels from coins and
//!   recipients, with fee estimation and peg-in/peg-out balancing.
//! - **Coinswap onions**: Sphinx-style layered payloads handing each mixer
//!   hop its blind shares and fee, plus the owner proof binding the spent
//!   input to the onion.
//! - **PSBT orchestration**: iterative packet enrichment with an always
//!   rebalanced peg-in, wallet-side signing and extraction.
//! - **Signing device protocol**: a pure state machine over framed
//!   protocol units, for wallets whose spend secret lives in hardware.
//! - **UTXO streaming**: per-scan-secret subscription fan-out with catchup
//!   and a live tail.
//!
//! The P2P sync engine, wallet database and RPC surface live outside the
//! crate, behind the traits in [`chain`].

pub mod assembler;
pub mod chain;
pub mod coinswap;
pub mod error;
pub mod mux;
pub mod mw;
pub mod node;
pub mod onion;
pub mod psbt;
pub mod rewind;
pub mod signer;
pub mod tx;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ── Core types ─────────────────────────────────────────────────────
pub use error::{Error, Result};
pub use mw::{BlindingFactor, Commitment, Keychain, PublicKey, SecretKey, Signature, StealthAddress};
pub use rewind::{rewind_output, Coin, CoinCache};
pub use tx::{Input, Kernel, Output, OutputId, Tx, TxBody, TxOut};

// ── Assembly ───────────────────────────────────────────────────────
pub use assembler::{estimate_fee, new_transaction, KernelSigner, LocalSigner, Recipient};

// ── Coinswap ───────────────────────────────────────────────────────
pub use coinswap::{build_swap_request, split_blind, swap_fee, MixerClient, MixerNode};
pub use onion::{Hop, Onion};

// ── Packets and signing devices ────────────────────────────────────
pub use psbt::{PsbtKernel, PsbtPacket, PsbtRecipient};
pub use signer::{run_session, HardwareKernelSigner, SignContext, SignerTransport, TxState};

// ── Daemon surface ─────────────────────────────────────────────────
pub use chain::{ChainBackend, ChainEvent, Leafset, MempoolStore, NetUtxo, Utxo};
pub use mux::{UtxoMux, UtxoStream};
pub use node::{CoinRef, CreateRequest, CreateResult, MwebNode, Status};
