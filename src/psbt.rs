//! Iterative construction of a partially signed extension-block
//! transaction.
//!
//! The packet is an envelope the wallet enriches step by step: add inputs,
//! add recipients, add peg-outs. After every mutation the open kernel's
//! peg-in is rebalanced so the packet's value offset returns to zero —
//! more obligations than inputs grow the peg-in, excess inputs drain
//! peg-ins back down. Signing derives the per-output keys from the scan
//! secret and verifies each input's advertised address index before
//! committing to anything.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::assembler::{
    create_input, create_kernel, create_output, sign_output, Recipient, BASE_MWEB_FEE,
    BYTES_PER_WEIGHT, KERNEL_WITH_STEALTH_WEIGHT, STANDARD_OUTPUT_WEIGHT,
};
use crate::error::{Error, Result};
use crate::mw::{
    blind_sum, hashed_scalar, key_sum, switch, BlindingFactor, HashTag, Keychain, PublicKey,
    SecretKey, StealthAddress,
};
use crate::rewind::Coin;
use crate::tx::{Input, Kernel, Output, OutputId, Tx, TxBody, TxOut};

/// Lock times at or above this value are timestamps, not heights, and do
/// not seed a kernel height lock.
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

// ── Packet model ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsbtInput {
    /// Base-chain prevout, for inputs the extension block does not cover.
    pub prevout_txid: Option<String>,
    pub prevout_index: Option<u32>,
    pub sequence: Option<u32>,
    pub witness_utxo: Option<TxOut>,

    /// Confidential spend fields, recorded when the input is added.
    pub mweb_output_id: Option<OutputId>,
    pub mweb_address_index: Option<u32>,
    pub mweb_amount: Option<u64>,
    pub mweb_shared_secret: Option<SecretKey>,
    pub mweb_key_exchange_pubkey: Option<PublicKey>,
    pub mweb_commit: Option<crate::mw::Commitment>,
    pub mweb_output_pubkey: Option<PublicKey>,

    /// The signed input, filled by [`PsbtPacket::sign`].
    pub mweb_input: Option<Input>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsbtOutput {
    pub amount: u64,
    /// Base-chain recipient script.
    pub script: Option<TxOut>,
    /// Confidential recipient.
    pub stealth_address: Option<StealthAddress>,
    /// Filled by [`PsbtPacket::sign`].
    pub output_commit: Option<crate::mw::Commitment>,
    pub mweb_output: Option<Output>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsbtKernel {
    pub fee: Option<u64>,
    pub pegin: Option<u64>,
    pub pegouts: Vec<TxOut>,
    pub lock_height: Option<u32>,
    pub kernel_offset: Option<BlindingFactor>,
    pub stealth_offset: Option<BlindingFactor>,
    /// The signed kernel; `None` marks the kernel as open.
    pub signed: Option<Kernel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PsbtPacket {
    pub tx_version: i32,
    pub fallback_locktime: Option<u32>,
    pub inputs: Vec<PsbtInput>,
    pub outputs: Vec<PsbtOutput>,
    pub kernels: Vec<PsbtKernel>,
}

/// One line of the packet's recipient summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtRecipient {
    pub address: String,
    pub value: u64,
}

impl PsbtPacket {
    pub fn new(tx_version: i32, fallback_locktime: u32) -> PsbtPacket {
        PsbtPacket {
            tx_version,
            fallback_locktime: Some(fallback_locktime),
            ..Default::default()
        }
    }

    /// Base64 framing for the RPC boundary.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<PsbtPacket> {
        let json = BASE64
            .decode(encoded)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))
    }

    // ── Balance bookkeeping ─────────────────────────────────────────

    /// The packet's value offset: obligations (confidential outputs, fees,
    /// peg-outs) minus coverage (confidential inputs, peg-ins). Zero means
    /// balanced.
    pub fn offset(&self) -> i128 {
        let mut offset: i128 = 0;
        for input in &self.inputs {
            if let Some(amount) = input.mweb_amount {
                offset -= amount as i128;
            }
        }
        for output in &self.outputs {
            if output.stealth_address.is_some() || output.output_commit.is_some() {
                offset += output.amount as i128;
            }
        }
        for kernel in &self.kernels {
            if let Some(fee) = kernel.fee {
                offset += fee as i128;
            }
            if let Some(pegin) = kernel.pegin {
                offset -= pegin as i128;
            }
            for pegout in &kernel.pegouts {
                offset += pegout.value as i128;
            }
        }
        offset
    }

    /// Index of the open kernel, appending a fresh one (standard kernel
    /// fee, fallback lock height when it is a plausible block height) when
    /// every kernel is already signed.
    pub fn kernel_index(&mut self) -> usize {
        let mut index = 0;
        for kernel in &self.kernels {
            if kernel.signed.is_none() {
                break;
            }
            index += 1;
        }
        if index == self.kernels.len() {
            let mut kernel = PsbtKernel {
                fee: Some(KERNEL_WITH_STEALTH_WEIGHT * BASE_MWEB_FEE),
                ..Default::default()
            };
            if let Some(locktime) = self.fallback_locktime {
                if locktime > 0 && locktime < LOCKTIME_THRESHOLD {
                    kernel.lock_height = Some(locktime);
                }
            }
            self.kernels.push(kernel);
        }
        index
    }

    /// Restore the zero offset: a positive offset is added to the open
    /// kernel's peg-in; a negative one drains existing peg-ins in order,
    /// zeroing the ones it empties.
    pub fn rebalance(&mut self) {
        let index = self.kernel_index();
        let offset = self.offset();
        if offset > 0 {
            *self.kernels[index].pegin.get_or_insert(0) += offset as u64;
        } else if offset < 0 {
            let mut deficit = (-offset) as u64;
            for kernel in &mut self.kernels {
                if kernel.signed.is_some() {
                    continue;
                }
                if let Some(pegin) = kernel.pegin {
                    if pegin <= deficit {
                        deficit -= pegin;
                        kernel.pegin = None;
                    } else {
                        kernel.pegin = Some(pegin - deficit);
                        deficit = 0;
                    }
                    if deficit == 0 {
                        break;
                    }
                }
            }
        }
    }

    // ── Enrichment operations ───────────────────────────────────────

    /// Record a confidential input from a rewound coin and its raw output.
    pub fn add_mweb_input(&mut self, coin: &Coin, output: &Output, address_index: u32) {
        self.inputs.push(PsbtInput {
            mweb_output_id: Some(coin.output_id),
            mweb_address_index: Some(address_index),
            mweb_amount: Some(coin.value),
            mweb_shared_secret: Some(coin.shared_secret),
            mweb_key_exchange_pubkey: Some(output.message.key_exchange_pubkey),
            mweb_commit: Some(output.commitment),
            mweb_output_pubkey: Some(output.receiver_pubkey),
            ..Default::default()
        });
        self.rebalance();
    }

    /// Add a confidential recipient; the open kernel absorbs the standard
    /// output fee.
    pub fn add_recipient(&mut self, value: u64, address: StealthAddress) {
        self.outputs.push(PsbtOutput {
            amount: value,
            stealth_address: Some(address),
            ..Default::default()
        });
        let index = self.kernel_index();
        *self.kernels[index].fee.get_or_insert(0) += STANDARD_OUTPUT_WEIGHT * BASE_MWEB_FEE;
        self.rebalance();
    }

    /// Add a peg-out to the open kernel, charging the base-chain byte fee
    /// and the peg-out script weight.
    pub fn add_pegout(&mut self, value: u64, script: Vec<u8>, fee_rate_per_kb: u64) {
        let txout = TxOut { value, script };
        let index = self.kernel_index();
        let mut fee = (fee_rate_per_kb * txout.serialized_size() as u64).div_ceil(1000);
        fee += (txout.script.len() as u64).div_ceil(BYTES_PER_WEIGHT) * BASE_MWEB_FEE;
        *self.kernels[index].fee.get_or_insert(0) += fee;
        self.kernels[index].pegouts.push(txout);
        self.rebalance();
    }

    // ── Signing ─────────────────────────────────────────────────────

    /// Sign every pending confidential component with the keychain.
    ///
    /// Input keys are derived from the scan secret and the recorded
    /// key-exchange pubkey; the derived stealth address must match the
    /// advertised address index, otherwise [`Error::AddressMismatch`].
    pub fn sign(&mut self, keychain: &Keychain) -> Result<()> {
        let mut input_blinds = Vec::new();
        let mut input_keys = Vec::new();
        let mut spend_keys = Vec::new();
        for pinput in &mut self.inputs {
            if pinput.mweb_input.is_some() || pinput.mweb_output_id.is_none() {
                continue;
            }
            let output_pubkey = pinput
                .mweb_output_pubkey
                .ok_or_else(|| Error::Packet("input missing output pubkey".into()))?;
            let amount = pinput
                .mweb_amount
                .ok_or_else(|| Error::Packet("input missing amount".into()))?;
            let index = pinput.mweb_address_index.unwrap_or(0);

            let t = match pinput.mweb_shared_secret {
                Some(t) => t,
                None => {
                    let ke = pinput
                        .mweb_key_exchange_pubkey
                        .ok_or_else(|| Error::Packet("input missing key exchange".into()))?;
                    let shared = ke.mul(&keychain.scan)?;
                    hashed_scalar(HashTag::Derive, &shared.0)
                }
            };

            let tweak = hashed_scalar(HashTag::OutKey, &t.0);
            let spend_pub = output_pubkey.sub_scalar(&tweak)?;
            let address = StealthAddress {
                scan: spend_pub.mul(&keychain.scan)?,
                spend: spend_pub,
            };
            if address != keychain.address(index)? {
                return Err(Error::AddressMismatch);
            }

            let spend_key = keychain.spend_key(index)?.add(&tweak);
            let blind = BlindingFactor(crate::mw::hashed(HashTag::Blind, &t.0));
            let coin = Coin {
                blind,
                value: amount,
                output_id: pinput
                    .mweb_output_id
                    .ok_or_else(|| Error::Packet("input missing output id".into()))?,
                address,
                shared_secret: t,
                spend_key: Some(spend_key),
            };

            let input_key = SecretKey::random();
            let input = create_input(&coin, &input_key)?;
            if let Some(commit) = pinput.mweb_commit {
                if commit != input.commitment {
                    return Err(Error::Packet("input commitment mismatch".into()));
                }
            }
            pinput.mweb_input = Some(input);
            input_blinds.push(switch(&blind, amount)?);
            input_keys.push(input_key);
            spend_keys.push(spend_key);
        }

        let mut output_blinds = Vec::new();
        let mut output_keys = Vec::new();
        for poutput in &mut self.outputs {
            if poutput.mweb_output.is_some() {
                continue;
            }
            let Some(address) = poutput.stealth_address else {
                continue;
            };
            let sender_key = SecretKey::random();
            let (mut output, blind, _) = create_output(
                &Recipient {
                    value: poutput.amount,
                    address,
                },
                &sender_key,
            )?;
            sign_output(&mut output, &sender_key)?;
            output_blinds.push(switch(&blind, poutput.amount)?);
            output_keys.push(sender_key);
            poutput.output_commit = Some(output.commitment);
            poutput.mweb_output = Some(output);
        }

        let index = self.kernel_index();
        let pkernel = &mut self.kernels[index];

        let kernel_offset = BlindingFactor::random();
        let mut negative_blinds = input_blinds;
        negative_blinds.push(kernel_offset);
        let kernel_excess = blind_sum(&output_blinds, &negative_blinds);

        let stealth_offset = BlindingFactor::random();
        let mut positive_keys = output_keys;
        positive_keys.extend_from_slice(&input_keys);
        let mut negative_keys = spend_keys;
        negative_keys.push(stealth_offset.as_secret());
        let stealth_key = key_sum(&positive_keys, &negative_keys);

        let kernel = create_kernel(
            &kernel_excess,
            &stealth_key,
            pkernel.fee.unwrap_or(0),
            pkernel.pegin.unwrap_or(0),
            pkernel.pegouts.clone(),
            pkernel.lock_height.unwrap_or(0),
        )?;
        pkernel.kernel_offset = Some(kernel_offset);
        pkernel.stealth_offset = Some(stealth_offset);
        pkernel.signed = Some(kernel);
        Ok(())
    }

    // ── Extraction ──────────────────────────────────────────────────

    /// Extract the final transaction. The packet must be balanced and
    /// every confidential component signed.
    pub fn extract(&self) -> Result<Tx> {
        if self.offset() != 0 {
            return Err(Error::Packet(format!(
                "packet does not balance: offset {}",
                self.offset()
            )));
        }

        let mut inputs = Vec::new();
        for pinput in &self.inputs {
            if pinput.mweb_output_id.is_none() {
                continue;
            }
            inputs.push(
                pinput
                    .mweb_input
                    .ok_or_else(|| Error::Packet("unsigned input".into()))?,
            );
        }

        let mut outputs = Vec::new();
        for poutput in &self.outputs {
            if poutput.stealth_address.is_none() {
                continue;
            }
            outputs.push(
                poutput
                    .mweb_output
                    .clone()
                    .ok_or_else(|| Error::Packet("unsigned output".into()))?,
            );
        }

        let mut kernels = Vec::new();
        let mut kernel_offsets = Vec::new();
        let mut stealth_offsets = Vec::new();
        for pkernel in &self.kernels {
            kernels.push(
                pkernel
                    .signed
                    .clone()
                    .ok_or_else(|| Error::Packet("unsigned kernel".into()))?,
            );
            if let Some(offset) = pkernel.kernel_offset {
                kernel_offsets.push(offset);
            }
            if let Some(offset) = pkernel.stealth_offset {
                stealth_offsets.push(offset);
            }
        }

        let mut body = TxBody {
            inputs,
            outputs,
            kernels,
        };
        body.sort();
        Ok(Tx {
            kernel_offset: blind_sum(&kernel_offsets, &[]),
            stealth_offset: blind_sum(&stealth_offsets, &[]),
            body,
        })
    }

    /// Output ids of the signed confidential outputs, in packet order.
    pub fn output_ids(&self) -> Vec<OutputId> {
        self.outputs
            .iter()
            .filter_map(|o| o.mweb_output.as_ref().map(|out| out.id()))
            .collect()
    }

    /// Human-readable recipient list plus the net fee the packet pays.
    pub fn recipients(&self) -> (Vec<PsbtRecipient>, i128) {
        let mut fee: i128 = 0;
        for input in &self.inputs {
            if let Some(utxo) = &input.witness_utxo {
                fee += utxo.value as i128;
            } else if let Some(amount) = input.mweb_amount {
                fee += amount as i128;
            }
        }
        let mut recipients = Vec::new();
        for output in &self.outputs {
            let address = match (&output.stealth_address, &output.script) {
                (Some(addr), _) => addr.to_hex(),
                (None, Some(txout)) => hex::encode(&txout.script),
                (None, None) => String::new(),
            };
            recipients.push(PsbtRecipient {
                address,
                value: output.amount,
            });
            fee -= output.amount as i128;
        }
        for kernel in &self.kernels {
            for pegout in &kernel.pegouts {
                recipients.push(PsbtRecipient {
                    address: hex::encode(&pegout.script),
                    value: pegout.value,
                });
                fee -= pegout.value as i128;
            }
        }
        (recipients, fee)
    }
}
