//! Signing-device protocol: a pure state machine per protocol unit.
//!
//! Every state renders one request (a 5-byte header `CLA, INS, P1, P2, Lc`
//! plus data) and parses one fixed-width little-endian response, yielding
//! the next state. The driver loop owns the transport; the machine itself
//! never blocks, which keeps the per-state logic testable without a
//! device.

pub mod transport;

pub use transport::{HidDevice, HidTransport, SignerTransport};

use crate::assembler::{KernelSigner, SignedParts, SignerContext};
use crate::error::{Error, Result};
use crate::mw::{hashed_scalar, range_proof, switch, BlindingFactor, HashTag, PublicKey, SecretKey, Signature};
use crate::rewind::Coin;
use crate::tx::{
    Input, Kernel, Output, OutputMessage, Reader, Tx, TxBody, TxOut, KERNEL_STEALTH_EXCESS_FEATURE,
};

pub const CLA: u8 = 0xEB;
pub const INS_GET_PUBLIC_KEY: u8 = 0x05;
pub const INS_CREATE_KERNEL: u8 = 0x06;
pub const INS_ADD_INPUT: u8 = 0x07;
pub const INS_ADD_OUTPUT: u8 = 0x08;
pub const INS_SIGN_OUTPUT: u8 = 0x09;
pub const INS_SIGN_KERNEL: u8 = 0x0A;

/// Continuation flag: more protocol units of this instruction follow.
pub const P2_MORE: u8 = 0x80;

fn header(ins: u8, p1: u8, p2: u8) -> Vec<u8> {
    vec![CLA, ins, p1, p2, 0]
}

fn push_hd_path(buf: &mut Vec<u8>, hd_path: &[u32]) {
    buf.push(hd_path.len() as u8);
    for part in hd_path {
        buf.extend_from_slice(&part.to_be_bytes());
    }
}

// ── Full-transaction session ────────────────────────────────────────

/// Everything the session needs up front, plus what it accumulates.
#[derive(Default)]
pub struct SignContext {
    pub hd_path: Vec<u32>,
    pub coins: Vec<Coin>,
    pub address_index: Vec<u32>,
    pub recipients: Vec<crate::assembler::Recipient>,
    pub fee: u64,
    pub pegin: u64,
    pub pegouts: Vec<TxOut>,
    pub lock_height: u32,

    inputs: Vec<Input>,
    outputs: Vec<Output>,
    /// Wallet views of the device-built outputs; output ids are filled
    /// once the device signs them.
    pub new_coins: Vec<Coin>,
    /// The assembled transaction, present once the machine terminates.
    pub tx: Option<Tx>,
}

/// The device protocol states. Transitions:
///
/// ```text
/// GetPublicKey → AddInput(0) | AddOutput(0) | InitKernel
/// AddInput(i)  → AddInput(i+1) | AddOutput(0) | InitKernel
/// AddOutput(i) → SignOutput(i)
/// SignOutput(i)→ AddOutput(i+1) | InitKernel
/// InitKernel   → AddPegout(0) | SignKernel
/// AddPegout(i) → AddPegout(i+1) | SignKernel
/// SignKernel   → terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    GetPublicKey,
    AddInput(usize),
    AddOutput(usize),
    SignOutput(usize),
    InitKernel,
    AddPegout(usize),
    SignKernel,
}

impl TxState {
    /// Render this state's request. The driver patches the length byte.
    pub fn request(&self, ctx: &SignContext) -> Result<Vec<u8>> {
        match *self {
            TxState::GetPublicKey => {
                let mut buf = header(INS_GET_PUBLIC_KEY, 0, 0);
                push_hd_path(&mut buf, &ctx.hd_path);
                Ok(buf)
            }
            TxState::AddInput(i) => {
                let coin = &ctx.coins[i];
                let mut buf = header(INS_ADD_INPUT, 0, 0);
                buf.extend_from_slice(&coin.blind.0);
                buf.extend_from_slice(&coin.value.to_le_bytes());
                buf.extend_from_slice(&coin.output_id.0);
                buf.extend_from_slice(&(ctx.address_index[i] as u64).to_le_bytes());
                buf.extend_from_slice(&coin.shared_secret.0);
                Ok(buf)
            }
            TxState::AddOutput(i) => {
                let recipient = &ctx.recipients[i];
                let mut buf = header(INS_ADD_OUTPUT, 0, 0);
                buf.extend_from_slice(&recipient.value.to_le_bytes());
                buf.extend_from_slice(&recipient.address.scan.0);
                buf.extend_from_slice(&recipient.address.spend.0);
                Ok(buf)
            }
            TxState::SignOutput(i) => {
                let mut buf = header(INS_SIGN_OUTPUT, 0, 0);
                buf.extend_from_slice(&ctx.outputs[i].range_proof_hash);
                Ok(buf)
            }
            TxState::InitKernel => {
                let mut buf = header(INS_SIGN_KERNEL, 1, 0);
                buf.extend_from_slice(&ctx.fee.to_le_bytes());
                buf.extend_from_slice(&ctx.pegin.to_le_bytes());
                buf.extend_from_slice(&(ctx.pegouts.len() as u16).to_le_bytes());
                buf.extend_from_slice(&ctx.lock_height.to_le_bytes());
                Ok(buf)
            }
            TxState::AddPegout(i) => {
                let pegout = &ctx.pegouts[i];
                let mut buf = header(INS_SIGN_KERNEL, 0, 0);
                buf.extend_from_slice(&pegout.value.to_le_bytes());
                buf.push(pegout.script.len() as u8);
                buf.extend_from_slice(&pegout.script);
                Ok(buf)
            }
            TxState::SignKernel => Ok(vec![CLA, INS_SIGN_KERNEL, 0, 0, 0, 0]),
        }
    }

    /// Consume this state's response, mutate the context, and return the
    /// next state; `None` terminates the session.
    pub fn process(self, ctx: &mut SignContext, response: &[u8]) -> Result<Option<TxState>> {
        let mut r = Reader::new(response);
        match self {
            TxState::GetPublicKey => {
                if !ctx.coins.is_empty() {
                    Ok(Some(TxState::AddInput(0)))
                } else if !ctx.recipients.is_empty() {
                    Ok(Some(TxState::AddOutput(0)))
                } else {
                    Ok(Some(TxState::InitKernel))
                }
            }
            TxState::AddInput(i) => {
                ctx.inputs.push(Input {
                    features: r.u8()?,
                    output_id: crate::tx::OutputId(r.array()?),
                    commitment: crate::mw::Commitment(r.array()?),
                    input_pubkey: PublicKey(r.array()?),
                    output_pubkey: PublicKey(r.array()?),
                    signature: Signature(r.array()?),
                });
                if i + 1 < ctx.coins.len() {
                    Ok(Some(TxState::AddInput(i + 1)))
                } else if !ctx.recipients.is_empty() {
                    Ok(Some(TxState::AddOutput(0)))
                } else {
                    Ok(Some(TxState::InitKernel))
                }
            }
            TxState::AddOutput(i) => {
                let commitment = crate::mw::Commitment(r.array()?);
                let sender_pubkey = PublicKey(r.array()?);
                let receiver_pubkey = PublicKey(r.array()?);
                let message = OutputMessage {
                    features: r.u8()?,
                    key_exchange_pubkey: PublicKey(r.array()?),
                    view_tag: r.u8()?,
                    masked_value: r.u64_le()?,
                    masked_nonce: r.array()?,
                };
                let blind = BlindingFactor(r.array()?);
                let shared = SecretKey(r.array()?);

                let recipient = &ctx.recipients[i];
                let mut message_bytes = Vec::with_capacity(OutputMessage::SERIALIZED_SIZE);
                message.serialize(&mut message_bytes);
                // The proof is built host-side from the device's blind; its
                // nonce only needs to be deterministic for this output.
                let proof_nonce = hashed_scalar(HashTag::SendKey, &shared.0);
                let proof = range_proof(
                    recipient.value,
                    &switch(&blind, recipient.value)?,
                    &proof_nonce,
                    &message_bytes,
                )?;
                let range_proof_hash = *blake3::hash(&proof).as_bytes();
                ctx.outputs.push(Output {
                    commitment,
                    sender_pubkey,
                    receiver_pubkey,
                    message,
                    range_proof: proof,
                    range_proof_hash,
                    signature: Signature::default(),
                });
                ctx.new_coins.push(Coin {
                    blind,
                    value: recipient.value,
                    output_id: crate::tx::OutputId::default(),
                    address: recipient.address,
                    shared_secret: shared,
                    spend_key: None,
                });
                Ok(Some(TxState::SignOutput(i)))
            }
            TxState::SignOutput(i) => {
                ctx.outputs[i].signature = Signature(r.array()?);
                ctx.new_coins[i].output_id = ctx.outputs[i].id();
                if i + 1 < ctx.recipients.len() {
                    Ok(Some(TxState::AddOutput(i + 1)))
                } else {
                    Ok(Some(TxState::InitKernel))
                }
            }
            TxState::InitKernel => {
                if !ctx.pegouts.is_empty() {
                    Ok(Some(TxState::AddPegout(0)))
                } else {
                    Ok(Some(TxState::SignKernel))
                }
            }
            TxState::AddPegout(i) => {
                if i + 1 < ctx.pegouts.len() {
                    Ok(Some(TxState::AddPegout(i + 1)))
                } else {
                    Ok(Some(TxState::SignKernel))
                }
            }
            TxState::SignKernel => {
                let kernel_offset = BlindingFactor(r.array()?);
                let stealth_offset = BlindingFactor(r.array()?);
                let features = r.u8()?;
                let excess = crate::mw::Commitment(r.array()?);
                let stealth_excess = PublicKey(r.array()?);
                let signature = Signature(r.array()?);
                let mut body = TxBody {
                    inputs: std::mem::take(&mut ctx.inputs),
                    outputs: std::mem::take(&mut ctx.outputs),
                    kernels: vec![Kernel {
                        features,
                        fee: ctx.fee,
                        pegin: ctx.pegin,
                        pegouts: ctx.pegouts.clone(),
                        lock_height: ctx.lock_height,
                        excess,
                        stealth_excess,
                        signature,
                    }],
                };
                body.sort();
                ctx.tx = Some(Tx {
                    kernel_offset,
                    stealth_offset,
                    body,
                });
                Ok(None)
            }
        }
    }
}

/// Drive the state machine over a transport until the transaction is
/// assembled.
pub fn run_session(transport: &mut dyn SignerTransport, ctx: &mut SignContext) -> Result<()> {
    let mut state = TxState::GetPublicKey;
    loop {
        let mut request = state.request(ctx)?;
        request[4] = (request.len() - 5) as u8;
        let response = transport.exchange(&request)?;
        match state.process(ctx, &response)? {
            Some(next) => state = next,
            None => return Ok(()),
        }
    }
}

// ── Scan-key export ─────────────────────────────────────────────────

/// Ask the device for the wallet's scan secret and spend public key,
/// optionally requiring on-device address confirmation.
pub fn export_keys(
    transport: &mut dyn SignerTransport,
    hd_path: &[u32],
    confirm_address: bool,
) -> Result<(SecretKey, PublicKey)> {
    let mut request = header(INS_GET_PUBLIC_KEY, confirm_address as u8, 0);
    push_hd_path(&mut request, hd_path);
    request[4] = (request.len() - 5) as u8;
    let response = transport.exchange(&request)?;
    let mut r = Reader::new(&response);
    Ok((SecretKey(r.array()?), PublicKey(r.array()?)))
}

// ── Streamed kernel signing ─────────────────────────────────────────

/// [`KernelSigner`] that delegates input and kernel signing to the device
/// while the host builds the outputs. Used when the wallet holds no spend
/// secret.
pub struct HardwareKernelSigner<'a, T: SignerTransport> {
    transport: std::sync::Mutex<&'a mut T>,
    hd_path: Vec<u32>,
}

impl<'a, T: SignerTransport> HardwareKernelSigner<'a, T> {
    pub fn new(transport: &'a mut T, hd_path: Vec<u32>) -> HardwareKernelSigner<'a, T> {
        HardwareKernelSigner {
            transport: std::sync::Mutex::new(transport),
            hd_path,
        }
    }
}

impl<'a, T: SignerTransport> KernelSigner for HardwareKernelSigner<'a, T> {
    fn sign(&self, ctx: &SignerContext<'_>) -> Result<SignedParts> {
        let mut guard = self.transport.lock().expect("signer transport poisoned");
        let transport: &mut T = &mut **guard;

        // Init unit: session parameters plus the aggregate blinds.
        let mut request = header(INS_CREATE_KERNEL, 0, P2_MORE);
        push_hd_path(&mut request, &self.hd_path);
        request.extend_from_slice(&(ctx.coins.len() as u32).to_le_bytes());
        request.extend_from_slice(&ctx.output_key_sum.0);
        request.extend_from_slice(&ctx.kernel_excess.0);
        request[4] = (request.len() - 5) as u8;
        transport.exchange(&request)?;

        // One unit per coin; the device returns the signed input parts.
        let mut inputs = Vec::with_capacity(ctx.coins.len());
        for coin in ctx.coins {
            let spend_key = coin.spend_key.ok_or(Error::MissingSpendKey)?;
            let mut request = header(INS_CREATE_KERNEL, 1, 0);
            request.extend_from_slice(&coin.output_id.0);
            request.extend_from_slice(&coin.shared_secret.0);
            request.extend_from_slice(&spend_key.0);
            request[4] = (request.len() - 5) as u8;
            let response = transport.exchange(&request)?;
            let mut r = Reader::new(&response);
            inputs.push(Input {
                features: r.u8()?,
                output_id: crate::tx::OutputId(r.array()?),
                commitment: crate::mw::switch_commit(&coin.blind, coin.value)?,
                input_pubkey: PublicKey(r.array()?),
                output_pubkey: PublicKey(r.array()?),
                signature: Signature(r.array()?),
            });
        }

        // Kernel parameters, streamed in chunks with the continuation flag.
        let mut params = Vec::new();
        params.extend_from_slice(&ctx.fee.to_le_bytes());
        params.extend_from_slice(&ctx.pegin.to_le_bytes());
        params.extend_from_slice(&(ctx.pegouts.len() as u16).to_le_bytes());
        params.extend_from_slice(&ctx.lock_height.to_le_bytes());
        for pegout in &ctx.pegouts {
            pegout.serialize(&mut params);
        }
        let mut rest = params.as_slice();
        while rest.len() > 200 {
            let mut request = header(INS_CREATE_KERNEL, 2, P2_MORE);
            request.extend_from_slice(&rest[..200]);
            request[4] = 200;
            transport.exchange(&request)?;
            rest = &rest[200..];
        }
        let mut request = header(INS_CREATE_KERNEL, 2, 0);
        request.extend_from_slice(rest);
        request[4] = rest.len() as u8;
        let response = transport.exchange(&request)?;

        let mut r = Reader::new(&response);
        let stealth_offset = BlindingFactor(r.array()?);
        let features = r.u8()?;
        let stealth_excess = PublicKey(r.array()?);
        let signature = Signature(r.array()?);

        let kernel = Kernel {
            features: features | KERNEL_STEALTH_EXCESS_FEATURE,
            fee: ctx.fee,
            pegin: ctx.pegin,
            pegouts: ctx.pegouts.clone(),
            lock_height: ctx.lock_height,
            excess: crate::mw::commit(0, &ctx.kernel_excess)?,
            stealth_excess,
            signature,
        };
        Ok(SignedParts {
            inputs,
            kernel,
            stealth_offset,
        })
    }
}
