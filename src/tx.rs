//! Extension-block transaction wire model.
//!
//! Bit-exact serialization for outputs, inputs, kernels and full
//! transactions, plus the canonical body ordering applied before broadcast.
//! Integers are little-endian on the transaction wire; the onion and device
//! protocols fix their own endianness separately.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mw::{BlindingFactor, Commitment, PublicKey, Signature};

// ── Feature bits ────────────────────────────────────────────────────

/// Output message carries the standard field set.
pub const OUTPUT_MSG_STANDARD_FIELDS: u8 = 0x01;

pub const KERNEL_FEE_FEATURE: u8 = 0x01;
pub const KERNEL_PEGIN_FEATURE: u8 = 0x02;
pub const KERNEL_PEGOUT_FEATURE: u8 = 0x04;
pub const KERNEL_HEIGHT_LOCK_FEATURE: u8 = 0x08;
pub const KERNEL_STEALTH_EXCESS_FEATURE: u8 = 0x10;

// ── Output identifiers ──────────────────────────────────────────────

/// BLAKE3 identifier of an output. On-wire identifiers sometimes arrive
/// byte-reversed, so both views stay available; nothing canonicalizes
/// silently.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct OutputId(pub [u8; 32]);

impl OutputId {
    pub fn from_bytes(bytes: [u8; 32]) -> OutputId {
        OutputId(bytes)
    }

    pub fn from_hex(s: &str) -> Result<OutputId> {
        let bytes = hex::decode(s).map_err(|e| Error::Serialization(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Serialization("output id must be 32 bytes".into()))?;
        Ok(OutputId(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The same identifier with byte order reversed.
    pub fn reversed(&self) -> OutputId {
        let mut bytes = self.0;
        bytes.reverse();
        OutputId(bytes)
    }
}

impl std::fmt::Debug for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OutputId({})", self.to_hex())
    }
}

impl std::fmt::Display for OutputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for OutputId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for OutputId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OutputId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Byte reader ─────────────────────────────────────────────────────

/// Minimal cursor for fixed-layout decoding.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Serialization("unexpected end of data".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn u64_be(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

// ── Output ──────────────────────────────────────────────────────────

/// The encrypted note a sender attaches to an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub features: u8,
    pub key_exchange_pubkey: PublicKey,
    pub view_tag: u8,
    pub masked_value: u64,
    pub masked_nonce: [u8; 16],
}

impl OutputMessage {
    pub const SERIALIZED_SIZE: usize = 1 + 33 + 1 + 8 + 16;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(self.features);
        buf.extend_from_slice(&self.key_exchange_pubkey.0);
        buf.push(self.view_tag);
        buf.extend_from_slice(&self.masked_value.to_le_bytes());
        buf.extend_from_slice(&self.masked_nonce);
    }

    pub(crate) fn deserialize(r: &mut Reader<'_>) -> Result<OutputMessage> {
        Ok(OutputMessage {
            features: r.u8()?,
            key_exchange_pubkey: PublicKey(r.array()?),
            view_tag: r.u8()?,
            masked_value: r.u64_le()?,
            masked_nonce: r.array()?,
        })
    }
}

/// An on-chain confidential output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub commitment: Commitment,
    pub sender_pubkey: PublicKey,
    pub receiver_pubkey: PublicKey,
    pub message: OutputMessage,
    #[serde(with = "crate::onion::hex_bytes")]
    pub range_proof: Vec<u8>,
    #[serde(with = "crate::onion::hex_array")]
    pub range_proof_hash: [u8; 32],
    pub signature: Signature,
}

impl Output {
    fn id_preimage(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(33 * 3 + OutputMessage::SERIALIZED_SIZE + 32);
        buf.extend_from_slice(&self.commitment.0);
        buf.extend_from_slice(&self.sender_pubkey.0);
        buf.extend_from_slice(&self.receiver_pubkey.0);
        self.message.serialize(&mut buf);
        buf.extend_from_slice(&self.range_proof_hash);
        buf
    }

    /// Message covered by the output signature: everything but the proof
    /// body and the signature itself.
    pub fn signing_message(&self) -> Vec<u8> {
        self.id_preimage()
    }

    /// The output identifier: BLAKE3 over the output with the range proof
    /// replaced by its hash.
    pub fn id(&self) -> OutputId {
        let mut buf = self.id_preimage();
        buf.extend_from_slice(&self.signature.0);
        OutputId(*blake3::hash(&buf).as_bytes())
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.commitment.0);
        buf.extend_from_slice(&self.sender_pubkey.0);
        buf.extend_from_slice(&self.receiver_pubkey.0);
        self.message.serialize(buf);
        buf.extend_from_slice(&(self.range_proof.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.range_proof);
        buf.extend_from_slice(&self.range_proof_hash);
        buf.extend_from_slice(&self.signature.0);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        buf
    }

    pub(crate) fn deserialize(r: &mut Reader<'_>) -> Result<Output> {
        let commitment = Commitment(r.array()?);
        let sender_pubkey = PublicKey(r.array()?);
        let receiver_pubkey = PublicKey(r.array()?);
        let message = OutputMessage::deserialize(r)?;
        let proof_len = r.u32_le()? as usize;
        let range_proof = r.take(proof_len)?.to_vec();
        let range_proof_hash = r.array()?;
        let signature = Signature(r.array()?);
        Ok(Output {
            commitment,
            sender_pubkey,
            receiver_pubkey,
            message,
            range_proof,
            range_proof_hash,
            signature,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Output> {
        Output::deserialize(&mut Reader::new(bytes))
    }
}

// ── Input ───────────────────────────────────────────────────────────

/// A spend of a confidential output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub features: u8,
    pub output_id: OutputId,
    pub commitment: Commitment,
    pub input_pubkey: PublicKey,
    pub output_pubkey: PublicKey,
    pub signature: Signature,
}

impl Input {
    /// Message covered by the input signature.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 32 + 33 * 3);
        buf.push(self.features);
        buf.extend_from_slice(&self.output_id.0);
        buf.extend_from_slice(&self.commitment.0);
        buf.extend_from_slice(&self.input_pubkey.0);
        buf.extend_from_slice(&self.output_pubkey.0);
        buf
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(self.features);
        buf.extend_from_slice(&self.output_id.0);
        buf.extend_from_slice(&self.commitment.0);
        buf.extend_from_slice(&self.input_pubkey.0);
        buf.extend_from_slice(&self.output_pubkey.0);
        buf.extend_from_slice(&self.signature.0);
    }

    pub(crate) fn deserialize(r: &mut Reader<'_>) -> Result<Input> {
        Ok(Input {
            features: r.u8()?,
            output_id: OutputId(r.array()?),
            commitment: Commitment(r.array()?),
            input_pubkey: PublicKey(r.array()?),
            output_pubkey: PublicKey(r.array()?),
            signature: Signature(r.array()?),
        })
    }
}

// ── Kernel ──────────────────────────────────────────────────────────

/// A base-chain output produced by a peg-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    #[serde(with = "crate::onion::hex_bytes")]
    pub script: Vec<u8>,
}

impl TxOut {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.extend_from_slice(&(self.script.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.script);
    }

    pub(crate) fn deserialize(r: &mut Reader<'_>) -> Result<TxOut> {
        let value = r.u64_le()?;
        let len = r.u32_le()? as usize;
        Ok(TxOut {
            value,
            script: r.take(len)?.to_vec(),
        })
    }

    /// Approximate serialized size on the base chain, used by fee
    /// estimation.
    pub fn serialized_size(&self) -> usize {
        8 + 1 + self.script.len()
    }
}

/// The transaction-level proof: fee, peg movements and aggregate excesses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    pub features: u8,
    pub fee: u64,
    pub pegin: u64,
    pub pegouts: Vec<TxOut>,
    pub lock_height: u32,
    pub excess: Commitment,
    pub stealth_excess: PublicKey,
    pub signature: Signature,
}

impl Kernel {
    /// Message covered by the kernel signature.
    pub fn message(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.features);
        buf.extend_from_slice(&self.fee.to_le_bytes());
        buf.extend_from_slice(&self.pegin.to_le_bytes());
        buf.extend_from_slice(&(self.pegouts.len() as u32).to_le_bytes());
        for pegout in &self.pegouts {
            pegout.serialize(&mut buf);
        }
        buf.extend_from_slice(&self.lock_height.to_le_bytes());
        buf.extend_from_slice(&self.excess.0);
        buf.extend_from_slice(&self.stealth_excess.0);
        buf
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.push(self.features);
        buf.extend_from_slice(&self.fee.to_le_bytes());
        buf.extend_from_slice(&self.pegin.to_le_bytes());
        buf.extend_from_slice(&(self.pegouts.len() as u32).to_le_bytes());
        for pegout in &self.pegouts {
            pegout.serialize(buf);
        }
        buf.extend_from_slice(&self.lock_height.to_le_bytes());
        buf.extend_from_slice(&self.excess.0);
        buf.extend_from_slice(&self.stealth_excess.0);
        buf.extend_from_slice(&self.signature.0);
    }

    pub(crate) fn deserialize(r: &mut Reader<'_>) -> Result<Kernel> {
        let features = r.u8()?;
        let fee = r.u64_le()?;
        let pegin = r.u64_le()?;
        let count = r.u32_le()? as usize;
        let mut pegouts = Vec::with_capacity(count);
        for _ in 0..count {
            pegouts.push(TxOut::deserialize(r)?);
        }
        Ok(Kernel {
            features,
            fee,
            pegin,
            pegouts,
            lock_height: r.u32_le()?,
            excess: Commitment(r.array()?),
            stealth_excess: PublicKey(r.array()?),
            signature: Signature(r.array()?),
        })
    }
}

// ── Transaction ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxBody {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<Kernel>,
}

impl TxBody {
    /// Canonical ordering: inputs by spent output id, outputs by
    /// commitment, kernels by excess.
    pub fn sort(&mut self) {
        self.inputs.sort_by(|a, b| a.output_id.0.cmp(&b.output_id.0));
        self.outputs.sort_by(|a, b| a.commitment.0.cmp(&b.commitment.0));
        self.kernels.sort_by(|a, b| a.excess.0.cmp(&b.excess.0));
    }
}

/// A complete extension-block transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub kernel_offset: BlindingFactor,
    pub stealth_offset: BlindingFactor,
    pub body: TxBody,
}

impl Tx {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.kernel_offset.0);
        buf.extend_from_slice(&self.stealth_offset.0);
        buf.extend_from_slice(&(self.body.inputs.len() as u32).to_le_bytes());
        for input in &self.body.inputs {
            input.serialize(buf);
        }
        buf.extend_from_slice(&(self.body.outputs.len() as u32).to_le_bytes());
        for output in &self.body.outputs {
            output.serialize(buf);
        }
        buf.extend_from_slice(&(self.body.kernels.len() as u32).to_le_bytes());
        for kernel in &self.body.kernels {
            kernel.serialize(buf);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize(&mut buf);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Tx> {
        let mut r = Reader::new(bytes);
        let kernel_offset = BlindingFactor(r.array()?);
        let stealth_offset = BlindingFactor(r.array()?);
        let input_count = r.u32_le()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(Input::deserialize(&mut r)?);
        }
        let output_count = r.u32_le()? as usize;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(Output::deserialize(&mut r)?);
        }
        let kernel_count = r.u32_le()? as usize;
        let mut kernels = Vec::with_capacity(kernel_count);
        for _ in 0..kernel_count {
            kernels.push(Kernel::deserialize(&mut r)?);
        }
        if r.remaining() != 0 {
            return Err(Error::Serialization("trailing bytes after transaction".into()));
        }
        Ok(Tx {
            kernel_offset,
            stealth_offset,
            body: TxBody {
                inputs,
                outputs,
                kernels,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_output(tag: u8) -> Output {
        Output {
            commitment: Commitment([tag; 33]),
            sender_pubkey: PublicKey([2; 33]),
            receiver_pubkey: PublicKey([3; 33]),
            message: OutputMessage {
                features: OUTPUT_MSG_STANDARD_FIELDS,
                key_exchange_pubkey: PublicKey([4; 33]),
                view_tag: 7,
                masked_value: 0xdead_beef,
                masked_nonce: [9; 16],
            },
            range_proof: vec![1, 2, 3, 4],
            range_proof_hash: [5; 32],
            signature: Signature([6; 64]),
        }
    }

    #[test]
    fn output_roundtrip_and_stable_id() {
        let output = dummy_output(1);
        let decoded = Output::from_bytes(&output.to_bytes()).unwrap();
        assert_eq!(output, decoded);
        assert_eq!(output.id(), decoded.id());
    }

    #[test]
    fn body_sort_is_canonical() {
        let mut body = TxBody {
            inputs: vec![],
            outputs: vec![dummy_output(9), dummy_output(1), dummy_output(4)],
            kernels: vec![],
        };
        body.sort();
        let commits: Vec<u8> = body.outputs.iter().map(|o| o.commitment.0[0]).collect();
        assert_eq!(commits, vec![1, 4, 9]);
    }

    #[test]
    fn reversed_id_is_involutive() {
        let id = OutputId(*blake3::hash(b"x").as_bytes());
        assert_ne!(id, id.reversed());
        assert_eq!(id, id.reversed().reversed());
    }

    #[test]
    fn tx_roundtrip() {
        let tx = Tx {
            kernel_offset: BlindingFactor([1; 32]),
            stealth_offset: BlindingFactor([2; 32]),
            body: TxBody {
                inputs: vec![Input {
                    features: 0,
                    output_id: OutputId([3; 32]),
                    commitment: Commitment([4; 33]),
                    input_pubkey: PublicKey([5; 33]),
                    output_pubkey: PublicKey([6; 33]),
                    signature: Signature([7; 64]),
                }],
                outputs: vec![dummy_output(8)],
                kernels: vec![Kernel {
                    features: KERNEL_FEE_FEATURE | KERNEL_STEALTH_EXCESS_FEATURE,
                    fee: 100,
                    pegin: 0,
                    pegouts: vec![TxOut {
                        value: 50,
                        script: vec![0x51],
                    }],
                    lock_height: 0,
                    excess: Commitment([9; 33]),
                    stealth_excess: PublicKey([10; 33]),
                    signature: Signature([11; 64]),
                }],
            },
        };
        assert_eq!(Tx::from_bytes(&tx.to_bytes()).unwrap(), tx);
    }
}
