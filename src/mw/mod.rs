//! Curve and commitment primitives for the extension block.
//!
//! Thin byte-oriented wrappers over the Pedersen/aggsig engine. Scalars are
//! raw 32-byte values so that zero is representable (blinding factors sum to
//! zero legitimately) and so they can serve as map keys; conversion into the
//! backing library happens per operation, which also keeps the `Secp256k1`
//! context local to each call.

use rand::RngCore;
use secp::pedersen;
use secp::{aggsig, ContextFlag, Message, Secp256k1};

use crate::error::{Error, Result};

pub mod keychain;

pub use keychain::{Keychain, StealthAddress};

/// Curve order minus one; multiplying a point by it negates the point.
const MINUS_ONE: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36,
    0x41, 0x40,
];

// ── Byte newtypes ───────────────────────────────────────────────────

/// A secret scalar modulo the curve order. Zero is a valid value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SecretKey(pub [u8; 32]);

/// A blinding factor, pre- or post-switch depending on context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlindingFactor(pub [u8; 32]);

/// A compressed curve point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 33]);

/// A Pedersen commitment `v·H + r·G` in compressed form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Commitment(pub [u8; 33]);

/// A 64-byte Schnorr signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl std::fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BlindingFactor(..)")
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Commitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Commitment({})", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

impl Default for Signature {
    fn default() -> Self {
        Signature([0; 64])
    }
}

impl Default for PublicKey {
    fn default() -> Self {
        PublicKey([0; 33])
    }
}

impl Default for Commitment {
    fn default() -> Self {
        Commitment([0; 33])
    }
}

macro_rules! hex_serde {
    ($ty:ident, $len:expr) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom(concat!("expected ", $len, " bytes")))?;
                Ok($ty(arr))
            }
        }
    };
}

hex_serde!(SecretKey, 32);
hex_serde!(BlindingFactor, 32);
hex_serde!(PublicKey, 33);
hex_serde!(Commitment, 33);
hex_serde!(Signature, 64);

// ── Context + conversion helpers ────────────────────────────────────

fn ctx() -> Secp256k1 {
    Secp256k1::with_caps(ContextFlag::Commit)
}

/// Convert a raw scalar into the backing type; `None` for zero. Hash-derived
/// scalars are taken as already canonical, matching the wire convention.
fn to_secp(secp: &Secp256k1, bytes: &[u8; 32]) -> Option<secp::key::SecretKey> {
    if bytes.iter().all(|b| *b == 0) {
        return None;
    }
    secp::key::SecretKey::from_slice(secp, bytes).ok()
}

fn pk_to_secp(secp: &Secp256k1, bytes: &[u8; 33]) -> Result<secp::key::PublicKey> {
    secp::key::PublicKey::from_slice(secp, bytes).map_err(Error::from)
}

fn pk_from_secp(secp: &Secp256k1, pk: &secp::key::PublicKey) -> PublicKey {
    let ser = pk.serialize_vec(secp, true);
    let mut out = [0u8; 33];
    out.copy_from_slice(&ser[..]);
    PublicKey(out)
}

/// Sum of scalars modulo the order; a zero result is returned as the zero
/// scalar rather than an error.
fn scalar_sum(positive: &[[u8; 32]], negative: &[[u8; 32]]) -> SecretKey {
    let secp = ctx();
    let pos: Vec<_> = positive.iter().filter_map(|b| to_secp(&secp, b)).collect();
    let neg: Vec<_> = negative.iter().filter_map(|b| to_secp(&secp, b)).collect();
    if pos.is_empty() && neg.is_empty() {
        return SecretKey([0; 32]);
    }
    match secp.blind_sum(pos, neg) {
        Ok(sum) => SecretKey(sum.0),
        Err(_) => SecretKey([0; 32]),
    }
}

// ── Scalar operations ───────────────────────────────────────────────

impl SecretKey {
    pub const ZERO: SecretKey = SecretKey([0; 32]);

    /// Draw a uniformly random nonzero scalar.
    pub fn random() -> SecretKey {
        let secp = ctx();
        let mut rng = rand::thread_rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            if secp::key::SecretKey::from_slice(&secp, &bytes).is_ok() {
                return SecretKey(bytes);
            }
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> SecretKey {
        SecretKey(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn add(&self, other: &SecretKey) -> SecretKey {
        scalar_sum(&[self.0, other.0], &[])
    }

    pub fn sub(&self, other: &SecretKey) -> SecretKey {
        scalar_sum(&[self.0], &[other.0])
    }

    pub fn neg(&self) -> SecretKey {
        scalar_sum(&[], &[self.0])
    }

    pub fn mul(&self, other: &SecretKey) -> SecretKey {
        let secp = ctx();
        let (Some(mut a), Some(b)) = (to_secp(&secp, &self.0), to_secp(&secp, &other.0)) else {
            return SecretKey::ZERO;
        };
        match a.mul_assign(&secp, &b) {
            Ok(()) => SecretKey(a.0),
            Err(_) => SecretKey::ZERO,
        }
    }

    /// The point `self·G`. Fails for the zero scalar, which has no
    /// representable public key.
    pub fn public_key(&self) -> Result<PublicKey> {
        let secp = ctx();
        let sk = to_secp(&secp, &self.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
        let pk = secp::key::PublicKey::from_secret_key(&secp, &sk)?;
        Ok(pk_from_secp(&secp, &pk))
    }
}

impl BlindingFactor {
    pub const ZERO: BlindingFactor = BlindingFactor([0; 32]);

    pub fn random() -> BlindingFactor {
        BlindingFactor(SecretKey::random().0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn add(&self, other: &BlindingFactor) -> BlindingFactor {
        BlindingFactor(scalar_sum(&[self.0, other.0], &[]).0)
    }

    pub fn sub(&self, other: &BlindingFactor) -> BlindingFactor {
        BlindingFactor(scalar_sum(&[self.0], &[other.0]).0)
    }

    pub fn as_secret(&self) -> SecretKey {
        SecretKey(self.0)
    }
}

/// Sum a set of blinding factors: `Σ positive − Σ negative`.
pub fn blind_sum(positive: &[BlindingFactor], negative: &[BlindingFactor]) -> BlindingFactor {
    let pos: Vec<[u8; 32]> = positive.iter().map(|b| b.0).collect();
    let neg: Vec<[u8; 32]> = negative.iter().map(|b| b.0).collect();
    BlindingFactor(scalar_sum(&pos, &neg).0)
}

/// Sum a set of secret keys: `Σ positive − Σ negative`.
pub fn key_sum(positive: &[SecretKey], negative: &[SecretKey]) -> SecretKey {
    let pos: Vec<[u8; 32]> = positive.iter().map(|k| k.0).collect();
    let neg: Vec<[u8; 32]> = negative.iter().map(|k| k.0).collect();
    scalar_sum(&pos, &neg)
}

// ── Point operations ────────────────────────────────────────────────

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 33]) -> PublicKey {
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn add(&self, other: &PublicKey) -> Result<PublicKey> {
        let secp = ctx();
        let a = pk_to_secp(&secp, &self.0)?;
        let b = pk_to_secp(&secp, &other.0)?;
        let sum = secp::key::PublicKey::from_combination(&secp, vec![&a, &b])?;
        Ok(pk_from_secp(&secp, &sum))
    }

    pub fn sub(&self, other: &PublicKey) -> Result<PublicKey> {
        self.add(&other.neg()?)
    }

    pub fn neg(&self) -> Result<PublicKey> {
        self.mul(&SecretKey(MINUS_ONE))
    }

    /// Scalar multiplication `k·P`.
    pub fn mul(&self, scalar: &SecretKey) -> Result<PublicKey> {
        let secp = ctx();
        let mut p = pk_to_secp(&secp, &self.0)?;
        let k = to_secp(&secp, &scalar.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
        p.mul_assign(&secp, &k)?;
        Ok(pk_from_secp(&secp, &p))
    }

    /// The point `P + k·G`.
    pub fn add_scalar(&self, scalar: &SecretKey) -> Result<PublicKey> {
        if scalar.is_zero() {
            return Ok(*self);
        }
        let secp = ctx();
        let mut p = pk_to_secp(&secp, &self.0)?;
        let k = to_secp(&secp, &scalar.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
        p.add_exp_assign(&secp, &k)?;
        Ok(pk_from_secp(&secp, &p))
    }

    /// The point `P − k·G`.
    pub fn sub_scalar(&self, scalar: &SecretKey) -> Result<PublicKey> {
        self.add_scalar(&scalar.neg())
    }
}

// ── Commitments ─────────────────────────────────────────────────────

impl Commitment {
    pub fn from_bytes(bytes: [u8; 33]) -> Commitment {
        Commitment(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn to_public_key(&self) -> Result<PublicKey> {
        let secp = ctx();
        let commit = pedersen::Commitment(self.0);
        let pk = commit.to_pubkey(&secp)?;
        Ok(pk_from_secp(&secp, &pk))
    }
}

/// Pedersen commitment `value·H + blind·G`. Either part may be zero, but not
/// both (the identity point has no compressed encoding).
pub fn commit(value: u64, blind: &BlindingFactor) -> Result<Commitment> {
    let secp = ctx();
    let commit = match to_secp(&secp, &blind.0) {
        Some(b) => secp.commit(value, b)?,
        None => secp.commit_value(value)?,
    };
    Ok(Commitment(commit.0))
}

/// `Σ positive − Σ negative` over commitments.
pub fn commit_sum(positive: &[Commitment], negative: &[Commitment]) -> Result<Commitment> {
    let secp = ctx();
    let pos: Vec<_> = positive.iter().map(|c| pedersen::Commitment(c.0)).collect();
    let neg: Vec<_> = negative.iter().map(|c| pedersen::Commitment(c.0)).collect();
    let sum = secp.commit_sum(pos, neg)?;
    Ok(Commitment(sum.0))
}

/// Switch commitment blind for `(blind, value)`; committing to the switched
/// blind binds the value into the blinding factor.
pub fn switch(blind: &BlindingFactor, value: u64) -> Result<BlindingFactor> {
    let secp = ctx();
    let b = to_secp(&secp, &blind.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
    let switched = secp.blind_switch(value, b)?;
    Ok(BlindingFactor(switched.0))
}

/// Convenience: the switch commitment itself.
pub fn switch_commit(blind: &BlindingFactor, value: u64) -> Result<Commitment> {
    commit(value, &switch(blind, value)?)
}

// ── Range proofs ────────────────────────────────────────────────────

/// Produce a range proof for `value` under the (already switched) blind,
/// committing to `extra_data`.
pub fn range_proof(
    value: u64,
    blind: &BlindingFactor,
    nonce: &SecretKey,
    extra_data: &[u8],
) -> Result<Vec<u8>> {
    let secp = Secp256k1::with_caps(ContextFlag::Commit);
    let b = to_secp(&secp, &blind.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
    let n = to_secp(&secp, &nonce.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
    let proof = secp.bullet_proof(value, b, n.clone(), n, Some(extra_data.to_vec()), None);
    Ok(proof.proof[..proof.plen].to_vec())
}

/// Verify a range proof against its commitment and bound extra data.
pub fn verify_range_proof(commitment: &Commitment, proof: &[u8], extra_data: &[u8]) -> bool {
    let secp = Secp256k1::with_caps(ContextFlag::Commit);
    if proof.len() > secp::constants::MAX_PROOF_SIZE {
        return false;
    }
    let mut raw = pedersen::RangeProof {
        proof: [0; secp::constants::MAX_PROOF_SIZE],
        plen: proof.len(),
    };
    raw.proof[..proof.len()].copy_from_slice(proof);
    secp.verify_bullet_proof(pedersen::Commitment(commitment.0), raw, Some(extra_data.to_vec()))
        .is_ok()
}

// ── Schnorr signatures ──────────────────────────────────────────────

fn message_for(msg: &[u8]) -> Result<Message> {
    let digest = blake3::hash(msg);
    Message::from_slice(digest.as_bytes()).map_err(Error::from)
}

/// Schnorr-sign `blake3(msg)` with `key`.
pub fn sign(key: &SecretKey, msg: &[u8]) -> Result<Signature> {
    let secp = Secp256k1::with_caps(ContextFlag::Full);
    let sk = to_secp(&secp, &key.0).ok_or(Error::Curve(secp::Error::InvalidSecretKey))?;
    let m = message_for(msg)?;
    let sig = aggsig::sign_single(&secp, &m, &sk, None, None, None, None, None)?;
    Ok(Signature(sig.to_raw_data()))
}

/// Verify a signature produced by [`sign`].
pub fn verify(sig: &Signature, pubkey: &PublicKey, msg: &[u8]) -> bool {
    let secp = Secp256k1::with_caps(ContextFlag::Full);
    let Ok(m) = message_for(msg) else {
        return false;
    };
    let Ok(raw) = secp::Signature::from_raw_data(&sig.0) else {
        return false;
    };
    let Ok(pk) = pk_to_secp(&secp, &pubkey.0) else {
        return false;
    };
    aggsig::verify_single(&secp, &raw, &m, None, &pk, Some(&pk), None, false)
}

/// Challenge scalar binding a kernel's stealth excess to its excess.
pub fn stealth_challenge(excess: &Commitment, stealth_excess: &PublicKey) -> SecretKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&excess.0);
    hasher.update(&stealth_excess.0);
    SecretKey(*hasher.finalize().as_bytes())
}

// ── Tagged hashing ──────────────────────────────────────────────────

/// Domain tags for the single-byte-prefixed BLAKE3 hashes used throughout
/// output construction and rewind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashTag {
    Blind,
    Derive,
    Nonce,
    OutKey,
    SendKey,
    ViewTag,
    ValueMask,
    NonceMask,
    Address,
}

impl HashTag {
    fn byte(self) -> u8 {
        match self {
            HashTag::Blind => 0,
            HashTag::Derive => 1,
            HashTag::Nonce => 2,
            HashTag::OutKey => 3,
            HashTag::SendKey => 4,
            HashTag::ViewTag => 5,
            HashTag::ValueMask => 6,
            HashTag::NonceMask => 7,
            HashTag::Address => 8,
        }
    }
}

/// `blake3(tag ‖ data)`.
pub fn hashed(tag: HashTag, data: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag.byte()]);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// A tagged hash interpreted as a scalar.
pub fn hashed_scalar(tag: HashTag, data: &[u8]) -> SecretKey {
    SecretKey(hashed(tag, data))
}

/// ECDH between a secret scalar and a point: the compressed `k·P`.
pub fn ecdh(key: &SecretKey, point: &PublicKey) -> Result<[u8; 33]> {
    Ok(point.mul(key)?.0)
}

// ── Tests ───────────────────────────────────────────────────────────
