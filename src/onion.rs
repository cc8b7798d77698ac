//! Layered-encryption onion for the coinswap mixnet.
//!
//! Each mixer hop receives its share of the kernel and stealth blinding
//! factors, its fee, and — on the terminal hop — the swap output itself.
//! Layering is Sphinx-style: one ChaCha20 stream per hop, applied over the
//! hop's own payload and everything after it, so a peel decrypts exactly
//! one payload and leaves the rest re-encrypted for the next hop.
//!
//! Framing is big-endian throughout: a `u64` payload count, then per
//! payload a `u64` length and the ciphertext bytes.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{Error, Result};
use crate::mw::{self, BlindingFactor, Commitment, PublicKey, SecretKey, Signature};
use crate::tx::{Input, Output, OutputId, Reader};

/// HMAC key turning a hop's ECDH secret into its ChaCha20 key.
const HMAC_LABEL: &[u8] = b"MWIXNET";
/// Fixed stream nonce; every hop key is unique, so a fixed nonce is sound.
const NONCE: &[u8; 12] = b"NONCE1234567";

// ── Serde helpers ───────────────────────────────────────────────────

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("wrong byte length"))
    }
}

// ── Types ───────────────────────────────────────────────────────────

/// One mixer hop's routing material.
#[derive(Debug, Clone)]
pub struct Hop {
    /// The hop's X25519 public key.
    pub pubkey: [u8; 32],
    pub kernel_blind: BlindingFactor,
    pub stealth_blind: BlindingFactor,
    pub fee: u64,
    /// Present only on the terminal hop.
    pub output: Option<Output>,
}

/// The input being mixed, bound into the onion by the owner proof.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnionInput {
    pub output_id: OutputId,
    #[serde(rename = "output_commit")]
    pub commitment: Commitment,
    #[serde(rename = "output_pk")]
    pub output_pubkey: PublicKey,
    #[serde(rename = "input_pk")]
    pub input_pubkey: PublicKey,
    #[serde(rename = "input_sig")]
    pub signature: Signature,
}

/// A layered payload stack plus the bundled input it spends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Onion {
    pub input: OnionInput,
    #[serde(rename = "enc_payloads", with = "hex_bytes")]
    pub payloads: Vec<u8>,
    #[serde(rename = "ephemeral_xpub", with = "hex_array")]
    pub ephemeral_pubkey: [u8; 32],
    pub owner_proof: Signature,
}

fn random_secret() -> StaticSecret {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    StaticSecret::from(bytes)
}

fn new_cipher(secret: &[u8; 32]) -> ChaCha20 {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(HMAC_LABEL).expect("hmac accepts any key length");
    mac.update(secret);
    let key: [u8; 32] = mac.finalize().into_bytes().into();
    ChaCha20::new((&key).into(), NONCE.into())
}

impl Onion {
    /// Build an onion for the given hops, innermost layer last.
    pub fn new(hops: &[Hop]) -> Result<Onion> {
        let mut ephemeral = random_secret();
        let ephemeral_pubkey = X25519PublicKey::from(&ephemeral).to_bytes();

        let mut secrets: Vec<[u8; 32]> = Vec::with_capacity(hops.len());
        let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(hops.len());
        for (i, hop) in hops.iter().enumerate() {
            let hop_pub = X25519PublicKey::from(hop.pubkey);
            secrets.push(*ephemeral.diffie_hellman(&hop_pub).as_bytes());

            // The next layer is addressed by a fresh ephemeral key; its
            // public half rides inside this hop's plaintext.
            ephemeral = random_secret();

            let mut buf = Vec::new();
            buf.push(0u8);
            if i + 1 < hops.len() {
                buf.extend_from_slice(X25519PublicKey::from(&ephemeral).as_bytes());
            } else {
                buf.extend_from_slice(&[0u8; 32]);
            }
            buf.extend_from_slice(&hop.kernel_blind.0);
            buf.extend_from_slice(&hop.stealth_blind.0);
            buf.extend_from_slice(&hop.fee.to_be_bytes());
            match &hop.output {
                Some(output) => {
                    buf.push(1);
                    output.serialize(&mut buf);
                }
                None => buf.push(0),
            }
            payloads.push(buf);
        }

        // Innermost first: hop i's stream covers payloads i..last, so after
        // i peels, payloads i+1.. carry exactly the remaining layers.
        for i in (0..payloads.len()).rev() {
            let mut cipher = new_cipher(&secrets[i]);
            for payload in payloads[i..].iter_mut() {
                cipher.apply_keystream(payload);
            }
        }

        Ok(Onion {
            input: OnionInput::default(),
            payloads: frame_payloads(&payloads),
            ephemeral_pubkey,
            owner_proof: Signature::default(),
        })
    }

    /// Strip one layer with the hop's private key, revealing that hop's
    /// routing material and the onion for the next hop.
    pub fn peel(&self, privkey: &[u8; 32]) -> Result<(Hop, Onion)> {
        let secret = StaticSecret::from(*privkey);
        let shared = secret.diffie_hellman(&X25519PublicKey::from(self.ephemeral_pubkey));
        let mut cipher = new_cipher(shared.as_bytes());

        let mut r = Reader::new(&self.payloads);
        let count = r
            .u64_be()
            .map_err(|_| Error::DecryptMalformed("missing payload count".into()))?;
        if count == 0 {
            return Err(Error::DecryptMalformed("empty payload stack".into()));
        }

        let mut first: Vec<u8> = Vec::new();
        let mut rest: Vec<Vec<u8>> = Vec::with_capacity(count as usize - 1);
        for i in 0..count {
            let len = r
                .u64_be()
                .map_err(|_| Error::DecryptMalformed("missing payload length".into()))?;
            let mut payload = r
                .take(len as usize)
                .map_err(|_| Error::DecryptMalformed("truncated payload".into()))?
                .to_vec();
            cipher.apply_keystream(&mut payload);
            if i == 0 {
                first = payload;
            } else {
                rest.push(payload);
            }
        }

        let mut p = Reader::new(&first);
        let parse = |_| Error::DecryptMalformed("short payload".into());
        let version = p.u8().map_err(parse)?;
        if version != 0 {
            return Err(Error::WrongOnionVersion(version));
        }
        let next_pub: [u8; 32] = p.array().map_err(parse)?;
        let kernel_blind = BlindingFactor(p.array().map_err(parse)?);
        let stealth_blind = BlindingFactor(p.array().map_err(parse)?);
        let fee = p.u64_be().map_err(parse)?;
        let output = match p.u8().map_err(parse)? {
            0 => None,
            1 => Some(
                Output::deserialize(&mut p)
                    .map_err(|e| Error::DecryptMalformed(e.to_string()))?,
            ),
            other => {
                return Err(Error::DecryptMalformed(format!(
                    "bad optional byte {other}"
                )))
            }
        };

        let hop = Hop {
            pubkey: X25519PublicKey::from(&secret).to_bytes(),
            kernel_blind,
            stealth_blind,
            fee,
            output,
        };
        let next = Onion {
            input: self.input.clone(),
            payloads: frame_payloads(&rest),
            ephemeral_pubkey: next_pub,
            owner_proof: Signature::default(),
        };
        Ok((hop, next))
    }

    /// Bind the spent input to this onion with an owner proof: a signature
    /// under the spend key tweaked by the hash of the input's key pair.
    pub fn sign(&mut self, input: &Input, spend_key: &SecretKey) -> Result<()> {
        self.input = OnionInput {
            output_id: input.output_id,
            commitment: input.commitment,
            output_pubkey: input.output_pubkey,
            input_pubkey: input.input_pubkey,
            signature: input.signature,
        };
        let key = spend_key.mul(&self.owner_tweak());
        self.owner_proof = mw::sign(&key, &self.proof_message())?;
        Ok(())
    }

    /// Check the owner proof against the bundled input's output key.
    pub fn verify_owner(&self) -> bool {
        let Ok(pubkey) = self.input.output_pubkey.mul(&self.owner_tweak()) else {
            return false;
        };
        mw::verify(&self.owner_proof, &pubkey, &self.proof_message())
    }

    fn owner_tweak(&self) -> SecretKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.input.input_pubkey.0);
        hasher.update(&self.input.output_pubkey.0);
        SecretKey(*hasher.finalize().as_bytes())
    }

    fn proof_message(&self) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(&self.input.output_id.0);
        msg.extend_from_slice(&self.input.commitment.0);
        msg.extend_from_slice(&self.input.output_pubkey.0);
        msg.extend_from_slice(&self.input.input_pubkey.0);
        msg.extend_from_slice(&self.input.signature.0);
        msg.extend_from_slice(&self.payloads);
        msg.extend_from_slice(&self.ephemeral_pubkey);
        msg
    }

    /// Number of remaining layers.
    pub fn hops_remaining(&self) -> Result<u64> {
        let mut r = Reader::new(&self.payloads);
        r.u64_be()
            .map_err(|_| Error::DecryptMalformed("missing payload count".into()))
    }
}

fn frame_payloads(payloads: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = payloads.iter().map(|p| 8 + p.len()).sum();
    let mut framed = Vec::with_capacity(8 + total);
    framed.extend_from_slice(&(payloads.len() as u64).to_be_bytes());
    for payload in payloads {
        framed.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        framed.extend_from_slice(payload);
    }
    framed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{create_output, sign_output, Recipient};
    use crate::mw::Keychain;

    struct TestHops {
        server_keys: Vec<StaticSecret>,
        hops: Vec<Hop>,
    }

    fn make_hops(n: usize, fee: u64, output: Option<Output>) -> TestHops {
        let mut server_keys = Vec::new();
        let mut hops = Vec::new();
        for i in 0..n {
            let key = random_secret();
            hops.push(Hop {
                pubkey: X25519PublicKey::from(&key).to_bytes(),
                kernel_blind: BlindingFactor::random(),
                stealth_blind: BlindingFactor::random(),
                fee,
                output: if i == n - 1 { output.clone() } else { None },
            });
            server_keys.push(key);
        }
        TestHops { server_keys, hops }
    }

    fn terminal_output() -> Output {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let recipient = Recipient {
            value: 990,
            address: kc.address(0).unwrap(),
        };
        let sender = SecretKey::random();
        let (mut output, _, _) = create_output(&recipient, &sender).unwrap();
        sign_output(&mut output, &sender).unwrap();
        output
    }

    #[test]
    fn five_hop_roundtrip() {
        let output = terminal_output();
        let t = make_hops(5, 2, Some(output.clone()));
        let mut onion = Onion::new(&t.hops).unwrap();

        for (i, key) in t.server_keys.iter().enumerate() {
            assert_eq!(onion.hops_remaining().unwrap(), (5 - i) as u64);
            let (hop, next) = onion.peel(key.as_bytes()).unwrap();
            assert_eq!(hop.kernel_blind, t.hops[i].kernel_blind);
            assert_eq!(hop.stealth_blind, t.hops[i].stealth_blind);
            assert_eq!(hop.fee, 2);
            if i == 4 {
                assert_eq!(hop.output.as_ref(), Some(&output));
            } else {
                assert!(hop.output.is_none());
            }
            onion = next;
        }
        assert_eq!(onion.hops_remaining().unwrap(), 0);
        assert_eq!(onion.ephemeral_pubkey, [0u8; 32]);
    }

    #[test]
    fn residual_carries_plaintext_next_pub() {
        let t = make_hops(2, 1, None);
        let onion = Onion::new(&t.hops).unwrap();
        let (_, next) = onion.peel(t.server_keys[0].as_bytes()).unwrap();
        // The second hop must be able to peel using the advertised key.
        assert_ne!(next.ephemeral_pubkey, [0u8; 32]);
        let (hop, _) = next.peel(t.server_keys[1].as_bytes()).unwrap();
        assert_eq!(hop.kernel_blind, t.hops[1].kernel_blind);
    }

    #[test]
    fn wrong_key_fails_to_peel() {
        let t = make_hops(3, 1, None);
        let onion = Onion::new(&t.hops).unwrap();
        let wrong = random_secret();
        assert!(onion.peel(wrong.as_bytes()).is_err());
    }

    #[test]
    fn out_of_order_peel_fails() {
        let t = make_hops(3, 1, None);
        let onion = Onion::new(&t.hops).unwrap();
        assert!(onion.peel(t.server_keys[1].as_bytes()).is_err());
    }

    #[test]
    fn owner_proof_binds_input_and_payloads() {
        let kc = Keychain::new(SecretKey::random(), SecretKey::random()).unwrap();
        let output = terminal_output();
        let t = make_hops(2, 1, Some(output));
        let mut onion = Onion::new(&t.hops).unwrap();

        let spend_key = kc.spend_key(0).unwrap();
        let input = Input {
            features: 0,
            output_id: OutputId([7; 32]),
            commitment: mw::commit(100, &BlindingFactor::random()).unwrap(),
            input_pubkey: SecretKey::random().public_key().unwrap(),
            output_pubkey: spend_key.public_key().unwrap(),
            signature: Signature([3; 64]),
        };
        onion.sign(&input, &spend_key).unwrap();
        assert!(onion.verify_owner());

        let mut tampered = onion.clone();
        tampered.payloads[20] ^= 1;
        assert!(!tampered.verify_owner());
    }

    #[test]
    fn json_form_uses_hex_fields() {
        let t = make_hops(1, 3, None);
        let onion = Onion::new(&t.hops).unwrap();
        let value: serde_json::Value = serde_json::to_value(&onion).unwrap();
        assert!(value["enc_payloads"].is_string());
        assert_eq!(value["ephemeral_xpub"].as_str().unwrap().len(), 64);
        assert!(value["input"]["output_commit"].is_string());
        assert!(value["input"]["input_sig"].is_string());

        let back: Onion = serde_json::from_value(value).unwrap();
        assert_eq!(back, onion);
    }
}
