//! Confidential transaction assembly.
//!
//! Builds inputs, outputs and the kernel from wallet coins and recipients,
//! balancing Pedersen commitments across the peg boundary. Kernel and input
//! signing goes through the [`KernelSigner`] seam so an external signing
//! device can replace the in-process path.

use crate::error::{Error, Result};
use crate::mw::{
    self, blind_sum, commit, hashed, hashed_scalar, key_sum, range_proof, stealth_challenge,
    switch, BlindingFactor, HashTag, SecretKey, Signature, StealthAddress,
};
use crate::rewind::Coin;
use crate::tx::{
    Input, Kernel, Output, OutputMessage, Tx, TxBody, TxOut, KERNEL_FEE_FEATURE,
    KERNEL_HEIGHT_LOCK_FEATURE, KERNEL_PEGIN_FEATURE, KERNEL_PEGOUT_FEATURE,
    KERNEL_STEALTH_EXCESS_FEATURE, OUTPUT_MSG_STANDARD_FIELDS,
};

// ── Fee model ───────────────────────────────────────────────────────

/// Fee per weight unit, in base units.
pub const BASE_MWEB_FEE: u64 = 100;
pub const KERNEL_WEIGHT: u64 = 2;
pub const STEALTH_EXCESS_WEIGHT: u64 = 1;
pub const KERNEL_WITH_STEALTH_WEIGHT: u64 = KERNEL_WEIGHT + STEALTH_EXCESS_WEIGHT;
pub const STANDARD_OUTPUT_WEIGHT: u64 = 18;
pub const BYTES_PER_WEIGHT: u64 = 42;

/// Estimate the fee for a transaction with `recipients` confidential
/// outputs and the given peg-outs, at `fee_rate_per_kb` for the base-chain
/// bytes.
pub fn estimate_fee(recipients: usize, pegouts: &[TxOut], fee_rate_per_kb: u64) -> u64 {
    let non_mweb_bytes: u64 = pegouts.iter().map(|p| p.serialized_size() as u64).sum();
    let mut fee = (fee_rate_per_kb * non_mweb_bytes).div_ceil(1000);
    fee += KERNEL_WITH_STEALTH_WEIGHT * BASE_MWEB_FEE;
    fee += STANDARD_OUTPUT_WEIGHT * BASE_MWEB_FEE * recipients as u64;
    fee += pegouts
        .iter()
        .map(|p| (p.script.len() as u64).div_ceil(BYTES_PER_WEIGHT) * BASE_MWEB_FEE)
        .sum::<u64>();
    fee
}

// ── Output construction ─────────────────────────────────────────────

/// A confidential payment destination.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub value: u64,
    pub address: StealthAddress,
}

/// Build an (unsigned) output to `recipient` with the sender's ephemeral
/// key. Returns the output, its pre-switch blinding factor, and the shared
/// derive scalar the receiver will recover.
pub fn create_output(
    recipient: &Recipient,
    sender_key: &SecretKey,
) -> Result<(Output, BlindingFactor, SecretKey)> {
    // Key exchange: the receiver computes the same shared point as
    // scan · Ke, since the address scan key is scan · spend.
    let shared = recipient.address.scan.mul(sender_key)?;
    let key_exchange_pubkey = recipient.address.spend.mul(sender_key)?;

    let view_tag = hashed(HashTag::ViewTag, &shared.0)[0];
    let t = hashed_scalar(HashTag::Derive, &shared.0);

    let value_mask = hashed(HashTag::ValueMask, &t.0);
    let mut mask = [0u8; 8];
    mask.copy_from_slice(&value_mask[..8]);
    let masked_value = recipient.value ^ u64::from_le_bytes(mask);

    let nonce = hashed(HashTag::Nonce, &sender_key.0);
    let nonce_mask = hashed(HashTag::NonceMask, &t.0);
    let mut masked_nonce = [0u8; 16];
    for i in 0..16 {
        masked_nonce[i] = nonce[i] ^ nonce_mask[i];
    }

    let blind = BlindingFactor(hashed(HashTag::Blind, &t.0));
    let switched = switch(&blind, recipient.value)?;
    let commitment = commit(recipient.value, &switched)?;

    let tweak = hashed_scalar(HashTag::OutKey, &t.0);
    let receiver_pubkey = recipient.address.spend.add_scalar(&tweak)?;
    let sender_pubkey = sender_key.public_key()?;

    let message = OutputMessage {
        features: OUTPUT_MSG_STANDARD_FIELDS,
        key_exchange_pubkey,
        view_tag,
        masked_value,
        masked_nonce,
    };
    let mut message_bytes = Vec::with_capacity(OutputMessage::SERIALIZED_SIZE);
    message.serialize(&mut message_bytes);

    let proof_nonce = hashed_scalar(HashTag::SendKey, &sender_key.0);
    let proof = range_proof(recipient.value, &switched, &proof_nonce, &message_bytes)?;
    let range_proof_hash = *blake3::hash(&proof).as_bytes();

    Ok((
        Output {
            commitment,
            sender_pubkey,
            receiver_pubkey,
            message,
            range_proof: proof,
            range_proof_hash,
            signature: Signature::default(),
        },
        blind,
        t,
    ))
}

/// Sign an output with the sender key that created it.
pub fn sign_output(output: &mut Output, sender_key: &SecretKey) -> Result<()> {
    output.signature = mw::sign(sender_key, &output.signing_message())?;
    Ok(())
}

/// Verify an output signature against its sender key.
pub fn verify_output(output: &Output) -> bool {
    mw::verify(
        &output.signature,
        &output.sender_pubkey,
        &output.signing_message(),
    )
}

// ── Input construction ──────────────────────────────────────────────

/// Build and sign an input spending `coin` with a fresh per-input key. The
/// coin must have its spend key populated.
pub fn create_input(coin: &Coin, input_key: &SecretKey) -> Result<Input> {
    let spend_key = coin.spend_key.ok_or(Error::MissingSpendKey)?;
    let mut input = Input {
        features: 0,
        output_id: coin.output_id,
        commitment: mw::switch_commit(&coin.blind, coin.value)?,
        input_pubkey: input_key.public_key()?,
        output_pubkey: spend_key.public_key()?,
        signature: Signature::default(),
    };
    let signing_key = input_key.add(&spend_key);
    input.signature = mw::sign(&signing_key, &input.signing_message())?;
    Ok(input)
}

/// Verify an input signature: the key is the sum of the input and output
/// public keys.
pub fn verify_input(input: &Input) -> bool {
    let Ok(pubkey) = input.input_pubkey.add(&input.output_pubkey) else {
        return false;
    };
    mw::verify(&input.signature, &pubkey, &input.signing_message())
}

// ── Kernel construction ─────────────────────────────────────────────

/// Build and sign a kernel. `excess_blind` is the post-offset kernel
/// excess; `stealth_key` the post-offset stealth excess secret.
pub fn create_kernel(
    excess_blind: &BlindingFactor,
    stealth_key: &SecretKey,
    fee: u64,
    pegin: u64,
    pegouts: Vec<TxOut>,
    lock_height: u32,
) -> Result<Kernel> {
    let mut features = KERNEL_STEALTH_EXCESS_FEATURE;
    if fee > 0 {
        features |= KERNEL_FEE_FEATURE;
    }
    if pegin > 0 {
        features |= KERNEL_PEGIN_FEATURE;
    }
    if !pegouts.is_empty() {
        features |= KERNEL_PEGOUT_FEATURE;
    }
    if lock_height > 0 {
        features |= KERNEL_HEIGHT_LOCK_FEATURE;
    }

    let excess = commit(0, excess_blind)?;
    let stealth_excess = stealth_key.public_key()?;

    let mut kernel = Kernel {
        features,
        fee,
        pegin,
        pegouts,
        lock_height,
        excess,
        stealth_excess,
        signature: Signature::default(),
    };

    let challenge = stealth_challenge(&excess, &stealth_excess);
    let signing_key = excess_blind.as_secret().add(&stealth_key.mul(&challenge));
    kernel.signature = mw::sign(&signing_key, &kernel.message())?;
    Ok(kernel)
}

/// Verify a kernel signature against its excess and stealth excess.
pub fn verify_kernel(kernel: &Kernel) -> bool {
    let Ok(excess_pk) = kernel.excess.to_public_key() else {
        return false;
    };
    let challenge = stealth_challenge(&kernel.excess, &kernel.stealth_excess);
    let Ok(shifted) = kernel.stealth_excess.mul(&challenge) else {
        return false;
    };
    let Ok(pubkey) = excess_pk.add(&shifted) else {
        return false;
    };
    mw::verify(&kernel.signature, &pubkey, &kernel.message())
}

// ── Signer seam ─────────────────────────────────────────────────────

/// Everything a signer needs to produce the inputs and kernel.
pub struct SignerContext<'a> {
    pub coins: &'a [Coin],
    /// Sum of the ephemeral sender keys of the new outputs.
    pub output_key_sum: SecretKey,
    /// Post-offset kernel excess blind.
    pub kernel_excess: BlindingFactor,
    pub fee: u64,
    pub pegin: u64,
    pub pegouts: Vec<TxOut>,
    pub lock_height: u32,
}

/// Inputs and kernel produced by a signer, plus the stealth offset it
/// chose.
pub struct SignedParts {
    pub inputs: Vec<Input>,
    pub kernel: Kernel,
    pub stealth_offset: BlindingFactor,
}

/// Capability that turns a signing context into signed transaction parts.
/// The default [`LocalSigner`] does everything in-process; a hardware
/// session drives an external device instead.
pub trait KernelSigner {
    fn sign(&self, ctx: &SignerContext<'_>) -> Result<SignedParts>;
}

/// In-process signer.
pub struct LocalSigner;

impl KernelSigner for LocalSigner {
    fn sign(&self, ctx: &SignerContext<'_>) -> Result<SignedParts> {
        let mut inputs = Vec::with_capacity(ctx.coins.len());
        let mut input_keys = Vec::with_capacity(ctx.coins.len());
        let mut spend_keys = Vec::with_capacity(ctx.coins.len());
        for coin in ctx.coins {
            let input_key = SecretKey::random();
            inputs.push(create_input(coin, &input_key)?);
            input_keys.push(input_key);
            spend_keys.push(coin.spend_key.ok_or(Error::MissingSpendKey)?);
        }

        let mut positive = vec![ctx.output_key_sum];
        positive.extend_from_slice(&input_keys);
        let stealth_total = key_sum(&positive, &spend_keys);

        let stealth_offset = BlindingFactor::random();
        let stealth_key = stealth_total.sub(&stealth_offset.as_secret());

        let kernel = create_kernel(
            &ctx.kernel_excess,
            &stealth_key,
            ctx.fee,
            ctx.pegin,
            ctx.pegouts.clone(),
            ctx.lock_height,
        )?;

        Ok(SignedParts {
            inputs,
            kernel,
            stealth_offset,
        })
    }
}

// ── Transaction assembly ────────────────────────────────────────────

/// Assemble a full transaction from coins and recipients.
///
/// The value balance `Σ inputs + pegin = Σ outputs + fee + Σ pegouts` is a
/// hard invariant; a violation indicates a bug in the caller's accounting
/// and aborts assembly. Returns the sorted transaction and the wallet's
/// view of the newly created outputs.
pub fn new_transaction(
    coins: &[Coin],
    recipients: &[Recipient],
    fee: u64,
    pegin: u64,
    pegouts: Vec<TxOut>,
    lock_height: u32,
    signer: &dyn KernelSigner,
) -> Result<(Tx, Vec<Coin>)> {
    let input_total: u64 = coins.iter().map(|c| c.value).sum();
    let output_total: u64 = recipients.iter().map(|r| r.value).sum();
    let pegout_total: u64 = pegouts.iter().map(|p| p.value).sum();
    if input_total + pegin != output_total + fee + pegout_total {
        return Err(Error::BalanceViolation {
            inputs: input_total,
            outputs: output_total,
            fee,
            pegin,
            pegouts: pegout_total,
        });
    }

    let mut outputs = Vec::with_capacity(recipients.len());
    let mut new_coins = Vec::with_capacity(recipients.len());
    let mut output_blinds = Vec::with_capacity(recipients.len());
    let mut output_key_sum = SecretKey::ZERO;
    for recipient in recipients {
        let sender_key = SecretKey::random();
        let (mut output, blind, shared) = create_output(recipient, &sender_key)?;
        sign_output(&mut output, &sender_key)?;
        output_blinds.push(switch(&blind, recipient.value)?);
        output_key_sum = output_key_sum.add(&sender_key);
        new_coins.push(Coin {
            blind,
            value: recipient.value,
            output_id: output.id(),
            address: recipient.address,
            shared_secret: shared,
            spend_key: None,
        });
        outputs.push(output);
    }

    let mut input_blinds = Vec::with_capacity(coins.len());
    for coin in coins {
        input_blinds.push(switch(&coin.blind, coin.value)?);
    }

    let kernel_offset = BlindingFactor::random();
    let mut negatives = input_blinds;
    negatives.push(kernel_offset);
    let kernel_excess = blind_sum(&output_blinds, &negatives);

    let parts = signer.sign(&SignerContext {
        coins,
        output_key_sum,
        kernel_excess,
        fee,
        pegin,
        pegouts,
        lock_height,
    })?;

    let mut body = TxBody {
        inputs: parts.inputs,
        outputs,
        kernels: vec![parts.kernel],
    };
    body.sort();

    Ok((
        Tx {
            kernel_offset,
            stealth_offset: parts.stealth_offset,
            body,
        },
        new_coins,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mw::{commit_sum, Keychain};
    use crate::rewind::rewind_output;
    use crate::testing::fund_coin;

    fn keychain() -> Keychain {
        Keychain::new(SecretKey::random(), SecretKey::random()).unwrap()
    }

    #[test]
    fn fee_estimate_components() {
        // One recipient, no pegouts: one kernel + one output worth of weight.
        let fee = estimate_fee(1, &[], 0);
        assert_eq!(
            fee,
            (KERNEL_WITH_STEALTH_WEIGHT + STANDARD_OUTPUT_WEIGHT) * BASE_MWEB_FEE
        );

        let pegout = TxOut {
            value: 1000,
            script: vec![0; 25],
        };
        let with_pegout = estimate_fee(0, std::slice::from_ref(&pegout), 2000);
        let base_bytes = pegout.serialized_size() as u64;
        let expected = (2000 * base_bytes).div_ceil(1000)
            + KERNEL_WITH_STEALTH_WEIGHT * BASE_MWEB_FEE
            + (25u64).div_ceil(BYTES_PER_WEIGHT) * BASE_MWEB_FEE;
        assert_eq!(with_pegout, expected);
    }

    #[test]
    fn output_signature_verifies() {
        let kc = keychain();
        let sender = SecretKey::random();
        let recipient = Recipient {
            value: 50,
            address: kc.address(0).unwrap(),
        };
        let (mut output, _, _) = create_output(&recipient, &sender).unwrap();
        sign_output(&mut output, &sender).unwrap();
        assert!(verify_output(&output));
        output.message.masked_value ^= 1;
        assert!(!verify_output(&output));
    }

    #[test]
    fn input_signature_verifies() {
        let kc = keychain();
        let (_, coin) = fund_coin(&kc, 0, 900);
        let input = create_input(&coin, &SecretKey::random()).unwrap();
        assert!(verify_input(&input));
    }

    #[test]
    fn balance_violation_is_fatal() {
        let kc = keychain();
        let (_, coin) = fund_coin(&kc, 0, 100);
        let recipients = [Recipient {
            value: 200,
            address: kc.address(1).unwrap(),
        }];
        let err = new_transaction(
            std::slice::from_ref(&coin),
            &recipients,
            0,
            0,
            vec![],
            0,
            &LocalSigner,
        );
        assert!(matches!(err, Err(Error::BalanceViolation { .. })));
    }

    #[test]
    fn transaction_balances_and_verifies() {
        let kc = keychain();
        let (_, coin) = fund_coin(&kc, 0, 10_000);
        let fee = estimate_fee(1, &[], 0);
        let recipients = [Recipient {
            value: 10_000 - fee,
            address: kc.address(1).unwrap(),
        }];
        let (tx, new_coins) = new_transaction(
            std::slice::from_ref(&coin),
            &recipients,
            fee,
            0,
            vec![],
            0,
            &LocalSigner,
        )
        .unwrap();

        assert_eq!(tx.body.kernels.len(), 1);
        let kernel = &tx.body.kernels[0];
        assert!(verify_kernel(kernel));
        assert!(tx.body.inputs.iter().all(verify_input));
        assert!(tx.body.outputs.iter().all(verify_output));

        // Pedersen balance: outputs + fee − inputs − offset = excess.
        let fee_commit = commit(kernel.fee, &BlindingFactor::ZERO).unwrap();
        let offset_commit = commit(0, &tx.kernel_offset).unwrap();
        let lhs = commit_sum(
            &[tx.body.outputs[0].commitment, fee_commit],
            &[tx.body.inputs[0].commitment, offset_commit],
        )
        .unwrap();
        assert_eq!(lhs, kernel.excess);

        // The new coin rewinds to the recipient's wallet.
        assert_eq!(new_coins.len(), 1);
        assert_eq!(new_coins[0].value, 10_000 - fee);
        let rewound = rewind_output(&tx.body.outputs[0], &kc.scan).unwrap();
        assert_eq!(rewound.value, new_coins[0].value);
        assert_eq!(rewound.output_id, new_coins[0].output_id);
    }

    #[test]
    fn pegin_and_pegout_balance() {
        let kc = keychain();
        let (_, coin) = fund_coin(&kc, 0, 5_000);
        let pegout = TxOut {
            value: 2_000,
            script: vec![0x51; 22],
        };
        let fee = estimate_fee(1, std::slice::from_ref(&pegout), 1000);
        // inputs (5000) + pegin = outputs (4000) + fee + pegouts (2000)
        let pegin = 4_000 + fee + 2_000 - 5_000;
        let recipients = [Recipient {
            value: 4_000,
            address: kc.address(2).unwrap(),
        }];
        let (tx, _) = new_transaction(
            std::slice::from_ref(&coin),
            &recipients,
            fee,
            pegin,
            vec![pegout],
            0,
            &LocalSigner,
        )
        .unwrap();
        let kernel = &tx.body.kernels[0];
        assert_eq!(kernel.pegin, pegin);
        assert_eq!(kernel.pegouts.len(), 1);
        assert!(kernel.features & KERNEL_PEGIN_FEATURE != 0);
        assert!(kernel.features & KERNEL_PEGOUT_FEATURE != 0);
        assert!(verify_kernel(kernel));
    }
}
