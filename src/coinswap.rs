//! Coinswap construction: a single-coin self-spend routed through mixers.
//!
//! The wallet builds a one-input/one-output transaction *without* a kernel
//! — each mixer contributes a kernel carrying its share of the blinding
//! factors and its fee — wraps the shares in an onion, and proves ownership
//! of the input. The aggregate of all hops preserves the Pedersen and
//! stealth balances even though no single hop sees a full blinding factor.

use crate::assembler::{
    create_input, create_output, sign_output, Recipient, BASE_MWEB_FEE,
    KERNEL_WITH_STEALTH_WEIGHT, STANDARD_OUTPUT_WEIGHT,
};
use crate::error::{Error, Result};
use crate::mw::{switch, BlindingFactor, SecretKey};
use crate::onion::{Hop, Onion};
use crate::rewind::Coin;
use crate::tx::{Input, Output};

/// A mixer node, addressed by its X25519 key.
#[derive(Debug, Clone, Copy)]
pub struct MixerNode {
    pub pubkey: [u8; 32],
}

/// Submission boundary: delivers a signed onion to the first mixer. The
/// request body is the onion's JSON form.
pub trait MixerClient {
    fn submit(&self, onion: &Onion) -> Result<()>;
}

/// Total fee for a swap across `hops` mixers: every hop pays for a kernel
/// with stealth excess, the terminal hop also pays for the output.
pub fn swap_fee(hops: usize) -> u64 {
    (KERNEL_WITH_STEALTH_WEIGHT * hops as u64 + STANDARD_OUTPUT_WEIGHT) * BASE_MWEB_FEE
}

/// Per-hop fee schedule; sums exactly to [`swap_fee`].
pub fn hop_fees(hops: usize) -> Vec<u64> {
    (0..hops)
        .map(|i| {
            let mut weight = KERNEL_WITH_STEALTH_WEIGHT;
            if i == hops - 1 {
                weight += STANDARD_OUTPUT_WEIGHT;
            }
            weight * BASE_MWEB_FEE
        })
        .collect()
}

/// Split a blinding factor into `n` shares summing to the original. The
/// first `n − 1` shares are uniform random; the last is the residue.
pub fn split_blind(blind: &BlindingFactor, n: usize) -> Vec<BlindingFactor> {
    let mut shares = Vec::with_capacity(n);
    let mut remainder = *blind;
    for _ in 1..n {
        let share = BlindingFactor::random();
        remainder = remainder.sub(&share);
        shares.push(share);
    }
    shares.push(remainder);
    shares
}

/// The kernel-less swap transaction: the signed input, the signed output,
/// and the two aggregate blinds the mixers will absorb.
pub struct SwapTx {
    pub input: Input,
    pub output: Output,
    pub kernel_blind: BlindingFactor,
    pub stealth_blind: BlindingFactor,
}

/// Build the swap transaction for `coin` paying `recipient`. The coin must
/// carry its spend key.
pub fn make_swap_tx(coin: &Coin, recipient: &Recipient) -> Result<SwapTx> {
    let spend_key = coin.spend_key.ok_or(Error::MissingSpendKey)?;
    let input_key = SecretKey::random();
    let output_key = SecretKey::random();

    let input = create_input(coin, &input_key)?;
    let input_blind = switch(&coin.blind, coin.value)?;

    let (mut output, blind, _) = create_output(recipient, &output_key)?;
    sign_output(&mut output, &output_key)?;
    let output_blind = switch(&blind, recipient.value)?;

    let kernel_blind = output_blind.sub(&input_blind);
    let stealth_blind =
        BlindingFactor(output_key.add(&input_key).sub(&spend_key).0);

    Ok(SwapTx {
        input,
        output,
        kernel_blind,
        stealth_blind,
    })
}

/// Build the complete signed swap request for `coin` across `mixers`.
///
/// Fails with [`Error::InsufficientValue`] when the coin cannot cover the
/// hop fees. The residue (`value − fee`) returns to the coin's own address.
pub fn build_swap_request(coin: &Coin, mixers: &[MixerNode]) -> Result<Onion> {
    let fee = swap_fee(mixers.len());
    if coin.value < fee {
        return Err(Error::InsufficientValue {
            value: coin.value,
            fee,
        });
    }

    let recipient = Recipient {
        value: coin.value - fee,
        address: coin.address,
    };
    let swap = make_swap_tx(coin, &recipient)?;

    let kernel_blinds = split_blind(&swap.kernel_blind, mixers.len());
    let stealth_blinds = split_blind(&swap.stealth_blind, mixers.len());
    let fees = hop_fees(mixers.len());

    let hops: Vec<Hop> = mixers
        .iter()
        .enumerate()
        .map(|(i, node)| Hop {
            pubkey: node.pubkey,
            kernel_blind: kernel_blinds[i],
            stealth_blind: stealth_blinds[i],
            fee: fees[i],
            output: (i == mixers.len() - 1).then(|| swap.output.clone()),
        })
        .collect();

    let mut onion = Onion::new(&hops)?;
    let spend_key = coin.spend_key.ok_or(Error::MissingSpendKey)?;
    onion.sign(&swap.input, &spend_key)?;
    log::debug!(
        "built swap request for {} across {} hops, fee {}",
        coin.output_id,
        mixers.len(),
        fee
    );
    Ok(onion)
}
