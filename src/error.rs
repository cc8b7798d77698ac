use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The output does not belong to the wallet doing the rewind. Callers
    /// scanning batches treat this as "skip", never as a failure.
    #[error("output does not belong to this scan key")]
    NotMine,

    #[error("coin value {value} cannot cover the swap fee {fee}")]
    InsufficientValue { value: u64, fee: u64 },

    #[error("wrong onion version {0}")]
    WrongOnionVersion(u8),

    #[error("onion payload malformed: {0}")]
    DecryptMalformed(String),

    #[error("derived stealth address does not match the advertised index")]
    AddressMismatch,

    #[error("coin not found")]
    CoinNotFound,

    #[error("device read error")]
    DeviceRead,

    #[error("invalid device status {0:#06x}")]
    InvalidStatus(u16),

    /// An internal accounting invariant was broken. This is a bug, not a
    /// recoverable condition.
    #[error("transaction does not balance: inputs {inputs} + pegin {pegin} != outputs {outputs} + fee {fee} + pegouts {pegouts}")]
    BalanceViolation {
        inputs: u64,
        outputs: u64,
        fee: u64,
        pegin: u64,
        pegouts: u64,
    },

    #[error("curve operation failed: {0:?}")]
    Curve(secp::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("keychain has no spend secret")]
    MissingSpendKey,

    #[error("chain backend error: {0}")]
    Backend(String),

    #[error("mixer submission failed: {0}")]
    Mixer(String),

    #[error("transaction packet error: {0}")]
    Packet(String),
}

impl From<secp::Error> for Error {
    fn from(e: secp::Error) -> Self {
        Error::Curve(e)
    }
}
