//! Error types for the Bitcoin-side atomic swap driver.

use thiserror::Error;

/// Top-level error surfaced to the outer transaction.
///
/// Composes the narrower per-concern error enums the way the upstream
/// atomic-swap module composes `HTLCError`/`BitcoinAdapterError`/`MonitorError`
/// into a single `AtomicSwapError`.
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("parameter store error: {0}")]
    Params(#[from] ParamsError),

    #[error("configuration error: missing mandatory parameter {0}")]
    Configuration(String),

    #[error("broadcast rejected for {subtx}: node returned an empty txid")]
    BroadcastRejected { subtx: &'static str },

    #[error("on-chain lock output does not match the expected contract: {reason}")]
    ConsensusMismatch { reason: String },

    #[error("signing failed: {0}")]
    SigningFailure(String),
}

/// Errors from HTLC script construction.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("secret size does not fit a minimally-encoded script number: {0}")]
    SecretSizeOverflow(usize),

    #[error("locktime does not fit a minimally-encoded script number: {0}")]
    LocktimeOverflow(i64),

    #[error("public key hash must be exactly 20 bytes, got {0}")]
    InvalidHashLength(usize),
}

/// Errors surfaced by the Bitcoin JSON-RPC client.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("transport error calling {method}: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("node returned an error for {method}: {message}")]
    NodeError { method: &'static str, message: String },

    #[error("malformed reply from {method}: {reason}")]
    MalformedReply { method: &'static str, reason: String },

    #[error(
        "fundrawtransaction produced more than one output beyond the HTLC output; \
         multi-output funding is unsupported"
    )]
    UnsupportedFunding,
}

/// Errors from the parameter store facade.
#[derive(Error, Debug)]
pub enum ParamsError {
    #[error("mandatory parameter {key:?} (subtx {subtx:?}) is not set")]
    Missing {
        key: &'static str,
        subtx: Option<&'static str>,
    },

    #[error("stored value for {key:?} could not be decoded: {reason}")]
    Decode { key: &'static str, reason: String },
}
