//! Core data model: swap roles, sub-transaction identity, and persisted parameter keys.

use serde::{Deserialize, Serialize};

/// Absolute CLTV locktime delta applied on top of swap creation time (48h).
pub const BTC_LOCK_TIME_SEC: u64 = 172_800;

/// Confirmations required before `confirm_lock_tx` reports success.
pub const BTC_MIN_TX_CONFIRMATIONS: u32 = 6;

/// Default flat withdraw fee, in satoshis. Kept configurable (see `DriverConfig`);
/// no fee-estimation policy is implemented per spec Open Questions.
pub const DEFAULT_WITHDRAW_FEE_SAT: u64 = 1_000;

pub const SATOSHI_PER_BITCOIN: u64 = 100_000_000;

/// Maximum nSequence value accepted by Bitcoin Core; the withdraw input uses
/// one less than this so the input remains replaceable-by-height only in the
/// sense the upstream C++ driver relies on (not BIP-125 RBF signaling).
pub const MAX_INPUT_SEQUENCE: u32 = u32::MAX;

/// Each party's two independent roles in the swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRole {
    /// Did we define the redeem secret?
    pub is_initiator: bool,
    /// Do we fund the Bitcoin side of the swap?
    pub is_btc_owner: bool,
}

impl SwapRole {
    /// `PreImage` is present iff we are both the initiator and the BTC owner.
    pub fn holds_preimage(&self) -> bool {
        self.is_btc_owner && self.is_initiator
    }
}

/// Identifies one of the three Bitcoin sub-transactions, plus the namespace
/// used solely to share the preimage parameter with the native-chain side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubTxId {
    LockTx,
    RefundTx,
    RedeemTx,
    /// Not a Bitcoin transaction; namespaces `PreImage`/`PeerLockImage`.
    BeamRedeemTx,
}

impl SubTxId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTxId::LockTx => "LockTx",
            SubTxId::RefundTx => "RefundTx",
            SubTxId::RedeemTx => "RedeemTx",
            SubTxId::BeamRedeemTx => "BeamRedeemTx",
        }
    }
}

/// Per-subtx lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapTxState {
    /// No work started.
    Initial,
    /// An RPC is outstanding, or the artifact is not yet complete.
    CreatingTx,
    /// A signed raw transaction is available for broadcast.
    Constructed,
}

/// Persisted, typed parameter keys. Mirrors the `TxParameterId` table in the
/// spec; the concrete value type for each variant lives alongside its use site
/// in `driver.rs` rather than being encoded in this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxParameterId {
    /// Swap creation moment (unix seconds); global.
    CreateTime,
    /// BTC side amount, in satoshis; global.
    AtomicSwapAmount,
    /// Our BTC address (change-address derived); global, set exactly once.
    AtomicSwapAddress,
    /// Peer's BTC address; global.
    AtomicSwapPeerAddress,
    /// Absolute CLTV locktime (unix seconds); global.
    AtomicSwapExternalLockTime,
    /// Initiator's secret, scoped to `BeamRedeemTx`.
    PreImage,
    /// Counterparty's commitment, scoped to `BeamRedeemTx`.
    PeerLockImage,
    /// On-chain txid hex, per-subtx.
    AtomicSwapExternalTxID,
    /// Vout index of the HTLC output, scoped to `LockTx`.
    AtomicSwapExternalTxOutputIndex,
    /// Serialized signed transaction hex, per-subtx.
    AtomicSwapExternalTx,
    /// Whether broadcast was accepted by the node, per-subtx.
    TransactionRegistered,
    /// State-machine marker, per-subtx.
    State,
}

/// Outbound bundle published to the native-chain side via `add_tx_details`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetails {
    pub atomic_swap_peer_address: String,
    pub sub_tx_index: SubTxId,
    pub atomic_swap_external_tx_id: String,
    pub atomic_swap_external_tx_output_index: u32,
}
