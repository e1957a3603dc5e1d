//! Bitcoin-side driver for BEAM<->Bitcoin atomic swaps.
//!
//! Four pieces, matching the component split of the design this crate
//! implements: HTLC script construction ([`script`]), the Bitcoin JSON-RPC
//! client ([`rpc`]), a typed parameter-store facade ([`params`]), and the
//! swap state machine itself ([`driver`]).

pub mod driver;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod params;
pub mod rpc;
pub mod script;
pub mod types;

pub use driver::{DriverConfig, SwapDriver};
pub use error::{ParamsError, RpcError, ScriptError, SwapError};
pub use params::{InMemoryParameterStore, ParameterStore};
pub use rpc::{BitcoinRpcClient, HttpBitcoinRpcClient};
pub use script::build_htlc_script;
pub use types::{SubTxId, SwapRole, SwapTxState, TxDetails, TxParameterId};
