//! Typed parameter-store facade.
//!
//! The store itself is out of scope (spec.md §1): this module only defines
//! the seam the driver talks to. An in-memory implementation is provided for
//! tests and as a reference for a real persistent-store adapter.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ParamsError;
use crate::types::{SubTxId, TxParameterId};

/// Typed get/set by `(key, sub-transaction id)`.
///
/// `get_mandatory` fails the swap (via `ParamsError::Missing`) instead of
/// returning `None`, matching the spec's `getMandatory<T>`.
pub trait ParameterStore: Send + Sync {
    fn get<T: DeserializeOwned + 'static>(
        &self,
        key: TxParameterId,
        subtx: Option<SubTxId>,
    ) -> Result<Option<T>, ParamsError>;

    fn get_mandatory<T: DeserializeOwned + 'static>(
        &self,
        key: TxParameterId,
        subtx: Option<SubTxId>,
    ) -> Result<T, ParamsError> {
        self.get(key, subtx)?.ok_or(ParamsError::Missing {
            key: key_name(key),
            subtx: subtx.map(SubTxId::as_str),
        })
    }

    fn set<T: Serialize + 'static>(
        &self,
        key: TxParameterId,
        value: &T,
        subtx: Option<SubTxId>,
    ) -> Result<(), ParamsError>;
}

fn key_name(key: TxParameterId) -> &'static str {
    match key {
        TxParameterId::CreateTime => "CreateTime",
        TxParameterId::AtomicSwapAmount => "AtomicSwapAmount",
        TxParameterId::AtomicSwapAddress => "AtomicSwapAddress",
        TxParameterId::AtomicSwapPeerAddress => "AtomicSwapPeerAddress",
        TxParameterId::AtomicSwapExternalLockTime => "AtomicSwapExternalLockTime",
        TxParameterId::PreImage => "PreImage",
        TxParameterId::PeerLockImage => "PeerLockImage",
        TxParameterId::AtomicSwapExternalTxID => "AtomicSwapExternalTxID",
        TxParameterId::AtomicSwapExternalTxOutputIndex => "AtomicSwapExternalTxOutputIndex",
        TxParameterId::AtomicSwapExternalTx => "AtomicSwapExternalTx",
        TxParameterId::TransactionRegistered => "TransactionRegistered",
        TxParameterId::State => "State",
    }
}

/// Single-writer, in-memory parameter store. Values are stored pre-serialized
/// (as JSON) the way a real length-prefixed KV store would round-trip them,
/// so `get`/`set` exercise the same (de)serialization path a persistent
/// backend does.
#[derive(Default)]
pub struct InMemoryParameterStore {
    values: std::sync::Mutex<HashMap<(TxParameterId, Option<SubTxId>), String>>,
}

impl InMemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterStore for InMemoryParameterStore {
    fn get<T: DeserializeOwned + 'static>(
        &self,
        key: TxParameterId,
        subtx: Option<SubTxId>,
    ) -> Result<Option<T>, ParamsError> {
        let values = self.values.lock().expect("parameter store lock poisoned");
        match values.get(&(key, subtx)) {
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|e| ParamsError::Decode {
                    key: key_name(key),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn set<T: Serialize + 'static>(
        &self,
        key: TxParameterId,
        value: &T,
        subtx: Option<SubTxId>,
    ) -> Result<(), ParamsError> {
        let raw = serde_json::to_string(value).map_err(|e| ParamsError::Decode {
            key: key_name(key),
            reason: e.to_string(),
        })?;
        let mut values = self.values.lock().expect("parameter store lock poisoned");
        values.insert((key, subtx), raw);
        Ok(())
    }
}
