//! The swap driver: the state machine that derives the HTLC contract,
//! constructs the lock/redeem/refund transactions, and drives confirmation
//! polling and broadcast.
//!
//! The driver never owns a private key at rest: signing keys are pulled from
//! the node via `dumpprivkey` immediately before use. It also never loops —
//! each public method performs at most one RPC round trip and returns; the
//! caller re-invokes the relevant method to advance further (see
//! SPEC_FULL.md §5, §9).

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::address::Address;
use bitcoin::blockdata::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Network, PrivateKey, Sequence, Transaction, TxOut};

use crate::error::SwapError;
use crate::params::ParameterStore;
use crate::rpc::{BitcoinRpcClient, TxInput};
use crate::script::build_htlc_script;
use crate::types::{
    SubTxId, SwapRole, SwapTxState, TxDetails, TxParameterId, BTC_LOCK_TIME_SEC,
    BTC_MIN_TX_CONFIRMATIONS, DEFAULT_WITHDRAW_FEE_SAT, MAX_INPUT_SEQUENCE, SATOSHI_PER_BITCOIN,
};

/// Length in bytes of the preimage the contract script hashes against.
const SECRET_SIZE: usize = 32;

/// Driver configuration. Mirrors the teacher's `Default`-constructible config
/// structs (e.g. `AtomicSwapConfig`): every field has a sane standalone
/// default, and callers override only what their deployment needs.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub network: Network,
    pub withdraw_fee_sat: u64,
    pub min_confirmations: u32,
    pub lock_time_delta_sec: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            withdraw_fee_sat: DEFAULT_WITHDRAW_FEE_SAT,
            min_confirmations: BTC_MIN_TX_CONFIRMATIONS,
            lock_time_delta_sec: BTC_LOCK_TIME_SEC,
        }
    }
}

/// Drives one side of one swap. `R` is the RPC client, `P` the parameter
/// store; both are generic rather than trait objects so a caller can hand in
/// zero-cost concrete types in production and a mock in tests.
pub struct SwapDriver<R: BitcoinRpcClient, P: ParameterStore> {
    config: DriverConfig,
    rpc: Arc<R>,
    params: Arc<P>,
    role: SwapRole,
}

impl<R: BitcoinRpcClient, P: ParameterStore> SwapDriver<R, P> {
    pub fn new(config: DriverConfig, rpc: Arc<R>, params: Arc<P>, role: SwapRole) -> Self {
        Self {
            config,
            rpc,
            params,
            role,
        }
    }

    /// First-touch setup: records the swap's creation time (if not already
    /// set) and derives the locktime and our own contract address from it.
    #[tracing::instrument(skip(self))]
    pub async fn initial(&self, now_unix: u64) -> Result<(), SwapError> {
        if self
            .params
            .get::<u64>(TxParameterId::CreateTime, None)?
            .is_none()
        {
            self.params.set(TxParameterId::CreateTime, &now_unix, None)?;
        }
        self.init_lock_time()?;
        self.ensure_own_address().await?;
        self.ensure_preimage()?;
        Ok(())
    }

    /// Generates the redeem secret if we're the party who defines it
    /// (`role.holds_preimage()`); a no-op for the counterparty, who instead
    /// receives `PeerLockImage` out of band before lock-time.
    fn ensure_preimage(&self) -> Result<(), SwapError> {
        if !self.role.holds_preimage() {
            return Ok(());
        }
        if self
            .params
            .get::<[u8; 32]>(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))?
            .is_none()
        {
            let mut secret = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut secret);
            self.params.set(
                TxParameterId::PreImage,
                &secret,
                Some(SubTxId::BeamRedeemTx),
            )?;
        }
        Ok(())
    }

    fn init_lock_time(&self) -> Result<(), SwapError> {
        if self
            .params
            .get::<u64>(TxParameterId::AtomicSwapExternalLockTime, None)?
            .is_none()
        {
            let create_time: u64 = self
                .params
                .get_mandatory(TxParameterId::CreateTime, None)?;
            let locktime = create_time + self.config.lock_time_delta_sec;
            self.params.set(
                TxParameterId::AtomicSwapExternalLockTime,
                &locktime,
                None,
            )?;
        }
        Ok(())
    }

    async fn ensure_own_address(&self) -> Result<(), SwapError> {
        if self
            .params
            .get::<String>(TxParameterId::AtomicSwapAddress, None)?
            .is_none()
        {
            let address = self.rpc.get_raw_change_address().await?;
            self.params
                .set(TxParameterId::AtomicSwapAddress, &address, None)?;
        }
        Ok(())
    }

    /// Assembles the bundle handed to the native-chain side after a
    /// sub-transaction has been registered on-chain.
    pub fn add_tx_details(&self, subtx: SubTxId) -> Result<TxDetails, SwapError> {
        let peer_address =
            self.params
                .get_mandatory(TxParameterId::AtomicSwapPeerAddress, None)?;
        let txid = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapExternalTxID, Some(subtx))?;
        let vout = self.params.get_mandatory(
            TxParameterId::AtomicSwapExternalTxOutputIndex,
            Some(subtx),
        )?;
        Ok(TxDetails {
            atomic_swap_peer_address: peer_address,
            sub_tx_index: subtx,
            atomic_swap_external_tx_id: txid,
            atomic_swap_external_tx_output_index: vout,
        })
    }

    /// `(hash_a, hash_b)`: the funder's (refund path) and redeemer's (claim
    /// path) pubkey hashes, ordered by who actually owns the BTC leg.
    fn contract_hashes(&self) -> Result<([u8; 20], [u8; 20]), SwapError> {
        let ours: String = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapAddress, None)?;
        let peer: String = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapPeerAddress, None)?;
        let ours_hash = pubkey_hash_from_address(&ours, self.config.network)?;
        let peer_hash = pubkey_hash_from_address(&peer, self.config.network)?;
        if self.role.is_btc_owner {
            Ok((ours_hash, peer_hash))
        } else {
            Ok((peer_hash, ours_hash))
        }
    }

    fn secret_hash(&self) -> Result<[u8; 32], SwapError> {
        if self.role.holds_preimage() {
            let secret: [u8; 32] = self
                .params
                .get_mandatory(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))?;
            Ok(sha256(&secret))
        } else {
            self.params
                .get_mandatory(TxParameterId::PeerLockImage, Some(SubTxId::BeamRedeemTx))
        }
    }

    fn contract_script(&self) -> Result<bitcoin::ScriptBuf, SwapError> {
        let (hash_a, hash_b) = self.contract_hashes()?;
        let locktime: u64 = self.params.get_mandatory(
            TxParameterId::AtomicSwapExternalLockTime,
            None,
        )?;
        let secret_hash = self.secret_hash()?;
        Ok(build_htlc_script(
            &hash_a,
            &hash_b,
            locktime as i64,
            &secret_hash,
            SECRET_SIZE,
        )?)
    }

    /// The contract's P2SH address, recomputed from persisted swap
    /// parameters. Exposed so a caller can display or independently verify
    /// the HTLC contract before funding it, not only so the driver itself
    /// can validate the on-chain output.
    pub fn contract_address(&self) -> Result<Address, SwapError> {
        let script = self.contract_script()?;
        Ok(Address::p2sh(&script, self.config.network).map_err(|e| {
            SwapError::Configuration(format!("cannot derive P2SH address from contract: {e}"))
        })?)
    }

    fn tx_state(&self, subtx: SubTxId) -> Result<SwapTxState, SwapError> {
        Ok(self
            .params
            .get(TxParameterId::State, Some(subtx))?
            .unwrap_or(SwapTxState::Initial))
    }

    fn set_tx_state(&self, subtx: SubTxId, state: SwapTxState) -> Result<(), SwapError> {
        self.params
            .set(TxParameterId::State, &state, Some(subtx))
            .map_err(SwapError::from)?;
        #[cfg(feature = "metrics")]
        crate::metrics::record_state_transition(subtx.as_str(), state_label(state));
        Ok(())
    }

    /// Drives `LockTx` through `fundrawtransaction` / `signrawtransaction`,
    /// then registers it with the node. Safe to call repeatedly: each call
    /// advances at most one state and is a no-op once `Constructed` and
    /// registered.
    #[tracing::instrument(skip(self))]
    pub async fn send_lock_tx(&self) -> Result<(), SwapError> {
        self.advance_lock_tx().await?;
        if self.tx_state(SubTxId::LockTx)? == SwapTxState::Constructed {
            self.register_tx(SubTxId::LockTx).await?;
        }
        Ok(())
    }

    async fn advance_lock_tx(&self) -> Result<(), SwapError> {
        match self.tx_state(SubTxId::LockTx)? {
            SwapTxState::Initial => {
                let amount: u64 = self
                    .params
                    .get_mandatory(TxParameterId::AtomicSwapAmount, None)?;
                let contract_address = self.contract_address()?;
                let template = build_funding_template(&contract_address, amount);

                let funded = self.rpc.fund_raw_transaction(&template).await?;
                let funded_tx = decode_hex_tx(&funded.hex)?;
                let expected_outputs = if funded.changepos == -1 { 1 } else { 2 };
                if funded_tx.output.len() != expected_outputs {
                    return Err(crate::error::RpcError::UnsupportedFunding.into());
                }
                let value_pos: u32 = if funded.changepos == 0 { 1 } else { 0 };

                self.params.set(
                    TxParameterId::AtomicSwapExternalTxOutputIndex,
                    &value_pos,
                    Some(SubTxId::LockTx),
                )?;
                self.params.set(
                    TxParameterId::AtomicSwapExternalTx,
                    &funded.hex,
                    Some(SubTxId::LockTx),
                )?;
                self.set_tx_state(SubTxId::LockTx, SwapTxState::CreatingTx)?;
                Ok(())
            }
            SwapTxState::CreatingTx => {
                let funded_hex: String = self.params.get_mandatory(
                    TxParameterId::AtomicSwapExternalTx,
                    Some(SubTxId::LockTx),
                )?;
                let signed = self.rpc.sign_raw_transaction(&funded_hex).await?;
                if !signed.complete {
                    return Err(SwapError::SigningFailure(
                        "node could not fully sign the funded lock transaction".to_string(),
                    ));
                }
                self.params.set(
                    TxParameterId::AtomicSwapExternalTx,
                    &signed.hex,
                    Some(SubTxId::LockTx),
                )?;
                self.set_tx_state(SubTxId::LockTx, SwapTxState::Constructed)?;
                Ok(())
            }
            SwapTxState::Constructed => Ok(()),
        }
    }

    /// Validates the lock output is still the expected contract and reports
    /// whether it has reached the confirmation threshold.
    ///
    /// A null `gettxout` reply (output spent, or not yet visible to the
    /// node) is not an error: it resolves to `Ok(false)` so the caller
    /// re-polls later.
    #[tracing::instrument(skip(self))]
    pub async fn confirm_lock_tx(&self) -> Result<bool, SwapError> {
        let txid: String = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapExternalTxID, Some(SubTxId::LockTx))?;
        let vout: u32 = self.params.get_mandatory(
            TxParameterId::AtomicSwapExternalTxOutputIndex,
            Some(SubTxId::LockTx),
        )?;

        let Some(out) = self.rpc.get_tx_out(&txid, vout).await? else {
            return Ok(false);
        };

        let expected_script = self.contract_address()?.script_pubkey();
        let expected_hex = hex::encode(expected_script.as_bytes());
        if out.script_pub_key.hex != expected_hex {
            return Err(SwapError::ConsensusMismatch {
                reason: format!(
                    "lock output scriptPubKey {} does not match the expected contract {}",
                    out.script_pub_key.hex, expected_hex
                ),
            });
        }

        let amount: u64 = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapAmount, None)?;
        let observed_sat = (out.value * SATOSHI_PER_BITCOIN as f64).round() as u64;
        if observed_sat < amount {
            return Err(SwapError::ConsensusMismatch {
                reason: format!(
                    "lock output carries {observed_sat} sat, expected at least {amount}"
                ),
            });
        }

        Ok(out.confirmations >= self.config.min_confirmations)
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_redeem(&self) -> Result<(), SwapError> {
        self.advance_withdraw_tx(SubTxId::RedeemTx).await?;
        if self.tx_state(SubTxId::RedeemTx)? == SwapTxState::Constructed {
            self.register_tx(SubTxId::RedeemTx).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn send_refund(&self) -> Result<(), SwapError> {
        self.advance_withdraw_tx(SubTxId::RefundTx).await?;
        if self.tx_state(SubTxId::RefundTx)? == SwapTxState::Constructed {
            self.register_tx(SubTxId::RefundTx).await?;
        }
        Ok(())
    }

    async fn advance_withdraw_tx(&self, subtx: SubTxId) -> Result<(), SwapError> {
        match self.tx_state(subtx)? {
            SwapTxState::Initial => {
                let lock_txid: String = self.params.get_mandatory(
                    TxParameterId::AtomicSwapExternalTxID,
                    Some(SubTxId::LockTx),
                )?;
                let lock_vout: u32 = self.params.get_mandatory(
                    TxParameterId::AtomicSwapExternalTxOutputIndex,
                    Some(SubTxId::LockTx),
                )?;
                let amount: u64 = self
                    .params
                    .get_mandatory(TxParameterId::AtomicSwapAmount, None)?;
                let payout = amount.checked_sub(self.config.withdraw_fee_sat).ok_or_else(|| {
                    SwapError::Configuration("withdraw fee exceeds the swap amount".to_string())
                })?;
                let destination: String = self
                    .params
                    .get_mandatory(TxParameterId::AtomicSwapAddress, None)?;

                let inputs = [TxInput {
                    txid: lock_txid,
                    vout: lock_vout,
                    sequence: MAX_INPUT_SEQUENCE - 1,
                }];
                let mut outputs = serde_json::Map::new();
                outputs.insert(destination, serde_json::json!(sat_to_btc(payout)));

                let locktime = if subtx == SubTxId::RefundTx {
                    Some(
                        self.params
                            .get_mandatory::<u64>(TxParameterId::AtomicSwapExternalLockTime, None)?,
                    )
                } else {
                    None
                };

                let raw_hex = self
                    .rpc
                    .create_raw_transaction(&inputs, &outputs, locktime)
                    .await?;
                self.params
                    .set(TxParameterId::AtomicSwapExternalTx, &raw_hex, Some(subtx))?;
                self.set_tx_state(subtx, SwapTxState::CreatingTx)?;
                Ok(())
            }
            SwapTxState::CreatingTx => {
                let raw_hex: String = self
                    .params
                    .get_mandatory(TxParameterId::AtomicSwapExternalTx, Some(subtx))?;
                let signed_hex = self.sign_withdraw_tx_locally(subtx, &raw_hex).await?;
                self.params.set(
                    TxParameterId::AtomicSwapExternalTx,
                    &signed_hex,
                    Some(subtx),
                )?;
                self.set_tx_state(subtx, SwapTxState::Constructed)?;
                Ok(())
            }
            SwapTxState::Constructed => Ok(()),
        }
    }

    /// Signs the single-input refund/redeem transaction against the HTLC
    /// contract script, using a private key pulled from the node for the
    /// occasion — the driver never persists one.
    async fn sign_withdraw_tx_locally(
        &self,
        subtx: SubTxId,
        raw_hex: &str,
    ) -> Result<String, SwapError> {
        let mut tx = decode_hex_tx(raw_hex)?;
        let own_address: String = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapAddress, None)?;
        let wif = self.rpc.dump_priv_key(&own_address).await?;
        let private_key = PrivateKey::from_wif(&wif)
            .map_err(|e| SwapError::SigningFailure(format!("invalid WIF from node: {e}")))?;

        let secp = Secp256k1::signing_only();
        let public_key = private_key.public_key(&secp);
        let contract_script = self.contract_script()?;

        let sighash_type = EcdsaSighashType::All;
        let sighash = SighashCache::new(&tx)
            .legacy_signature_hash(0, &contract_script, sighash_type.to_u32())
            .map_err(|e| SwapError::SigningFailure(format!("sighash computation failed: {e}")))?;
        let message = Message::from_slice(sighash.as_ref())
            .map_err(|e| SwapError::SigningFailure(format!("invalid sighash: {e}")))?;
        let signature = secp.sign_ecdsa(&message, &private_key.inner);

        let mut der_sig = signature.serialize_der().to_vec();
        der_sig.push(sighash_type.to_u32() as u8);
        let sig_push = PushBytesBuf::try_from(der_sig)
            .map_err(|_| SwapError::SigningFailure("signature too long to push".to_string()))?;
        let pubkey_push = PushBytesBuf::try_from(public_key.to_bytes())
            .map_err(|_| SwapError::SigningFailure("public key too long to push".to_string()))?;

        let script_sig = if subtx == SubTxId::RefundTx {
            Builder::new()
                .push_slice(sig_push)
                .push_slice(pubkey_push)
                .push_int(0)
                .into_script()
        } else {
            let secret: [u8; 32] = self
                .params
                .get_mandatory(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))?;
            let secret_push = PushBytesBuf::try_from(secret.to_vec())
                .map_err(|_| SwapError::SigningFailure("secret too long to push".to_string()))?;
            Builder::new()
                .push_slice(sig_push)
                .push_slice(pubkey_push)
                .push_slice(secret_push)
                .push_int(1)
                .into_script()
        };

        tx.input[0].script_sig = script_sig;
        tx.input[0].sequence = Sequence(MAX_INPUT_SEQUENCE - 1);

        Ok(hex::encode(bitcoin::consensus::serialize(&tx)))
    }

    /// Idempotent broadcast: a sub-tx already marked `TransactionRegistered`
    /// is not re-sent.
    pub async fn register_tx(&self, subtx: SubTxId) -> Result<(), SwapError> {
        if self
            .params
            .get::<bool>(TxParameterId::TransactionRegistered, Some(subtx))?
            .unwrap_or(false)
        {
            return Ok(());
        }

        let raw_hex: String = self
            .params
            .get_mandatory(TxParameterId::AtomicSwapExternalTx, Some(subtx))?;
        match self.rpc.send_raw_transaction(&raw_hex).await? {
            Some(txid) => {
                tracing::info!(subtx = subtx.as_str(), %txid, "broadcast accepted");
                self.params
                    .set(TxParameterId::AtomicSwapExternalTxID, &txid, Some(subtx))?;
                self.params
                    .set(TxParameterId::TransactionRegistered, &true, Some(subtx))?;
                Ok(())
            }
            None => {
                tracing::warn!(subtx = subtx.as_str(), "broadcast rejected by node");
                #[cfg(feature = "metrics")]
                crate::metrics::record_broadcast_rejection(subtx.as_str());
                Err(SwapError::BroadcastRejected {
                    subtx: subtx.as_str(),
                })
            }
        }
    }
}

#[cfg(feature = "metrics")]
fn state_label(state: SwapTxState) -> &'static str {
    match state {
        SwapTxState::Initial => "Initial",
        SwapTxState::CreatingTx => "CreatingTx",
        SwapTxState::Constructed => "Constructed",
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}

fn sat_to_btc(sat: u64) -> f64 {
    sat as f64 / SATOSHI_PER_BITCOIN as f64
}

fn build_funding_template(contract_address: &Address, amount_sat: u64) -> String {
    let tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![],
        output: vec![TxOut {
            value: amount_sat,
            script_pubkey: contract_address.script_pubkey(),
        }],
    };
    hex::encode(bitcoin::consensus::serialize(&tx))
}

fn decode_hex_tx(hex_str: &str) -> Result<Transaction, SwapError> {
    let bytes = hex::decode(hex_str).map_err(|e| crate::error::RpcError::MalformedReply {
        method: "(local decode)",
        reason: e.to_string(),
    })?;
    bitcoin::consensus::deserialize(&bytes).map_err(|e| {
        crate::error::RpcError::MalformedReply {
            method: "(local decode)",
            reason: e.to_string(),
        }
        .into()
    })
}

/// Only legacy P2PKH addresses are accepted, matching the HTLC script's
/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG` tail; Segwit inputs
/// are out of scope.
fn pubkey_hash_from_address(addr: &str, network: Network) -> Result<[u8; 20], SwapError> {
    let address = Address::from_str(addr)
        .map_err(|e| SwapError::Configuration(format!("invalid address {addr}: {e}")))?
        .require_network(network)
        .map_err(|e| {
            SwapError::Configuration(format!("address {addr} is on the wrong network: {e}"))
        })?;

    // Pull the hash straight out of the P2PKH scriptPubKey bytes
    // (`OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG`) rather than
    // relying on the address payload's internal representation.
    let script = address.script_pubkey();
    let bytes = script.as_bytes();
    if bytes.len() == 25 && bytes[0] == 0x76 && bytes[1] == 0xa9 && bytes[2] == 0x14 {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[3..23]);
        Ok(hash)
    } else {
        Err(SwapError::Configuration(format!(
            "address {addr} is not a legacy P2PKH address"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::InMemoryParameterStore;
    use crate::rpc::{FundRawTransactionResult, SignRawTransactionResult, TxOutResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Minimal scripted RPC stub: each method returns whatever was queued for
    /// it, in FIFO order, so a test can script a multi-call exchange.
    #[derive(Default)]
    struct MockRpcClient {
        fund_raw_transaction: Mutex<Vec<FundRawTransactionResult>>,
        sign_raw_transaction: Mutex<Vec<SignRawTransactionResult>>,
        send_raw_transaction: Mutex<Vec<Option<String>>>,
        get_tx_out: Mutex<Vec<Option<TxOutResult>>>,
        dump_priv_key: Mutex<String>,
        create_raw_transaction: Mutex<String>,
    }

    #[async_trait]
    impl BitcoinRpcClient for MockRpcClient {
        async fn get_raw_change_address(&self) -> Result<String, crate::error::RpcError> {
            Ok("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string())
        }

        async fn fund_raw_transaction(
            &self,
            _hex_tx: &str,
        ) -> Result<FundRawTransactionResult, crate::error::RpcError> {
            Ok(self.fund_raw_transaction.lock().unwrap().remove(0))
        }

        async fn sign_raw_transaction(
            &self,
            _hex_tx: &str,
        ) -> Result<SignRawTransactionResult, crate::error::RpcError> {
            Ok(self.sign_raw_transaction.lock().unwrap().remove(0))
        }

        async fn send_raw_transaction(
            &self,
            _hex_tx: &str,
        ) -> Result<Option<String>, crate::error::RpcError> {
            Ok(self.send_raw_transaction.lock().unwrap().remove(0))
        }

        async fn create_raw_transaction(
            &self,
            _inputs: &[TxInput],
            _outputs: &serde_json::Map<String, serde_json::Value>,
            _locktime: Option<u64>,
        ) -> Result<String, crate::error::RpcError> {
            Ok(self.create_raw_transaction.lock().unwrap().clone())
        }

        async fn dump_priv_key(&self, _address: &str) -> Result<String, crate::error::RpcError> {
            Ok(self.dump_priv_key.lock().unwrap().clone())
        }

        async fn get_tx_out(
            &self,
            _txid: &str,
            _vout: u32,
        ) -> Result<Option<TxOutResult>, crate::error::RpcError> {
            Ok(self.get_tx_out.lock().unwrap().remove(0))
        }
    }

    fn bootstrap(role: SwapRole) -> (Arc<MockRpcClient>, Arc<InMemoryParameterStore>, SwapDriver<MockRpcClient, InMemoryParameterStore>) {
        let rpc = Arc::new(MockRpcClient::default());
        let params = Arc::new(InMemoryParameterStore::new());
        let driver = SwapDriver::new(DriverConfig::default(), rpc.clone(), params.clone(), role);

        params
            .set(TxParameterId::CreateTime, &1_700_000_000u64, None)
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalLockTime,
                &(1_700_000_000u64 + BTC_LOCK_TIME_SEC),
                None,
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapAddress,
                &"1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string(),
                None,
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapPeerAddress,
                &"1BoatSLRHtKNngkdXEeobR76b53LETtpyT".to_string(),
                None,
            )
            .unwrap();
        params
            .set(TxParameterId::AtomicSwapAmount, &1_000_000u64, None)
            .unwrap();
        params
            .set(
                TxParameterId::PeerLockImage,
                &sha256(&[0u8; 32]),
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();

        (rpc, params, driver)
    }

    fn initiator_owner_role() -> SwapRole {
        SwapRole {
            is_initiator: true,
            is_btc_owner: true,
        }
    }

    #[tokio::test]
    async fn initial_generates_preimage_for_btc_owner_initiator() {
        let (_rpc, params, driver) = bootstrap(initiator_owner_role());
        assert!(params
            .get::<[u8; 32]>(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))
            .unwrap()
            .is_none());

        driver.initial(1_700_000_000).await.unwrap();

        let secret: [u8; 32] = params
            .get(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))
            .unwrap()
            .unwrap();
        assert_ne!(secret, [0u8; 32]);

        // Re-running `initial` must not regenerate (and thus invalidate) the
        // secret once it's been committed on-chain via its hash.
        driver.initial(1_700_000_001).await.unwrap();
        let secret_again: [u8; 32] = params
            .get(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))
            .unwrap()
            .unwrap();
        assert_eq!(secret, secret_again);
    }

    #[tokio::test]
    async fn initial_does_not_generate_preimage_for_non_initiator() {
        let role = SwapRole {
            is_initiator: false,
            is_btc_owner: true,
        };
        let (_rpc, params, driver) = bootstrap(role);

        driver.initial(1_700_000_000).await.unwrap();

        assert!(params
            .get::<[u8; 32]>(TxParameterId::PreImage, Some(SubTxId::BeamRedeemTx))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lock_tx_vout_derivation_changepos_zero() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();

        let unsigned = build_funding_template(
            &driver.contract_address().unwrap(),
            1_000_000,
        );
        let mut funded_tx = decode_hex_tx(&unsigned).unwrap();
        funded_tx.output.insert(
            0,
            TxOut {
                value: 5_000,
                script_pubkey: driver.contract_address().unwrap().script_pubkey(),
            },
        );
        let funded_hex = hex::encode(bitcoin::consensus::serialize(&funded_tx));

        rpc.fund_raw_transaction.lock().unwrap().push(FundRawTransactionResult {
            hex: funded_hex,
            changepos: 0,
            fee: 0.0001,
        });

        driver.advance_lock_tx().await.unwrap();
        let vout: u32 = params
            .get(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                Some(SubTxId::LockTx),
            )
            .unwrap()
            .unwrap();
        assert_eq!(vout, 1);
    }

    #[tokio::test]
    async fn lock_tx_vout_derivation_no_change() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();

        let unsigned = build_funding_template(&driver.contract_address().unwrap(), 1_000_000);
        rpc.fund_raw_transaction.lock().unwrap().push(FundRawTransactionResult {
            hex: unsigned,
            changepos: -1,
            fee: 0.0001,
        });

        driver.advance_lock_tx().await.unwrap();
        let vout: u32 = params
            .get(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                Some(SubTxId::LockTx),
            )
            .unwrap()
            .unwrap();
        assert_eq!(vout, 0);
    }

    #[tokio::test]
    async fn confirm_lock_tx_gates_on_threshold() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxID,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                &0u32,
                Some(SubTxId::LockTx),
            )
            .unwrap();

        let script_hex = hex::encode(driver.contract_address().unwrap().script_pubkey().as_bytes());

        rpc.get_tx_out.lock().unwrap().push(Some(TxOutResult {
            value: 0.01,
            confirmations: 5,
            script_pub_key: crate::rpc::ScriptPubKeyResult {
                hex: script_hex.clone(),
            },
        }));
        assert!(!driver.confirm_lock_tx().await.unwrap());

        rpc.get_tx_out.lock().unwrap().push(Some(TxOutResult {
            value: 0.01,
            confirmations: 6,
            script_pub_key: crate::rpc::ScriptPubKeyResult { hex: script_hex },
        }));
        assert!(driver.confirm_lock_tx().await.unwrap());
    }

    #[tokio::test]
    async fn confirm_lock_tx_aborts_on_null_result() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxID,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                &0u32,
                Some(SubTxId::LockTx),
            )
            .unwrap();

        rpc.get_tx_out.lock().unwrap().push(None);
        assert!(!driver.confirm_lock_tx().await.unwrap());
    }

    #[tokio::test]
    async fn confirm_lock_tx_rejects_script_mismatch() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxID,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                &0u32,
                Some(SubTxId::LockTx),
            )
            .unwrap();

        rpc.get_tx_out.lock().unwrap().push(Some(TxOutResult {
            value: 0.01,
            confirmations: 6,
            script_pub_key: crate::rpc::ScriptPubKeyResult {
                hex: "76a914deadbeefdeadbeefdeadbeefdeadbeefdeadbeef88ac".to_string(),
            },
        }));

        let err = driver.confirm_lock_tx().await.unwrap_err();
        assert!(matches!(err, SwapError::ConsensusMismatch { .. }));
    }

    #[tokio::test]
    async fn refund_input_script_has_op_0_selector() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxID,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                &0u32,
                Some(SubTxId::LockTx),
            )
            .unwrap();

        let template_tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![],
        };
        *rpc.create_raw_transaction.lock().unwrap() =
            hex::encode(bitcoin::consensus::serialize(&template_tx));

        let secp = Secp256k1::new();
        let (sk, _pk) = secp.generate_keypair(&mut bitcoin::secp256k1::rand::thread_rng());
        let wif = PrivateKey::new(sk, Network::Bitcoin).to_wif();
        *rpc.dump_priv_key.lock().unwrap() = wif;

        driver.advance_withdraw_tx(SubTxId::RefundTx).await.unwrap();
        driver.advance_withdraw_tx(SubTxId::RefundTx).await.unwrap();

        let signed_hex: String = params
            .get(TxParameterId::AtomicSwapExternalTx, Some(SubTxId::RefundTx))
            .unwrap()
            .unwrap();
        let signed_tx = decode_hex_tx(&signed_hex).unwrap();
        let script_bytes = signed_tx.input[0].script_sig.as_bytes();
        assert_eq!(*script_bytes.last().unwrap(), 0x00);
    }

    #[tokio::test]
    async fn redeem_input_script_carries_secret_and_op_1_selector() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        let secret = [7u8; 32];
        params
            .set(TxParameterId::PreImage, &secret, Some(SubTxId::BeamRedeemTx))
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxID,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTxOutputIndex,
                &0u32,
                Some(SubTxId::LockTx),
            )
            .unwrap();

        let template_tx = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                script_sig: bitcoin::ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![],
        };
        *rpc.create_raw_transaction.lock().unwrap() =
            hex::encode(bitcoin::consensus::serialize(&template_tx));

        let secp = Secp256k1::new();
        let (sk, _pk) = secp.generate_keypair(&mut bitcoin::secp256k1::rand::thread_rng());
        let wif = PrivateKey::new(sk, Network::Bitcoin).to_wif();
        *rpc.dump_priv_key.lock().unwrap() = wif;

        driver.advance_withdraw_tx(SubTxId::RedeemTx).await.unwrap();
        driver.advance_withdraw_tx(SubTxId::RedeemTx).await.unwrap();

        let signed_hex: String = params
            .get(TxParameterId::AtomicSwapExternalTx, Some(SubTxId::RedeemTx))
            .unwrap()
            .unwrap();
        let signed_tx = decode_hex_tx(&signed_hex).unwrap();
        let script_bytes = signed_tx.input[0].script_sig.as_bytes();
        assert_eq!(*script_bytes.last().unwrap(), 0x51); // OP_PUSHNUM_1
        let secret_start = script_bytes.len() - 1 - 32;
        assert_eq!(&script_bytes[secret_start..secret_start + 32], &secret);
    }

    #[tokio::test]
    async fn register_tx_is_idempotent() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTx,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        rpc.send_raw_transaction
            .lock()
            .unwrap()
            .push(Some("cafebabe".to_string()));

        driver.register_tx(SubTxId::LockTx).await.unwrap();
        // Second call must not consume another queued response.
        driver.register_tx(SubTxId::LockTx).await.unwrap();
        assert!(rpc.send_raw_transaction.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_tx_surfaces_broadcast_rejection() {
        let (rpc, params, driver) = bootstrap(initiator_owner_role());
        params
            .set(
                TxParameterId::PreImage,
                &[0u8; 32],
                Some(SubTxId::BeamRedeemTx),
            )
            .unwrap();
        params
            .set(
                TxParameterId::AtomicSwapExternalTx,
                &"deadbeef".to_string(),
                Some(SubTxId::LockTx),
            )
            .unwrap();
        rpc.send_raw_transaction.lock().unwrap().push(None);

        let err = driver.register_tx(SubTxId::LockTx).await.unwrap_err();
        assert!(matches!(err, SwapError::BroadcastRejected { .. }));
    }
}
