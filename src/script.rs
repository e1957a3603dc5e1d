//! Construction of the atomic-swap HTLC contract script.
//!
//! Pure, deterministic, and byte-identical across runs: this is the contract
//! both parties embed in the P2SH lock output and must reproduce exactly to
//! validate or spend it.

use bitcoin::blockdata::opcodes::all::{
    OP_CHECKLOCKTIMEVERIFY, OP_CHECKSIG, OP_DROP, OP_DUP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY,
    OP_HASH160, OP_IF, OP_SHA256, OP_SIZE,
};
use bitcoin::blockdata::script::Builder;
use bitcoin::ScriptBuf;

use crate::error::ScriptError;

const PUBKEY_HASH_LEN: usize = 20;

/// Largest magnitude `OP_CHECKLOCKTIMEVERIFY` will accept: BIP65 compares the
/// locktime operand as a script number with the standard 5-byte limit, so
/// anything outside `[0, 2^39 - 1]` can never be a valid absolute locktime.
const MAX_CLTV_LOCKTIME: i64 = (1i64 << 39) - 1;

/// Builds the HTLC redeem script:
///
/// ```text
/// OP_IF
///   OP_SIZE <secretSize> OP_EQUALVERIFY
///   OP_SHA256 <secretHash> OP_EQUALVERIFY
///   OP_DUP OP_HASH160 <hashB>
/// OP_ELSE
///   <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP
///   OP_DUP OP_HASH160 <hashA>
/// OP_ENDIF
/// OP_EQUALVERIFY
/// OP_CHECKSIG
/// ```
///
/// `hash_a` is the funder's pubkey hash (refund path), `hash_b` the redeemer's
/// (claim path). The two common trailing ops are factored out of both
/// branches; callers constructing input scripts must match this exact shape.
pub fn build_htlc_script(
    hash_a: &[u8],
    hash_b: &[u8],
    locktime: i64,
    secret_hash: &[u8; 32],
    secret_size: usize,
) -> Result<ScriptBuf, ScriptError> {
    if hash_a.len() != PUBKEY_HASH_LEN {
        return Err(ScriptError::InvalidHashLength(hash_a.len()));
    }
    if hash_b.len() != PUBKEY_HASH_LEN {
        return Err(ScriptError::InvalidHashLength(hash_b.len()));
    }

    let secret_size_i64 = i64::try_from(secret_size)
        .map_err(|_| ScriptError::SecretSizeOverflow(secret_size))?;

    if !(0..=MAX_CLTV_LOCKTIME).contains(&locktime) {
        return Err(ScriptError::LocktimeOverflow(locktime));
    }

    Ok(Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SIZE)
        .push_int(secret_size_i64)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_SHA256)
        .push_slice(secret_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(<&[u8; PUBKEY_HASH_LEN]>::try_from(hash_b).unwrap())
        .push_opcode(OP_ELSE)
        .push_int(locktime)
        .push_opcode(OP_CHECKLOCKTIMEVERIFY)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(<&[u8; PUBKEY_HASH_LEN]>::try_from(hash_a).unwrap())
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}
