//! The seam to the external script interpreter, signature-operation
//! accounting, and the parallel check pool.

use std::sync::atomic::{AtomicBool, Ordering};

use novad_primitives::transaction::Transaction;
use rayon::prelude::*;

pub const SCRIPT_VERIFY_NONE: u32 = 0;
pub const SCRIPT_VERIFY_P2SH: u32 = 1 << 0;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 1;

const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKSIGVERIFY: u8 = 0xad;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError(pub &'static str);

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ScriptError {}

/// Spending context handed to the verifier alongside the scripts.
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub value: i64,
}

/// The external script interpreter. Verification must be pure: no side
/// effects, same verdict for the same inputs.
pub trait ScriptVerifier: Send + Sync {
    fn verify(
        &self,
        script_sig: &[u8],
        script_pubkey: &[u8],
        flags: u32,
        context: &TxContext<'_>,
    ) -> Result<(), ScriptError>;
}

/// One queued input check; batched and verified in parallel once the whole
/// block has been walked.
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub value: i64,
    pub flags: u32,
}

/// Runs a block's checks on the rayon pool; the first failure fails the
/// batch. Workers observe the shutdown flag and skip remaining checks.
pub fn run_script_checks(
    verifier: &dyn ScriptVerifier,
    checks: &[ScriptCheck<'_>],
    shutdown: &AtomicBool,
) -> Result<(), ScriptError> {
    checks.par_iter().try_for_each(|check| {
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let context = TxContext {
            tx: check.tx,
            input_index: check.input_index,
            value: check.value,
        };
        verifier.verify(
            &check.tx.vin[check.input_index].script_sig,
            &check.script_pubkey,
            check.flags,
            &context,
        )
    })
}

pub fn is_pay_to_script_hash(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

/// Counts sigops the pre-P2SH way. `accurate` credits CHECKMULTISIG with
/// its real key count when an OP_1..OP_16 precedes it; the legacy mode
/// always charges twenty.
pub fn sigop_count(script: &[u8], accurate: bool) -> u32 {
    let mut count = 0u32;
    let mut cursor = 0usize;
    let mut last_opcode = 0xffu8;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as u32;
                } else {
                    count += 20;
                }
            }
            0x01..=0x4b => cursor += opcode as usize,
            OP_PUSHDATA1 => {
                if cursor >= script.len() {
                    break;
                }
                let len = script[cursor] as usize;
                cursor += 1 + len;
            }
            OP_PUSHDATA2 => {
                if cursor + 2 > script.len() {
                    break;
                }
                let len = u16::from_le_bytes([script[cursor], script[cursor + 1]]) as usize;
                cursor += 2 + len;
            }
            OP_PUSHDATA4 => {
                if cursor + 4 > script.len() {
                    break;
                }
                let len = u32::from_le_bytes([
                    script[cursor],
                    script[cursor + 1],
                    script[cursor + 2],
                    script[cursor + 3],
                ]) as usize;
                cursor += 4 + len;
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

/// Sigops hidden in the redeem script of a P2SH spend: the last push of
/// the scriptSig, counted accurately.
pub fn p2sh_sigop_count(script_sig: &[u8], script_pubkey: &[u8]) -> u32 {
    if !is_pay_to_script_hash(script_pubkey) {
        return 0;
    }
    match last_push(script_sig) {
        Some(redeem_script) => sigop_count(redeem_script, true),
        None => 0,
    }
}

fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut cursor = 0usize;
    let mut last: Option<&[u8]> = None;
    while cursor < script.len() {
        let opcode = script[cursor];
        cursor += 1;
        let len = match opcode {
            0x00 => 0,
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(cursor)? as usize;
                cursor += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(cursor..cursor + 2)?;
                cursor += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(cursor..cursor + 4)?;
                cursor += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            // Anything that is not a push disqualifies the scriptSig.
            _ => return None,
        };
        let data = script.get(cursor..cursor + len)?;
        cursor += len;
        last = Some(data);
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_plain_checksigs() {
        assert_eq!(sigop_count(&[OP_CHECKSIG, OP_CHECKSIG], false), 2);
        assert_eq!(sigop_count(&[OP_CHECKSIGVERIFY], false), 1);
    }

    #[test]
    fn multisig_is_twenty_unless_accurate() {
        let script = [OP_1 + 2, OP_CHECKMULTISIG];
        assert_eq!(sigop_count(&script, false), 20);
        assert_eq!(sigop_count(&script, true), 3);
    }

    #[test]
    fn pushdata_is_skipped_not_counted() {
        // A push whose payload byte happens to be OP_CHECKSIG.
        let script = [0x01, OP_CHECKSIG];
        assert_eq!(sigop_count(&script, false), 0);
    }

    #[test]
    fn p2sh_counts_redeem_script() {
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&[0u8; 20]);
        script_pubkey.push(OP_EQUAL);
        assert!(is_pay_to_script_hash(&script_pubkey));

        // scriptSig pushing a redeem script with two checksigs.
        let script_sig = [0x02, OP_CHECKSIG, OP_CHECKSIG];
        assert_eq!(p2sh_sigop_count(&script_sig, &script_pubkey), 2);

        // Not P2SH: nothing extra.
        assert_eq!(p2sh_sigop_count(&script_sig, &[OP_CHECKSIG]), 0);
    }

    #[test]
    fn non_push_script_sig_contributes_nothing() {
        let mut script_pubkey = vec![OP_HASH160, 0x14];
        script_pubkey.extend_from_slice(&[0u8; 20]);
        script_pubkey.push(OP_EQUAL);
        assert_eq!(p2sh_sigop_count(&[OP_CHECKSIG], &script_pubkey), 0);
    }
}
