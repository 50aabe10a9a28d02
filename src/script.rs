//! Script execution engine
//!
//! A stack machine over byte vectors. Locking and unlocking scripts are
//! evaluated in sequence against one stack; a script passes when it runs to
//! completion without error and leaves a true value on top. Signature checks
//! are routed through [`SignatureChecker`] so the interpreter itself never sees
//! a transaction.

use crate::constants::*;
use crate::error::ScriptError;
use crate::serialization::{double_sha256, encode_transaction};
use crate::types::*;
use bitcoin_hashes::{sha1, Hash as _};
use bitflags::bitflags;
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_RESERVED: u8 = 0x50;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;

    pub const OP_NOP: u8 = 0x61;
    pub const OP_VER: u8 = 0x62;
    pub const OP_IF: u8 = 0x63;
    pub const OP_NOTIF: u8 = 0x64;
    pub const OP_VERIF: u8 = 0x65;
    pub const OP_VERNOTIF: u8 = 0x66;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_VERIFY: u8 = 0x69;
    pub const OP_RETURN: u8 = 0x6a;

    pub const OP_TOALTSTACK: u8 = 0x6b;
    pub const OP_FROMALTSTACK: u8 = 0x6c;
    pub const OP_2DROP: u8 = 0x6d;
    pub const OP_2DUP: u8 = 0x6e;
    pub const OP_3DUP: u8 = 0x6f;
    pub const OP_2OVER: u8 = 0x70;
    pub const OP_2ROT: u8 = 0x71;
    pub const OP_2SWAP: u8 = 0x72;
    pub const OP_IFDUP: u8 = 0x73;
    pub const OP_DEPTH: u8 = 0x74;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_NIP: u8 = 0x77;
    pub const OP_OVER: u8 = 0x78;
    pub const OP_PICK: u8 = 0x79;
    pub const OP_ROLL: u8 = 0x7a;
    pub const OP_ROT: u8 = 0x7b;
    pub const OP_SWAP: u8 = 0x7c;
    pub const OP_TUCK: u8 = 0x7d;

    pub const OP_CAT: u8 = 0x7e;
    pub const OP_SUBSTR: u8 = 0x7f;
    pub const OP_LEFT: u8 = 0x80;
    pub const OP_RIGHT: u8 = 0x81;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_INVERT: u8 = 0x83;
    pub const OP_AND: u8 = 0x84;
    pub const OP_OR: u8 = 0x85;
    pub const OP_XOR: u8 = 0x86;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_RESERVED1: u8 = 0x89;
    pub const OP_RESERVED2: u8 = 0x8a;

    pub const OP_1ADD: u8 = 0x8b;
    pub const OP_1SUB: u8 = 0x8c;
    pub const OP_2MUL: u8 = 0x8d;
    pub const OP_2DIV: u8 = 0x8e;
    pub const OP_NEGATE: u8 = 0x8f;
    pub const OP_ABS: u8 = 0x90;
    pub const OP_NOT: u8 = 0x91;
    pub const OP_0NOTEQUAL: u8 = 0x92;
    pub const OP_ADD: u8 = 0x93;
    pub const OP_SUB: u8 = 0x94;
    pub const OP_MUL: u8 = 0x95;
    pub const OP_DIV: u8 = 0x96;
    pub const OP_MOD: u8 = 0x97;
    pub const OP_LSHIFT: u8 = 0x98;
    pub const OP_RSHIFT: u8 = 0x99;
    pub const OP_BOOLAND: u8 = 0x9a;
    pub const OP_BOOLOR: u8 = 0x9b;
    pub const OP_NUMEQUAL: u8 = 0x9c;
    pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
    pub const OP_NUMNOTEQUAL: u8 = 0x9e;
    pub const OP_LESSTHAN: u8 = 0x9f;
    pub const OP_GREATERTHAN: u8 = 0xa0;
    pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
    pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
    pub const OP_MIN: u8 = 0xa3;
    pub const OP_MAX: u8 = 0xa4;
    pub const OP_WITHIN: u8 = 0xa5;

    pub const OP_RIPEMD160: u8 = 0xa6;
    pub const OP_SHA1: u8 = 0xa7;
    pub const OP_SHA256: u8 = 0xa8;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_HASH256: u8 = 0xaa;
    pub const OP_CODESEPARATOR: u8 = 0xab;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

    pub const OP_NOP1: u8 = 0xb0;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
    pub const OP_NOP4: u8 = 0xb3;
    pub const OP_NOP10: u8 = 0xb9;
}

use opcodes::*;

bitflags! {
    /// Script verification rules
    #[derive(Default)]
    pub struct ScriptFlags: u32 {
        const P2SH = 1 << 0;
        const STRICTENC = 1 << 1;
        const DERSIG = 1 << 2;
        const LOW_S = 1 << 3;
        const NULLDUMMY = 1 << 4;
        const SIGPUSHONLY = 1 << 5;
        const MINIMALDATA = 1 << 6;
        const DISCOURAGE_UPGRADABLE_NOPS = 1 << 7;
        const CLEANSTACK = 1 << 8;
        const CHECKLOCKTIMEVERIFY = 1 << 9;
        const CHECKSEQUENCEVERIFY = 1 << 10;
        const NULLFAIL = 1 << 14;
    }
}

/// Rules applied to unconfirmed transactions; a superset of every consensus rule
pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = ScriptFlags::from_bits_truncate(
    ScriptFlags::P2SH.bits()
        | ScriptFlags::STRICTENC.bits()
        | ScriptFlags::DERSIG.bits()
        | ScriptFlags::LOW_S.bits()
        | ScriptFlags::NULLDUMMY.bits()
        | ScriptFlags::MINIMALDATA.bits()
        | ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS.bits()
        | ScriptFlags::CLEANSTACK.bits()
        | ScriptFlags::CHECKLOCKTIMEVERIFY.bits()
        | ScriptFlags::CHECKSEQUENCEVERIFY.bits()
        | ScriptFlags::NULLFAIL.bits(),
);

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

// ============================================================================
// PARSING
// ============================================================================

/// GetOp: read one instruction at `pc`, advancing it.
/// Push opcodes return their data; every other opcode returns `None`.
pub fn read_instruction<'a>(script: &'a [u8], pc: &mut usize) -> ScriptResult<(u8, Option<&'a [u8]>)> {
    let opcode = *script.get(*pc).ok_or(ScriptError::BadPush)?;
    *pc += 1;
    if opcode > OP_PUSHDATA4 {
        return Ok((opcode, None));
    }
    let len = match opcode {
        OP_PUSHDATA1 => read_len(script, pc, 1)?,
        OP_PUSHDATA2 => read_len(script, pc, 2)?,
        OP_PUSHDATA4 => read_len(script, pc, 4)?,
        n => n as usize,
    };
    let end = pc.checked_add(len).ok_or(ScriptError::BadPush)?;
    let data = script.get(*pc..end).ok_or(ScriptError::BadPush)?;
    *pc = end;
    Ok((opcode, Some(data)))
}

/// Big-endian length prefix of OP_PUSHDATA1/2/4
fn read_len(script: &[u8], pc: &mut usize, width: usize) -> ScriptResult<usize> {
    let bytes = script.get(*pc..*pc + width).ok_or(ScriptError::BadPush)?;
    *pc += width;
    Ok(bytes.iter().fold(0usize, |acc, &b| (acc << 8) | b as usize))
}

/// Script consisting only of push operations (OP_1NEGATE and OP_1..OP_16 included)
pub fn is_push_only(script: &[u8]) -> bool {
    let mut pc = 0;
    while pc < script.len() {
        match read_instruction(script, &mut pc) {
            Ok((opcode, _)) if opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

/// `OP_HASH160 <20 bytes> OP_EQUAL`
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

/// Encode a data push using the shortest form
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_be_bytes());
    }
    script.extend_from_slice(data);
}

/// Small helper for assembling scripts
#[derive(Debug, Clone, Default)]
pub struct Builder(Vec<u8>);

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.0.push(opcode);
        self
    }

    pub fn push_slice(mut self, data: &[u8]) -> Self {
        push_data(&mut self.0, data);
        self
    }

    /// Push a number using OP_0, OP_1NEGATE, OP_1..OP_16 where possible
    pub fn push_int(mut self, n: i64) -> Self {
        match n {
            0 => self.0.push(OP_0),
            -1 => self.0.push(OP_1NEGATE),
            1..=16 => self.0.push(OP_1 + (n as u8) - 1),
            _ => push_data(&mut self.0, &encode_num(n)),
        }
        self
    }

    pub fn into_script(self) -> ByteString {
        self.0
    }
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(Sha256::digest(data)));
    out
}

pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> ByteString {
    Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(pubkey_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> ByteString {
    Builder::new()
        .push_opcode(OP_HASH160)
        .push_slice(script_hash)
        .push_opcode(OP_EQUAL)
        .into_script()
}

// ============================================================================
// NUMBERS
// ============================================================================

/// Decode a little-endian sign-magnitude script number of at most `max_len` bytes
pub fn decode_num(bytes: &[u8], require_minimal: bool, max_len: usize) -> ScriptResult<i64> {
    if bytes.len() > max_len {
        return Err(ScriptError::InvalidNumber);
    }
    let Some(&last) = bytes.last() else {
        return Ok(0);
    };
    if require_minimal && last & 0x7f == 0 && (bytes.len() == 1 || bytes[bytes.len() - 2] & 0x80 == 0) {
        return Err(ScriptError::InvalidNumber);
    }
    let mut result: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        result |= (byte as i64) << (8 * i);
    }
    if last & 0x80 != 0 {
        let sign_bit = 0x80i64 << (8 * (bytes.len() - 1));
        return Ok(-(result & !sign_bit));
    }
    Ok(result)
}

pub fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

/// Any non-zero byte is true, except a lone sign bit (negative zero)
pub fn cast_to_bool(bytes: &[u8]) -> bool {
    for (i, &byte) in bytes.iter().enumerate() {
        if byte != 0 {
            return !(i == bytes.len() - 1 && byte == 0x80);
        }
    }
    false
}

fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    match data.len() {
        0 => opcode == OP_0,
        1 if (1..=16).contains(&data[0]) => false,
        1 if data[0] == 0x81 => false,
        len if len < OP_PUSHDATA1 as usize => opcode as usize == len,
        len if len <= 0xff => opcode == OP_PUSHDATA1,
        len if len <= 0xffff => opcode == OP_PUSHDATA2,
        _ => true,
    }
}

fn is_disabled(opcode: u8) -> bool {
    matches!(
        opcode,
        OP_CAT
            | OP_SUBSTR
            | OP_LEFT
            | OP_RIGHT
            | OP_INVERT
            | OP_AND
            | OP_OR
            | OP_XOR
            | OP_2MUL
            | OP_2DIV
            | OP_MUL
            | OP_DIV
            | OP_MOD
            | OP_LSHIFT
            | OP_RSHIFT
    )
}

// ============================================================================
// SIGNATURE AND KEY ENCODING
// ============================================================================

/// Strict DER plus trailing hash type byte
pub fn is_valid_signature_encoding(sig: &[u8]) -> bool {
    let len = sig.len();
    if !(9..=73).contains(&len) {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != len - 3 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= len {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 7 != len {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || sig[4] & 0x80 != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && sig[5] & 0x80 == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || sig[len_r + 6] & 0x80 != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && sig[len_r + 7] & 0x80 == 0 {
        return false;
    }
    true
}

fn is_low_der_signature(sig: &[u8]) -> ScriptResult<()> {
    if !is_valid_signature_encoding(sig) {
        return Err(ScriptError::SigDer);
    }
    let parsed = Signature::from_der_lax(&sig[..sig.len() - 1]).map_err(|_| ScriptError::SigDer)?;
    let mut normalized = parsed;
    normalized.normalize_s();
    if normalized != parsed {
        return Err(ScriptError::SigHighS);
    }
    Ok(())
}

fn is_defined_hashtype(sig: &[u8]) -> bool {
    match sig.last() {
        Some(&ht) => (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&((ht as u32) & !SIGHASH_ANYONECANPAY)),
        None => false,
    }
}

/// Encoding rules on a signature before it reaches the checker. Empty
/// signatures are always allowed so a failed CHECKSIG can be intentional.
pub fn check_signature_encoding(sig: &[u8], flags: ScriptFlags) -> ScriptResult<()> {
    if sig.is_empty() {
        return Ok(());
    }
    if flags.intersects(ScriptFlags::DERSIG | ScriptFlags::LOW_S | ScriptFlags::STRICTENC)
        && !is_valid_signature_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if flags.contains(ScriptFlags::LOW_S) {
        is_low_der_signature(sig)?;
    }
    if flags.contains(ScriptFlags::STRICTENC) && !is_defined_hashtype(sig) {
        return Err(ScriptError::SigHashType);
    }
    Ok(())
}

pub fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> ScriptResult<()> {
    if !flags.contains(ScriptFlags::STRICTENC) {
        return Ok(());
    }
    let compressed = pubkey.len() == 33 && (pubkey[0] == 0x02 || pubkey[0] == 0x03);
    let uncompressed = pubkey.len() == 65 && pubkey[0] == 0x04;
    if compressed || uncompressed {
        Ok(())
    } else {
        Err(ScriptError::PubkeyType)
    }
}

// ============================================================================
// SIGNATURE HASH
// ============================================================================

fn one_hash() -> Hash {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
}

/// FindAndDelete: drop every instruction-aligned occurrence of `pattern`
pub fn find_and_delete(script: &[u8], pattern: &[u8]) -> ByteString {
    if pattern.is_empty() {
        return script.to_vec();
    }
    let mut result = Vec::with_capacity(script.len());
    let mut pc = 0;
    let mut start = 0;
    loop {
        result.extend_from_slice(&script[start..pc]);
        while script.len() - pc >= pattern.len() && script[pc..].starts_with(pattern) {
            pc += pattern.len();
        }
        start = pc;
        if pc >= script.len() || read_instruction(script, &mut pc).is_err() {
            break;
        }
    }
    result.extend_from_slice(&script[start..]);
    result
}

/// Legacy signature digest of input `input_index` committing to `script_code`
pub fn signature_hash(script_code: &[u8], tx: &Transaction, input_index: usize, hash_type: u32) -> Hash {
    if input_index >= tx.inputs.len() {
        return one_hash();
    }
    let base_type = hash_type & 0x1f;
    if base_type == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return one_hash();
    }

    let script_code = find_and_delete(script_code, &[OP_CODESEPARATOR]);
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    let mut copy = Transaction {
        version: tx.version,
        inputs: Vec::with_capacity(tx.inputs.len()),
        outputs: Vec::new(),
        lock_time: tx.lock_time,
    };
    for (i, input) in tx.inputs.iter().enumerate() {
        if anyone_can_pay && i != input_index {
            continue;
        }
        let mut input = input.clone();
        if i == input_index {
            input.script_sig = script_code.clone();
        } else {
            input.script_sig.clear();
            if base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE {
                input.sequence = 0;
            }
        }
        copy.inputs.push(input);
    }
    match base_type {
        SIGHASH_NONE => {}
        SIGHASH_SINGLE => {
            copy.outputs = tx.outputs[..=input_index].to_vec();
            for output in copy.outputs.iter_mut().take(input_index) {
                output.value = -1;
                output.script_pubkey.clear();
            }
        }
        _ => copy.outputs = tx.outputs.clone(),
    }

    let mut buf = Vec::new();
    encode_transaction(&mut buf, &copy);
    buf.extend_from_slice(&hash_type.to_be_bytes());
    double_sha256(&buf)
}

// ============================================================================
// CHECKERS
// ============================================================================

/// Context-dependent checks the interpreter delegates to its caller
pub trait SignatureChecker {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool;
    fn check_lock_time(&self, lock_time: i64) -> bool;
    fn check_sequence(&self, sequence: i64) -> bool;
}

/// Checker with no transaction context: every check fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSignatureChecker;

impl SignatureChecker for NoSignatureChecker {
    fn check_sig(&self, _sig: &[u8], _pubkey: &[u8], _script_code: &[u8]) -> bool {
        false
    }

    fn check_lock_time(&self, _lock_time: i64) -> bool {
        false
    }

    fn check_sequence(&self, _sequence: i64) -> bool {
        false
    }
}

fn verification_context() -> &'static Secp256k1<VerifyOnly> {
    static CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::verification_only)
}

/// Checks signatures against input `input_index` of `tx`
#[derive(Debug, Clone, Copy)]
pub struct TransactionSignatureChecker<'a> {
    tx: &'a Transaction,
    input_index: usize,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize) -> Self {
        Self { tx, input_index }
    }
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8]) -> bool {
        let Some((&hash_type, der)) = sig.split_last() else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        // Lax parsing accepts everything strict DER does; strictness is enforced upstream
        let Ok(mut signature) = Signature::from_der_lax(der) else {
            return false;
        };
        signature.normalize_s();
        let digest = signature_hash(script_code, self.tx, self.input_index, hash_type as u32);
        let Ok(message) = Message::from_digest_slice(&digest) else {
            return false;
        };
        verification_context().verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock_time = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        // Height-based and time-based lock times are not comparable
        if (tx_lock_time < threshold) != (lock_time < threshold) {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        // A final input would disable the transaction's lock time altogether
        self.tx
            .inputs
            .get(self.input_index)
            .map_or(false, |input| input.sequence != SEQUENCE_FINAL)
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let Some(input) = self.tx.inputs.get(self.input_index) else {
            return false;
        };
        let tx_sequence = input.sequence as i64;
        if self.tx.version < 2 {
            return false;
        }
        if tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        if (tx_masked < type_flag) != (masked < type_flag) {
            return false;
        }
        masked <= tx_masked
    }
}

// ============================================================================
// INTERPRETER
// ============================================================================

fn stack_top(stack: &[ByteString], depth: usize) -> ScriptResult<&ByteString> {
    if depth == 0 || depth > stack.len() {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn pop(stack: &mut Vec<ByteString>) -> ScriptResult<ByteString> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn pop_num(stack: &mut Vec<ByteString>, require_minimal: bool) -> ScriptResult<i64> {
    let item = pop(stack)?;
    decode_num(&item, require_minimal, 4)
}

fn push_bool(stack: &mut Vec<ByteString>, value: bool) {
    stack.push(if value { vec![1] } else { Vec::new() });
}

fn require(stack: &[ByteString], n: usize) -> ScriptResult<()> {
    if stack.len() < n {
        Err(ScriptError::InvalidStackOperation)
    } else {
        Ok(())
    }
}

/// EvalScript: run `script` against `stack`
pub fn eval_script(
    stack: &mut Vec<ByteString>,
    script: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize(script.len()));
    }
    let require_minimal = flags.contains(ScriptFlags::MINIMALDATA);
    let mut pc = 0;
    let mut code_start = 0;
    let mut exec: Vec<bool> = Vec::new();
    let mut altstack: Vec<ByteString> = Vec::new();
    let mut op_count = 0usize;

    while pc < script.len() {
        let executing = exec.iter().all(|&branch| branch);
        let (opcode, push) = read_instruction(script, &mut pc)?;

        if let Some(data) = push {
            if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize(data.len()));
            }
        }
        if opcode > OP_16 {
            op_count += 1;
            if op_count > MAX_OPS_PER_SCRIPT {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode) {
            return Err(ScriptError::DisabledOpcode(opcode));
        }

        if let Some(data) = push {
            if executing {
                if require_minimal && !check_minimal_push(data, opcode) {
                    return Err(ScriptError::MinimalData);
                }
                stack.push(data.to_vec());
            }
        } else if executing || (OP_IF..=OP_ENDIF).contains(&opcode) {
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = if opcode == OP_1NEGATE { -1 } else { (opcode - OP_1 + 1) as i64 };
                    stack.push(encode_num(n));
                }

                // Flow control
                OP_NOP => {}
                OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                    if flags.contains(ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS) {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_CHECKLOCKTIMEVERIFY => {
                    if !flags.contains(ScriptFlags::CHECKLOCKTIMEVERIFY) {
                        if flags.contains(ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS) {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        // Five bytes: lock times reach 2^32 - 1
                        let lock_time = decode_num(stack_top(stack, 1)?, require_minimal, 5)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(lock_time) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if !flags.contains(ScriptFlags::CHECKSEQUENCEVERIFY) {
                        if flags.contains(ScriptFlags::DISCOURAGE_UPGRADABLE_NOPS) {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let sequence = decode_num(stack_top(stack, 1)?, require_minimal, 5)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64 == 0
                            && !checker.check_sequence(sequence)
                        {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if executing {
                        let top = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        value = cast_to_bool(&top);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec.push(value);
                }
                OP_ELSE => {
                    let last = exec.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(&pop(stack)?) {
                        return Err(ScriptError::Verify);
                    }
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                // Stack
                OP_TOALTSTACK => altstack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let item = altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(item);
                }
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    require(stack, 2)?;
                    let a = stack[stack.len() - 2].clone();
                    let b = stack[stack.len() - 1].clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    require(stack, 3)?;
                    let items = stack[stack.len() - 3..].to_vec();
                    stack.extend(items);
                }
                OP_2OVER => {
                    require(stack, 4)?;
                    let items = stack[stack.len() - 4..stack.len() - 2].to_vec();
                    stack.extend(items);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let start = stack.len() - 6;
                    let items: Vec<_> = stack.drain(start..start + 2).collect();
                    stack.extend(items);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let len = stack.len();
                    stack.swap(len - 4, len - 2);
                    stack.swap(len - 3, len - 1);
                }
                OP_IFDUP => {
                    let top = stack_top(stack, 1)?.clone();
                    if cast_to_bool(&top) {
                        stack.push(top);
                    }
                }
                OP_DEPTH => stack.push(encode_num(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let top = stack_top(stack, 1)?.clone();
                    stack.push(top);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    stack.remove(stack.len() - 2);
                }
                OP_OVER => {
                    let item = stack_top(stack, 2)?.clone();
                    stack.push(item);
                }
                OP_PICK | OP_ROLL => {
                    let n = pop_num(stack, require_minimal)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let index = stack.len() - 1 - n as usize;
                    let item = if opcode == OP_ROLL {
                        stack.remove(index)
                    } else {
                        stack[index].clone()
                    };
                    stack.push(item);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let item = stack.remove(stack.len() - 3);
                    stack.push(item);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let len = stack.len();
                    stack.swap(len - 2, len - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let top = stack[stack.len() - 1].clone();
                    stack.insert(stack.len() - 2, top);
                }
                OP_SIZE => {
                    let size = stack_top(stack, 1)?.len();
                    stack.push(encode_num(size as i64));
                }

                // Bitwise logic
                OP_EQUAL | OP_EQUALVERIFY => {
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        push_bool(stack, equal);
                    }
                }

                // Numeric
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = pop_num(stack, require_minimal)?;
                    let result = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(encode_num(result));
                }
                OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMEQUALVERIFY
                | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    require(stack, 2)?;
                    let b = pop_num(stack, require_minimal)?;
                    let a = pop_num(stack, require_minimal)?;
                    let result = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if result == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(encode_num(result));
                    }
                }
                OP_WITHIN => {
                    require(stack, 3)?;
                    let max = pop_num(stack, require_minimal)?;
                    let min = pop_num(stack, require_minimal)?;
                    let x = pop_num(stack, require_minimal)?;
                    push_bool(stack, min <= x && x < max);
                }

                // Crypto
                OP_RIPEMD160 | OP_SHA1 | OP_SHA256 | OP_HASH160 | OP_HASH256 => {
                    let item = pop(stack)?;
                    let digest = match opcode {
                        OP_RIPEMD160 => Ripemd160::digest(&item).to_vec(),
                        OP_SHA1 => sha1::Hash::hash(&item).into_inner().to_vec(),
                        OP_SHA256 => Sha256::digest(&item).to_vec(),
                        OP_HASH160 => hash160(&item).to_vec(),
                        _ => double_sha256(&item).to_vec(),
                    };
                    stack.push(digest);
                }
                OP_CODESEPARATOR => code_start = pc,
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    let mut pattern = Vec::new();
                    push_data(&mut pattern, &sig);
                    let script_code = find_and_delete(&script[code_start..], &pattern);

                    check_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let success = !sig.is_empty() && checker.check_sig(&sig, &pubkey, &script_code);
                    if !success && flags.contains(ScriptFlags::NULLFAIL) && !sig.is_empty() {
                        return Err(ScriptError::SigNullFail);
                    }
                    if opcode == OP_CHECKSIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        push_bool(stack, success);
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let success = check_multisig(
                        stack,
                        &script[code_start..],
                        flags,
                        checker,
                        &mut op_count,
                    )?;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        push_bool(stack, success);
                    }
                }

                other => return Err(ScriptError::BadOpcode(other)),
            }
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(())
}

/// Stack layout, top first: n_keys, keys, n_sigs, sigs, dummy
fn check_multisig(
    stack: &mut Vec<ByteString>,
    script_code: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
    op_count: &mut usize,
) -> ScriptResult<bool> {
    let require_minimal = flags.contains(ScriptFlags::MINIMALDATA);
    let mut i = 1;
    let n_keys = decode_num(stack_top(stack, i)?, require_minimal, 4)?;
    if n_keys < 0 || n_keys as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    let mut n_keys = n_keys as usize;
    *op_count += n_keys;
    if *op_count > MAX_OPS_PER_SCRIPT {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let mut key_index = i;
    // Keys not yet consumed when a null-fail check may still apply
    let mut keys_left_for_cleanup = n_keys + 2;
    i += n_keys;

    let n_sigs = decode_num(stack_top(stack, i)?, require_minimal, 4)?;
    if n_sigs < 0 || n_sigs as usize > n_keys {
        return Err(ScriptError::SigCount);
    }
    let mut n_sigs = n_sigs as usize;
    i += 1;
    let mut sig_index = i;
    i += n_sigs;
    require(stack, i)?;

    let mut script_code = script_code.to_vec();
    for k in 0..n_sigs {
        let mut pattern = Vec::new();
        push_data(&mut pattern, stack_top(stack, sig_index + k)?);
        script_code = find_and_delete(&script_code, &pattern);
    }

    let mut success = true;
    while success && n_sigs > 0 {
        let sig = stack_top(stack, sig_index)?;
        let pubkey = stack_top(stack, key_index)?;
        check_signature_encoding(sig, flags)?;
        check_pubkey_encoding(pubkey, flags)?;
        if !sig.is_empty() && checker.check_sig(sig, pubkey, &script_code) {
            sig_index += 1;
            n_sigs -= 1;
        }
        key_index += 1;
        n_keys -= 1;
        // More signatures left than keys means failure
        if n_sigs > n_keys {
            success = false;
        }
    }

    while i > 1 {
        i -= 1;
        if !success
            && flags.contains(ScriptFlags::NULLFAIL)
            && keys_left_for_cleanup == 0
            && !stack_top(stack, 1)?.is_empty()
        {
            return Err(ScriptError::SigNullFail);
        }
        keys_left_for_cleanup = keys_left_for_cleanup.saturating_sub(1);
        pop(stack)?;
    }

    // An off-by-one in the original protocol consumes one extra element
    let dummy = pop(stack)?;
    if flags.contains(ScriptFlags::NULLDUMMY) && !dummy.is_empty() {
        return Err(ScriptError::SigNullDummy);
    }
    Ok(success)
}

/// VerifyScript: unlocking script, then locking script, then P2SH redeem script
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &dyn SignatureChecker,
) -> ScriptResult<()> {
    if flags.contains(ScriptFlags::SIGPUSHONLY) && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack = Vec::new();
    eval_script(&mut stack, script_sig, flags, checker)?;
    let p2sh_stack = if flags.contains(ScriptFlags::P2SH) {
        stack.clone()
    } else {
        Vec::new()
    };
    eval_script(&mut stack, script_pubkey, flags, checker)?;
    match stack.last() {
        Some(top) if cast_to_bool(top) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if flags.contains(ScriptFlags::P2SH) && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = p2sh_stack;
        let redeem_script = pop(&mut stack)?;
        eval_script(&mut stack, &redeem_script, flags, checker)?;
        match stack.last() {
            Some(top) if cast_to_bool(top) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if flags.contains(ScriptFlags::CLEANSTACK) && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }
    Ok(())
}

// ============================================================================
// SIGNATURE OPERATION COUNTING
// ============================================================================

/// Legacy sigop count. `accurate` reads the key count of a preceding OP_N
/// for CHECKMULTISIG instead of assuming the maximum.
pub fn count_sigops(script: &[u8], accurate: bool) -> usize {
    let mut count = 0;
    let mut pc = 0;
    let mut last_opcode = 0xff;
    while pc < script.len() {
        let Ok((opcode, _)) = read_instruction(script, &mut pc) else {
            break;
        };
        match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                    count += (last_opcode - OP_1 + 1) as usize;
                } else {
                    count += MAX_PUBKEYS_PER_MULTISIG;
                }
            }
            _ => {}
        }
        last_opcode = opcode;
    }
    count
}

/// Sigops in the redeem script a P2SH spend reveals
pub fn p2sh_sigop_count(script_sig: &[u8], script_pubkey: &[u8]) -> usize {
    if !is_p2sh(script_pubkey) {
        return 0;
    }
    let mut pc = 0;
    let mut last_push: &[u8] = &[];
    while pc < script_sig.len() {
        match read_instruction(script_sig, &mut pc) {
            Ok((_, Some(data))) => last_push = data,
            Ok((opcode, None)) if opcode <= OP_16 => last_push = &[],
            _ => return 0,
        }
    }
    count_sigops(last_push, true)
}
