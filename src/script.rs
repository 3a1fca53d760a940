//! Script execution engine for output-locking predicates.
//!
//! A script is a byte string interpreted by a stack machine over byte-string
//! items. Verification of an input runs `script_sig` then `script_pubkey`
//! on the same stack and succeeds iff the final top of stack is true.
//! Signature opcodes are parameterized by the spending transaction and the
//! input index through [`SignatureChecker`].

use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use crate::constants::*;
use crate::error::ScriptError;
use crate::serialize::{encode_to_vec, Encodable};
use crate::types::{double_sha256, Hash, Transaction, TxOut};

pub type Result<T> = std::result::Result<T, ScriptError>;

// Push opcodes
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;

// Flow control
pub const OP_NOP: u8 = 0x61;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

// Stack
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
pub const OP_SIZE: u8 = 0x82;

// Equality
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;

// Arithmetic
pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
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

// Hashing and signatures
pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

// Sighash flags (last byte of each signature)
pub const SIGHASH_ALL: u8 = 0x01;
pub const SIGHASH_NONE: u8 = 0x02;
pub const SIGHASH_SINGLE: u8 = 0x03;
pub const SIGHASH_ANYONECANPAY: u8 = 0x80;

/// Append a minimal push of `data` to a script under construction.
pub fn push_slice(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        0 => script.push(OP_0),
        1..=0x4b => {
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        0x4c..=0xff => {
            script.push(OP_PUSHDATA1);
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
        0x100..=0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(data.len() as u16).to_le_bytes());
            script.extend_from_slice(data);
        }
        _ => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(data.len() as u32).to_le_bytes());
            script.extend_from_slice(data);
        }
    }
}

/// Standard pay-to-pubkey-hash locking script.
pub fn p2pkh_script(pubkey_hash: &crate::types::Hash160) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160];
    push_slice(&mut script, pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Pay-to-pubkey locking script.
pub fn p2pk_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(pubkey.len() + 2);
    push_slice(&mut script, pubkey);
    script.push(OP_CHECKSIG);
    script
}

fn fail(reason: impl Into<String>) -> ScriptError {
    ScriptError::ScriptFailure { reason: reason.into() }
}

/// Truth of a stack item: false is empty, all-zero, or negative zero.
fn cast_to_bool(item: &[u8]) -> bool {
    for (i, &b) in item.iter().enumerate() {
        if b != 0 {
            // Negative zero: sign bit only, in the last byte.
            if i == item.len() - 1 && b == 0x80 {
                return false;
            }
            return true;
        }
    }
    false
}

/// Encode a script number: little-endian sign-magnitude, minimal length.
fn encode_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![];
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().map_or(false, |b| b & 0x80 != 0) {
        out.push(if negative { 0x80 } else { 0 });
    } else if negative {
        let last = out.len() - 1;
        out[last] |= 0x80;
    }
    out
}

/// Decode a script number, capped at 4 bytes as in arithmetic context.
fn decode_num(item: &[u8]) -> Result<i64> {
    if item.len() > 4 {
        return Err(fail("numeric operand over 4 bytes"));
    }
    if item.is_empty() {
        return Ok(0);
    }
    let mut value: i64 = 0;
    for (i, &b) in item.iter().enumerate() {
        value |= (b as i64) << (8 * i);
    }
    let last = item[item.len() - 1];
    if last & 0x80 != 0 {
        value &= !(0x80i64 << (8 * (item.len() - 1)));
        value = -value;
    }
    Ok(value)
}

fn bool_item(b: bool) -> Vec<u8> {
    if b {
        vec![1]
    } else {
        vec![]
    }
}

/// Hook for signature opcodes. The chain supplies a checker bound to the
/// spending transaction and input index; standalone evaluation (predicates
/// with no signatures) can use [`NoSignatures`].
pub trait SignatureChecker {
    /// Verify `sig` (DER || sighash byte) by `pubkey` over the running
    /// subscript.
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], subscript: &[u8]) -> bool;
}

/// Checker that rejects every signature.
pub struct NoSignatures;

impl SignatureChecker for NoSignatures {
    fn check_sig(&self, _sig: &[u8], _pubkey: &[u8], _subscript: &[u8]) -> bool {
        false
    }
}

/// Checker bound to one input of a spending transaction.
pub struct TransactionSignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
}

impl SignatureChecker for TransactionSignatureChecker<'_> {
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], subscript: &[u8]) -> bool {
        let Some((&sighash_type, der)) = sig.split_last() else {
            return false;
        };
        let Ok(hash) = signature_hash(self.tx, self.input_index, subscript, sighash_type) else {
            return false;
        };
        let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(der) else {
            return false;
        };
        let Ok(message) = Message::from_digest_slice(&hash) else {
            return false;
        };
        let secp = Secp256k1::verification_only();
        secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
    }
}

/// Sighash for one input: `DSHA256(serialize(masked tx) || u32(type))`.
///
/// The mask clears every input script, installs `subscript` at the signed
/// input, and applies the NONE / SINGLE / ANYONECANPAY reductions.
pub fn signature_hash(
    tx: &Transaction,
    input_index: usize,
    subscript: &[u8],
    sighash_type: u8,
) -> Result<Hash> {
    if input_index >= tx.inputs.len() {
        return Err(fail("sighash input index out of range"));
    }
    let mut masked = tx.clone();
    for input in &mut masked.inputs {
        input.script_sig.clear();
    }
    masked.inputs[input_index].script_sig = subscript.to_vec();

    match sighash_type & 0x1f {
        SIGHASH_NONE => {
            masked.outputs.clear();
            for (i, input) in masked.inputs.iter_mut().enumerate() {
                if i != input_index {
                    input.sequence = 0;
                }
            }
        }
        SIGHASH_SINGLE => {
            if input_index >= masked.outputs.len() {
                return Err(fail("sighash single with no matching output"));
            }
            masked.outputs.truncate(input_index + 1);
            for output in masked.outputs.iter_mut().take(input_index) {
                *output = TxOut { value: -1, script_pubkey: vec![] };
            }
            for (i, input) in masked.inputs.iter_mut().enumerate() {
                if i != input_index {
                    input.sequence = 0;
                }
            }
        }
        _ => {}
    }
    if sighash_type & SIGHASH_ANYONECANPAY != 0 {
        let own = masked.inputs[input_index].clone();
        masked.inputs = vec![own];
    }

    let mut preimage = encode_to_vec(&masked);
    (sighash_type as u32).encode(&mut preimage);
    Ok(double_sha256(&preimage))
}

/// One parsed element of a script.
enum Op<'a> {
    Push(&'a [u8]),
    Code(u8),
}

/// Iterate over a script, decoding push data lengths.
fn parse(script: &[u8]) -> ScriptIter<'_> {
    ScriptIter { script, pc: 0 }
}

struct ScriptIter<'a> {
    script: &'a [u8],
    pc: usize,
}

impl<'a> Iterator for ScriptIter<'a> {
    type Item = Result<(usize, Op<'a>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pc >= self.script.len() {
            return None;
        }
        let at = self.pc;
        let opcode = self.script[self.pc];
        self.pc += 1;
        let take = |iter: &mut Self, len: usize| -> Result<&'a [u8]> {
            if iter.script.len() - iter.pc < len {
                return Err(fail("push runs past end of script"));
            }
            let data = &iter.script[iter.pc..iter.pc + len];
            iter.pc += len;
            Ok(data)
        };
        let item = match opcode {
            1..=0x4b => take(self, opcode as usize).map(Op::Push),
            OP_PUSHDATA1 => take(self, 1)
                .map(|l| l[0] as usize)
                .and_then(|len| take(self, len))
                .map(Op::Push),
            OP_PUSHDATA2 => take(self, 2)
                .map(|l| u16::from_le_bytes([l[0], l[1]]) as usize)
                .and_then(|len| take(self, len))
                .map(Op::Push),
            OP_PUSHDATA4 => take(self, 4)
                .map(|l| u32::from_le_bytes([l[0], l[1], l[2], l[3]]) as usize)
                .and_then(|len| take(self, len))
                .map(Op::Push),
            code => Ok(Op::Code(code)),
        };
        Some(item.map(|op| (at, op)))
    }
}

/// Execute `script` against `stack`.
///
/// 1. Reject scripts over `MAX_SCRIPT_SIZE`.
/// 2. For each opcode: enforce the operation and stack limits, then apply
///    its effect; signature opcodes consult `checker` with the running
///    subscript (from the last `OP_CODESEPARATOR` onward).
/// 3. Any opcode error, underflow, or `OP_RETURN` aborts evaluation.
pub fn eval_script(script: &[u8], stack: &mut Vec<Vec<u8>>, checker: &dyn SignatureChecker) -> Result<()> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptTooLarge(script.len()));
    }
    let mut op_count = 0usize;
    let mut separator = 0usize;

    macro_rules! pop {
        () => {
            stack.pop().ok_or(ScriptError::StackUnderflow)?
        };
    }

    for item in parse(script) {
        let (at, op) = item?;
        if stack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackOverflow);
        }
        match op {
            Op::Push(data) => stack.push(data.to_vec()),
            Op::Code(opcode) => {
                if opcode > OP_16 {
                    op_count += 1;
                    if op_count > MAX_SCRIPT_OPS {
                        return Err(ScriptError::OpCountExceeded);
                    }
                }
                match opcode {
                    OP_0 => stack.push(vec![]),
                    OP_1NEGATE => stack.push(encode_num(-1)),
                    OP_1..=OP_16 => stack.push(vec![opcode - OP_1 + 1]),
                    OP_NOP => {}
                    OP_VERIFY => {
                        let top = pop!();
                        if !cast_to_bool(&top) {
                            return Err(fail("verify failed"));
                        }
                    }
                    OP_RETURN => return Err(fail("op_return")),

                    OP_DUP => {
                        let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                        stack.push(top);
                    }
                    OP_IFDUP => {
                        let top = stack.last().ok_or(ScriptError::StackUnderflow)?.clone();
                        if cast_to_bool(&top) {
                            stack.push(top);
                        }
                    }
                    OP_DEPTH => {
                        let depth = stack.len();
                        stack.push(encode_num(depth as i64));
                    }
                    OP_DROP => {
                        pop!();
                    }
                    OP_2DROP => {
                        pop!();
                        pop!();
                    }
                    OP_NIP => {
                        let top = pop!();
                        pop!();
                        stack.push(top);
                    }
                    OP_OVER => {
                        if stack.len() < 2 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        stack.push(stack[stack.len() - 2].clone());
                    }
                    OP_2DUP => {
                        if stack.len() < 2 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let a = stack[stack.len() - 2].clone();
                        let b = stack[stack.len() - 1].clone();
                        stack.push(a);
                        stack.push(b);
                    }
                    OP_3DUP => {
                        if stack.len() < 3 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        for _ in 0..3 {
                            stack.push(stack[stack.len() - 3].clone());
                        }
                    }
                    OP_2OVER => {
                        if stack.len() < 4 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        stack.push(stack[stack.len() - 4].clone());
                        stack.push(stack[stack.len() - 4].clone());
                    }
                    OP_2ROT => {
                        if stack.len() < 6 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let item = stack.remove(stack.len() - 6);
                        let item2 = stack.remove(stack.len() - 5);
                        stack.push(item);
                        stack.push(item2);
                    }
                    OP_2SWAP => {
                        if stack.len() < 4 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let len = stack.len();
                        stack.swap(len - 4, len - 2);
                        stack.swap(len - 3, len - 1);
                    }
                    OP_PICK | OP_ROLL => {
                        let n = decode_num(&pop!())?;
                        if n < 0 || n as usize >= stack.len() {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let pos = stack.len() - 1 - n as usize;
                        let item =
                            if opcode == OP_ROLL { stack.remove(pos) } else { stack[pos].clone() };
                        stack.push(item);
                    }
                    OP_ROT => {
                        if stack.len() < 3 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let item = stack.remove(stack.len() - 3);
                        stack.push(item);
                    }
                    OP_SWAP => {
                        if stack.len() < 2 {
                            return Err(ScriptError::StackUnderflow);
                        }
                        let len = stack.len();
                        stack.swap(len - 2, len - 1);
                    }
                    OP_TUCK => {
                        let top = pop!();
                        let second = pop!();
                        stack.push(top.clone());
                        stack.push(second);
                        stack.push(top);
                    }
                    OP_SIZE => {
                        let len = stack.last().ok_or(ScriptError::StackUnderflow)?.len();
                        stack.push(encode_num(len as i64));
                    }

                    OP_EQUAL => {
                        let a = pop!();
                        let b = pop!();
                        stack.push(bool_item(a == b));
                    }
                    OP_EQUALVERIFY => {
                        let a = pop!();
                        let b = pop!();
                        if a != b {
                            return Err(fail("equalverify failed"));
                        }
                    }

                    OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                        let n = decode_num(&pop!())?;
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
                    OP_ADD | OP_SUB | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL | OP_NUMNOTEQUAL
                    | OP_LESSTHAN | OP_GREATERTHAN | OP_LESSTHANOREQUAL
                    | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                        let b = decode_num(&pop!())?;
                        let a = decode_num(&pop!())?;
                        let result = match opcode {
                            OP_ADD => a + b,
                            OP_SUB => a - b,
                            OP_BOOLAND => (a != 0 && b != 0) as i64,
                            OP_BOOLOR => (a != 0 || b != 0) as i64,
                            OP_NUMEQUAL => (a == b) as i64,
                            OP_NUMNOTEQUAL => (a != b) as i64,
                            OP_LESSTHAN => (a < b) as i64,
                            OP_GREATERTHAN => (a > b) as i64,
                            OP_LESSTHANOREQUAL => (a <= b) as i64,
                            OP_GREATERTHANOREQUAL => (a >= b) as i64,
                            OP_MIN => a.min(b),
                            _ => a.max(b),
                        };
                        stack.push(encode_num(result));
                    }
                    OP_NUMEQUALVERIFY => {
                        let b = decode_num(&pop!())?;
                        let a = decode_num(&pop!())?;
                        if a != b {
                            return Err(fail("numequalverify failed"));
                        }
                    }
                    OP_WITHIN => {
                        let max = decode_num(&pop!())?;
                        let min = decode_num(&pop!())?;
                        let x = decode_num(&pop!())?;
                        stack.push(bool_item(min <= x && x < max));
                    }

                    OP_RIPEMD160 => {
                        let item = pop!();
                        stack.push(Ripemd160::digest(&item).to_vec());
                    }
                    OP_SHA256 => {
                        let item = pop!();
                        stack.push(Sha256::digest(&item).to_vec());
                    }
                    OP_HASH160 => {
                        let item = pop!();
                        stack.push(crate::types::hash160(&item).to_vec());
                    }
                    OP_HASH256 => {
                        let item = pop!();
                        stack.push(double_sha256(&item).to_vec());
                    }
                    OP_CODESEPARATOR => {
                        separator = at + 1;
                    }

                    OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                        let pubkey = pop!();
                        let sig = pop!();
                        let valid = checker.check_sig(&sig, &pubkey, &script[separator..]);
                        if opcode == OP_CHECKSIGVERIFY {
                            if !valid {
                                return Err(fail("checksigverify failed"));
                            }
                        } else {
                            stack.push(bool_item(valid));
                        }
                    }
                    OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                        let key_count = decode_num(&pop!())?;
                        if key_count < 0 || key_count as usize > MAX_MULTISIG_KEYS {
                            return Err(fail("multisig key count out of range"));
                        }
                        op_count += key_count as usize;
                        if op_count > MAX_SCRIPT_OPS {
                            return Err(ScriptError::OpCountExceeded);
                        }
                        let mut pubkeys = Vec::with_capacity(key_count as usize);
                        for _ in 0..key_count {
                            pubkeys.push(pop!());
                        }
                        let sig_count = decode_num(&pop!())?;
                        if sig_count < 0 || sig_count > key_count {
                            return Err(fail("multisig signature count out of range"));
                        }
                        let mut sigs = Vec::with_capacity(sig_count as usize);
                        for _ in 0..sig_count {
                            sigs.push(pop!());
                        }
                        // Historical extra stack element consumed by the opcode.
                        pop!();
                        let subscript = &script[separator..];
                        let mut key_iter = pubkeys.into_iter();
                        let mut matched = 0usize;
                        for sig in &sigs {
                            for key in key_iter.by_ref() {
                                if checker.check_sig(sig, &key, subscript) {
                                    matched += 1;
                                    break;
                                }
                            }
                        }
                        let valid = matched == sigs.len();
                        if opcode == OP_CHECKMULTISIGVERIFY {
                            if !valid {
                                return Err(fail("checkmultisigverify failed"));
                            }
                        } else {
                            stack.push(bool_item(valid));
                        }
                    }

                    other => return Err(ScriptError::UnknownOpcode(other)),
                }
            }
        }
    }
    if stack.len() > MAX_STACK_SIZE {
        return Err(ScriptError::StackOverflow);
    }
    Ok(())
}

/// Verify `script_sig || script_pubkey` for one input. Succeeds iff
/// evaluation runs clean and the final top of stack is true.
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    checker: &dyn SignatureChecker,
) -> Result<()> {
    let mut stack = Vec::new();
    eval_script(script_sig, &mut stack, checker)?;
    eval_script(script_pubkey, &mut stack, checker)?;
    match stack.last() {
        Some(top) if cast_to_bool(top) => Ok(()),
        Some(_) => Err(fail("final stack value is false")),
        None => Err(fail("empty final stack")),
    }
}

/// Verify one input of `tx` against the locking script it spends.
pub fn verify_input(tx: &Transaction, input_index: usize, script_pubkey: &[u8]) -> Result<()> {
    let checker = TransactionSignatureChecker { tx, input_index };
    verify_script(&tx.inputs[input_index].script_sig, script_pubkey, &checker)
}
