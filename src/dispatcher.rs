//! The command dispatcher: decodes one request, mutates [`TokenState`],
//! builds a response, and runs the stream cipher over the outgoing
//! status+payload.
//!
//! `ECHO_REQUEST` and `READ_STRUCT` are special-cased: they bypass the
//! status byte, the encoded-status loop, and the cipher entirely.

use crate::crypto::{hash_engine, stream_cipher};
use crate::descriptors::read_struct_payload;
use crate::token_state::TokenState;

pub const KEY_FN_SET_CHIPER_KEYS: u8 = 0x80;
pub const KEY_FN_CHECK_PASS: u8 = 0x81;
pub const KEY_FN_READ_3WORDS: u8 = 0x82;
pub const KEY_FN_WRITE_WORD: u8 = 0x83;
pub const KEY_FN_READ_ST: u8 = 0x84;
pub const KEY_FN_READ_NETMEMORY_3WORDS: u8 = 0x8B;
pub const KEY_FN_HASH_DWORD: u8 = 0x98;
pub const KEY_FN_ECHO_REQUEST: u8 = 0xA0;
pub const KEY_FN_READ_STRUCT: u8 = 0xA1;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;
pub const STATUS_LAST: u8 = 0x1F;

/// One decoded URB, as delivered by the transport adapter.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub major_fn: u8,
    pub p1: u16,
    pub p2: u16,
    pub p3: u16,
    pub out_cap: u32,
}

/// A source of wall-clock entropy for the encoded-status mixing step.
/// Production code uses [`SystemClock`]; tests inject a fixed value so
/// the encoded-status loop is reproducible.
pub trait Clock {
    /// Low 16 bits of the current microsecond counter.
    fn micros_low16(&self) -> u16;
}

/// Real wall-clock source.
pub struct SystemClock;

impl Clock for SystemClock {
    fn micros_low16(&self) -> u16 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_micros())
            .unwrap_or(0);
        (micros & 0xFFFF) as u16
    }
}

/// Deterministic clock for tests.
pub struct FixedClock(pub u16);

impl Clock for FixedClock {
    fn micros_low16(&self) -> u16 {
        self.0
    }
}

/// Dispatches one request against `token`, returning the bytes to send back
/// over the wire (already length-capped to `request.out_cap`).
pub fn dispatch(token: &mut TokenState, request: Request, clock: &dyn Clock) -> Vec<u8> {
    tracing::debug!("[dispatcher] [command] major_fn={:#04X}", request.major_fn);
    match request.major_fn {
        KEY_FN_ECHO_REQUEST => vec![0x00],
        KEY_FN_READ_STRUCT => {
            let out_cap = request.out_cap as usize;
            match read_struct_payload(request.p1) {
                Some(payload) => {
                    let n = payload.len().min(out_cap);
                    payload[..n].to_vec()
                }
                // Unmatched p1: the real device never updates its out-length
                // for this case, so the caller-requested capacity is copied
                // verbatim from a zeroed response buffer.
                None => vec![0u8; out_cap],
            }
        }
        _ => dispatch_ciphered(token, request, clock),
    }
}

/// Raw little-endian view of the three request parameters, matching the
/// original `KEY_REQUEST` struct layout (`param1, param2, param3` packed
/// contiguously) so the stream cipher can be applied to a byte prefix of it
/// exactly as the firmware does.
struct ParamBytes([u8; 6]);

impl ParamBytes {
    fn new(req: &Request) -> Self {
        let mut bytes = [0u8; 6];
        bytes[0..2].copy_from_slice(&req.p1.to_le_bytes());
        bytes[2..4].copy_from_slice(&req.p2.to_le_bytes());
        bytes[4..6].copy_from_slice(&req.p3.to_le_bytes());
        Self(bytes)
    }

    fn p1(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]])
    }

    fn p1_p2_u32(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

fn dispatch_ciphered(token: &mut TokenState, request: Request, clock: &dyn Clock) -> Vec<u8> {
    let mut status = STATUS_ERROR;
    let mut payload: Vec<u8> = Vec::new();
    let mut encode_payload = false;

    let mut params = ParamBytes::new(&request);

    match request.major_fn {
        KEY_FN_SET_CHIPER_KEYS => {
            token.chiper_key1 = request.p1;
            token.chiper_key2 = 0xA0CB;
            let nm = token.key.net_memory;
            token.encoded_status = nm[0]
                .wrapping_add(nm[1])
                .wrapping_add(nm[2])
                .wrapping_add(nm[3]);
            token.is_init_done = true;

            let type_byte = if nm[4] == 3 || nm[4] == 5 {
                0x1A
            } else if token.key.key_type > 5 {
                token.key.key_type
            } else {
                0x0A
            };
            status = STATUS_OK;
            payload = vec![
                0x02,
                type_byte,
                0x00,
                nm[0].wrapping_add(nm[1]),
                nm[2].wrapping_add(nm[3]),
            ];
            encode_payload = true;
        }

        KEY_FN_CHECK_PASS => {
            stream_cipher::apply(&mut params.0[0..4], &mut token.chiper_key1, token.chiper_key2);
            let candidate = params.p1_p2_u32();
            if token.is_init_done && candidate == token.key.password {
                let mem_size = token.key.memory_size();
                status = STATUS_OK;
                payload = vec![(mem_size & 0xFF) as u8, ((mem_size >> 8) & 0xFF) as u8, 0x10];
                encode_payload = true;
                token.is_key_opened = true;
            } else {
                tracing::warn!(
                    "[dispatcher] [guard_failed] fn=CHECK_PASS is_init_done={}",
                    token.is_init_done
                );
            }
        }

        KEY_FN_READ_3WORDS => {
            stream_cipher::apply(&mut params.0[0..2], &mut token.chiper_key1, token.chiper_key2);
            let word_index = params.p1();
            let byte_off = word_index as u32 * 2;
            if token.is_key_opened && byte_off < token.key.memory_size() {
                status = STATUS_OK;
                payload = read_clamped(&token.key.memory, byte_off as usize, 6);
                encode_payload = true;
            } else {
                tracing::warn!(
                    "[dispatcher] [guard_failed] fn=READ_3WORDS is_key_opened={} byte_off={}",
                    token.is_key_opened, byte_off
                );
            }
        }

        KEY_FN_WRITE_WORD => {
            stream_cipher::apply(&mut params.0[0..4], &mut token.chiper_key1, token.chiper_key2);
            let word_index = params.p1();
            let value = [params.0[2], params.0[3]];
            let byte_off = word_index as u32 * 2;
            if token.is_key_opened && byte_off < token.key.memory_size() {
                status = STATUS_OK;
                write_clamped(&mut token.key.memory, byte_off as usize, &value);
            } else {
                tracing::warn!(
                    "[dispatcher] [guard_failed] fn=WRITE_WORD is_key_opened={} byte_off={}",
                    token.is_key_opened, byte_off
                );
            }
        }

        KEY_FN_READ_ST => {
            if token.is_key_opened {
                status = STATUS_OK;
                payload = token.key.sec_table.0.iter().rev().copied().collect();
                encode_payload = true;
            } else {
                tracing::warn!("[dispatcher] [guard_failed] fn=READ_ST is_key_opened=false");
            }
        }

        KEY_FN_READ_NETMEMORY_3WORDS => {
            stream_cipher::apply(&mut params.0[0..2], &mut token.chiper_key1, token.chiper_key2);
            let word_index = params.p1();
            if token.is_key_opened && word_index <= 7 {
                status = STATUS_OK;
                payload = read_clamped(&token.key.net_memory, word_index as usize * 2, 6);
                encode_payload = true;
            } else {
                tracing::warn!(
                    "[dispatcher] [guard_failed] fn=READ_NETMEMORY_3WORDS is_key_opened={} word_index={}",
                    token.is_key_opened, word_index
                );
            }
        }

        KEY_FN_HASH_DWORD => {
            stream_cipher::apply(&mut params.0[0..4], &mut token.chiper_key1, token.chiper_key2);
            if token.is_key_opened {
                let word = params.p1_p2_u32();
                let hashed = hash_engine::transform(word, &token.key.ed_struct);
                status = STATUS_OK;
                payload = hashed.to_le_bytes().to_vec();
                encode_payload = true;
            } else {
                tracing::warn!("[dispatcher] [guard_failed] fn=HASH_DWORD is_key_opened=false");
            }
        }

        _ => {
            tracing::warn!("[dispatcher] [unknown_fn] major_fn={:#04X}", request.major_fn);
        }
    }

    let encoded_status = finalize_encoded_status(token, request.major_fn, status, clock);

    let mut header = [status, encoded_status];
    stream_cipher::apply(&mut header, &mut token.chiper_key1, token.chiper_key2);
    if encode_payload {
        stream_cipher::apply(&mut payload, &mut token.chiper_key1, token.chiper_key2);
    }

    if status == STATUS_OK {
        token.chiper_key2 = (token.chiper_key2 & 0xFF) | ((encoded_status as u16) << 8);
        tracing::debug!("[dispatcher] [key2_reshuffle] key2={:#06X}", token.chiper_key2);
    }

    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&payload);
    let cap = (request.out_cap as usize).min(out.len());
    out.truncate(cap);
    out
}

/// Reads `len` bytes starting at `offset` from `src`, zero-padding past the
/// end of the backing array.
///
/// `GetMemorySize` can report a nominal size (up to 4048 bytes) larger than
/// the fixed 512-byte `memory`/16-byte `netMemory` arrays backing it — a
/// mismatch inherited from the original firmware's memory-size table. Reads
/// past the real array are clamped to zero rather than panicking.
fn read_clamped(src: &[u8], offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    if offset < src.len() {
        let avail = (src.len() - offset).min(len);
        out[..avail].copy_from_slice(&src[offset..offset + avail]);
    }
    out
}

/// Writes `value` at `offset` into `dst`, silently dropping bytes that would
/// fall past the end of the backing array (see [`read_clamped`]).
fn write_clamped(dst: &mut [u8], offset: usize, value: &[u8]) {
    if offset < dst.len() {
        let avail = (dst.len() - offset).min(value.len());
        dst[offset..offset + avail].copy_from_slice(&value[..avail]);
    }
}

/// Mixes wall-clock entropy into `token.encoded_status` and, for statuses in
/// `0..=STATUS_LAST` (which covers both `STATUS_OK` and `STATUS_ERROR` —
/// every status this dispatcher ever produces), rolls it forward until
/// `check_encoded_status` accepts the pair. A status above `STATUS_LAST`
/// would leave the response's encoded-status byte at zero; no command here
/// produces one.
fn finalize_encoded_status(token: &mut TokenState, major_fn: u8, status: u8, clock: &dyn Clock) -> u8 {
    token.encoded_status ^= (clock.micros_low16() & 0xFF) as u8;

    let mut encoded_status = 0u8;
    if status <= STATUS_LAST {
        let adjusted_req_code = major_fn & 0x7F;
        loop {
            token.encoded_status = token.encoded_status.wrapping_add(1);
            encoded_status = token.encoded_status;
            if check_encoded_status(adjusted_req_code, status, encoded_status) {
                break;
            }
        }
    }
    encoded_status
}

/// Client-side validation predicate for `(status, encodedStatus)`, mirrored
/// here so the dispatcher only emits pairs a real client would accept.
fn check_encoded_status(adjusted_req_code: u8, status: u8, encoded_status: u8) -> bool {
    if adjusted_req_code == 0 {
        return status <= 0x0F;
    }
    if status > 0x1F {
        return false;
    }
    let mut acc: u8 = 0x0F;
    lfsr_check_byte(status, &mut acc);
    lfsr_check_byte(encoded_status, &mut acc);
    acc == 0
}

/// 4-bit LFSR check (`sub_12D50`): folds one byte, MSB first, into `acc`.
fn lfsr_check_byte(byte: u8, acc: &mut u8) {
    for i in (0..8u8).rev() {
        *acc = (*acc << 1) | ((byte >> i) & 1);
        if *acc & 0x10 != 0 {
            *acc ^= 0x0D;
        }
        *acc &= 0x0F;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_definition::{KeyDefinition, ED_STRUCT_LEN, MEMORY_LEN, NET_MEMORY_LEN};
    use crate::secure_table::SecureTable;

    fn reference_token() -> TokenState {
        let password = 0x1234_5678u32;
        let key = KeyDefinition {
            name: "ref".into(),
            created: "ref".into(),
            password,
            key_type: 3,
            memory_type: 0x20,
            options: [0; 14],
            sec_table: SecureTable::derive_from_password(password),
            net_memory: {
                let mut nm = [0u8; NET_MEMORY_LEN];
                nm[0] = 0x12;
                nm[1] = 0x1A;
                nm[2] = 0x12;
                nm[3] = 0x0F;
                nm
            },
            memory: [0; MEMORY_LEN],
            ed_struct: [0; ED_STRUCT_LEN],
        };
        TokenState::new(key)
    }

    fn req(major_fn: u8, p1: u16, p2: u16, p3: u16, out_cap: u32) -> Request {
        Request { major_fn, p1, p2, p3, out_cap }
    }

    #[test]
    fn echo_request_before_handshake_is_raw_zero_byte() {
        let mut t = reference_token();
        let out = dispatch(&mut t, req(KEY_FN_ECHO_REQUEST, 0, 0, 0, 64), &FixedClock(0));
        assert_eq!(out, vec![0x00]);
        assert!(!t.is_init_done);
    }

    #[test]
    fn unknown_fn_is_error_and_no_state_mutation() {
        let mut t = reference_token();
        let before_key1 = t.chiper_key1;
        let out = dispatch(&mut t, req(0x77, 0, 0, 0, 64), &FixedClock(0));
        // 2-byte ciphered status pair, no payload.
        assert_eq!(out.len(), 2);
        assert!(!t.is_init_done);
        assert!(!t.is_key_opened);
        assert_eq!(t.chiper_key1, before_key1); // key1 untouched: no decrypt step ran
    }

    /// Decrypts a captured response with a throwaway copy of the keys the
    /// session held right before the call that produced it. `params_len` is
    /// the number of request-parameter bytes that call's command decrypts
    /// first (0, 2, or 4) — `key1`'s advance depends only on `(key1, key2)`
    /// and the byte count, never on the data itself, so replaying that many
    /// dummy bytes first puts the local key1 copy in the same state the
    /// server was in right before it encoded the header, without disturbing
    /// the live session state.
    fn decrypt_with(snapshot_key1: u16, snapshot_key2: u16, params_len: usize, out: &[u8]) -> Vec<u8> {
        let mut k1 = snapshot_key1;
        stream_cipher::apply(&mut vec![0u8; params_len], &mut k1, snapshot_key2);
        let mut plain = out.to_vec();
        stream_cipher::apply(&mut plain, &mut k1, snapshot_key2);
        plain
    }

    #[test]
    fn set_chiper_keys_then_check_pass_then_read_st_and_hash() {
        let mut t = reference_token();
        let clock = FixedClock(0);

        let out = dispatch(&mut t, req(KEY_FN_SET_CHIPER_KEYS, 0x1234, 0, 0, 64), &clock);
        assert!(t.is_init_done);
        assert_eq!(out.len(), 2 + 5);

        let plain = decrypt_with(0x1234, 0xA0CB, 0, &out);
        assert_eq!(plain[0], STATUS_OK);
        assert_eq!(&plain[2..], &[0x02, 0x0A, 0x00, 0x2C, 0x21]);

        // Build the ciphertext a real client would send: encrypt the
        // plaintext password with a throwaway copy of the session's
        // *current* keys (as they stand after SET_CHIPER_KEYS).
        let key1_before_pass = t.chiper_key1;
        let key2_before_pass = t.chiper_key2;
        let mut client_key1 = key1_before_pass;
        let mut ct = t.key.password.to_le_bytes();
        stream_cipher::apply(&mut ct, &mut client_key1, key2_before_pass);
        let p1 = u16::from_le_bytes([ct[0], ct[1]]);
        let p2 = u16::from_le_bytes([ct[2], ct[3]]);

        let out = dispatch(&mut t, req(KEY_FN_CHECK_PASS, p1, p2, 0, 64), &clock);
        assert!(t.is_key_opened);
        let plain = decrypt_with(key1_before_pass, key2_before_pass, 4, &out);
        assert_eq!(plain[0], STATUS_OK);
        assert_eq!(&plain[2..], &[0xD0, 0x0F, 0x10]); // memory_size 0xFD0 LE, type 0x10

        // READ_ST: no param decrypt, so the snapshot is just the live keys.
        let key1_before_st = t.chiper_key1;
        let key2_before_st = t.chiper_key2;
        let out = dispatch(&mut t, req(KEY_FN_READ_ST, 0, 0, 0, 64), &clock);
        let plain = decrypt_with(key1_before_st, key2_before_st, 0, &out);
        assert_eq!(plain[0], STATUS_OK);
        let expected: Vec<u8> = t.key.sec_table.0.iter().rev().copied().collect();
        assert_eq!(&plain[2..], expected.as_slice());

        // HASH_DWORD: decrypt 4 bytes, compare against the hash engine directly.
        let key1_before_hash = t.chiper_key1;
        let key2_before_hash = t.chiper_key2;
        let mut client_key1 = key1_before_hash;
        let mut ct = 0xCAFEBABEu32.to_le_bytes();
        stream_cipher::apply(&mut ct, &mut client_key1, key2_before_hash);
        let p1 = u16::from_le_bytes([ct[0], ct[1]]);
        let p2 = u16::from_le_bytes([ct[2], ct[3]]);
        let out = dispatch(&mut t, req(KEY_FN_HASH_DWORD, p1, p2, 0, 64), &clock);
        let plain = decrypt_with(key1_before_hash, key2_before_hash, 4, &out);
        assert_eq!(plain[0], STATUS_OK);
        let expected_hash = hash_engine::transform(0xCAFEBABE, &t.key.ed_struct);
        assert_eq!(&plain[2..], &expected_hash.to_le_bytes());
    }

    #[test]
    fn check_pass_before_set_chiper_keys_is_error() {
        let mut t = reference_token();
        let out = dispatch(&mut t, req(KEY_FN_CHECK_PASS, 0, 0, 0, 64), &FixedClock(0));
        assert_eq!(out.len(), 2);
        assert!(!t.is_key_opened);
    }

    #[test]
    fn read_3words_before_check_pass_is_error() {
        let mut t = reference_token();
        dispatch(&mut t, req(KEY_FN_SET_CHIPER_KEYS, 0x1234, 0, 0, 64), &FixedClock(0));
        let out = dispatch(&mut t, req(KEY_FN_READ_3WORDS, 0, 0, 0, 64), &FixedClock(0));
        assert_eq!(out.len(), 2);
        assert!(!t.is_key_opened);
    }

    #[test]
    fn read_struct_literal_tables() {
        let mut t = reference_token();
        let out = dispatch(&mut t, req(KEY_FN_READ_STRUCT, 0, 0, 0, 64), &FixedClock(0));
        assert_eq!(out, vec![0x01, 0x00, 0x00]);
        let out = dispatch(&mut t, req(KEY_FN_READ_STRUCT, 3, 0, 0, 64), &FixedClock(0));
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn guard_failure_never_mutates_memory_or_keys() {
        let mut t = reference_token();
        let mem_before = t.key.memory;
        let k1_before = t.chiper_key1;
        let k2_before = t.chiper_key2;
        dispatch(&mut t, req(KEY_FN_WRITE_WORD, 0, 0xBEEF, 0, 64), &FixedClock(0));
        assert_eq!(t.key.memory, mem_before);
        assert_eq!(t.chiper_key1, k1_before);
        assert_eq!(t.chiper_key2, k2_before);
    }

    #[test]
    fn net_memory_p1_eight_is_error_seven_is_ok() {
        let mut t = reference_token();
        dispatch(&mut t, req(KEY_FN_SET_CHIPER_KEYS, 0x1234, 0, 0, 64), &FixedClock(0));
        t.is_key_opened = true;

        let key1 = t.chiper_key1;
        let key2 = t.chiper_key2;
        // p1=7 is plaintext here; since key1 wasn't advanced from a prior
        // client-side encryption step, the server decrypts whatever ciphertext
        // arrives — so to exercise the real path we must send the correctly
        // encrypted form of 7 using the session's current keys.
        let mut ct = 7u16.to_le_bytes();
        let mut client_key1 = key1;
        stream_cipher::apply(&mut ct, &mut client_key1, key2);
        let p1 = u16::from_le_bytes(ct);
        let out = dispatch(&mut t, req(KEY_FN_READ_NETMEMORY_3WORDS, p1, 0, 0, 64), &FixedClock(0));
        let plain = decrypt_with(key1, key2, 2, &out);
        assert_eq!(plain[0], STATUS_OK);
        assert_eq!(plain.len(), 8); // 2-byte header + 6-byte payload, last 2 bytes zero-padded

        let key1 = t.chiper_key1;
        let key2 = t.chiper_key2;
        let mut ct = 8u16.to_le_bytes();
        let mut client_key1 = key1;
        stream_cipher::apply(&mut ct, &mut client_key1, key2);
        let p1 = u16::from_le_bytes(ct);
        let out = dispatch(&mut t, req(KEY_FN_READ_NETMEMORY_3WORDS, p1, 0, 0, 64), &FixedClock(0));
        let plain = decrypt_with(key1, key2, 2, &out);
        assert_eq!(plain[0], STATUS_ERROR);
        assert_eq!(plain.len(), 2); // error, no payload
    }
}
