//! `Transform`: the nonlinear LFSR-based keyed word hash.
//!
//! This is the "classified" `HashWORD` routine the original vusbsrm authors
//! stripped out of their public sources — it is reconstructed here from the
//! revisited `EncDecSim.c` that shipped alongside it. The 256-byte `edStruct`
//! blob in a [`crate::key_definition::KeyDefinition`] is reinterpreted as a
//! `KEY_INFO` scratch record at the byte offsets below on every call.
//! `Transform` is pure in `(word, edStruct)`: none of the scratch fields
//! survive between calls.
//!
//! Byte layout of the leading 24 bytes of `edStruct` (little-endian, packed):
//! `columnMask: u8, cryptInitVect: u8, secTable: [u8; 8], isInvSecTab: u8,
//! prepNotMask: u32, curLFSRState: u32, first5bit: u8, password: u32`.
//! Only `columnMask`, `cryptInitVect`, `secTable`, and `password` are read —
//! the rest are scratch, recomputed before use.

use crate::secure_table::SecureTable;

const OFF_COLUMN_MASK: usize = 0;
const OFF_CRYPT_INIT_VECT: usize = 1;
const OFF_SEC_TABLE: usize = 2;
const OFF_PASSWORD: usize = 20;

/// The inputs to `Transform` carried in a token's `edStruct` blob.
#[derive(Debug, Clone, Copy)]
struct KeyInfoInput {
    column_mask: u8,
    crypt_init_vect: u8,
    sec_table: SecureTable,
    password: u32,
}

impl KeyInfoInput {
    fn from_ed_struct(ed_struct: &[u8]) -> Self {
        let mut sec_table = [0u8; 8];
        sec_table.copy_from_slice(&ed_struct[OFF_SEC_TABLE..OFF_SEC_TABLE + 8]);
        Self {
            column_mask: ed_struct[OFF_COLUMN_MASK],
            crypt_init_vect: ed_struct[OFF_CRYPT_INIT_VECT],
            sec_table: SecureTable::new(sec_table),
            password: u32::from_le_bytes(
                ed_struct[OFF_PASSWORD..OFF_PASSWORD + 4].try_into().unwrap(),
            ),
        }
    }
}

/// The four 11-bit LFSR tap masks used by the IV-variant step function,
/// selected by `(in5Bit >> 1) & 3`.
const FACT_LFSR: [u32; 4] = [0x480, 0x4A0, 0x580, 0x5A0];

/// Scratch state threaded through one call to `Transform`.
struct Scratch {
    sec_table: SecureTable,
    cur_lfsr_state: u32,
    // IV-variant only:
    is_inv_sec_tab: u32,
    prep_not_mask: u32,
}

/// Hashes one 32-bit word in place against a token's `edStruct`.
///
/// Selects the password variant when `edStruct`'s embedded `password` field
/// is nonzero, the IV variant otherwise.
pub fn transform(word: u32, ed_struct: &[u8]) -> u32 {
    let input = KeyInfoInput::from_ed_struct(ed_struct);
    if input.password != 0 {
        transform_tch(word, input.password, input.sec_table)
    } else {
        transform2(word, input.column_mask, input.crypt_init_vect, input.sec_table)
    }
}

/// Password variant (`TransformTch` / `Transform2Tch` step).
fn transform_tch(mut word: u32, password: u32, sec_table: SecureTable) -> u32 {
    let mut p = password ^ 0x0108_1989;
    p >>= 12;

    let mut lfsr_seed: u32 = 31; // bit 5 (0x1F) always set
    for i in (6..=10).rev() {
        let nibble = (p & 0x0F) as u8;
        if nibble != 0 && nibble < 0x0B {
            lfsr_seed |= 1 << i;
        }
        p >>= 4;
    }
    let first5bit = (lfsr_seed >> 6) as u8;

    let mut scratch = Scratch {
        sec_table,
        cur_lfsr_state: ((first5bit as u32) << 6) | 0x1F,
        is_inv_sec_tab: 0,
        prep_not_mask: 0,
    };

    let word_bytes = word.to_le_bytes();
    let mut index: usize = 0;
    for _ in 1..=39 {
        let in5bit = word_bytes[index & 3] as u32;
        let bit = step_tch(in5bit, &mut scratch);
        index = (((word & 1) << 1) | bit) as usize;
        if (word & 1) == bit {
            word >>= 1;
        } else {
            word = (word >> 1) ^ 0x8050_0062;
        }
    }
    word
}

fn step_tch(in5bit_raw: u32, scratch: &mut Scratch) -> u32 {
    let in5bit = in5bit_raw & 0x1F;
    let st1 = scratch.sec_table.bit(in5bit) as u32;

    let mut b0 = in5bit ^ ((st1 ^ 1) & (in5bit >> 3)) ^ (in5bit >> 4);
    b0 ^= scratch.cur_lfsr_state >> 10;
    b0 ^= scratch.cur_lfsr_state >> 7;
    if in5bit & 2 != 0 {
        b0 ^= scratch.cur_lfsr_state >> 5;
    }
    if in5bit & 4 != 0 {
        b0 ^= scratch.cur_lfsr_state >> 8;
    }
    b0 &= 1;

    scratch.cur_lfsr_state ^= (in5bit & 1) << 2;
    scratch.cur_lfsr_state <<= 1;
    scratch.cur_lfsr_state |= b0;

    (scratch.cur_lfsr_state >> 11 ^ st1) & 1
}

/// IV variant (`Transform2`), used when the token has no password.
fn transform2(mut word: u32, column_mask: u8, crypt_init_vect: u8, sec_table: SecureTable) -> u32 {
    let mut scratch = Scratch {
        sec_table,
        cur_lfsr_state: 0,
        is_inv_sec_tab: ((crypt_init_vect >> 5) & 1) as u32,
        prep_not_mask: 0,
    };
    init_transform2(&mut scratch, column_mask, crypt_init_vect);

    let word_bytes = word.to_le_bytes();
    let mut index: usize = 0;
    for _ in 1..=39 {
        let in5bit = word_bytes[index & 3] as u32;
        let bit = step_iv(in5bit, &mut scratch);
        index = (((word & 1) << 1) | bit) as usize;
        if (word & 1) == bit {
            word >>= 1;
        } else {
            word = (word >> 1) ^ 0x8050_0062;
        }
    }
    word
}

fn step_iv(in5bit_raw: u32, scratch: &mut Scratch) -> u32 {
    let in5bit = in5bit_raw & 0x1F;
    let fact_lfsr = FACT_LFSR[((in5bit >> 1) & 3) as usize];

    let mut new_lfsr_state: u32 = 0;
    for pos in 0..=11u32 {
        if (fact_lfsr >> pos) & 1 != 0 {
            new_lfsr_state ^= scratch.cur_lfsr_state >> pos;
        }
    }
    scratch.cur_lfsr_state ^= (in5bit & 1) << 2;

    let st_res = (scratch.sec_table.bit(in5bit) as u32) ^ scratch.is_inv_sec_tab;
    scratch.cur_lfsr_state = (scratch.cur_lfsr_state << 1) | ((new_lfsr_state ^ st_res) & 1);
    scratch.cur_lfsr_state ^= (scratch.prep_not_mask >> in5bit) & 1;

    (scratch.cur_lfsr_state >> 11 ^ st_res) & 1
}

fn init_transform2(scratch: &mut Scratch, column_mask: u8, crypt_init_vect: u8) {
    let first_bit_of_sec_table = scratch.sec_table.bit(0) ^ 1;
    let prep_column_mask: u8 = if first_bit_of_sec_table != 0 {
        column_mask
    } else {
        !column_mask
    };

    // Build the 4-byte `emulData` scratch.
    let mut emul_data = [0u8; 4];
    let mut civ = crypt_init_vect & 0x1F;
    for _ in 0..4 {
        emul_data[0] <<= 2;
        emul_data[0] |= (civ & 1) | (((civ ^ 1) & 1) << 1);
        civ >>= 1;
    }
    emul_data[2] = emul_data[0] ^ 0xFF;
    emul_data[1] = emul_data[0];
    emul_data[3] = emul_data[2];
    for bit_num in 0..8u32 {
        emul_data[1] ^= ((scratch.sec_table.bit(bit_num + 8) as u8) ^ civ) << bit_num;
        emul_data[3] ^= ((scratch.sec_table.bit(bit_num + 24) as u8) ^ civ) << bit_num;
    }
    let emul_data = u32::from_le_bytes(emul_data);

    let mut prep_not_mask: u32 = 0;
    for i in (0..=31u32).rev() {
        scratch.cur_lfsr_state = (prep_column_mask as u32) << 3;
        let mut lfsr11bit = 0;
        for _ in 0..12 {
            lfsr11bit = step_iv(i, scratch);
        }
        prep_not_mask <<= 1;
        prep_not_mask |= (scratch.sec_table.bit(i) as u32) ^ (i & 1) ^ ((emul_data >> i) & 1) ^ lfsr11bit;
    }
    scratch.prep_not_mask = prep_not_mask;

    scratch.cur_lfsr_state = ((prep_column_mask as u32) << 3)
        | ((first_bit_of_sec_table as u32) << 2)
        | ((first_bit_of_sec_table as u32) << 1)
        | (first_bit_of_sec_table as u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ed_struct_with(column_mask: u8, crypt_init_vect: u8, sec_table: [u8; 8], password: u32) -> [u8; 256] {
        let mut buf = [0u8; 256];
        buf[OFF_COLUMN_MASK] = column_mask;
        buf[OFF_CRYPT_INIT_VECT] = crypt_init_vect;
        buf[OFF_SEC_TABLE..OFF_SEC_TABLE + 8].copy_from_slice(&sec_table);
        buf[OFF_PASSWORD..OFF_PASSWORD + 4].copy_from_slice(&password.to_le_bytes());
        buf
    }

    #[test]
    fn password_variant_is_deterministic() {
        let ed = ed_struct_with(0x12, 0x34, [0xAA; 8], 0x1234_5678);
        let a = transform(0, &ed);
        let b = transform(0, &ed);
        assert_eq!(a, b);
    }

    #[test]
    fn iv_variant_is_deterministic() {
        let ed = ed_struct_with(0x12, 0x34, [0xAA; 8], 0);
        let a = transform(0xDEAD_BEEF, &ed);
        let b = transform(0xDEAD_BEEF, &ed);
        assert_eq!(a, b);
    }

    #[test]
    fn password_and_iv_variants_diverge() {
        let ed_pw = ed_struct_with(0x12, 0x34, [0xAA; 8], 0x1234_5678);
        let ed_iv = ed_struct_with(0x12, 0x34, [0xAA; 8], 0);
        assert_ne!(transform(0, &ed_pw), transform(0, &ed_iv));
    }

    #[test]
    fn different_words_usually_hash_differently() {
        let ed = ed_struct_with(0x12, 0x34, [0xAA; 8], 0x1234_5678);
        assert_ne!(transform(0, &ed), transform(1, &ed));
    }
}
