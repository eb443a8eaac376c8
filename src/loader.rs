//! Token-definition file loader.
//!
//! Parses a token-definition file's JSON shape (mirrors the original
//! `LoadKey.c`, which used `jansson` over the same `"HASP Key"` object) into
//! a [`KeyDefinition`]. Any byte-array field may be given either as one
//! comma-separated string of `"0xNN"` tokens or as a JSON array of such
//! strings, matching the two shapes `GetHexByteArray` accepted in the
//! original loader.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::LoaderError;
use crate::key_definition::{KeyDefinition, ED_STRUCT_LEN, MEMORY_LEN, NET_MEMORY_LEN};
use crate::secure_table::SecureTable;

#[derive(Debug, Deserialize)]
struct KeyFile {
    #[serde(rename = "HASP Key")]
    hasp_key: Option<HaspKey>,
}

#[derive(Debug, Deserialize)]
struct HaspKey {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "Created")]
    created: Option<String>,
    #[serde(rename = "Password")]
    password: Option<String>,
    #[serde(rename = "Type")]
    key_type: Option<String>,
    #[serde(rename = "Memory")]
    memory_type: Option<String>,
    #[serde(rename = "SN")]
    sn: Option<String>,
    #[serde(rename = "Option")]
    option: Option<Value>,
    #[serde(rename = "SecTable")]
    sec_table: Option<Value>,
    #[serde(rename = "NetMemory")]
    net_memory: Option<Value>,
    #[serde(rename = "Data")]
    data: Option<Value>,
    #[serde(rename = "EDStruct")]
    ed_struct: Option<Value>,
}

/// Parses one hex token (`"0xNN"`, case-insensitive) out of a comma/whitespace
/// separated run, mirroring the original `GetHexBytesString` scanner.
fn parse_hex_tokens(s: &str, out: &mut Vec<u8>) {
    for tok in s.split(|c: char| c == ',' || c.is_whitespace()) {
        let tok = tok.trim();
        let upper = tok.to_ascii_uppercase();
        if let Some(hex) = upper.strip_prefix("0X") {
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
            }
        }
    }
}

/// Extracts a byte array from either a single hex-token string or a JSON
/// array of such strings. Absent/malformed input yields an empty vec — the
/// caller zero-pads, matching the original's tolerant `memcpy`.
fn hex_byte_array(value: &Option<Value>) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        Some(Value::String(s)) => parse_hex_tokens(s, &mut out),
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(s) = item {
                    parse_hex_tokens(s, &mut out);
                }
            }
        }
        _ => {}
    }
    out
}

fn hex_u64(s: Option<&str>) -> u64 {
    s.and_then(|s| u64::from_str_radix(s.trim_start_matches("0x").trim_start_matches("0X"), 16).ok())
        .unwrap_or(0)
}

/// Copies `src` into the front of `dst`, truncating or zero-padding as needed.
fn copy_clamped(dst: &mut [u8], src: &[u8]) {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
}

/// Loads and parses a token-definition file at `path`.
pub fn load_key_file(path: impl AsRef<Path>) -> Result<KeyDefinition, LoaderError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| LoaderError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_key_file(&text, &path.display().to_string())
}

/// Parses already-read JSON text into a `KeyDefinition`. Split out from
/// [`load_key_file`] so tests can exercise it without touching the
/// filesystem.
pub fn parse_key_file(text: &str, path_for_errors: &str) -> Result<KeyDefinition, LoaderError> {
    let file: KeyFile = serde_json::from_str(text).map_err(|source| LoaderError::Json {
        path: path_for_errors.to_string(),
        source,
    })?;
    let key = file.hasp_key.ok_or_else(|| LoaderError::MissingKeyObject {
        path: path_for_errors.to_string(),
    })?;

    let name = key.name.unwrap_or_else(|| "None".to_string());
    let created = key.created.unwrap_or_else(|| "Not set".to_string());

    let raw_password = hex_u64(key.password.as_deref()) as u32;
    let password = (raw_password >> 16) | (raw_password << 16);

    let key_type = hex_u64(key.key_type.as_deref()) as u8;
    let memory_type = hex_u64(key.memory_type.as_deref()) as u8;
    let sn = hex_u64(key.sn.as_deref()) as u32;

    let mut options = [0u8; 14];
    copy_clamped(&mut options, &hex_byte_array(&key.option));

    let supplied_sec_table = hex_byte_array(&key.sec_table);
    let sec_table = if !supplied_sec_table.is_empty() && options[0] == 1 {
        let mut bytes = [0u8; 8];
        copy_clamped(&mut bytes, &supplied_sec_table);
        SecureTable::new(bytes)
    } else {
        SecureTable::derive_from_password(password)
    };

    let supplied_net_memory = hex_byte_array(&key.net_memory);
    let mut net_memory = [0u8; NET_MEMORY_LEN];
    net_memory[0..4].copy_from_slice(&sn.to_le_bytes());
    if supplied_net_memory.is_empty() {
        net_memory[4..16].fill(0xFF);
        if memory_type == 4 {
            net_memory[10] = 0xFF;
            net_memory[11] = 0xFF;
            net_memory[14] = 0xFE;
        } else {
            net_memory[10] = 0x00;
            net_memory[11] = 0x00;
            net_memory[14] = 0x00;
        }
    } else {
        copy_clamped(&mut net_memory[4..], &supplied_net_memory);
    }

    let mut memory = [0u8; MEMORY_LEN];
    copy_clamped(&mut memory, &hex_byte_array(&key.data));

    let mut ed_struct = [0u8; ED_STRUCT_LEN];
    copy_clamped(&mut ed_struct, &hex_byte_array(&key.ed_struct));

    Ok(KeyDefinition {
        name,
        created,
        password,
        key_type,
        memory_type,
        options,
        sec_table,
        net_memory,
        memory,
        ed_struct,
    })
}
