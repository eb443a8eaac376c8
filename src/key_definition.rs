//! Static, per-token key definition (`KeyDefinition`).
//!
//! Immutable after [`crate::loader::load_key_file`] populates it, except for
//! `memory`, which `WRITE_WORD` mutates in place.

use crate::secure_table::SecureTable;

/// Number of bytes of net-memory that `READ_NETMEMORY_3WORDS` can read from.
pub const NET_MEMORY_LEN: usize = 16;
/// Size of the user-addressable memory array.
pub const MEMORY_LEN: usize = 512;
/// Size of the `edStruct`/`KEY_INFO` scratch blob.
pub const ED_STRUCT_LEN: usize = 256;

/// Static, per-token parameters loaded from a key file.
#[derive(Debug, Clone)]
pub struct KeyDefinition {
    /// Loader-only label, never touched by the dispatcher.
    pub name: String,
    /// Loader-only creation date, never touched by the dispatcher.
    pub created: String,

    /// Word-swapped on load: `(raw >> 16) | (raw << 16)`.
    pub password: u32,
    pub key_type: u8,
    pub memory_type: u8,
    pub options: [u8; 14],
    pub sec_table: SecureTable,
    pub net_memory: [u8; NET_MEMORY_LEN],
    pub memory: [u8; MEMORY_LEN],
    pub ed_struct: [u8; ED_STRUCT_LEN],
}

impl KeyDefinition {
    /// HASP key memory size by `memoryType`: `0x01 -> 128`, otherwise `4048`
    /// (both `0x20` and `0x21`, and anything else, share the same size in
    /// the original firmware).
    pub fn memory_size(&self) -> u32 {
        match self.memory_type {
            0x01 => 0x80,
            _ => 0xFD0,
        }
    }
}
