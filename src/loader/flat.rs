//! Flat-binary loader (spec.md §4.C).

use std::fs::File;

use crate::error::{Error, Result};
use crate::memory::{MemoryMap, Prot};

use super::Loaded;

/// Fixed guest-virtual (and, since mapping is identity, physical)
/// load address for raw flat binaries.
pub const FLAT_LOAD_ADDR: u64 = 0x40_0000;

pub fn load(map: &mut MemoryMap, file: &File, data: &[u8]) -> Result<Loaded> {
    if data.is_empty() {
        return Err(Error::InvalidArg("flat binary is empty".into()));
    }

    map.map_host_memory(FLAT_LOAD_ADDR, data.len() as u64, Some((file, 0)), Prot::EXEC)?;

    log::debug!("loaded flat binary: {} bytes at {FLAT_LOAD_ADDR:#x}", data.len());
    Ok(Loaded { entry_addr: FLAT_LOAD_ADDR })
}
