//! Component F: lifecycle (spec.md §4.F).

use std::path::Path;

use bitflags::bitflags;

use crate::boot::X86BootState;
use crate::error::{Error, Result};
use crate::hv::Hypervisor;
use crate::loader::{self, Format};
use crate::memory::MemoryMap;
use crate::pagetable;

bitflags! {
    /// Capability bits a caller may request from `create`. No
    /// capabilities are currently advertised (spec.md §4.F); the type
    /// exists so adding one later is additive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Caps: u32 {}
}

/// One sandboxed guest: one memory map, one hypervisor VM+vCPU, one
/// boot-state snapshot (spec.md §3 "Instance").
pub struct Instance {
    pub(crate) memory_map: MemoryMap,
    pub(crate) hv: Hypervisor,
    pub(crate) boot: X86BootState,
    pub(crate) entry_addr: u64,
    pub(crate) should_terminate: bool,
    /// Diagnostic: last value written to the exit port, never
    /// consulted for the termination decision (spec.md §9 open
    /// question on the PIO exit value).
    pub(crate) last_exit_value: Option<u8>,
    loaded: bool,
}

/// Currently advertises nothing (spec.md §6).
pub fn capabilities() -> Caps {
    Caps::empty()
}

pub fn create(caps: Caps) -> Result<Instance> {
    if !Caps::all().contains(caps) {
        return Err(Error::Unsupported(format!("unknown capability bits: {caps:?}")));
    }

    let hv = Hypervisor::new()?;
    log::info!("ivee instance created");

    Ok(Instance {
        memory_map: MemoryMap::new(),
        hv,
        boot: X86BootState::fresh(),
        entry_addr: 0,
        should_terminate: false,
        last_exit_value: None,
        loaded: false,
    })
}

/// Releases the hypervisor handle and the instance. The memory map is
/// owned by `Instance` and freed transitively via `Drop`.
pub fn destroy(instance: Instance) {
    drop(instance);
}

pub fn load_executable(instance: &mut Instance, path: &Path, format: Format) -> Result<()> {
    if instance.loaded {
        return Err(Error::InvalidArg("instance already has an executable loaded".into()));
    }

    let result = (|| -> Result<()> {
        let loaded = loader::load_executable(&mut instance.memory_map, path, format)?;
        pagetable::build(&mut instance.memory_map)?;
        instance.memory_map.finalize();
        instance.hv.apply_memory_map(&instance.memory_map)?;
        instance.entry_addr = loaded.entry_addr;
        Ok(())
    })();

    if let Err(e) = result {
        log::warn!("load_executable failed, discarding memory map: {e}");
        instance.memory_map.free();
        return Err(e);
    }

    instance.loaded = true;
    log::info!("loaded executable {:?} (format={:?}), entry={:#x}", path, format, instance.entry_addr);
    Ok(())
}
