//! `ivee`: an embeddable in-process execution sandbox that runs
//! x86_64 code inside a hardware-assisted (KVM) virtual machine,
//! invoked as if calling a function (spec.md §1).
//!
//! The public surface is deliberately small: [`create`] an
//! [`Instance`], [`load_executable`] an image into it, then [`call`]
//! it with a register file. Everything else (the memory map, page
//! tables, boot-state snapshot, hypervisor binding) is an
//! implementation detail of the four components in `spec.md` §4.

mod boot;
mod error;
mod hv;
mod instance;
mod loader;
mod memory;
mod pagetable;
mod runloop;

pub use error::{Error, Result};
pub use instance::{capabilities, create, destroy, Caps, Instance};
pub use loader::Format;
pub use runloop::IVEE_PIO_EXIT_PORT;

/// The general-purpose registers a caller passes into and reads back
/// from [`call`] (spec.md §3, §4.E). `RSP` is deliberately absent —
/// the guest owns its own stack setup (spec.md §9 open question).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Load `path` (interpreted per `format`) into `instance`'s guest
/// address space (spec.md §4.C).
pub fn load_executable(instance: &mut Instance, path: &std::path::Path, format: Format) -> Result<()> {
    instance::load_executable(instance, path, format)
}

/// Run `instance`'s guest from its entry point with `regs` seeded in,
/// until it signals termination, returning the final register file
/// (spec.md §4.E).
pub fn call(instance: &mut Instance, regs: &Registers) -> Result<Registers> {
    runloop::call(instance, regs)
}

/// The last value the guest wrote to [`IVEE_PIO_EXIT_PORT`], exposed
/// purely as a diagnostic (spec.md §9 open question on the PIO exit
/// value — termination never depends on it).
pub fn last_exit_value(instance: &Instance) -> Option<u8> {
    instance.last_exit_value
}
