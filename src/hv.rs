//! The hypervisor collaborator (spec.md §6): the thin seam between
//! the hardware-independent core (components A-F) and `kvm-ioctls`.
//! No other module in this crate touches `kvm_ioctls`/`kvm_bindings`
//! directly.

use kvm_bindings::{kvm_segment, kvm_userspace_memory_region, KVM_MEM_READONLY};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};

use crate::boot::{Segment, X86BootState};
use crate::error::{Error, Result};
use crate::memory::MemoryMap;
use crate::Registers;

/// One vCPU exit, reduced to what the run loop (spec.md §4.E) needs
/// to dispatch on. Owned (no borrow of the underlying `kvm_run`
/// page), since the hypervisor collaborator's job is exactly to strip
/// that lifetime away from the core.
pub enum Exit {
    /// Guest executed `OUT` on `port`, writing `value` (lowest byte
    /// of whatever width it wrote, per spec.md §4.E "width is
    /// ignored").
    PioOut { port: u16, value: u8 },
    /// Guest executed `IN` on `port`. The read is always satisfied
    /// with zero here, since the core's only defined reaction to any
    /// PIO exit is either "terminate" (value irrelevant) or
    /// "unsupported" (call fails before the value could matter).
    PioIn { port: u16 },
    Other(String),
}

pub struct Hypervisor {
    _kvm: Kvm,
    vm: VmFd,
    vcpu: VcpuFd,
}

fn to_kvm_segment(s: &Segment) -> kvm_segment {
    kvm_segment {
        base: s.base,
        limit: s.limit,
        selector: s.selector,
        type_: s.type_,
        present: s.present as u8,
        dpl: s.dpl,
        db: s.db as u8,
        s: s.system as u8,
        l: s.long_mode as u8,
        g: s.granularity as u8,
        avl: 0,
        unusable: if s.present { 0 } else { 1 },
        padding: 0,
    }
}

impl Hypervisor {
    /// Process-wide subsystem init + one VM with one vCPU (spec.md
    /// §4.F `create`). `Kvm::new` opens `/dev/kvm`, which is itself
    /// idempotent to call repeatedly per process.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new().map_err(|e| Error::NotAvailable(format!("kvm subsystem init: {e}")))?;
        let vm = kvm
            .create_vm()
            .map_err(|e| Error::NotAvailable(format!("create vm: {e}")))?;
        let vcpu = vm
            .create_vcpu(0)
            .map_err(|e| Error::NotAvailable(format!("create vcpu: {e}")))?;
        Ok(Self { _kvm: kvm, vm, vcpu })
    }

    /// Register each region's `(gpa, size, hva, read_only)` as a
    /// guest-physical slot (spec.md §6).
    pub fn apply_memory_map(&self, map: &MemoryMap) -> Result<()> {
        for (slot, region) in map.iterate().enumerate() {
            let flags = if region.read_only() { KVM_MEM_READONLY } else { 0 };
            unsafe {
                self.vm
                    .set_user_memory_region(kvm_userspace_memory_region {
                        slot: slot as u32,
                        flags,
                        guest_phys_addr: region.gpa().0,
                        memory_size: region.size(),
                        userspace_addr: region.hva(),
                    })
                    .map_err(|e| Error::IoError(std::io::Error::other(format!(
                        "set_user_memory_region failed for slot {slot}: {e}"
                    ))))?;
            }
        }
        Ok(())
    }

    /// Load an x86 boot-state snapshot plus the caller's registers
    /// into the vCPU (spec.md §6 "load vCPU state").
    pub fn load_vcpu_state(&self, boot: &X86BootState, regs: &Registers, rip: u64) -> Result<()> {
        let kregs = kvm_bindings::kvm_regs {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            rsp: boot.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip,
            rflags: boot.rflags,
        };
        self.vcpu
            .set_regs(&kregs)
            .map_err(|e| Error::IoError(std::io::Error::other(format!("set_regs: {e}"))))?;

        let mut sregs = self
            .vcpu
            .get_sregs()
            .map_err(|e| Error::IoError(std::io::Error::other(format!("get_sregs: {e}"))))?;
        sregs.cr0 = boot.cr0;
        sregs.cr2 = boot.cr2;
        sregs.cr3 = boot.cr3;
        sregs.cr4 = boot.cr4;
        sregs.efer = boot.efer;
        sregs.cs = to_kvm_segment(&boot.cs);
        sregs.ds = to_kvm_segment(&boot.ds);
        sregs.ss = to_kvm_segment(&boot.ss);
        sregs.es = to_kvm_segment(&boot.es);
        sregs.fs = to_kvm_segment(&boot.fs);
        sregs.gs = to_kvm_segment(&boot.gs);
        sregs.tr = to_kvm_segment(&boot.tr);
        sregs.ldt = to_kvm_segment(&boot.ldt);
        sregs.gdt.limit = 0;
        sregs.idt.limit = 0;
        self.vcpu
            .set_sregs(&sregs)
            .map_err(|e| Error::IoError(std::io::Error::other(format!("set_sregs: {e}"))))?;
        Ok(())
    }

    /// Read the vCPU register image back (spec.md §6 "store vCPU
    /// state"), returning a fresh `Registers` plus the architectural
    /// `rip` (spec.md §8 testable property 5: RIP must have moved past
    /// `entry_addr`).
    pub fn store_vcpu_state(&self) -> Result<(Registers, u64)> {
        let kregs = self
            .vcpu
            .get_regs()
            .map_err(|e| Error::IoError(std::io::Error::other(format!("get_regs: {e}"))))?;
        let regs = Registers {
            rax: kregs.rax,
            rbx: kregs.rbx,
            rcx: kregs.rcx,
            rdx: kregs.rdx,
            rsi: kregs.rsi,
            rdi: kregs.rdi,
            rbp: kregs.rbp,
            r8: kregs.r8,
            r9: kregs.r9,
            r10: kregs.r10,
            r11: kregs.r11,
            r12: kregs.r12,
            r13: kregs.r13,
            r14: kregs.r14,
            r15: kregs.r15,
        };
        Ok((regs, kregs.rip))
    }

    /// Run the vCPU until it produces an exit (spec.md §6 "run vCPU").
    pub fn run(&mut self) -> Result<Exit> {
        let exit = self
            .vcpu
            .run()
            .map_err(|e| Error::IoError(std::io::Error::other(format!("vcpu run: {e}"))))?;
        Ok(match exit {
            VcpuExit::IoOut(port, data) => Exit::PioOut {
                port,
                value: data.first().copied().unwrap_or(0),
            },
            VcpuExit::IoIn(port, data) => {
                data.fill(0);
                Exit::PioIn { port }
            }
            other => Exit::Other(format!("{other:?}")),
        })
    }
}
