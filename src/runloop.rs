//! Component E: the run loop / exit dispatcher (spec.md §4.E).

use crate::error::{Error, Result};
use crate::hv::Exit;
use crate::instance::Instance;
use crate::Registers;

/// Port implementing the termination protocol (spec.md §4.E, §6
/// guest ABI). Part of the public ABI published to guests.
pub const IVEE_PIO_EXIT_PORT: u16 = 0x501;

/// Drive the vCPU from `entry_addr` with `regs` seeded in, until the
/// guest signals termination through `IVEE_PIO_EXIT_PORT`.
pub fn call(instance: &mut Instance, regs: &Registers) -> Result<Registers> {
    instance
        .hv
        .load_vcpu_state(&instance.boot, regs, instance.entry_addr)?;
    instance.should_terminate = false;

    loop {
        match instance.hv.run()? {
            Exit::PioOut { port, value } => handle_pio(instance, port, Some(value))?,
            Exit::PioIn { port } => handle_pio(instance, port, None)?,
            Exit::Other(reason) => {
                return Err(Error::Unsupported(format!("unhandled vCPU exit: {reason}")));
            }
        }
        if instance.should_terminate {
            break;
        }
    }

    let (out_regs, rip) = instance.hv.store_vcpu_state()?;
    debug_assert_ne!(rip, instance.entry_addr, "guest exited without executing any instruction");
    Ok(out_regs)
}

fn handle_pio(instance: &mut Instance, port: u16, value: Option<u8>) -> Result<()> {
    if port != IVEE_PIO_EXIT_PORT {
        return Err(Error::Unsupported(format!("unhandled PIO exit on port {port:#x}")));
    }
    log::debug!("guest signalled termination on exit port, value={value:?}");
    instance.last_exit_value = value;
    instance.should_terminate = true;
    Ok(())
}
