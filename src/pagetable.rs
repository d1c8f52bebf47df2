//! Component B: the 4-level identity-mapping page-table builder
//! (spec.md §4.B).

use crate::error::{Error, Result};
use crate::memory::{MemoryMap, PAGE_SIZE, Prot};

const PTE_PRESENT: u64 = 1 << 0;
const PTE_RW: u64 = 1 << 1;
const PTE_NX: u64 = 1 << 63;

/// Size of the identity-mapped guest-physical window (spec.md §4.B).
pub const WINDOW_SIZE: u64 = 1 << 30;
const WINDOW_PAGES: u64 = WINDOW_SIZE / PAGE_SIZE;

const FOOTPRINT_PAGES: u64 = 1 + 1 + 1 + 512; // PML4 + PDPT + PD + 512 PTs
pub const FOOTPRINT_SIZE: u64 = FOOTPRINT_PAGES * PAGE_SIZE;

pub const PML4_BASE: u64 = WINDOW_SIZE - FOOTPRINT_SIZE;
pub const PDPT_BASE: u64 = PML4_BASE + PAGE_SIZE;
pub const PD_BASE: u64 = PDPT_BASE + PAGE_SIZE;
pub const PT_BASE: u64 = PD_BASE + PAGE_SIZE;

fn write_u64(buf: &mut [u8], base: u64, addr: u64, value: u64) {
    let off = (addr - base) as usize;
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Build the 4-level identity mapping covering `[0, 2^30)` at 4 KiB
/// granularity, from the regions already present in `map`. Must be
/// called once, after the loader has finished populating `map` and
/// before the map is finalized and pushed to the hypervisor.
pub fn build(map: &mut MemoryMap) -> Result<()> {
    // Step 1: allocate the page-table footprint itself. Guest
    // permissions are READ|WRITE (implicit READ, explicit WRITE) so
    // the guest may edit its own unmapped PTE slots at runtime.
    map.map_host_memory(PML4_BASE, FOOTPRINT_SIZE, None, Prot::WRITE)?;

    // Snapshot (first_gfn, last_gfn, prot) for every region, including
    // the page-table region just inserted above, before taking a
    // mutable borrow of that region's backing buffer.
    let snapshots: Vec<(u64, u64, Prot)> =
        map.iterate().map(|r| (r.first_gfn, r.last_gfn, r.prot)).collect();

    let pt_first_gfn = PML4_BASE / PAGE_SIZE;
    let pt_region = map
        .iterate_mut()
        .find(|r| r.first_gfn == pt_first_gfn)
        .expect("page-table region was just inserted");
    let buf = pt_region
        .as_mut_slice()
        .expect("page-table region is anonymous and therefore writable");

    // Step 2+3: single PML4/PDPT entry each, covering the whole window.
    write_u64(buf, PML4_BASE, PML4_BASE, PDPT_BASE | PTE_PRESENT);
    write_u64(buf, PML4_BASE, PDPT_BASE, PD_BASE | PTE_PRESENT);

    // Step 4: every PD entry unconditionally grants RW; PT entries
    // narrow effective permissions per region.
    for i in 0..512u64 {
        let pd_entry_addr = PD_BASE + i * 8;
        let pt_page = PT_BASE + i * PAGE_SIZE;
        write_u64(buf, PML4_BASE, pd_entry_addr, pt_page | PTE_PRESENT | PTE_RW);
    }

    // Step 5: the 512*512 PTE slots are already zero (fresh anonymous
    // mapping), so non-covered GFNs stay non-present for free.

    // Step 6: emit one PTE per GFN covered by a region.
    for (first_gfn, last_gfn, prot) in snapshots {
        if last_gfn >= WINDOW_PAGES {
            return Err(Error::InvalidArg(format!(
                "region gfn {last_gfn:#x} falls outside the {WINDOW_SIZE:#x}-byte identity-mapped window"
            )));
        }
        for gfn in first_gfn..=last_gfn {
            let pte_addr = PT_BASE + (gfn >> 9) * PAGE_SIZE + (gfn & 0x1FF) * 8;
            let mut flags = PTE_PRESENT;
            if prot.contains(Prot::WRITE) {
                flags |= PTE_RW;
            }
            if !prot.contains(Prot::EXEC) {
                flags |= PTE_NX;
            }
            write_u64(buf, PML4_BASE, pte_addr, (gfn * PAGE_SIZE) | flags);
        }
    }

    log::debug!("built identity page tables: cr3={PML4_BASE:#x} footprint={FOOTPRINT_SIZE:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMap;

    #[test]
    fn footprint_is_515_pages_and_page_aligned() {
        assert_eq!(FOOTPRINT_SIZE, 515 * PAGE_SIZE);
        assert_eq!(PML4_BASE % PAGE_SIZE, 0);
        assert_eq!(PDPT_BASE, PML4_BASE + PAGE_SIZE);
        assert_eq!(PD_BASE, PDPT_BASE + PAGE_SIZE);
        assert_eq!(PT_BASE, PD_BASE + PAGE_SIZE);
        assert_eq!(PML4_BASE + FOOTPRINT_SIZE, WINDOW_SIZE);
    }

    fn read_u64(buf: &[u8], base: u64, addr: u64) -> u64 {
        let off = (addr - base) as usize;
        u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
    }

    #[test]
    fn pte_encodes_permissions_and_leaves_holes_zero() {
        let mut map = MemoryMap::new();
        map.map_host_memory(0x0, PAGE_SIZE, None, Prot::EXEC).unwrap(); // R/X
        map.map_host_memory(0x1000, PAGE_SIZE, None, Prot::WRITE).unwrap(); // R/W
        build(&mut map).unwrap();

        let pt_region = map.iterate().find(|r| r.first_gfn == PML4_BASE / PAGE_SIZE).unwrap();
        let buf = pt_region.as_slice();

        let pte0 = read_u64(buf, PML4_BASE, PT_BASE);
        assert_eq!(pte0 & PTE_PRESENT, PTE_PRESENT);
        assert_eq!(pte0 & PTE_RW, 0, "R/X region must not be writable");
        assert_eq!(pte0 & PTE_NX, 0, "R/X region must be executable");

        let pte1 = read_u64(buf, PML4_BASE, PT_BASE + 8);
        assert_eq!(pte1 & PTE_PRESENT, PTE_PRESENT);
        assert_eq!(pte1 & PTE_RW, PTE_RW, "R/W region must be writable");
        assert_eq!(pte1 & PTE_NX, PTE_NX, "R/W region must not be executable");

        // An uncovered GFN between the two real regions and the PT
        // footprint stays exactly zero.
        let hole = read_u64(buf, PML4_BASE, PT_BASE + 2 * 8);
        assert_eq!(hole, 0);
    }

    #[test]
    fn cr3_is_pml4_base() {
        assert_eq!(PML4_BASE, WINDOW_SIZE - 515 * PAGE_SIZE);
    }
}
