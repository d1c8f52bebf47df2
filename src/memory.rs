//! Component A: the guest memory map (spec.md §4.A).

use std::collections::BTreeMap;
use std::fs::File;

use bitflags::bitflags;
use memmap2::{Mmap, MmapMut};
use vm_memory::GuestAddress;

use crate::error::{Error, Result};

pub const PAGE_SIZE: u64 = 4096;

bitflags! {
    /// Region permission set. READ is implied whenever a region exists
    /// (spec.md §3), so it is not a distinct bit here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const WRITE = 0b01;
        const EXEC  = 0b10;
    }
}

/// Host-side backing for a guest region: either a private anonymous
/// allocation, or a read-only mapping of a contiguous range of a file
/// starting at offset 0.
pub enum Backing {
    Anon(MmapMut),
    File(Mmap),
}

impl Backing {
    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::Anon(m) => m.as_ptr(),
            Backing::File(m) => m.as_ptr(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backing::Anon(m) => m.len(),
            Backing::File(m) => m.len(),
        }
    }

    fn is_file(&self) -> bool {
        matches!(self, Backing::File(_))
    }
}

/// A contiguous span of guest-physical memory backed by host memory
/// (spec.md §3).
pub struct GuestMemoryRegion {
    pub first_gfn: u64,
    pub last_gfn: u64,
    pub prot: Prot,
    pub backing: Backing,
}

impl GuestMemoryRegion {
    pub fn gpa(&self) -> GuestAddress {
        GuestAddress(self.first_gfn * PAGE_SIZE)
    }

    pub fn size(&self) -> u64 {
        (self.last_gfn - self.first_gfn + 1) * PAGE_SIZE
    }

    pub fn hva(&self) -> u64 {
        self.backing.as_ptr() as u64
    }

    pub fn read_only(&self) -> bool {
        self.backing.is_file()
    }

    /// Host-visible bytes of this region. Safe to read for the
    /// lifetime of the map since regions are never resized or freed
    /// until the whole map is freed.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.backing.as_ptr(), self.backing.len()) }
    }

    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            Backing::Anon(m) => Some(&mut m[..]),
            Backing::File(_) => None,
        }
    }
}

/// Ordered set of guest regions, sorted by `first_gfn` (spec.md §3,
/// §9 design note: an ordered container keyed by `first_gfn`, not the
/// source's intrusive list).
#[derive(Default)]
pub struct MemoryMap {
    regions: BTreeMap<u64, GuestMemoryRegion>,
    finalized: bool,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Ascending sequence of regions by `first_gfn`. Pure read, no
    /// side effects (spec.md §4.A `iterate`).
    pub fn iterate(&self) -> impl Iterator<Item = &GuestMemoryRegion> {
        self.regions.values()
    }

    pub fn iterate_mut(&mut self) -> impl Iterator<Item = &mut GuestMemoryRegion> {
        self.regions.values_mut()
    }

    fn overlaps(&self, first_gfn: u64, last_gfn: u64) -> bool {
        self.regions.values().any(|r| first_gfn <= r.last_gfn && r.first_gfn <= last_gfn)
    }

    /// Allocate host backing and register a region covering
    /// `[gpa, gpa + round_up(size, 4 KiB))` (spec.md §4.A
    /// `map_host_memory`).
    pub fn map_host_memory(
        &mut self,
        gpa: u64,
        size: u64,
        file: Option<(&File, u64)>,
        prot: Prot,
    ) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArg("region size must be non-zero".into()));
        }
        if gpa % PAGE_SIZE != 0 {
            return Err(Error::InvalidArg("region gpa must be page-aligned".into()));
        }

        let page_count = size.div_ceil(PAGE_SIZE);
        let first_gfn = gpa / PAGE_SIZE;
        let last_gfn = first_gfn + page_count - 1;

        if self.overlaps(first_gfn, last_gfn) {
            return Err(Error::Conflict(format!(
                "region [{first_gfn:#x}, {last_gfn:#x}] overlaps an existing region"
            )));
        }

        let backing = match file {
            Some((f, offset)) => {
                let mmap = unsafe {
                    memmap2::MmapOptions::new()
                        .offset(offset)
                        .len((page_count * PAGE_SIZE) as usize)
                        .map(f)
                        .map_err(|e| Error::OutOfMemory(format!("file mapping failed: {e}")))?
                };
                Backing::File(mmap)
            }
            None => {
                let mmap = MmapMut::map_anon((page_count * PAGE_SIZE) as usize)
                    .map_err(|e| Error::OutOfMemory(format!("anonymous mapping failed: {e}")))?;
                Backing::Anon(mmap)
            }
        };

        log::debug!(
            "mapped guest region gfn=[{first_gfn:#x},{last_gfn:#x}] prot={prot:?} file_backed={}",
            file.is_some()
        );

        self.regions.insert(
            first_gfn,
            GuestMemoryRegion {
                first_gfn,
                last_gfn,
                prot,
                backing,
            },
        );
        Ok(())
    }

    /// Release all host-side backings and region metadata. Idempotent.
    pub fn free(&mut self) {
        self.regions.clear();
        self.finalized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_sorted_and_non_overlapping() {
        let mut map = MemoryMap::new();
        map.map_host_memory(0x4000, PAGE_SIZE, None, Prot::empty()).unwrap();
        map.map_host_memory(0x1000, PAGE_SIZE, None, Prot::WRITE).unwrap();
        map.map_host_memory(0x2000, PAGE_SIZE, None, Prot::EXEC).unwrap();

        let gfns: Vec<u64> = map.iterate().map(|r| r.first_gfn).collect();
        assert_eq!(gfns, vec![1, 2, 4]);
    }

    #[test]
    fn overlap_is_rejected() {
        let mut map = MemoryMap::new();
        map.map_host_memory(0x1000, 2 * PAGE_SIZE, None, Prot::empty()).unwrap();
        let err = map.map_host_memory(0x2000, PAGE_SIZE, None, Prot::empty()).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(map.iterate().count(), 1);
    }

    #[test]
    fn zero_size_is_invalid() {
        let mut map = MemoryMap::new();
        let err = map.map_host_memory(0x1000, 0, None, Prot::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }

    #[test]
    fn free_is_idempotent() {
        let mut map = MemoryMap::new();
        map.map_host_memory(0x1000, PAGE_SIZE, None, Prot::empty()).unwrap();
        map.free();
        map.free();
        assert_eq!(map.iterate().count(), 0);
    }
}
