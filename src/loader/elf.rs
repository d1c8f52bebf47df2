//! ELF64 loader (spec.md §4.C).

use goblin::elf::Elf;
use goblin::elf::header::{EM_X86_64, ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};

use crate::error::{Error, Result};
use crate::memory::{MemoryMap, Prot};

use super::Loaded;

pub fn load(map: &mut MemoryMap, data: &[u8]) -> Result<Loaded> {
    let elf = Elf::parse(data)?;

    if !elf.is_64 {
        return Err(Error::Unsupported("ELF class is not 64-bit".into()));
    }
    if elf.header.e_machine != EM_X86_64 {
        return Err(Error::Unsupported(format!(
            "unsupported ELF machine type {}",
            elf.header.e_machine
        )));
    }
    if elf.header.e_type != ET_EXEC && elf.header.e_type != ET_DYN {
        return Err(Error::Unsupported(format!(
            "unsupported ELF type {}",
            elf.header.e_type
        )));
    }

    for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        let file_off = ph.p_offset as usize;
        let filesz = ph.p_filesz as usize;
        let memsz = ph.p_memsz as usize;

        if file_off.checked_add(filesz).is_none_or(|end| end > data.len()) {
            return Err(Error::IoError(std::io::Error::other(
                "PT_LOAD segment extends past end of file",
            )));
        }

        let mut prot = Prot::empty();
        if ph.p_flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if ph.p_flags & PF_X != 0 {
            prot |= Prot::EXEC;
        }
        // A segment with none of R/W/X set still becomes a present,
        // non-executable, non-writable PTE (spec.md §9 open question).

        map.map_host_memory(ph.p_vaddr, memsz as u64, None, prot)?;

        let region = map
            .iterate_mut()
            .find(|r| r.first_gfn == ph.p_vaddr / crate::memory::PAGE_SIZE)
            .expect("region was just inserted");
        let buf = region.as_mut_slice().expect("freshly allocated region is anonymous");
        buf[..filesz].copy_from_slice(&data[file_off..file_off + filesz]);
        // The remainder of `memsz` beyond `filesz` is already zero
        // (fresh anonymous mapping), giving BSS semantics for free.
    }

    Ok(Loaded { entry_addr: elf.entry })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_elf(segments: &[(u64, u64, u32, &[u8])]) -> Vec<u8> {
        // Hand-build a minimal valid ELF64 header + one program
        // header per segment, using hand-encoded byte arrays instead
        // of pulling in an assembler/object-writer dependency.
        use goblin::elf::header::*;
        use goblin::elf::program_header::*;

        let ehsize = 64usize;
        let phentsize = 56usize;
        let phnum = segments.len();
        let phoff = ehsize;
        let data_off = phoff + phentsize * phnum;

        let mut out = vec![0u8; data_off];

        // e_ident
        out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = ELFCLASS64;
        out[5] = ELFDATA2LSB;
        out[6] = EV_CURRENT as u8;

        let mut header_fields: Vec<u8> = Vec::new();
        header_fields.extend_from_slice(&(ET_EXEC as u16).to_le_bytes()); // e_type
        header_fields.extend_from_slice(&(EM_X86_64 as u16).to_le_bytes()); // e_machine
        header_fields.extend_from_slice(&(EV_CURRENT as u32).to_le_bytes()); // e_version
        header_fields.extend_from_slice(&segments[0].0.to_le_bytes()); // e_entry = first segment vaddr
        header_fields.extend_from_slice(&(phoff as u64).to_le_bytes()); // e_phoff
        header_fields.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        header_fields.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        header_fields.extend_from_slice(&(ehsize as u16).to_le_bytes()); // e_ehsize
        header_fields.extend_from_slice(&(phentsize as u16).to_le_bytes()); // e_phentsize
        header_fields.extend_from_slice(&(phnum as u16).to_le_bytes()); // e_phnum
        header_fields.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        header_fields.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        header_fields.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        out[16..16 + header_fields.len()].copy_from_slice(&header_fields);

        let mut appended = Vec::new();
        for (vaddr, memsz, flags, filedata) in segments {
            let this_off = data_off + appended.len();
            let mut ph = Vec::new();
            ph.extend_from_slice(&PT_LOAD.to_le_bytes());
            ph.extend_from_slice(&flags.to_le_bytes());
            ph.extend_from_slice(&(this_off as u64).to_le_bytes()); // p_offset
            ph.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
            ph.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
            ph.extend_from_slice(&(filedata.len() as u64).to_le_bytes()); // p_filesz
            ph.extend_from_slice(&memsz.to_le_bytes()); // p_memsz
            ph.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
            out.extend_from_slice(&ph);
            appended.extend_from_slice(filedata);
        }
        out.extend_from_slice(&appended);
        out
    }

    #[test]
    fn two_load_segments_get_distinct_permissions() {
        use goblin::elf::program_header::{PF_R, PF_W, PF_X};

        let code = vec![0x90u8; 4096]; // nop sled
        let data = build_minimal_elf(&[
            (0x400000, 4096, PF_R | PF_X, &code),
            (0x601000, 4096, PF_R | PF_W, &[]),
        ]);

        let mut map = MemoryMap::new();
        let loaded = load(&mut map, &data).unwrap();
        assert_eq!(loaded.entry_addr, 0x400000);

        let regions: Vec<_> = map.iterate().collect();
        assert_eq!(regions.len(), 2);
        assert!(regions[0].prot.contains(Prot::EXEC) && !regions[0].prot.contains(Prot::WRITE));
        assert!(regions[1].prot.contains(Prot::WRITE) && !regions[1].prot.contains(Prot::EXEC));
    }

    #[test]
    fn non_elf_input_is_unsupported() {
        let mut map = MemoryMap::new();
        let err = load(&mut map, b"not an elf file at all").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(map.iterate().count(), 0);
    }
}
