//! Component C: the executable loader (spec.md §4.C).

mod elf;
mod flat;

use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::memory::MemoryMap;

/// On-disk image format a caller may request (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Bin,
    Elf64,
    Any,
}

/// Result of a successful load: where the guest starts executing.
#[derive(Debug)]
pub struct Loaded {
    pub entry_addr: u64,
}

/// Checks read+execute access before any file handle is opened, so a
/// permission failure always surfaces as `INVALID_ARG` rather than
/// racing an OS-level `IoError` out of `File::open` (spec.md §4.C
/// precondition, §8 testable property 8).
fn check_access(path: &Path) -> Result<File> {
    let meta = std::fs::metadata(path)?;
    let mode = meta.permissions().mode();
    if mode & 0o444 == 0 || mode & 0o111 == 0 {
        return Err(Error::InvalidArg(format!(
            "{} is not readable and executable",
            path.display()
        )));
    }
    File::open(path).map_err(Error::from)
}

/// Parse `path` per `format` and populate `map` with the resulting
/// guest regions. On any failure `map` is left exactly as it was
/// handed in, so the caller can `free()` it (spec.md §4.C "Failure
/// policy").
pub fn load_executable(map: &mut MemoryMap, path: &Path, format: Format) -> Result<Loaded> {
    let file = check_access(path)?;
    let data = std::fs::read(path)?;

    match format {
        Format::Bin => flat::load(map, &file, &data),
        Format::Elf64 => elf::load(map, &data),
        Format::Any => match elf::load(map, &data) {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                log::warn!("ELF64 load failed ({e}), falling back to flat binary");
                flat::load(map, &file, &data)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    struct TempFile(std::path::PathBuf);
    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn tempfile_with(name: &str, data: &[u8], mode: u32) -> TempFile {
        let path = std::env::temp_dir().join(format!("ivee-loader-test-{name}-{:?}", std::thread::current().id()));
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(mode)
            .open(&path)
            .unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        // OpenOptions::mode is only honored on creation; force it in
        // case the path already existed from a prior failed test run.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        TempFile(path)
    }

    #[test]
    fn any_tries_elf_before_falling_back_to_flat() {
        // Not a valid ELF, but a perfectly good flat binary.
        let tmp = tempfile_with("any-fallback", b"not an elf file", 0o755);
        let mut map = MemoryMap::new();
        let loaded = load_executable(&mut map, &tmp.0, Format::Any).unwrap();
        assert_eq!(loaded.entry_addr, flat::FLAT_LOAD_ADDR);
    }

    #[test]
    fn non_executable_file_is_rejected_before_any_mapping() {
        let tmp = tempfile_with("no-exec", b"\xF4", 0o644);
        let mut map = MemoryMap::new();
        let err = load_executable(&mut map, &tmp.0, Format::Bin).unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert_eq!(map.iterate().count(), 0);
    }

    #[test]
    fn non_readable_file_is_rejected_before_any_mapping() {
        let tmp = tempfile_with("no-read", b"\xF4", 0o311);
        let mut map = MemoryMap::new();
        let err = load_executable(&mut map, &tmp.0, Format::Bin).unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
        assert_eq!(map.iterate().count(), 0);
    }
}
