use crate::file_image::{FileImage, FileImageError};
use crate::layout::{ElfClass, ElfParseError, PT_LOAD, sniff_class};
use crate::{ET_DYN, ET_EXEC};
use corescope_map::{Permissions, VirtualAddressMap};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ModuleImageError {
    #[error(transparent)]
    File(#[from] FileImageError),
    #[error(transparent)]
    Parse(#[from] ElfParseError),
    #[error("the file is neither an executable nor a shared library")]
    NotAModule,
}

/// The on-disk copy of a module mapped read-only.
///
/// Used to recover statically-allocated bytes (usually string constants)
/// the dumper chose not to copy into the core. The mapping lives only as
/// long as this value; callers build the module-local address map per
/// recovery call.
pub struct ModuleImage<W> {
    file: FileImage,
    _width: std::marker::PhantomData<W>,
}

impl<W: ElfClass> ModuleImage<W> {
    /// Open and validate `path` as an `ET_EXEC` or `ET_DYN` ELF of this
    /// class.
    pub fn open(path: &Path) -> Result<Self, ModuleImageError> {
        let file = FileImage::open(path)?;
        let bytes = file.bytes();
        let class = sniff_class(bytes)?;
        if class != W::IDENT_CLASS {
            return Err(ElfParseError::UnsupportedClass(class).into());
        }
        if bytes.len() < W::EHDR_SIZE {
            return Err(ElfParseError::TruncatedHeader.into());
        }
        let elf_type = W::parse_ehdr(bytes).e_type;
        if elf_type != ET_EXEC && elf_type != ET_DYN {
            return Err(ModuleImageError::NotAModule);
        }
        Ok(Self {
            file,
            _width: std::marker::PhantomData,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The module's ELF header bytes, used to check that an on-disk file is
    /// the same build the process had mapped.
    #[must_use]
    pub fn header_bytes(&self) -> &[u8] {
        &self.file.bytes()[..W::EHDR_SIZE.min(self.file.bytes().len())]
    }

    /// Build the module's own virtual address map from its load headers.
    ///
    /// Addresses in the returned map are module virtual addresses, not
    /// process runtime addresses.
    #[must_use]
    pub fn address_map(&self) -> VirtualAddressMap<'_, W> {
        let bytes = self.file.bytes();
        let header = W::parse_ehdr(bytes);
        let mut map = VirtualAddressMap::new(bytes);
        let entry_size = header.e_phentsize as usize;
        if entry_size < W::PHDR_SIZE {
            return map;
        }
        for index in 0..header.e_phnum as usize {
            let at = header.e_phoff as usize + index * entry_size;
            let Some(raw) = bytes.get(at..at + entry_size) else {
                break;
            };
            let parsed = W::parse_phdr(raw);
            if parsed.p_type != PT_LOAD || parsed.filesz == 0 {
                continue;
            }
            map.add_range(
                parsed.vaddr,
                parsed.filesz,
                W::wrapping_sub(parsed.offset, parsed.vaddr),
                true,
                Some(Permissions {
                    readable: parsed.flags.read(),
                    writable: parsed.flags.write(),
                    executable: parsed.flags.execute(),
                }),
            );
        }
        map
    }
}
