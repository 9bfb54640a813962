use corescope_map::{GuestWidth, Width32, Width64};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFDATA2LSB: u8 = 1;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ElfParseError {
    #[error("not an ELF file")]
    NotElf,
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),
    #[error("big-endian ELF files are not supported")]
    WrongByteOrder,
    #[error("file ends inside the ELF header")]
    TruncatedHeader,
    #[error("not an ELF core file")]
    NotACore,
}

/// Decide which pointer-width instantiation can parse this file.
///
/// Returns the `e_ident` class byte (1 = 32-bit, 2 = 64-bit) after checking
/// the magic and byte order, so the caller can pick the monomorphization.
pub fn sniff_class(bytes: &[u8]) -> Result<u8, ElfParseError> {
    if bytes.len() < 6 || bytes[..4] != ELF_MAGIC {
        return Err(ElfParseError::NotElf);
    }
    if bytes[EI_DATA] != ELFDATA2LSB {
        return Err(ElfParseError::WrongByteOrder);
    }
    match bytes[EI_CLASS] {
        class @ (1 | 2) => Ok(class),
        class => Err(ElfParseError::UnsupportedClass(class)),
    }
}

/// Segment permission bits from `Elf_Phdr.p_flags`.
#[bitfield_struct::bitfield(u32)]
pub struct PFlags {
    #[bits(1)]
    pub execute: bool,
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// One program header with its fields widened to `u64`.
#[derive(Copy, Clone, Debug)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub flags: PFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

/// Class-specific ELF layout: header geometry plus the architecture's
/// `NT_PRSTATUS` register file.
///
/// The register vectors are fixed tables; holes (segment registers, status
/// words) carry empty names and are skipped when printing.
pub trait ElfClass: GuestWidth {
    const IDENT_CLASS: u8;
    const EHDR_SIZE: usize;
    const PHDR_SIZE: usize;
    /// Offset of the general-purpose register file inside a `NT_PRSTATUS`
    /// note description.
    const PRSTATUS_REGISTERS_OFFSET: usize;
    const REGISTER_NAMES: &'static [&'static str];
    const STACK_POINTER_INDEX: usize;

    fn parse_ehdr(bytes: &[u8]) -> ElfHeaderFields;
    fn parse_phdr(bytes: &[u8]) -> ProgramHeader;
}

/// The handful of `Elf_Ehdr` fields the analyzer consumes.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeaderFields {
    pub e_type: u16,
    pub e_phoff: u64,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(bytes[offset..offset + 2].try_into().expect("u16 field"))
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("u32 field"))
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().expect("u64 field"))
}

impl ElfClass for Width32 {
    const IDENT_CLASS: u8 = 1;
    const EHDR_SIZE: usize = 52;
    const PHDR_SIZE: usize = 32;
    const PRSTATUS_REGISTERS_OFFSET: usize = 0x48;
    const REGISTER_NAMES: &'static [&'static str] = &[
        "ebx", "ecx", "edx", "esi", "edi", "ebp", "eax", "", "", "", "", "", "eip", "", "", "esp",
    ];
    const STACK_POINTER_INDEX: usize = 15;

    fn parse_ehdr(bytes: &[u8]) -> ElfHeaderFields {
        ElfHeaderFields {
            e_type: u16_at(bytes, 16),
            e_phoff: u64::from(u32_at(bytes, 28)),
            e_phentsize: u16_at(bytes, 42),
            e_phnum: u16_at(bytes, 44),
        }
    }

    fn parse_phdr(bytes: &[u8]) -> ProgramHeader {
        ProgramHeader {
            p_type: u32_at(bytes, 0),
            offset: u64::from(u32_at(bytes, 4)),
            vaddr: u64::from(u32_at(bytes, 8)),
            filesz: u64::from(u32_at(bytes, 16)),
            memsz: u64::from(u32_at(bytes, 20)),
            flags: PFlags::from(u32_at(bytes, 24)),
            align: u64::from(u32_at(bytes, 28)),
        }
    }
}

impl ElfClass for Width64 {
    const IDENT_CLASS: u8 = 2;
    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;
    const PRSTATUS_REGISTERS_OFFSET: usize = 0x70;
    const REGISTER_NAMES: &'static [&'static str] = &[
        "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
        "rsi", "rdi", "", "rip", "", "", "rsp", "", "*fs-base*",
    ];
    const STACK_POINTER_INDEX: usize = 19;

    fn parse_ehdr(bytes: &[u8]) -> ElfHeaderFields {
        ElfHeaderFields {
            e_type: u16_at(bytes, 16),
            e_phoff: u64_at(bytes, 32),
            e_phentsize: u16_at(bytes, 54),
            e_phnum: u16_at(bytes, 56),
        }
    }

    fn parse_phdr(bytes: &[u8]) -> ProgramHeader {
        ProgramHeader {
            p_type: u32_at(bytes, 0),
            flags: PFlags::from(u32_at(bytes, 4)),
            offset: u64_at(bytes, 8),
            vaddr: u64_at(bytes, 16),
            filesz: u64_at(bytes, 32),
            memsz: u64_at(bytes, 40),
            align: u64_at(bytes, 48),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_sniffing() {
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(&ELF_MAGIC);
        ident[EI_CLASS] = 2;
        ident[EI_DATA] = 1;
        assert_eq!(sniff_class(&ident), Ok(2));
        ident[EI_CLASS] = 1;
        assert_eq!(sniff_class(&ident), Ok(1));
        ident[EI_CLASS] = 9;
        assert_eq!(sniff_class(&ident), Err(ElfParseError::UnsupportedClass(9)));
        ident[EI_CLASS] = 2;
        ident[EI_DATA] = 2;
        assert_eq!(sniff_class(&ident), Err(ElfParseError::WrongByteOrder));
        assert_eq!(sniff_class(b"\x7fELD"), Err(ElfParseError::NotElf));
        assert_eq!(sniff_class(b"\x7fE"), Err(ElfParseError::NotElf));
    }

    #[test]
    fn phdr_field_order_differs_per_class() {
        // The 64-bit layout moves p_flags ahead of p_offset.
        let mut raw64 = [0u8; 56];
        raw64[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        raw64[4..8].copy_from_slice(&5u32.to_le_bytes()); // R+X
        raw64[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
        raw64[16..24].copy_from_slice(&0x4000_0000u64.to_le_bytes());
        raw64[32..40].copy_from_slice(&0x2000u64.to_le_bytes());
        raw64[40..48].copy_from_slice(&0x3000u64.to_le_bytes());
        let header = Width64::parse_phdr(&raw64);
        assert_eq!(header.p_type, PT_LOAD);
        assert!(header.flags.read() && header.flags.execute() && !header.flags.write());
        assert_eq!(header.offset, 0x1000);
        assert_eq!(header.vaddr, 0x4000_0000);
        assert_eq!(header.filesz, 0x2000);
        assert_eq!(header.memsz, 0x3000);

        let mut raw32 = [0u8; 32];
        raw32[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        raw32[4..8].copy_from_slice(&0x1000u32.to_le_bytes());
        raw32[8..12].copy_from_slice(&0x0804_8000u32.to_le_bytes());
        raw32[16..20].copy_from_slice(&0x500u32.to_le_bytes());
        raw32[20..24].copy_from_slice(&0x600u32.to_le_bytes());
        raw32[24..28].copy_from_slice(&6u32.to_le_bytes()); // R+W
        let header = Width32::parse_phdr(&raw32);
        assert_eq!(header.vaddr, 0x0804_8000);
        assert!(header.flags.read() && header.flags.write() && !header.flags.execute());
        assert_eq!(header.filesz, 0x500);
        assert_eq!(header.memsz, 0x600);
    }
}
