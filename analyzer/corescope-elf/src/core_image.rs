use crate::layout::{ElfClass, ElfParseError, PT_LOAD, PT_NOTE, ProgramHeader, sniff_class};
use crate::thread_map::{Thread, ThreadMap};
use crate::ET_CORE;
use corescope_map::{Permissions, Reader, VirtualAddressMap};

const NT_PRSTATUS: u32 = 1;
/// "FILE" read as a little-endian u32.
const NT_FILE: u32 = 0x4649_4C45;

/// One module-backed range from the core's FILE note.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileBackedRange {
    pub base: u64,
    pub limit: u64,
    /// Byte offset inside the backing file (the in-note page/byte ambiguity
    /// is already resolved).
    pub file_offset: u64,
    pub path: String,
}

/// A parsed little-endian ELF core of width `W`.
///
/// Owns the virtual address map, the thread map and the FILE-note ranges;
/// everything else in the analyzer reads through these.
#[derive(Debug)]
pub struct CoreImage<'core, W: ElfClass> {
    address_map: VirtualAddressMap<'core, W>,
    thread_map: ThreadMap,
    file_backed_ranges: Vec<FileBackedRange>,
    elf_type: u16,
    file_size: u64,
    minimum_expected_file_size: u64,
}

impl<'core, W: ElfClass> CoreImage<'core, W> {
    /// Parse `bytes` as an ELF core of this width.
    ///
    /// The load headers that survive truncation are always applied, so a
    /// truncated core still yields the best address map the file supports.
    pub fn parse(bytes: &'core [u8]) -> Result<Self, ElfParseError> {
        let class = sniff_class(bytes)?;
        if class != W::IDENT_CLASS {
            return Err(ElfParseError::UnsupportedClass(class));
        }
        if bytes.len() < W::EHDR_SIZE {
            return Err(ElfParseError::TruncatedHeader);
        }
        let header = W::parse_ehdr(bytes);
        if header.e_type != ET_CORE {
            return Err(ElfParseError::NotACore);
        }

        let file_size = bytes.len() as u64;
        let mut image = Self {
            address_map: VirtualAddressMap::new(bytes),
            thread_map: ThreadMap::new(W::REGISTER_NAMES),
            file_backed_ranges: Vec::new(),
            elf_type: header.e_type,
            file_size,
            minimum_expected_file_size: header.e_phoff
                + u64::from(header.e_phnum) * u64::from(header.e_phentsize),
        };

        for program_header in header_table::<W>(bytes, file_size) {
            if program_header.p_type == PT_LOAD {
                image.apply_load_header(&program_header);
            }
        }
        let truncated = image.is_truncated();

        for (offset, program_header) in note_headers::<W>(bytes, file_size, truncated) {
            image.walk_note_segment(bytes, offset, &program_header);
        }
        image.derive_thread_stacks();
        Ok(image)
    }

    #[must_use]
    pub const fn address_map(&self) -> &VirtualAddressMap<'core, W> {
        &self.address_map
    }

    #[must_use]
    pub const fn thread_map(&self) -> &ThreadMap {
        &self.thread_map
    }

    #[must_use]
    pub fn file_backed_ranges(&self) -> &[FileBackedRange] {
        &self.file_backed_ranges
    }

    #[must_use]
    pub const fn elf_type(&self) -> u16 {
        self.elf_type
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub const fn minimum_expected_file_size(&self) -> u64 {
        self.minimum_expected_file_size
    }

    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        self.file_size < self.minimum_expected_file_size
    }

    fn apply_load_header(&mut self, header: &ProgramHeader) {
        let permissions = Some(Permissions {
            readable: header.flags.read(),
            writable: header.flags.write(),
            executable: header.flags.execute(),
        });
        let adjust = W::wrapping_sub(header.offset, header.vaddr);
        if header.filesz > 0 {
            if header.memsz < header.filesz {
                log::warn!(
                    "load range at {:#x} is larger than its in-memory size",
                    header.vaddr
                );
                return;
            }
            // The map splits off any truncated tail itself.
            self.address_map
                .add_range(header.vaddr, header.filesz, adjust, true, permissions);
            if header.memsz > header.filesz {
                self.address_map.add_range(
                    header.vaddr + header.filesz,
                    header.memsz - header.filesz,
                    adjust,
                    false,
                    permissions,
                );
            }
            let limit = header.offset.saturating_add(header.filesz);
            if self.minimum_expected_file_size < limit {
                self.minimum_expected_file_size = limit;
            }
        } else {
            self.address_map
                .add_range(header.vaddr, header.memsz, adjust, false, permissions);
        }
    }

    fn walk_note_segment(&mut self, bytes: &'core [u8], at: u64, header: &ProgramHeader) {
        if header.offset == 0 {
            log::warn!("note header at file offset {at:#x} has invalid p_offset 0");
            return;
        }
        let Ok(start) = usize::try_from(header.offset) else {
            return;
        };
        let Some(segment) = usize::try_from(header.filesz)
            .ok()
            .and_then(|len| start.checked_add(len))
            .and_then(|end| bytes.get(start..end))
        else {
            // Truncation took the notes; the truncation warning covers it.
            return;
        };
        let mut cursor = 0usize;
        while cursor + 12 <= segment.len() {
            let name_size = u32::from_le_bytes(segment[cursor..cursor + 4].try_into().unwrap());
            let desc_size = u32::from_le_bytes(segment[cursor + 4..cursor + 8].try_into().unwrap());
            let note_type = u32::from_le_bytes(segment[cursor + 8..cursor + 12].try_into().unwrap());
            let name_start = cursor + 12;
            let Some(name_end) = name_start.checked_add(name_size as usize) else {
                break;
            };
            if name_end > segment.len() {
                log::warn!("a note segment at file offset {:#x} is not parseable", header.offset);
                break;
            }
            // The name length may or may not include the trailing NUL.
            let name_bytes = &segment[name_start..name_end];
            let name = match name_bytes.split_last() {
                Some((0, rest)) => rest,
                _ => name_bytes,
            };
            if desc_size == 0 {
                break;
            }
            let desc_start = name_start + align4(name_size as usize);
            let Some(desc_end) = desc_start.checked_add(desc_size as usize) else {
                break;
            };
            if desc_end > segment.len() {
                log::warn!("a note description at file offset {:#x} runs past its segment", header.offset);
                break;
            }
            self.visit_note(name, &segment[desc_start..desc_end], note_type);
            cursor = desc_start + align4(desc_size as usize);
        }
    }

    fn visit_note(&mut self, name: &[u8], description: &'core [u8], note_type: u32) {
        if name != b"CORE" {
            return;
        }
        match note_type {
            NT_PRSTATUS => self.record_thread(description),
            NT_FILE => self.record_file_backed_ranges(description),
            _ => {}
        }
    }

    fn record_thread(&mut self, description: &[u8]) {
        let registers_offset = W::PRSTATUS_REGISTERS_OFFSET;
        let count = W::REGISTER_NAMES.len();
        let needed = registers_offset + count * W::WORD_BYTES as usize;
        if description.len() < needed {
            log::warn!("a status note is too short for the register file");
            return;
        }
        let registers: Vec<u64> = (0..count)
            .map(|i| {
                let at = registers_offset + i * W::WORD_BYTES as usize;
                W::read_word(&description[at..])
            })
            .collect();
        let number = self.thread_map.threads().len() + 1;
        let stack_pointer = registers[W::STACK_POINTER_INDEX];
        self.thread_map.add_thread(Thread {
            number,
            stack_base: 0,
            stack_pointer,
            stack_limit: 0,
            registers,
        });
    }

    /// Bound each thread's stack inside its mapped range.
    ///
    /// The range base is trustworthy (a guard area precedes it); the other
    /// end is guessed by scanning upward for the pthread self-reference pair
    /// and rounding to a page.
    fn derive_thread_stacks(&mut self) {
        let word = W::WORD_BYTES;
        let truncated = self.is_truncated();
        let mut bounded = Vec::new();
        for thread in self.thread_map.threads() {
            let mut thread = thread.clone();
            let Some(range) = self.address_map.find(thread.stack_pointer) else {
                log::warn!(
                    "thread {} has unmapped stack top {:#x}",
                    thread.number,
                    thread.stack_pointer
                );
                continue;
            };
            if range.image.is_none() {
                if !truncated {
                    log::warn!("thread {} has no stack image in the core", thread.number);
                }
                continue;
            }
            let mut reader = Reader::new(&self.address_map);
            let max_limit = range.limit();
            if max_limit < range.base + 3 * word {
                continue;
            }
            let max_self_ref = max_limit - 3 * word;
            let mut limit = max_limit;
            let mut self_ref = (thread.stack_pointer + word) & !(word - 1);
            while self_ref <= max_self_ref {
                if reader.read_word_or(self_ref, 0) == self_ref
                    && reader.read_word_or(self_ref + 2 * word, 0) == self_ref
                {
                    limit = (self_ref + 0x1000) & !0xFFF;
                    break;
                }
                self_ref += word;
            }
            thread.stack_base = range.base;
            thread.stack_limit = limit.min(max_limit);
            bounded.push(thread);
        }
        let mut thread_map = ThreadMap::new(W::REGISTER_NAMES);
        for thread in bounded {
            thread_map.add_thread(thread);
        }
        self.thread_map = thread_map;
    }

    fn record_file_backed_ranges(&mut self, description: &'core [u8]) {
        let word = W::WORD_BYTES as usize;
        if description.len() < 2 * word {
            return;
        }
        let count = W::read_word(description) as usize;
        let triples_start = 2 * word; // count, then the in-note page size
        let Some(paths_start) = count
            .checked_mul(3 * word)
            .and_then(|len| triples_start.checked_add(len))
        else {
            return;
        };
        if paths_start > description.len() {
            log::warn!("the module table note is shorter than its own count");
            return;
        }
        let triple = |index: usize, field: usize| {
            W::read_word(&description[triples_start + (index * 3 + field) * word..])
        };
        // Offsets may be stored in pages or in bytes. Byte offsets of page
        // aligned mappings have zero low bits, so any set low bit means the
        // table is in pages.
        let mut multiplier = 1;
        for index in 0..count {
            if triple(index, 2) & 0xFFF != 0 {
                multiplier = 0x1000;
                break;
            }
        }
        let mut paths = description[paths_start..].split(|&b| b == 0);
        for index in 0..count {
            let Some(path) = paths.next() else {
                log::warn!("the module table note names fewer files than it counts");
                break;
            };
            self.file_backed_ranges.push(FileBackedRange {
                base: triple(index, 0),
                limit: triple(index, 1),
                file_offset: triple(index, 2).wrapping_mul(multiplier),
                path: String::from_utf8_lossy(path).into_owned(),
            });
        }
    }
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Program headers that are fully present in the file, in table order.
fn header_table<W: ElfClass>(
    bytes: &[u8],
    file_size: u64,
) -> impl Iterator<Item = ProgramHeader> + '_ {
    let header = W::parse_ehdr(bytes);
    let entry_size = header.e_phentsize as usize;
    let mut count = header.e_phnum as usize;
    if entry_size < W::PHDR_SIZE {
        count = 0;
    }
    let table_end = header.e_phoff + (count as u64) * (entry_size as u64);
    if count != 0 && table_end > file_size {
        count = if file_size < header.e_phoff {
            0
        } else {
            ((file_size - header.e_phoff) / entry_size as u64) as usize
        };
    }
    let start = header.e_phoff as usize;
    (0..count).map_while(move |index| {
        let at = start + index * entry_size;
        let raw = bytes.get(at..at + entry_size)?;
        let parsed = W::parse_phdr(raw);
        // A non-power-of-two alignment means the header count in the ELF
        // header was corrupt; stop trusting the rest of the table.
        if parsed.align != 0 && !parsed.align.is_power_of_two() {
            log::warn!("program header at file offset {at:#x} has alignment {:#x}", parsed.align);
            return None;
        }
        Some(parsed)
    })
}

fn note_headers<W: ElfClass>(
    bytes: &[u8],
    file_size: u64,
    truncated: bool,
) -> Vec<(u64, ProgramHeader)> {
    let header = W::parse_ehdr(bytes);
    let entry_size = u64::from(header.e_phentsize);
    header_table::<W>(bytes, file_size)
        .enumerate()
        .filter(|(_, parsed)| parsed.p_type == PT_NOTE)
        .filter(|(_, parsed)| {
            // Skip notes whose bytes truncation removed.
            !(truncated && parsed.offset.saturating_add(parsed.filesz) > file_size)
        })
        .map(|(index, parsed)| (header.e_phoff + index as u64 * entry_size, parsed))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ELF_MAGIC;
    use corescope_map::Width64;

    /// Builds a minimal 64-bit core image in memory.
    pub struct CoreBuilder {
        headers: Vec<ProgramHeader>,
        payload: Vec<u8>,
        notes: Vec<u8>,
    }

    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;

    impl CoreBuilder {
        pub fn new() -> Self {
            Self {
                headers: Vec::new(),
                payload: Vec::new(),
                notes: Vec::new(),
            }
        }

        pub fn load(&mut self, vaddr: u64, bytes: &[u8], memsz: u64, flags: u32) -> &mut Self {
            self.headers.push(ProgramHeader {
                p_type: PT_LOAD,
                flags: PFlags::from(flags),
                offset: self.payload.len() as u64, // patched to absolute later
                vaddr,
                filesz: bytes.len() as u64,
                memsz,
                align: 0x1000,
            });
            self.payload.extend_from_slice(bytes);
            self
        }

        pub fn note(&mut self, name: &[u8], note_type: u32, desc: &[u8]) -> &mut Self {
            let name_size = name.len() as u32 + 1;
            self.notes.extend_from_slice(&name_size.to_le_bytes());
            self.notes.extend_from_slice(&(desc.len() as u32).to_le_bytes());
            self.notes.extend_from_slice(&note_type.to_le_bytes());
            self.notes.extend_from_slice(name);
            self.notes.push(0);
            while self.notes.len() % 4 != 0 {
                self.notes.push(0);
            }
            self.notes.extend_from_slice(desc);
            while self.notes.len() % 4 != 0 {
                self.notes.push(0);
            }
            self
        }

        pub fn build(&self) -> Vec<u8> {
            self.build_clipped(usize::MAX)
        }

        /// Build, then drop every byte past `keep` to fake truncation.
        pub fn build_clipped(&self, keep: usize) -> Vec<u8> {
            let has_notes = !self.notes.is_empty();
            let phnum = self.headers.len() + usize::from(has_notes);
            let table_size = phnum * PHDR_SIZE;
            let payload_start = EHDR_SIZE + table_size;
            let notes_start = payload_start + self.payload.len();

            let mut out = vec![0u8; EHDR_SIZE];
            out[..4].copy_from_slice(&ELF_MAGIC);
            out[4] = 2; // ELFCLASS64
            out[5] = 1; // little-endian
            out[6] = 1;
            out[16..18].copy_from_slice(&ET_CORE.to_le_bytes());
            out[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
            out[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
            out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

            for header in &self.headers {
                let mut raw = [0u8; PHDR_SIZE];
                raw[0..4].copy_from_slice(&header.p_type.to_le_bytes());
                raw[4..8].copy_from_slice(&u32::from(header.flags).to_le_bytes());
                raw[8..16]
                    .copy_from_slice(&(payload_start as u64 + header.offset).to_le_bytes());
                raw[16..24].copy_from_slice(&header.vaddr.to_le_bytes());
                raw[32..40].copy_from_slice(&header.filesz.to_le_bytes());
                raw[40..48].copy_from_slice(&header.memsz.to_le_bytes());
                raw[48..56].copy_from_slice(&header.align.to_le_bytes());
                out.extend_from_slice(&raw);
            }
            if has_notes {
                let mut raw = [0u8; PHDR_SIZE];
                raw[0..4].copy_from_slice(&PT_NOTE.to_le_bytes());
                raw[8..16].copy_from_slice(&(notes_start as u64).to_le_bytes());
                raw[32..40].copy_from_slice(&(self.notes.len() as u64).to_le_bytes());
                raw[48..56].copy_from_slice(&4u64.to_le_bytes());
                out.extend_from_slice(&raw);
            }
            out.extend_from_slice(&self.payload);
            out.extend_from_slice(&self.notes);
            out.truncate(keep.min(out.len()));
            out
        }
    }

    use crate::layout::PFlags;

    fn prstatus(stack_pointer: u64) -> Vec<u8> {
        let offset = Width64::PRSTATUS_REGISTERS_OFFSET;
        let mut desc = vec![0u8; offset + Width64::REGISTER_NAMES.len() * 8];
        let at = offset + Width64::STACK_POINTER_INDEX * 8;
        desc[at..at + 8].copy_from_slice(&stack_pointer.to_le_bytes());
        desc
    }

    #[test]
    fn load_headers_build_the_address_map() {
        let mut builder = CoreBuilder::new();
        builder.load(0x40_0000, &[0xAAu8; 0x100], 0x100, 5);
        builder.load(0x60_0000, &[0xBBu8; 0x80], 0x180, 6);
        let bytes = builder.build();
        let core = CoreImage::<Width64>::parse(&bytes).expect("parse");
        assert!(!core.is_truncated());

        let map = core.address_map();
        let text = map.find(0x40_0010).expect("text");
        assert!(text.is_executable());
        assert_eq!(text.image.expect("image")[0], 0xAA);
        // The zero-filled tail has no image but keeps its permissions.
        let tail = map.find(0x60_0100).expect("bss");
        assert!(tail.image.is_none());
        assert!(tail.flags.contains(corescope_map::RangeFlags::WRITABLE));
    }

    #[test]
    fn rejects_non_cores_and_wrong_class() {
        assert_eq!(
            CoreImage::<Width64>::parse(b"not elf at all").unwrap_err(),
            ElfParseError::NotElf
        );
        let mut builder = CoreBuilder::new();
        builder.load(0x1000, &[0u8; 8], 8, 6);
        let mut bytes = builder.build();
        bytes[16] = 2; // ET_EXEC
        bytes[17] = 0;
        assert_eq!(
            CoreImage::<Width64>::parse(&bytes).unwrap_err(),
            ElfParseError::NotACore
        );
    }

    #[test]
    fn truncated_core_reports_expected_size() {
        let mut builder = CoreBuilder::new();
        builder.load(0x40_0000, &[1u8; 0x2000], 0x2000, 6);
        let full = builder.build();
        let bytes = builder.build_clipped(full.len() - 0x1000);
        let core = CoreImage::<Width64>::parse(&bytes).expect("parse");
        assert!(core.is_truncated());
        assert_eq!(core.minimum_expected_file_size(), full.len() as u64);
        // The missing tail reads as unmapped.
        let mut reader = Reader::new(core.address_map());
        assert!(reader.read_u8(0x40_1FFF).is_err());
        assert_eq!(reader.read_u8(0x40_0000), Ok(1));
    }

    #[test]
    fn prstatus_notes_become_threads_with_bounded_stacks() {
        let stack_base = 0x7F00_0000_0000u64;
        let sp = stack_base + 0x8000;
        let mut stack = vec![0u8; 0x10000];
        // Self-reference pair a little above the stack pointer.
        let self_ref = sp + 0x140;
        let at = (self_ref - stack_base) as usize;
        stack[at..at + 8].copy_from_slice(&self_ref.to_le_bytes());
        let at2 = at + 16;
        stack[at2..at2 + 8].copy_from_slice(&self_ref.to_le_bytes());

        let mut builder = CoreBuilder::new();
        builder.load(stack_base, &stack, 0x10000, 6);
        builder.note(b"CORE", NT_PRSTATUS, &prstatus(sp));
        let bytes = builder.build();
        let core = CoreImage::<Width64>::parse(&bytes).expect("parse");

        let threads = core.thread_map().threads();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].number, 1);
        assert_eq!(threads[0].stack_base, stack_base);
        assert_eq!(threads[0].stack_pointer, sp);
        assert_eq!(threads[0].stack_limit, (self_ref + 0x1000) & !0xFFF);
        assert_eq!(threads[0].registers[Width64::STACK_POINTER_INDEX], sp);
    }

    #[test]
    fn file_note_multiplier_detection() {
        // Offsets with set low bits are page numbers.
        let mut desc = Vec::new();
        desc.extend_from_slice(&2u64.to_le_bytes()); // count
        desc.extend_from_slice(&0x1000u64.to_le_bytes()); // page size
        for (base, limit, offset) in [(0x1000u64, 0x3000u64, 0u64), (0x5000, 0x6000, 3)] {
            desc.extend_from_slice(&base.to_le_bytes());
            desc.extend_from_slice(&limit.to_le_bytes());
            desc.extend_from_slice(&offset.to_le_bytes());
        }
        desc.extend_from_slice(b"/usr/bin/app\0/usr/lib/libc.so\0");

        let mut builder = CoreBuilder::new();
        builder.load(0x1000, &[0u8; 8], 8, 6);
        builder.note(b"CORE", NT_FILE, &desc);
        let bytes = builder.build();
        let core = CoreImage::<Width64>::parse(&bytes).expect("parse");

        let ranges = core.file_backed_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].path, "/usr/bin/app");
        assert_eq!(ranges[0].file_offset, 0);
        assert_eq!(ranges[1].path, "/usr/lib/libc.so");
        assert_eq!(ranges[1].file_offset, 3 * 0x1000);
    }

    #[test]
    fn byte_offsets_in_file_note_are_kept_verbatim() {
        let mut desc = Vec::new();
        desc.extend_from_slice(&1u64.to_le_bytes());
        desc.extend_from_slice(&0x1000u64.to_le_bytes());
        desc.extend_from_slice(&0x40_0000u64.to_le_bytes());
        desc.extend_from_slice(&0x40_2000u64.to_le_bytes());
        desc.extend_from_slice(&0x4000u64.to_le_bytes()); // page-aligned: bytes
        desc.extend_from_slice(b"/usr/bin/app\0");

        let mut builder = CoreBuilder::new();
        builder.load(0x1000, &[0u8; 8], 8, 6);
        builder.note(b"CORE", NT_FILE, &desc);
        let bytes = builder.build();
        let core = CoreImage::<Width64>::parse(&bytes).expect("parse");
        assert_eq!(core.file_backed_ranges()[0].file_offset, 0x4000);
    }
}
