use crate::allocations::AllocationDirectory;
use corescope_map::{GuestWidth, RangeFlags, Reader, VirtualAddressMap};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// How a signature's name is (or is not yet) known.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignatureStatus {
    /// Seen in the core; waiting for a name from the symdefs file.
    PendingSymdefs,
    /// The symdefs file named it as a vtable symbol.
    VtableNameFromSymdefs,
    /// The symdefs file named it as some other unwritable symbol.
    NameFromSymdefs,
    /// The symdefs file had no symbol for it.
    MissingFromSymdefs,
}

/// Vtable signatures seen at the start of used allocations, with any names
/// learned from the debugger side channel.
#[derive(Default)]
pub struct SignatureDirectory {
    signatures: BTreeMap<u64, (String, SignatureStatus)>,
}

impl SignatureDirectory {
    #[must_use]
    pub fn is_mapped(&self, signature: u64) -> bool {
        self.signatures.contains_key(&signature)
    }

    pub fn map_signature(&mut self, signature: u64, name: String, status: SignatureStatus) {
        self.signatures.insert(signature, (name, status));
    }

    #[must_use]
    pub fn name_of(&self, signature: u64) -> Option<&str> {
        self.signatures
            .get(&signature)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, _)| name.as_str())
    }

    pub fn pending(&self) -> impl Iterator<Item = u64> {
        self.signatures
            .iter()
            .filter(|(_, (_, status))| *status == SignatureStatus::PendingSymdefs)
            .map(|(&signature, _)| signature)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Names for static anchor addresses, learned from the symdefs file.
#[derive(Default)]
pub struct AnchorDirectory {
    names: HashMap<u64, String>,
}

impl AnchorDirectory {
    pub fn map_anchor(&mut self, anchor: u64, name: String) {
        self.names.insert(anchor, name);
    }

    #[must_use]
    pub fn name_of(&self, anchor: u64) -> Option<&str> {
        self.names.get(&anchor).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Treat the first word of each used allocation as a candidate vtable
/// pointer: word-aligned, nonzero, and pointing into unwritable mapped
/// memory.
pub fn collect_signatures<W: GuestWidth>(
    directory: &AllocationDirectory,
    map: &VirtualAddressMap<'_, W>,
    signatures: &mut SignatureDirectory,
) {
    let mut reader = Reader::new(map);
    for allocation in directory.allocations() {
        if !allocation.used || allocation.size < W::WORD_BYTES {
            continue;
        }
        let Ok(signature) = reader.read_word(allocation.address) else {
            continue;
        };
        if signature == 0 || signature & (W::WORD_BYTES - 1) != 0 {
            continue;
        }
        if signatures.is_mapped(signature) {
            continue;
        }
        let Some(range) = map.find(signature) else {
            continue;
        };
        if range.is_writable() || !range.flags.contains(RangeFlags::MAPPED) {
            continue;
        }
        signatures.map_signature(signature, String::new(), SignatureStatus::PendingSymdefs);
    }
}

fn side_channel_path(core_path: &Path, extension: &str) -> PathBuf {
    let mut name = core_path.as_os_str().to_owned();
    name.push(extension);
    PathBuf::from(name)
}

/// Write the gdb batch script that will produce the symdefs file, unless a
/// script already exists. Returns whether one was written.
pub fn write_symreqs_if_needed(
    core_path: &Path,
    signatures: &SignatureDirectory,
    anchors: &[u64],
) -> io::Result<bool> {
    let symreqs = side_channel_path(core_path, ".symreqs");
    if symreqs.exists() {
        return Ok(false);
    }
    let symdefs = side_channel_path(core_path, ".symdefs");
    let mut script = String::new();
    let _ = writeln!(script, "set logging file {}", symdefs.display());
    script.push_str("set logging overwrite 1\nset logging redirect 1\nset logging on\nset height 0\n");
    for signature in signatures.pending() {
        let _ = writeln!(script, "printf \"SIGNATURE {signature:x}\\n\"");
        let _ = writeln!(script, "info symbol 0x{signature:x}");
    }
    for &anchor in anchors {
        let _ = writeln!(script, "printf \"ANCHOR {anchor:x}\\n\"");
        let _ = writeln!(script, "info symbol 0x{anchor:x}");
    }
    script.push_str("set logging off\nset logging overwrite 0\nset logging redirect 0\n");
    let _ = writeln!(script, "printf \"output written to {}\\n\"", symdefs.display());
    fs::write(&symreqs, script)?;
    Ok(true)
}

/// Read the symdefs file produced by the symreqs script, if present.
///
/// The file interleaves `SIGNATURE <hex>` / `ANCHOR <hex>` headers with the
/// debugger's `info symbol` output for each.
pub fn read_symdefs(
    core_path: &Path,
    signatures: &mut SignatureDirectory,
    anchors: &mut AnchorDirectory,
) -> io::Result<bool> {
    let path = side_channel_path(core_path, ".symdefs");
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(error) => return Err(error),
    };

    let mut signature = None;
    let mut anchor = None;
    for line in contents.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("SIGNATURE ") {
            signature = parse_hex(rest);
            if signature.is_none() {
                log::warn!("\"{rest}\" is not a valid hexadecimal number");
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("ANCHOR ") {
            anchor = parse_hex(rest);
            if anchor.is_none() {
                log::warn!("\"{rest}\" is not a valid hexadecimal number");
            }
            continue;
        }
        if line.contains("No symbol matches") {
            if let Some(signature) = signature.take() {
                signatures.map_signature(
                    signature,
                    String::new(),
                    SignatureStatus::MissingFromSymdefs,
                );
            }
            anchor = None;
            continue;
        }
        if let Some(pending) = signature.take() {
            // "vtable for X + 16 in section .data.rel.ro" names type X.
            let for_at = line.find(" for ");
            let start = for_at.map_or(0, |at| at + 5);
            let end = line
                .find(" + ")
                .or_else(|| line.find(" in section"))
                .unwrap_or(line.len());
            let name = line[start..end.max(start)].to_owned();
            let status = if for_at.is_some() {
                SignatureStatus::VtableNameFromSymdefs
            } else {
                SignatureStatus::NameFromSymdefs
            };
            signatures.map_signature(pending, name, status);
        } else if let Some(pending) = anchor.take() {
            let end = line.find(" in section").unwrap_or(line.len());
            anchors.map_anchor(pending, line[..end].to_owned());
        }
    }
    Ok(true)
}

fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocations::{AllocationFinder, AllocationRecord};
    use corescope_map::{Permissions, Width64};

    struct OneShot(Vec<AllocationRecord>, usize);

    impl AllocationFinder for OneShot {
        fn label(&self) -> &'static str {
            "test"
        }
        fn peek(&self) -> Option<AllocationRecord> {
            self.0.get(self.1).copied()
        }
        fn advance(&mut self) {
            self.1 += 1;
        }
    }

    #[test]
    fn signatures_come_from_used_allocations_pointing_at_unwritable_memory() {
        // Memory layout: an RO "module" range at 0x1000 and a heap at
        // 0x1_0000 whose first allocation points into the module.
        let mut file = vec![0u8; 0x100];
        file[0x80..0x88].copy_from_slice(&0x1008u64.to_le_bytes()); // used -> signature
        file[0x90..0x98].copy_from_slice(&0x1010u64.to_le_bytes()); // free -> ignored
        file[0xA0..0xA8].copy_from_slice(&0x2_0000u64.to_le_bytes()); // writable target -> ignored
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        map.add_range(
            0x1000,
            0x40,
            0u64.wrapping_sub(0x1000),
            true,
            Some(Permissions { readable: true, writable: false, executable: false }),
        );
        map.add_range(
            0x1_0000,
            0x30,
            0x80u64.wrapping_sub(0x1_0000),
            true,
            Some(Permissions { readable: true, writable: true, executable: false }),
        );
        map.add_range(
            0x2_0000,
            0x40,
            0xC0u64.wrapping_sub(0x2_0000),
            true,
            Some(Permissions { readable: true, writable: true, executable: false }),
        );

        let finder = OneShot(
            vec![
                AllocationRecord { address: 0x1_0000, size: 0x10, used: true },
                AllocationRecord { address: 0x1_0010, size: 0x10, used: false },
                AllocationRecord { address: 0x1_0020, size: 0x10, used: true },
            ],
            0,
        );
        let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);
        let mut signatures = SignatureDirectory::default();
        collect_signatures(&directory, &map, &mut signatures);
        assert_eq!(signatures.pending().collect::<Vec<_>>(), vec![0x1008]);
    }

    #[test]
    fn symdefs_round_trip() {
        let dir = std::env::temp_dir().join(format!("corescope-symdefs-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("temp dir");
        let core_path = dir.join("core.1234");
        fs::write(&core_path, b"").expect("core file");

        let mut signatures = SignatureDirectory::default();
        signatures.map_signature(0x1008, String::new(), SignatureStatus::PendingSymdefs);
        signatures.map_signature(0x2010, String::new(), SignatureStatus::PendingSymdefs);
        assert!(write_symreqs_if_needed(&core_path, &signatures, &[0x5000]).expect("write"));
        // A second call sees the existing script and leaves it alone.
        assert!(!write_symreqs_if_needed(&core_path, &signatures, &[]).expect("rewrite"));
        let script = fs::read_to_string(side_channel_path(&core_path, ".symreqs")).expect("script");
        assert!(script.contains("SIGNATURE 1008"));
        assert!(script.contains("info symbol 0x2010"));
        assert!(script.contains("ANCHOR 5000"));

        fs::write(
            side_channel_path(&core_path, ".symdefs"),
            "SIGNATURE 1008\n\
             vtable for std::vector<int> + 16 in section .data.rel.ro\n\
             SIGNATURE 2010\n\
             No symbol matches 0x2010.\n\
             ANCHOR 5000\n\
             g_registry in section .bss\n",
        )
        .expect("symdefs");

        let mut anchors = AnchorDirectory::default();
        assert!(read_symdefs(&core_path, &mut signatures, &mut anchors).expect("read"));
        assert_eq!(signatures.name_of(0x1008), Some("std::vector<int>"));
        assert_eq!(signatures.name_of(0x2010), None);
        assert_eq!(anchors.name_of(0x5000), Some("g_registry"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_symdefs_is_not_an_error() {
        let mut signatures = SignatureDirectory::default();
        let mut anchors = AnchorDirectory::default();
        let read = read_symdefs(
            Path::new("/nonexistent/core"),
            &mut signatures,
            &mut anchors,
        )
        .expect("read");
        assert!(!read);
    }
}
