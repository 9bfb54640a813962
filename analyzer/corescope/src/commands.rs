//! The low-level command loop over the frozen address map.
//!
//! Commands read whitespace-separated tokens from stdin until EOF or
//! `exit`; numeric arguments are hexadecimal. Every command is a
//! synchronous query; nothing here mutates the analysis.

use corescope_elf::ElfClass;
use corescope_map::VirtualAddressMap;
use std::io::{self, BufRead, Write};

pub fn run_command_loop<W: ElfClass>(map: &VirtualAddressMap<'_, W>) {
    let stdin = io::stdin();
    let stdout = io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, arguments)) = tokens.split_first() else {
            continue;
        };
        if command == "exit" || command == "quit" {
            break;
        }
        let mut out = stdout.lock();
        let result = dispatch(map, command, arguments, &mut out);
        if let Err(error) = result {
            if error.kind() == io::ErrorKind::BrokenPipe {
                break;
            }
        }
    }
}

fn dispatch<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    command: &str,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    match command {
        "dump" => dump(map, arguments, out),
        "string" => string_at(map, arguments, out),
        "wstring" => wide_string_at(map, arguments, out),
        "findptr" => find_pointer(map, arguments, out),
        "find32" => find_u32(map, arguments, out),
        "findbytes" => find_bytes(map, arguments, out),
        "findrelref" => find_rel_ref(map, arguments, out),
        _ => {
            eprintln!("unknown command: {command}");
            Ok(())
        }
    }
}

fn parse_hex(token: &str) -> Option<u64> {
    u64::from_str_radix(token.trim_start_matches("0x"), 16).ok()
}

fn hex_arguments(arguments: &[&str], expected: usize) -> Option<Vec<u64>> {
    if arguments.len() != expected {
        return None;
    }
    arguments.iter().map(|token| parse_hex(token)).collect()
}

fn dump<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let Some(parsed) = hex_arguments(arguments, 2) else {
        eprintln!("Usage: dump <addr-in-hex> <size-in-hex>");
        return Ok(());
    };
    let (address, mut num_bytes) = (parsed[0], parsed[1]);
    let Some(image) = map.find_mapped_image(address) else {
        eprintln!("Only 0x0 bytes were mapped starting from that address");
        return Ok(());
    };
    if (image.len() as u64) < num_bytes {
        eprintln!(
            "Only {:#x} bytes were mapped starting from that address",
            image.len()
        );
        num_bytes = image.len() as u64;
    }
    let word = W::WORD_BYTES as usize;
    let words_per_line = 16 / word;
    let bytes = &image[..num_bytes as usize];
    for (line_index, line) in bytes.chunks(words_per_line * word).enumerate() {
        write!(out, "{:x}:", address + (line_index * words_per_line * word) as u64)?;
        for chunk in line.chunks(word) {
            let mut value = 0u64;
            for (byte_index, &byte) in chunk.iter().enumerate() {
                value |= u64::from(byte) << (8 * byte_index);
            }
            write!(out, " {value:0width$x}", width = 2 * chunk.len())?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn string_at<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let Some(parsed) = hex_arguments(arguments, 1) else {
        eprintln!("Usage: string <addr-in-hex>");
        return Ok(());
    };
    let image = map.find_mapped_image(parsed[0]).unwrap_or(&[]);
    let printable: String = image
        .iter()
        .take_while(|&&byte| (b' '..=0x7E).contains(&byte))
        .map(|&byte| byte as char)
        .collect();
    writeln!(out, "\"{printable}\"")
}

fn wide_string_at<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let Some(parsed) = hex_arguments(arguments, 1) else {
        eprintln!("Usage: wstring <addr-in-hex>");
        return Ok(());
    };
    let image = map.find_mapped_image(parsed[0]).unwrap_or(&[]);
    write!(out, "\"")?;
    for pair in image.chunks_exact(2) {
        if pair[0] == 0 {
            break;
        }
        if pair[1] == 0 {
            write!(out, "{}", pair[0] as char)?;
        } else {
            write!(out, "?")?;
        }
    }
    writeln!(out, "\"")
}

fn find_pointer<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let Some(parsed) = hex_arguments(arguments, 1) else {
        eprintln!("Usage: findptr <value-in-hex>");
        return Ok(());
    };
    let value = parsed[0];
    let word = W::WORD_BYTES as usize;
    for range in map.iter() {
        let Some(image) = range.image else {
            continue;
        };
        for (index, window) in image.chunks_exact(word).enumerate() {
            if W::read_word(window) == value {
                writeln!(out, "{:x}", range.base + (index * word) as u64)?;
            }
        }
    }
    Ok(())
}

fn find_u32<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let Some(parsed) = hex_arguments(arguments, 1) else {
        eprintln!("Usage: find32 <value-in-hex>");
        return Ok(());
    };
    let Ok(value) = u32::try_from(parsed[0]) else {
        eprintln!("Usage: find32 <value-in-hex>");
        return Ok(());
    };
    for range in map.iter() {
        let Some(image) = range.image else {
            continue;
        };
        for (index, window) in image.chunks_exact(4).enumerate() {
            if u32::from_le_bytes(window.try_into().expect("4-byte window")) == value {
                writeln!(out, "{:x}", range.base + (index * 4) as u64)?;
            }
        }
    }
    Ok(())
}

fn find_bytes<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let bytes: Option<Vec<u8>> = arguments
        .iter()
        .map(|token| parse_hex(token).and_then(|value| u8::try_from(value).ok()))
        .collect();
    let Some(bytes) = bytes.filter(|bytes| !bytes.is_empty()) else {
        eprintln!("Usage: findbytes <v1> [<v2>...<vn>]");
        return Ok(());
    };
    for range in map.iter() {
        let Some(image) = range.image else {
            continue;
        };
        for (offset, window) in image.windows(bytes.len()).enumerate() {
            if window == bytes {
                writeln!(out, "{:x}", range.base + offset as u64)?;
            }
        }
    }
    Ok(())
}

/// Instruction-relative references: a 32-bit displacement at any byte
/// offset whose following address plus the displacement hits the target.
fn find_rel_ref<W: ElfClass>(
    map: &VirtualAddressMap<'_, W>,
    arguments: &[&str],
    out: &mut impl Write,
) -> io::Result<()> {
    let Some(parsed) = hex_arguments(arguments, 1) else {
        eprintln!("Usage: findrelref <addr-in-hex>");
        return Ok(());
    };
    let target = parsed[0];
    for range in map.iter() {
        let Some(image) = range.image else {
            continue;
        };
        for (offset, window) in image.windows(4).enumerate() {
            let displacement = i32::from_le_bytes(window.try_into().expect("4-byte window"));
            let address = range.base + offset as u64;
            let referenced = address
                .wrapping_add(4)
                .wrapping_add(displacement as u64)
                & W::ADDRESS_MASK;
            if referenced == target {
                writeln!(out, "{address:x}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corescope_map::{Permissions, Width64};

    const RW: Permissions = Permissions {
        readable: true,
        writable: true,
        executable: false,
    };

    fn map_of(file: &[u8]) -> VirtualAddressMap<'_, Width64> {
        let mut map = VirtualAddressMap::new(file);
        map.add_range(0x1000, file.len() as u64, 0u64.wrapping_sub(0x1000), true, Some(RW));
        map
    }

    fn run(map: &VirtualAddressMap<'_, Width64>, command: &str, arguments: &[&str]) -> String {
        let mut out = Vec::new();
        dispatch(map, command, arguments, &mut out).expect("command");
        String::from_utf8(out).expect("utf8 output")
    }

    #[test]
    fn string_stops_at_unprintable_bytes() {
        let mut file = vec![0u8; 0x40];
        file[0x10..0x16].copy_from_slice(b"hello\x01");
        let map = map_of(&file);
        assert_eq!(run(&map, "string", &["1010"]), "\"hello\"\n");
    }

    #[test]
    fn wstring_translates_narrow_utf16() {
        let mut file = vec![0u8; 0x40];
        file[0x10..0x18].copy_from_slice(&[b'o', 0, b'k', 0, 0x34, 0x12, 0, 0]);
        let map = map_of(&file);
        assert_eq!(run(&map, "wstring", &["1010"]), "\"ok?\"\n");
    }

    #[test]
    fn findptr_reports_aligned_matches_only() {
        let mut file = vec![0u8; 0x40];
        file[0x8..0x10].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        file[0x1C..0x24].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes()); // misaligned
        let map = map_of(&file);
        assert_eq!(run(&map, "findptr", &["deadbeef"]), "1008\n");
    }

    #[test]
    fn findbytes_matches_at_any_offset() {
        let mut file = vec![0u8; 0x40];
        file[0x13..0x16].copy_from_slice(&[0xAB, 0xCD, 0xEF]);
        let map = map_of(&file);
        assert_eq!(run(&map, "findbytes", &["ab", "cd", "ef"]), "1013\n");
    }

    #[test]
    fn findrelref_solves_the_displacement() {
        let mut file = vec![0u8; 0x40];
        // A displacement at 0x1010 referring to 0x1020: 0x1020 - 0x1014.
        file[0x10..0x14].copy_from_slice(&0xCi32.to_le_bytes());
        let map = map_of(&file);
        let output = run(&map, "findrelref", &["1020"]);
        assert!(output.lines().any(|line| line == "1010"), "{output}");
    }

    #[test]
    fn dump_clips_to_the_mapped_image() {
        let mut file = vec![0u8; 0x20];
        file[0x10..0x18].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        let map = map_of(&file);
        let output = run(&map, "dump", &["1010", "10"]);
        assert!(output.starts_with("1010: 1122334455667788"), "{output}");
    }
}
