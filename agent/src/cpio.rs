//! Minimal cpio "newc" archive writer.
//!
//! # Background
//!
//! The Linux kernel unpacks its initramfs from a cpio archive in the SVR4
//! "newc" format (the one `cpio -H newc` produces): each member starts with
//! a 110-byte ASCII header of fixed-width hex fields, followed by the
//! NUL-terminated path and the file data, both padded to four-byte
//! boundaries. A member named `TRAILER!!!` ends the archive.
//!
//! # Scope
//!
//! This module only writes archives — regular files and directories, no
//! hardlinks, no device nodes. That is exactly what an initramfs carrying an
//! init script and a code file needs, so there is no reason to pull in a
//! general-purpose archiver.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;

const MAGIC: &[u8; 6] = b"070701";
const TRAILER: &str = "TRAILER!!!";

/// One member of the archive.
pub struct Entry<'a> {
    /// Path inside the guest filesystem, without a leading slash.
    pub path: &'a str,
    /// Full mode bits, including the file type.
    pub mode: u32,
    pub data: &'a [u8],
}

/// A directory entry (`drwxr-xr-x`).
pub fn directory(path: &str) -> Entry<'_> {
    Entry {
        path,
        mode: 0o040_755,
        data: &[],
    }
}

/// A regular file entry with the given permission bits.
pub fn file<'a>(path: &'a str, perms: u32, data: &'a [u8]) -> Entry<'a> {
    Entry {
        path,
        mode: 0o100_000 | perms,
        data,
    }
}

/// Serialize the entries into a newc archive, trailer included.
pub fn build_archive(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut out = Vec::new();

    // Inode numbers only need to be unique within the archive.
    for (ino, entry) in entries.iter().enumerate() {
        push_entry(&mut out, ino as u32 + 1, entry);
    }

    push_entry(
        &mut out,
        0,
        &Entry {
            path: TRAILER,
            mode: 0,
            data: &[],
        },
    );

    out
}

/// Gzip-compress the entries into `writer`.
///
/// The kernel accepts several concatenated gzip members as one initramfs,
/// which is how a base rootfs archive and this overlay are combined without
/// unpacking either.
pub fn write_gzipped<W: Write>(entries: &[Entry<'_>], writer: W) -> io::Result<()> {
    let mut encoder = GzEncoder::new(writer, Compression::default());
    encoder.write_all(&build_archive(entries))?;
    encoder.finish()?;
    Ok(())
}

fn push_entry(out: &mut Vec<u8>, ino: u32, entry: &Entry<'_>) {
    let name = entry.path.as_bytes();
    // Path plus its NUL terminator.
    let namesize = name.len() as u32 + 1;

    out.extend_from_slice(MAGIC);
    push_hex(out, ino); // c_ino
    push_hex(out, entry.mode); // c_mode
    push_hex(out, 0); // c_uid
    push_hex(out, 0); // c_gid
    push_hex(out, 1); // c_nlink
    push_hex(out, 0); // c_mtime, zeroed for determinism
    push_hex(out, entry.data.len() as u32); // c_filesize
    push_hex(out, 0); // c_devmajor
    push_hex(out, 0); // c_devminor
    push_hex(out, 0); // c_rdevmajor
    push_hex(out, 0); // c_rdevminor
    push_hex(out, namesize); // c_namesize
    push_hex(out, 0); // c_check, unused in newc

    out.extend_from_slice(name);
    out.push(0);
    pad_to_4(out);

    out.extend_from_slice(entry.data);
    pad_to_4(out);
}

fn push_hex(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(format!("{value:08X}").as_bytes());
}

fn pad_to_4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const HEADER_LEN: usize = 110;

    fn parse_hex(bytes: &[u8]) -> u32 {
        u32::from_str_radix(std::str::from_utf8(bytes).unwrap(), 16).unwrap()
    }

    fn sample_archive() -> Vec<u8> {
        build_archive(&[
            directory("lambda"),
            file("init", 0o755, b"#!/bin/sh\necho hi\n"),
            file("lambda/code.py", 0o644, b"print('x')\n"),
        ])
    }

    #[test]
    fn archive_starts_with_newc_magic() {
        let archive = sample_archive();
        assert_eq!(&archive[..6], MAGIC);
    }

    #[test]
    fn first_header_describes_the_directory() {
        let archive = sample_archive();

        // Field layout: magic(6), then 8-char fields.
        let mode = parse_hex(&archive[6 + 8..6 + 16]);
        let filesize = parse_hex(&archive[6 + 6 * 8..6 + 7 * 8]);
        let namesize = parse_hex(&archive[6 + 11 * 8..6 + 12 * 8]);

        assert_eq!(mode, 0o040_755);
        assert_eq!(filesize, 0);
        assert_eq!(namesize, "lambda".len() as u32 + 1);
    }

    #[test]
    fn entries_are_four_byte_aligned() {
        let archive = sample_archive();
        assert_eq!(archive.len() % 4, 0);

        // Every header must start on a 4-byte boundary; scan for the magic.
        let mut offset = 0;
        let mut headers = 0;
        while offset + HEADER_LEN <= archive.len() {
            if &archive[offset..offset + 6] == MAGIC {
                assert_eq!(offset % 4, 0, "header at misaligned offset {offset}");
                headers += 1;
                offset += 6;
            } else {
                offset += 1;
            }
        }
        // Three entries plus the trailer.
        assert_eq!(headers, 4);
    }

    #[test]
    fn archive_ends_with_trailer() {
        let archive = sample_archive();
        let trailer_pos = archive
            .windows(TRAILER.len())
            .rposition(|w| w == TRAILER.as_bytes())
            .unwrap();
        // Nothing but the NUL and padding after the trailer name.
        assert!(archive.len() - (trailer_pos + TRAILER.len()) <= 4);
    }

    #[test]
    fn file_data_is_embedded_verbatim() {
        let archive = sample_archive();
        let needle = b"print('x')\n";
        assert!(archive.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn gzipped_archive_round_trips() {
        let mut compressed = Vec::new();
        write_gzipped(
            &[file("init", 0o755, b"#!/bin/sh\n")],
            &mut compressed,
        )
        .unwrap();

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();

        assert_eq!(
            decompressed,
            build_archive(&[file("init", 0o755, b"#!/bin/sh\n")])
        );
    }
}
