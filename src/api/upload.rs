//! ZIP extraction for uploaded file context.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use zip::ZipArchive;

use crate::error::UploadError;

/// Largest declared uncompressed size accepted for a single entry.
const MAX_ENTRY_SIZE: u64 = 256 * 1024 * 1024;

/// Pre-reservation ceiling; larger entries grow while being read.
const RESERVE_CAP: u64 = 1024 * 1024;

/// Extracts a ZIP archive into a relative-path → bytes map.
///
/// Directory entries are skipped. Entries whose names would escape the
/// extraction root (absolute paths, `..` components) are rejected outright
/// rather than silently dropped, as are entries declaring an uncompressed
/// size over [`MAX_ENTRY_SIZE`].
pub fn extract_zip(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, UploadError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| UploadError::Archive(e.to_string()))?;

    let mut files = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| UploadError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        let Some(safe_path) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(UploadError::UnsafePath(raw_name));
        };

        if entry.size() > MAX_ENTRY_SIZE {
            return Err(UploadError::Archive(format!(
                "entry '{}' declares {} bytes, over the {} byte limit",
                raw_name,
                entry.size(),
                MAX_ENTRY_SIZE
            )));
        }

        // The declared size comes from the archive and is not trusted for
        // allocation
        let mut content = Vec::with_capacity(entry.size().min(RESERVE_CAP) as usize);
        entry.read_to_end(&mut content)?;
        files.insert(safe_path.to_string_lossy().replace('\\', "/"), content);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_preserves_nested_paths() {
        let bytes = build_archive(&[
            ("src/main.rs", b"fn main() {}"),
            ("README.md", b"# readme"),
            ("deep/a/b/c.txt", b"c"),
        ]);

        let files = extract_zip(&bytes).unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files["src/main.rs"], b"fn main() {}");
        assert_eq!(files["deep/a/b/c.txt"], b"c");
    }

    #[test]
    fn test_extract_skips_directory_entries() {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer.add_directory("src/", FileOptions::default()).unwrap();
        writer.start_file("src/lib.rs", FileOptions::default()).unwrap();
        writer.write_all(b"pub fn f() {}").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let files = extract_zip(&bytes).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key("src/lib.rs"));
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let bytes = build_archive(&[("../../etc/passwd", b"pwned")]);
        assert!(matches!(
            extract_zip(&bytes),
            Err(UploadError::UnsafePath(_))
        ));
    }

    #[test]
    fn test_oversized_declared_entry_is_rejected() {
        // Stored entry whose size fields are inflated after writing: the
        // declared uncompressed size must be rejected before any allocation
        // or read happens.
        let content = vec![b'x'; 57];
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(
                "big.bin",
                FileOptions::default().compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        writer.write_all(&content).unwrap();
        let mut bytes = writer.finish().unwrap().into_inner();

        // For a stored entry, compressed and uncompressed size fields are
        // adjacent and equal in both the local and central headers.
        let original = (content.len() as u32).to_le_bytes();
        let pattern = [original, original].concat();
        let huge = 0x7FFF_FFF0u32.to_le_bytes();
        let mut patched = 0;
        let mut i = 0;
        while i + 8 <= bytes.len() {
            if bytes[i..i + 8] == pattern[..] {
                bytes[i + 4..i + 8].copy_from_slice(&huge);
                patched += 1;
                i += 8;
            } else {
                i += 1;
            }
        }
        assert!(patched >= 1, "size fields not found in archive bytes");

        assert!(matches!(
            extract_zip(&bytes),
            Err(UploadError::Archive(_))
        ));
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert!(matches!(
            extract_zip(b"not a zip archive"),
            Err(UploadError::Archive(_))
        ));
    }

    #[test]
    fn test_extract_empty_archive() {
        let bytes = build_archive(&[]);
        assert!(extract_zip(&bytes).unwrap().is_empty());
    }
}
