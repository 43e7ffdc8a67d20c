//! Packing source trees into module archives.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Version-control metadata never shipped in an archive.
const SKIPPED_DIRS: &[&str] = &[".git", ".hg", ".svn", ".bzr"];

/// Zip every regular file under `dir`, each stored as `<prefix>/<relative path>`.
///
/// Entries are sorted and carry a fixed timestamp, so packing the same tree
/// twice yields identical bytes. Symlinks are skipped.
pub fn pack_source_tree(dir: &Path, prefix: &str) -> std::io::Result<Vec<u8>> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_skipped(e.file_name())));
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(std::io::Error::other)?;
        let name = zip_name(prefix, relative)?;

        writer.start_file(name, options).map_err(std::io::Error::other)?;
        let mut file = std::fs::File::open(entry.path())?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        writer.write_all(&buf)?;
    }

    let cursor = writer.finish().map_err(std::io::Error::other)?;
    Ok(cursor.into_inner())
}

fn is_skipped(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| SKIPPED_DIRS.contains(&n))
}

fn zip_name(prefix: &str, relative: &Path) -> std::io::Result<String> {
    let mut name = prefix.trim_end_matches('/').to_string();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("non UTF-8 file name in {}", relative.display()),
            )
        })?;
        name.push('/');
        name.push_str(part);
    }
    Ok(name)
}
