//! Packaging collaborator — zip-backed archive handling
//!
//! Directories are packed into deterministic zip archives (entries sorted
//! by path, fixed timestamps and permissions) so that every peer packing
//! the same tree produces byte-identical output, which is what makes the
//! standalone checksum globally agreeable.

use crate::resource::ResError;
use crc32fast::Hasher;
use sha1::{Digest, Sha1};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::read::ZipArchive;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn zip_options() -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

/// Does the file parse as an archive?
pub fn is_archive(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    ZipArchive::new(file).is_ok()
}

/// Read the archive comment, used as the resource author field.
pub fn archive_comment(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let archive = ZipArchive::new(file).ok()?;
    let comment = String::from_utf8_lossy(archive.comment()).trim().to_owned();
    (!comment.is_empty()).then_some(comment)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn entry_name(root: &Path, path: &Path) -> Result<String, ResError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| ResError::Archive(format!("{} escapes pack root", path.display())))?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Ok(parts.join("/"))
}

/// Pack a directory into a single archive at `dst`.
pub fn pack_directory(src: &Path, dst: &Path) -> Result<(), ResError> {
    let mut files = Vec::new();
    collect_files(src, src, &mut files)?;
    files.sort();

    let mut zip = ZipWriter::new(File::create(dst)?);
    let options = zip_options();
    let mut buf = Vec::new();
    for path in &files {
        zip.start_file(entry_name(src, path)?, options)?;
        buf.clear();
        File::open(path)?.read_to_end(&mut buf)?;
        zip.write_all(&buf)?;
    }
    zip.finish()?;
    Ok(())
}

/// Replace a directory in place by its packed archive. The archive is
/// written to a scratch name first and renamed over the directory only
/// after the pack succeeded, so a failed pack leaves the source intact.
pub fn pack_directory_in_place(dir: &Path) -> Result<(), ResError> {
    let mut scratch = dir.as_os_str().to_owned();
    scratch.push(".packing");
    let scratch = PathBuf::from(scratch);
    pack_directory(dir, &scratch).inspect_err(|_| {
        let _ = fs::remove_file(&scratch);
    })?;
    fs::remove_dir_all(dir)?;
    fs::rename(&scratch, dir)?;
    Ok(())
}

/// Copy an item to `dst`. When `src` does not exist as a loose file, walk
/// up its ancestors: if one of them is an archive, extract the inner entry.
pub fn copy_item(src: &Path, dst: &Path) -> Result<(), ResError> {
    if src.is_file() {
        fs::copy(src, dst)?;
        return Ok(());
    }
    // resolve from an enclosing archive
    let mut container = src.parent();
    let mut inner = PathBuf::from(src.file_name().unwrap_or_default());
    while let Some(dir) = container {
        if dir.is_file() {
            if !is_archive(dir) {
                break;
            }
            let mut archive = ZipArchive::new(File::open(dir)?)?;
            let name = inner
                .components()
                .filter_map(|c| match c {
                    Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("/");
            let mut entry = archive
                .by_name(&name)
                .map_err(|_| ResError::Archive(format!("entry {name:?} not found")))?;
            let mut out = File::create(dst)?;
            io::copy(&mut entry, &mut out)?;
            return Ok(());
        }
        inner = PathBuf::from(dir.file_name().unwrap_or_default()).join(&inner);
        container = dir.parent();
    }
    Err(ResError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", src.display()),
    )))
}

/// CRC32 of a file's raw bytes.
pub fn file_crc(path: &Path) -> Result<u32, ResError> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// SHA-1 of a file's raw bytes.
pub fn file_sha1(path: &Path) -> Result<[u8; 20], ResError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Content-only checksum that survives repackaging: for an archive or a
/// directory, the CRC32 over every entry's name and uncompressed bytes in
/// entry order; for a loose file, the plain file CRC. A directory and its
/// packed archive hash identically because packing sorts entries.
pub fn contents_crc(path: &Path) -> Result<u32, ResError> {
    if path.is_dir() {
        let mut files = Vec::new();
        collect_files(path, path, &mut files)?;
        files.sort();
        let mut hasher = Hasher::new();
        let mut buf = Vec::new();
        for file in &files {
            hasher.update(entry_name(path, file)?.as_bytes());
            buf.clear();
            File::open(file)?.read_to_end(&mut buf)?;
            hasher.update(&buf);
        }
        return Ok(hasher.finalize());
    }
    if !is_archive(path) {
        return file_crc(path);
    }
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut hasher = Hasher::new();
    let mut buf = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.is_file() {
            continue;
        }
        hasher.update(entry.name().as_bytes());
        buf.clear();
        entry.read_to_end(&mut buf)?;
        hasher.update(&buf);
    }
    Ok(hasher.finalize())
}

/// Uncompressed size of an archive entry, if present.
pub fn entry_size(path: &Path, name: &str) -> Result<Option<u64>, ResError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let result = match archive.by_name(name) {
        Ok(entry) => Ok(Some(entry.size())),
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(err) => Err(err.into()),
    };
    result
}

/// Rewrite an archive without the entries matching `drop`. Entries are
/// copied raw, so kept entries stay byte-identical.
pub fn strip_entries(path: &Path, drop: impl Fn(&str) -> bool) -> Result<(), ResError> {
    let mut archive = ZipArchive::new(File::open(path)?)?;
    let mut scratch = path.as_os_str().to_owned();
    scratch.push(".strip");
    let scratch = PathBuf::from(scratch);
    let result = (|| -> Result<(), ResError> {
        let mut out = ZipWriter::new(File::create(&scratch)?);
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            if !drop(entry.name()) {
                out.raw_copy_file(entry)?;
            }
        }
        out.finish()?;
        Ok(())
    })();
    match result {
        Ok(()) => {
            fs::rename(&scratch, path)?;
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&scratch);
            Err(err)
        }
    }
}

/// Result of walking a directory tree for its total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSize {
    pub total_bytes: u64,
    pub over_limit: bool,
}

/// Explicit stateful directory-size walker; stops descending once the
/// accumulated size passes `max_bytes`.
struct DirWalker {
    total: u64,
    max: u64,
}

impl DirWalker {
    fn walk(&mut self, dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            if self.total > self.max {
                return Ok(());
            }
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path)?;
            } else {
                self.total += fs::metadata(&path)?.len();
            }
        }
        Ok(())
    }
}

/// Total byte size of a directory tree, bounded by `max_bytes`.
pub fn dir_size(path: &Path, max_bytes: u64) -> Result<DirSize, ResError> {
    let mut walker = DirWalker {
        total: 0,
        max: max_bytes,
    };
    walker.walk(path)?;
    Ok(DirSize {
        total_bytes: walker.total,
        over_limit: walker.total > max_bytes,
    })
}
