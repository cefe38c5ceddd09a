//! Standalone materialization — the canonical single-file artifact
//!
//! Turns a loose file or directory into the byte-exact form whose size and
//! CRC all peers agree on. Directories are packed; files hiding inside a
//! parent archive are fetched out; Player artifacts are pruned of portrait
//! and oversized icon entries before checksumming.

use super::entity::ResInner;
use super::list::Shared;
use super::{ResError, ResType};
use crate::archive;
use std::fs;
use std::path::{Path, PathBuf};

/// Archive subtree holding player portraits; always pruned from Player
/// artifacts.
const PORTRAITS_DIR: &str = "Portraits";

/// Player icon entry; pruned when larger than the configured threshold.
const BIGICON_ENTRY: &str = "BigIcon.png";

fn remove_unless(path: &Path, keep: &Path) {
    if path != keep && path.is_file() {
        let _ = fs::remove_file(path);
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Materialize the standalone for `inner`, caching the path on success.
/// Failure is sticky until the entity is re-initialized.
pub(super) fn get_standalone(
    inner: &mut ResInner,
    shared: &Shared,
    set_official: bool,
    allow_unloadable: bool,
) -> Result<PathBuf, ResError> {
    // already set?
    if let Some(path) = &inner.standalone {
        return Ok(path.clone());
    }
    // already tried and failed? no point in retrying
    if inner.standalone_failed {
        return Err(ResError::Standalone("previous attempt failed".into()));
    }
    // without a loadable core there is nothing to check the standalone
    // against, and nothing will ask for it either
    if !set_official && !inner.core.is_loadable() {
        return Err(ResError::Unloadable);
    }
    // set now so any failure below short-circuits future calls
    inner.standalone_failed = true;

    let max_size = shared.config.network.max_load_file_size;
    let mut standalone = inner.file.clone();

    if inner.file.is_dir() {
        if allow_unloadable {
            let size = archive::dir_size(&inner.file, max_size)?;
            if size.over_limit {
                return Err(ResError::Oversize {
                    size: size.total_bytes,
                    max: max_size,
                });
            }
        }
        // this may take a few seconds
        tracing::info!("packing {}", base_name(&inner.file));
        if !inner.temp_file {
            standalone = shared.find_temp_res_filename(&base_name(&inner.file))?;
            archive::pack_directory(&inner.file, &standalone)?;
        } else {
            archive::pack_directory_in_place(&inner.file)?;
            standalone = inner.file.clone();
        }
        if standalone.is_dir() {
            remove_unless(&standalone, &inner.file);
            return Err(ResError::Standalone("directory has not been packed".into()));
        }
        inner.file = standalone.clone();
        inner.temp_file = true;
    }

    // not present as a loose file? it may live inside a parent archive
    if !standalone.exists() {
        let target = shared.find_temp_res_filename(&base_name(&inner.file))?;
        if let Err(err) = archive::copy_item(&inner.file, &target) {
            let _ = fs::remove_file(&target);
            return Err(err);
        }
        standalone = target;
    }

    if !standalone.exists() {
        return Err(ResError::Standalone("file not found".into()));
    }

    // delete entries all peers agree to drop, before any checksum is taken
    if let Err(err) = optimize_standalone(inner, shared, &mut standalone) {
        remove_unless(&standalone, &inner.file);
        return Err(err);
    }

    let size = fs::metadata(&standalone)?.len();
    if allow_unloadable && size > max_size {
        tracing::info!(
            "{} over size limit, will be marked unloadable",
            base_name(&inner.file)
        );
        remove_unless(&standalone, &inner.file);
        return Err(ResError::Oversize {
            size,
            max: max_size,
        });
    }
    if !set_official && size != u64::from(inner.core.file_size()) {
        // this version isn't good enough
        remove_unless(&standalone, &inner.file);
        return Err(ResError::Standalone(format!(
            "size {} does not match announced {}",
            size,
            inner.core.file_size()
        )));
    }

    let crc = archive::file_crc(&standalone)?;
    if !set_official && crc != inner.core.file_crc() {
        remove_unless(&standalone, &inner.file);
        return Err(ResError::ChecksumMismatch {
            expected: inner.core.file_crc(),
            got: crc,
        });
    }

    // we didn't fail; publish the file information and the full chunk map
    inner.standalone_failed = false;
    inner.core.set_loadable(size as u32, crc);
    let cnt = inner.core.chunk_cnt();
    inner.chunks.set_complete(cnt);
    inner.standalone = Some(standalone.clone());
    Ok(standalone)
}

/// Type-specific optimization: Player artifacts lose their portraits and
/// any oversized big icon. Runs before checksum computation so all peers
/// agree on the post-optimization bytes.
fn optimize_standalone(
    inner: &mut ResInner,
    shared: &Shared,
    standalone: &mut PathBuf,
) -> Result<(), ResError> {
    if inner.core.res_type() != ResType::Player {
        return Ok(());
    }
    // this may take a few seconds
    tracing::info!("preparing {} for transfer", base_name(standalone));
    // never prune the original: work on a temp copy
    if !inner.temp_file && *standalone == inner.file {
        let fresh = shared.find_temp_res_filename(&base_name(standalone))?;
        archive::copy_item(standalone, &fresh)?;
        *standalone = fresh;
    }
    archive::strip_entries(standalone, |name| {
        name == PORTRAITS_DIR || name.starts_with(&format!("{PORTRAITS_DIR}/"))
    })?;
    let max_icon = u64::from(shared.config.tunables.max_bigicon_kb) * 1024;
    if let Some(size) = archive::entry_size(standalone, BIGICON_ENTRY)? {
        if size > max_icon {
            archive::strip_entries(standalone, |name| name == BIGICON_ENTRY)?;
        }
    }
    Ok(())
}
