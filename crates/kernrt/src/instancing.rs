//! Storage isolation for prebuilt libraries.
//!
//! Platform loaders deduplicate images by path, so a second open of the same
//! library would hand back the first instance's globals. Every path that has
//! been opened once is remembered process-wide; later requests for it go
//! through a uniquely named symlink that is opened and then unlinked right
//! away. The opened image stays valid after the link is gone.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use kernrt_contracts::{INSTANCE_CACHE_DIR, INSTANCE_SUFFIX_LEN, LIBRARY_PREFIX, LIBRARY_SUFFIX};
use once_cell::sync::OnceCell;

use crate::loader::{ModuleHandle, PlatformLoader};

const ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

static LOADED: OnceCell<LoadedLibraries> = OnceCell::new();

/// Process-wide set of library paths that have already been opened.
#[derive(Debug, Default)]
pub struct LoadedLibraries {
    paths: Mutex<BTreeSet<PathBuf>>,
}

pub fn loaded_libraries() -> &'static LoadedLibraries {
    LOADED.get_or_init(LoadedLibraries::default)
}

impl LoadedLibraries {
    fn lock(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug)]
pub enum InstancedLoadError {
    /// The library file does not exist.
    Missing,
    /// The loader refused the file (or its alias).
    Loader(String),
    /// The alias could not be set up.
    Alias(anyhow::Error),
}

/// Opens `orig` so that the returned image has globals of its own.
///
/// Returns the handle and the path that was actually handed to the loader.
pub fn load_instanced(
    loader: &dyn PlatformLoader,
    orig: &Path,
    cache_dir: &Path,
    res_name: &str,
) -> Result<(ModuleHandle, PathBuf), InstancedLoadError> {
    if !orig.exists() {
        return Err(InstancedLoadError::Missing);
    }

    // Held across the open so two constructions cannot both take the
    // "first load" branch for the same path.
    let mut loaded = loaded_libraries().lock();

    if !loaded.contains(orig) {
        let handle = loader.open(orig).map_err(InstancedLoadError::Loader)?;
        loaded.insert(orig.to_path_buf());
        return Ok((handle, orig.to_path_buf()));
    }

    let dir = ensure_instance_dir(cache_dir).map_err(InstancedLoadError::Alias)?;
    let alias = dir.join(alias_file_name(res_name).map_err(InstancedLoadError::Alias)?);

    std::os::unix::fs::symlink(orig, &alias)
        .with_context(|| format!("create symlink {} -> {}", alias.display(), orig.display()))
        .map_err(InstancedLoadError::Alias)?;
    tracing::debug!(alias = %alias.display(), orig = %orig.display(), "loading instanced alias");

    let opened = loader.open(&alias);
    if let Err(err) = std::fs::remove_file(&alias) {
        tracing::error!(alias = %alias.display(), %err, "could not unlink symlink");
    }
    let handle = opened.map_err(InstancedLoadError::Loader)?;
    loaded.insert(alias.clone());
    Ok((handle, alias))
}

/// Returns the alias directory under `cache_dir`, creating it (mode 0700)
/// unless it is already readable, writable and searchable.
pub fn ensure_instance_dir(cache_dir: &Path) -> Result<PathBuf> {
    let dir = cache_dir.join(INSTANCE_CACHE_DIR);
    if is_rwx(&dir) {
        return Ok(dir);
    }
    std::fs::DirBuilder::new()
        .mode(0o700)
        .create(&dir)
        .with_context(|| format!("could not verify or create cache dir: {}", dir.display()))?;
    Ok(dir)
}

fn is_rwx(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK | libc::X_OK) == 0 }
}

pub fn alias_file_name(res_name: &str) -> Result<String> {
    let suffix = random_suffix(INSTANCE_SUFFIX_LEN)?;
    Ok(format!("{LIBRARY_PREFIX}{res_name}#{suffix}{LIBRARY_SUFFIX}"))
}

/// `len` characters drawn from `[A-Za-z0-9]`.
pub fn random_suffix(len: usize) -> Result<String> {
    let mut raw = vec![0u8; len * 2];
    getrandom::getrandom(&mut raw).map_err(|e| anyhow::anyhow!("gather randomness: {e}"))?;
    Ok(raw
        .chunks_exact(2)
        .map(|pair| {
            let r = u16::from_le_bytes([pair[0], pair[1]]) as usize;
            ALPHABET[r % ALPHABET.len()] as char
        })
        .collect())
}
