//! Platform loader seam and the owned module handle built on top of it.

use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use kernrt_contracts::SYMBOL_INFO;

/// Opaque token for an image opened by a [`PlatformLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Address of a resolved export inside a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddr(NonNull<c_void>);

// Addresses stay valid for as long as the owning module is open; the module
// outlives every table holding them.
unsafe impl Send for SymbolAddr {}
unsafe impl Sync for SymbolAddr {}

impl SymbolAddr {
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(SymbolAddr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    pub fn as_non_null(self) -> NonNull<c_void> {
        self.0
    }
}

/// The platform's dynamic code loader.
///
/// Implementations may deduplicate images by path: opening the same path
/// twice is allowed to return the same image and the same global storage.
/// Instancing is layered on top of that in [`crate::instancing`].
pub trait PlatformLoader: Send + Sync {
    fn open(&self, path: &Path) -> Result<ModuleHandle, String>;
    fn resolve(&self, handle: ModuleHandle, name: &str) -> Option<SymbolAddr>;
    fn close(&self, handle: ModuleHandle);

    /// Diagnostic for the most recent failed [`PlatformLoader::resolve`].
    fn resolve_error(&self, name: &str) -> String {
        format!("symbol {name:?} not found")
    }
}

/// `dlopen`-backed loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct DlLoader;

impl DlLoader {
    fn last_error() -> String {
        // SAFETY: dlerror returns either null or a NUL-terminated string owned
        // by the loader, valid until the next dl* call on this thread.
        unsafe {
            let msg = libc::dlerror();
            if msg.is_null() {
                "unknown loader error".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }
}

impl PlatformLoader for DlLoader {
    fn open(&self, path: &Path) -> Result<ModuleHandle, String> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| format!("path contains NUL: {}", path.display()))?;
        // SAFETY: c_path is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Self::last_error());
        }
        Ok(ModuleHandle(handle as usize))
    }

    fn resolve(&self, handle: ModuleHandle, name: &str) -> Option<SymbolAddr> {
        let c_name = CString::new(name).ok()?;
        // SAFETY: handle came from a successful dlopen and has not been closed.
        let addr = unsafe { libc::dlsym(handle.0 as *mut c_void, c_name.as_ptr()) };
        SymbolAddr::new(addr)
    }

    fn close(&self, handle: ModuleHandle) {
        // SAFETY: handle came from a successful dlopen and is closed once.
        unsafe {
            libc::dlclose(handle.0 as *mut c_void);
        }
    }

    fn resolve_error(&self, _name: &str) -> String {
        Self::last_error()
    }
}

/// One opened code image, owned by exactly one script instance.
///
/// Dropping it closes the image, invalidating every address resolved from it.
pub struct CodeModule {
    loader: Arc<dyn PlatformLoader>,
    handle: ModuleHandle,
    path: PathBuf,
}

impl CodeModule {
    pub(crate) fn new(loader: Arc<dyn PlatformLoader>, handle: ModuleHandle, path: PathBuf) -> Self {
        Self {
            loader,
            handle,
            path,
        }
    }

    /// Path the image was opened from. For instanced loads this is the
    /// (already removed) alias.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn resolve(&self, name: &str) -> Option<SymbolAddr> {
        self.loader.resolve(self.handle, name)
    }

    pub(crate) fn resolve_error(&self, name: &str) -> String {
        self.loader.resolve_error(name)
    }

    /// The module's embedded self-description, if it exports one.
    pub fn export_info(&self) -> Option<&[u8]> {
        let addr = self.resolve(SYMBOL_INFO)?;
        // SAFETY: the info export is a NUL-terminated string living in the
        // image, which stays mapped for the lifetime of `self`.
        let text = unsafe { CStr::from_ptr(addr.as_ptr() as *const libc::c_char) };
        Some(text.to_bytes())
    }
}

impl fmt::Debug for CodeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeModule")
            .field("handle", &self.handle)
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for CodeModule {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "closing code module");
        self.loader.close(self.handle);
    }
}
