//! Thin wrapper around the platform dynamic loader, used by
//! [`crate::Jit::load_library`] and the process-global symbol search
//! step of global-operand resolution (spec §4.10).

use liric_codegen::result::{CodegenError, CodegenResult};
use std::ffi::CString;

/// A loaded shared library. Closed on drop.
pub struct Library {
    #[cfg(unix)]
    handle: *mut libc::c_void,
    #[cfg(windows)]
    handle: winapi::shared::minwindef::HMODULE,
}

impl Library {
    #[cfg(unix)]
    pub fn open(path: &str) -> CodegenResult<Self> {
        let c_path = CString::new(path)
            .map_err(|_| CodegenError::argument("library path contains a NUL byte"))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(CodegenError::backend(format!("dlopen failed for '{path}'")));
        }
        Ok(Library { handle })
    }

    #[cfg(windows)]
    pub fn open(path: &str) -> CodegenResult<Self> {
        use std::os::windows::ffi::OsStrExt;
        let wide: Vec<u16> = std::ffi::OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let handle = unsafe { winapi::um::libloaderapi::LoadLibraryW(wide.as_ptr()) };
        if handle.is_null() {
            return Err(CodegenError::backend(format!("LoadLibraryW failed for '{path}'")));
        }
        Ok(Library { handle })
    }

    #[cfg(unix)]
    pub fn symbol(&self, name: &str) -> Option<usize> {
        let c_name = CString::new(name).ok()?;
        let addr = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as usize)
        }
    }

    #[cfg(windows)]
    pub fn symbol(&self, name: &str) -> Option<usize> {
        let c_name = CString::new(name).ok()?;
        let addr = unsafe { winapi::um::libloaderapi::GetProcAddress(self.handle, c_name.as_ptr()) };
        if addr.is_null() {
            None
        } else {
            Some(addr as usize)
        }
    }
}

impl Drop for Library {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        unsafe {
            winapi::um::libloaderapi::FreeLibrary(self.handle);
        }
    }
}

/// Look up `name` among symbols already loaded into the process
/// (spec §4.10's last resolution step, `dlsym(RTLD_DEFAULT, ...)`).
#[cfg(unix)]
pub fn process_symbol(name: &str) -> Option<usize> {
    let c_name = CString::new(name).ok()?;
    let addr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr()) };
    if addr.is_null() {
        None
    } else {
        Some(addr as usize)
    }
}

#[cfg(windows)]
pub fn process_symbol(_name: &str) -> Option<usize> {
    // No portable RTLD_DEFAULT equivalent; callers still have
    // add_symbol/load_library for anything not already resolvable
    // through a module-local or explicitly loaded library.
    None
}
