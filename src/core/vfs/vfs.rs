//! SQLite VFS registration
//!
//! Wraps any [`Vfs`] in a `sqlite3_vfs` so SQLite can open databases
//! through it by name (`file:app.db?vfs=<name>`).

use super::file::{file_open, RegisteredFile};
use super::Vfs;
use crate::error::{Result, VfsError};
use chrono::Utc;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name the adapter registers under unless configured otherwise
pub const DEFAULT_VFS_NAME: &str = "blockvfs";

/// Longest path a VFS accepts unless it says otherwise
pub const DEFAULT_MAX_PATHNAME: usize = 1024;

/// Julian day of the Unix epoch
const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;
/// The same instant in Julian milliseconds
const UNIX_EPOCH_JULIAN_MS: i64 = 210866760000000;

/// Names registered through [`register_vfs`] and not yet unregistered
static REGISTERED: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

/// State behind `pAppData` of a registered VFS
pub(crate) struct Registration {
    pub(crate) vfs: Arc<dyn Vfs>,
    name: CString,
}

/// Register `vfs` with SQLite under `name`
///
/// Registering a name that is already taken fails; unregister it first.
pub fn register_vfs(name: &str, vfs: Arc<dyn Vfs>, make_default: bool) -> Result<()> {
    let mut registered = REGISTERED.lock();
    let key = name.to_string();
    let name = CString::new(name)
        .map_err(|e| VfsError::Config(format!("invalid VFS name: {}", e)))?;

    let max_pathname = c_int::try_from(vfs.max_pathname())
        .map_err(|_| VfsError::Config(format!("max_pathname {} is too large", vfs.max_pathname())))?;

    let existing = unsafe { ffi::sqlite3_vfs_find(name.as_ptr()) };
    if !existing.is_null() {
        return Err(VfsError::AlreadyExists(format!(
            "VFS '{}' is already registered",
            name.to_string_lossy()
        )));
    }

    let registration = Box::into_raw(Box::new(Registration { vfs, name }));

    let sqlite_vfs = Box::new(ffi::sqlite3_vfs {
        iVersion: 2,
        szOsFile: std::mem::size_of::<RegisteredFile>() as c_int,
        mxPathname: max_pathname,
        pNext: ptr::null_mut(),
        zName: unsafe { (*registration).name.as_ptr() },
        pAppData: registration as *mut c_void,
        xOpen: Some(vfs_open),
        xDelete: Some(vfs_delete),
        xAccess: Some(vfs_access),
        xFullPathname: Some(vfs_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(vfs_randomness),
        xSleep: Some(vfs_sleep),
        xCurrentTime: Some(vfs_current_time),
        xGetLastError: Some(vfs_get_last_error),
        xCurrentTimeInt64: Some(vfs_current_time_int64),
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    });

    let vfs_ptr = Box::into_raw(sqlite_vfs);

    unsafe {
        let rc = ffi::sqlite3_vfs_register(vfs_ptr, make_default as c_int);
        if rc != ffi::SQLITE_OK {
            drop(Box::from_raw(vfs_ptr));
            drop(Box::from_raw(registration));
            return Err(VfsError::VfsRegistration(rc));
        }
        registered.insert(key);
        info!(
            "Registered VFS '{}'{}",
            (*registration).name.to_string_lossy(),
            if make_default { " as default" } else { "" }
        );
    }

    Ok(())
}

/// Unregister the VFS called `name`; a no-op if there is none
///
/// Every connection using it must be closed first.
pub fn unregister_vfs(name: &str) -> Result<()> {
    let mut registered = REGISTERED.lock();
    let key = name.to_string();
    let name = CString::new(name)
        .map_err(|e| VfsError::Config(format!("invalid VFS name: {}", e)))?;

    unsafe {
        let vfs_ptr = ffi::sqlite3_vfs_find(name.as_ptr());
        if vfs_ptr.is_null() {
            return Ok(());
        }
        if !registered.contains(&key) {
            return Err(VfsError::Config(format!(
                "VFS '{}' was not registered by this crate",
                name.to_string_lossy()
            )));
        }

        let rc = ffi::sqlite3_vfs_unregister(vfs_ptr);
        if rc != ffi::SQLITE_OK {
            return Err(VfsError::VfsRegistration(rc));
        }

        let app_data = (*vfs_ptr).pAppData;
        if !app_data.is_null() {
            drop(Box::from_raw(app_data as *mut Registration));
        }
        drop(Box::from_raw(vfs_ptr));
    }
    registered.remove(&key);

    debug!("Unregistered VFS '{}'", name.to_string_lossy());
    Ok(())
}

unsafe fn registration<'a>(vfs: *mut ffi::sqlite3_vfs) -> Option<&'a Registration> {
    let app_data = (*vfs).pAppData as *const Registration;
    app_data.as_ref()
}

unsafe fn path_arg<'a>(z_name: *const c_char) -> Option<&'a str> {
    if z_name.is_null() {
        return None;
    }
    CStr::from_ptr(z_name).to_str().ok()
}

// VFS callbacks

unsafe extern "C" fn vfs_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    match registration(vfs) {
        Some(registration) => file_open(registration, z_name, file, flags, p_out_flags),
        None => ffi::SQLITE_ERROR,
    }
}

unsafe extern "C" fn vfs_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    let Some(registration) = registration(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let Some(path) = path_arg(z_name) else {
        return ffi::SQLITE_ERROR;
    };

    match registration.vfs.delete(path) {
        Ok(()) => ffi::SQLITE_OK,
        Err(VfsError::NotFound(_)) => ffi::SQLITE_IOERR_DELETE_NOENT,
        Err(err) => {
            warn!("delete of {} failed: {}", path, err);
            ffi::SQLITE_IOERR_DELETE
        }
    }
}

unsafe extern "C" fn vfs_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(registration) = registration(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let Some(path) = path_arg(z_name) else {
        return ffi::SQLITE_ERROR;
    };

    *p_res_out = registration.vfs.access(path) as c_int;
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let Some(registration) = registration(vfs) else {
        return ffi::SQLITE_ERROR;
    };
    let Some(path) = path_arg(z_name) else {
        return ffi::SQLITE_CANTOPEN;
    };

    let full = match registration.vfs.full_pathname(path) {
        Ok(full) => full,
        Err(_) => return ffi::SQLITE_CANTOPEN,
    };
    if full.len() >= n_out as usize {
        return ffi::SQLITE_CANTOPEN;
    }

    ptr::copy_nonoverlapping(full.as_ptr() as *const c_char, z_out, full.len());
    *z_out.add(full.len()) = 0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_randomness(
    _vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    if n_byte <= 0 {
        return 0;
    }
    let out = std::slice::from_raw_parts_mut(z_out as *mut u8, n_byte as usize);
    rand::thread_rng().fill_bytes(out);
    n_byte
}

unsafe extern "C" fn vfs_sleep(_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(std::time::Duration::from_micros(microseconds.max(0) as u64));
    microseconds
}

unsafe extern "C" fn vfs_current_time(_vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    let millis = Utc::now().timestamp_millis() as f64;
    *p_time_out = UNIX_EPOCH_JULIAN_DAY + millis / 86_400_000.0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_current_time_int64(
    _vfs: *mut ffi::sqlite3_vfs,
    p_time_out: *mut ffi::sqlite3_int64,
) -> c_int {
    *p_time_out = UNIX_EPOCH_JULIAN_MS + Utc::now().timestamp_millis();
    ffi::SQLITE_OK
}

unsafe extern "C" fn vfs_get_last_error(
    _vfs: *mut ffi::sqlite3_vfs,
    _n_byte: c_int,
    _z_err_msg: *mut c_char,
) -> c_int {
    // Failures are logged where they happen
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VfsConfig;
    use crate::core::block_store::MemoryBlockStore;
    use crate::core::vfs::{MemoryVfsAdapter, VfsAdapter};

    #[test]
    fn test_register_twice_fails() {
        let vfs: Arc<dyn Vfs> = Arc::new(MemoryVfsAdapter::new());
        register_vfs("blockvfs-register-twice", Arc::clone(&vfs), false).unwrap();
        assert!(matches!(
            register_vfs("blockvfs-register-twice", vfs, false),
            Err(VfsError::AlreadyExists(_))
        ));
        unregister_vfs("blockvfs-register-twice").unwrap();
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        unregister_vfs("blockvfs-never-registered").unwrap();
    }

    #[test]
    fn test_refuses_foreign_vfs() {
        // The platform VFS is always registered
        let foreign = unsafe { ffi::sqlite3_vfs_find(ptr::null()) };
        let name = unsafe { CStr::from_ptr((*foreign).zName) }
            .to_str()
            .unwrap()
            .to_string();
        assert!(matches!(unregister_vfs(&name), Err(VfsError::Config(_))));
    }

    #[tokio::test]
    async fn test_pathname_limit_follows_config() {
        let config = VfsConfig {
            max_pathname: 4096,
            ..VfsConfig::default()
        };
        let adapter = VfsAdapter::mount(Arc::new(MemoryBlockStore::new()), config)
            .await
            .unwrap();
        register_vfs("blockvfs-long-paths", Arc::new(adapter), false).unwrap();

        let name = CString::new("blockvfs-long-paths").unwrap();
        let registered = unsafe { ffi::sqlite3_vfs_find(name.as_ptr()) };
        assert_eq!(unsafe { (*registered).mxPathname }, 4096);
        unregister_vfs("blockvfs-long-paths").unwrap();

        let memory: Arc<dyn Vfs> = Arc::new(MemoryVfsAdapter::new());
        assert_eq!(memory.max_pathname(), DEFAULT_MAX_PATHNAME);
    }

    #[test]
    fn test_current_time_is_after_2020() {
        let mut julian = 0f64;
        let mut julian_ms: ffi::sqlite3_int64 = 0;
        unsafe {
            vfs_current_time(ptr::null_mut(), &mut julian);
            vfs_current_time_int64(ptr::null_mut(), &mut julian_ms);
        }
        // 2020-01-01 is Julian day 2458849.5
        assert!(julian > 2458849.5);
        assert!((julian_ms as f64 / 86_400_000.0 - julian).abs() < 1.0);
    }
}
