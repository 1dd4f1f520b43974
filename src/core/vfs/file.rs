//! SQLite file I/O methods
//!
//! Implements `sqlite3_io_methods` by forwarding to a boxed [`VfsFile`].
//! Sync only flushes into the adapter's queue; the durability barrier is
//! left for the host to await.

use super::vfs::Registration;
use super::{OpenFlags, VfsFile};
use crate::core::lock::LockLevel;
use crate::error::VfsError;
use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use tracing::{debug, warn};

/// SQLite's view of an open file
#[repr(C)]
pub struct RegisteredFile {
    /// Base sqlite3_file structure (MUST be first field)
    pub base: ffi::sqlite3_file,
    /// `None` once closed
    file: Option<Box<dyn VfsFile>>,
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(file_close),
    xRead: Some(file_read),
    xWrite: Some(file_write),
    xTruncate: Some(file_truncate),
    xSync: Some(file_sync),
    xFileSize: Some(file_file_size),
    xLock: Some(file_lock),
    xUnlock: Some(file_unlock),
    xCheckReservedLock: Some(file_check_reserved_lock),
    xFileControl: Some(file_file_control),
    xSectorSize: Some(file_sector_size),
    xDeviceCharacteristics: Some(file_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

/// Map a failure to SQLite's code, using `io_code` for storage failures
fn error_code(err: &VfsError, io_code: c_int) -> c_int {
    match err {
        VfsError::LockConflict { .. } => ffi::SQLITE_BUSY,
        VfsError::QuotaExceeded(_) => ffi::SQLITE_FULL,
        VfsError::NotFound(_) | VfsError::AlreadyExists(_) => ffi::SQLITE_CANTOPEN,
        _ => io_code,
    }
}

unsafe fn handle<'a>(file: *mut ffi::sqlite3_file) -> Option<&'a mut Box<dyn VfsFile>> {
    (*(file as *mut RegisteredFile)).file.as_mut()
}

// File I/O method implementations

unsafe extern "C" fn file_close(file: *mut ffi::sqlite3_file) -> c_int {
    let registered = &mut *(file as *mut RegisteredFile);
    let Some(mut inner) = registered.file.take() else {
        return ffi::SQLITE_OK;
    };

    match inner.close() {
        Ok(_barrier) => ffi::SQLITE_OK,
        Err(err) => {
            warn!("close of {} failed: {}", inner.name(), err);
            error_code(&err, ffi::SQLITE_IOERR_CLOSE)
        }
    }
}

unsafe extern "C" fn file_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_READ;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_READ;
    }

    let out = std::slice::from_raw_parts_mut(buf as *mut u8, amt as usize);
    match inner.read(out, offset as u64) {
        // The rest of `out` is already zeroed
        Ok(n) if n < out.len() => ffi::SQLITE_IOERR_SHORT_READ,
        Ok(_) => ffi::SQLITE_OK,
        Err(err) => {
            warn!("read of {} failed: {}", inner.name(), err);
            error_code(&err, ffi::SQLITE_IOERR_READ)
        }
    }
}

unsafe extern "C" fn file_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_WRITE;
    };
    if offset < 0 || amt < 0 {
        return ffi::SQLITE_IOERR_WRITE;
    }

    let data = std::slice::from_raw_parts(buf as *const u8, amt as usize);
    match inner.write(data, offset as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => {
            warn!("write to {} failed: {}", inner.name(), err);
            error_code(&err, ffi::SQLITE_IOERR_WRITE)
        }
    }
}

unsafe extern "C" fn file_truncate(
    file: *mut ffi::sqlite3_file,
    size: ffi::sqlite3_int64,
) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_TRUNCATE;
    };
    if size < 0 {
        return ffi::SQLITE_IOERR_TRUNCATE;
    }

    match inner.truncate(size as u64) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => {
            warn!("truncate of {} failed: {}", inner.name(), err);
            error_code(&err, ffi::SQLITE_IOERR_TRUNCATE)
        }
    }
}

unsafe extern "C" fn file_sync(file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_FSYNC;
    };

    match inner.sync() {
        // The host awaits durability through the adapter's flush
        Ok(_barrier) => ffi::SQLITE_OK,
        Err(err) => {
            warn!("sync of {} failed: {}", inner.name(), err);
            error_code(&err, ffi::SQLITE_IOERR_FSYNC)
        }
    }
}

unsafe extern "C" fn file_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_FSTAT;
    };
    *p_size = inner.file_size() as ffi::sqlite3_int64;
    ffi::SQLITE_OK
}

unsafe extern "C" fn file_lock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_LOCK;
    };
    let Some(level) = LockLevel::from_raw(lock_type) else {
        return ffi::SQLITE_MISUSE;
    };

    match inner.lock(level) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => error_code(&err, ffi::SQLITE_IOERR_LOCK),
    }
}

unsafe extern "C" fn file_unlock(file: *mut ffi::sqlite3_file, lock_type: c_int) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_UNLOCK;
    };
    let Some(level) = LockLevel::from_raw(lock_type) else {
        return ffi::SQLITE_MISUSE;
    };

    match inner.unlock(level) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => error_code(&err, ffi::SQLITE_IOERR_UNLOCK),
    }
}

unsafe extern "C" fn file_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(inner) = handle(file) else {
        return ffi::SQLITE_IOERR_CHECKRESERVEDLOCK;
    };
    *p_res_out = inner.check_reserved_lock() as c_int;
    ffi::SQLITE_OK
}

unsafe extern "C" fn file_file_control(
    _file: *mut ffi::sqlite3_file,
    _op: c_int,
    _p_arg: *mut c_void,
) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn file_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    handle(file).map_or(0, |inner| inner.sector_size() as c_int)
}

unsafe extern "C" fn file_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    handle(file).map_or(0, |inner| inner.device_characteristics())
}

// VFS open callback

pub(crate) unsafe fn file_open(
    registration: &Registration,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    // SQLite hands over uninitialized memory of szOsFile bytes
    let registered = file as *mut RegisteredFile;
    ptr::write(
        registered,
        RegisteredFile {
            base: ffi::sqlite3_file {
                pMethods: ptr::null(),
            },
            file: None,
        },
    );

    let name = if z_name.is_null() {
        None
    } else {
        match CStr::from_ptr(z_name).to_str() {
            Ok(name) => Some(name),
            Err(_) => return ffi::SQLITE_CANTOPEN,
        }
    };

    let open_flags = OpenFlags::from_sqlite(flags);
    let inner = match registration.vfs.open_file(name, open_flags) {
        Ok(inner) => inner,
        Err(err) => {
            debug!("open of {:?} failed: {}", name, err);
            return error_code(&err, ffi::SQLITE_CANTOPEN);
        }
    };

    (*registered).file = Some(inner);
    (*registered).base.pMethods = &IO_METHODS;

    if !p_out_flags.is_null() {
        *p_out_flags = flags;
    }

    ffi::SQLITE_OK
}
