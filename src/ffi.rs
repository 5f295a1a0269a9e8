use std::ffi::{CStr, CString, c_void};
use std::os::raw::{c_char, c_int};

use crate::engine::{SyncConfig, SyncEngine};
use crate::remote::{RemoteError, RemoteId, RemoteStore};

/// Host-provided remote callbacks. Each returns 0 on success, 1 for a
/// retryable failure (network, timeout, 5xx), and any other value for a
/// terminal failure. `user_data` is passed back verbatim.
#[repr(C)]
pub struct OutboxRemoteCallbacks {
    pub user_data: *mut c_void,
    pub insert:
        extern "C" fn(user_data: *mut c_void, table: *const c_char, record_json: *const c_char) -> c_int,
    pub update: extern "C" fn(
        user_data: *mut c_void,
        table: *const c_char,
        record_id: *const c_char,
        patch_json: *const c_char,
    ) -> c_int,
    pub delete:
        extern "C" fn(user_data: *mut c_void, table: *const c_char, record_id: *const c_char) -> c_int,
}

struct CallbackRemote {
    callbacks: OutboxRemoteCallbacks,
}

// The host guarantees its callbacks and user_data are usable from whichever
// thread drives the engine.
unsafe impl Send for CallbackRemote {}
unsafe impl Sync for CallbackRemote {}

fn status_to_result(status: c_int) -> Result<(), RemoteError> {
    match status {
        0 => Ok(()),
        1 => Err(RemoteError::retryable("remote callback reported a retryable failure")),
        other => Err(RemoteError::Terminal(format!(
            "remote callback reported status {other}"
        ))),
    }
}

fn to_c_arg(s: &str) -> Result<CString, RemoteError> {
    CString::new(s).map_err(|_| RemoteError::terminal("argument contains interior NUL"))
}

impl RemoteStore for CallbackRemote {
    fn insert(&self, table: &str, record: &serde_json::Value) -> Result<RemoteId, RemoteError> {
        let table_c = to_c_arg(table)?;
        let record_c = to_c_arg(&record.to_string())?;
        let status =
            (self.callbacks.insert)(self.callbacks.user_data, table_c.as_ptr(), record_c.as_ptr());
        status_to_result(status)?;
        Ok(record
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    fn update(&self, table: &str, id: &str, patch: &serde_json::Value) -> Result<(), RemoteError> {
        let table_c = to_c_arg(table)?;
        let id_c = to_c_arg(id)?;
        let patch_c = to_c_arg(&patch.to_string())?;
        let status = (self.callbacks.update)(
            self.callbacks.user_data,
            table_c.as_ptr(),
            id_c.as_ptr(),
            patch_c.as_ptr(),
        );
        status_to_result(status)
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let table_c = to_c_arg(table)?;
        let id_c = to_c_arg(id)?;
        let status =
            (self.callbacks.delete)(self.callbacks.user_data, table_c.as_ptr(), id_c.as_ptr());
        status_to_result(status)
    }
}

/// Opaque handle that owns the engine and its SQLite connection.
/// The host holds this as an unsafe pointer and passes it back to these APIs.
pub struct OutboxHandle {
    engine: SyncEngine<CallbackRemote>,
}

fn ptr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, ()> {
    if ptr.is_null() {
        return Err(());
    }
    unsafe { CStr::from_ptr(ptr).to_str().map_err(|_| ()) }
}

fn to_cstring_ptr(s: &str) -> *mut c_char {
    CString::new(s).map(|cs| cs.into_raw()).unwrap_or(std::ptr::null_mut())
}

/// Free a C string returned by this library.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe { let _ = CString::from_raw(s); }
}

/// Open (or create) the local database at `path` and bind the host's remote
/// callbacks. Returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_open(
    path: *const c_char,
    callbacks: OutboxRemoteCallbacks,
) -> *mut OutboxHandle {
    let path = match ptr_to_str(path) {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    let remote = CallbackRemote { callbacks };
    match SyncEngine::open(path, remote, SyncConfig::default()) {
        Ok(engine) => Box::into_raw(Box::new(OutboxHandle { engine })),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Close a previously opened handle.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_close(handle: *mut OutboxHandle) {
    if handle.is_null() {
        return;
    }
    unsafe { let _ = Box::from_raw(handle); }
}

/// Stage a create: optimistic local write plus a queued remote insert.
/// Returns the op id (>=1) or -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_stage_create(
    handle: *mut OutboxHandle,
    table: *const c_char,
    record_id: *const c_char,
    record_json: *const c_char,
) -> i64 {
    let h = unsafe { handle.as_ref() };
    let (table, record_id, record_s) =
        match (ptr_to_str(table), ptr_to_str(record_id), ptr_to_str(record_json)) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            _ => return -1,
        };
    let record: serde_json::Value = match serde_json::from_str(record_s) {
        Ok(v) => v,
        Err(_) => return -1,
    };
    if let Some(h) = h {
        match h.engine.stage_create(table, record_id, &record) {
            Ok(id) => id,
            Err(_) => -1,
        }
    } else {
        -1
    }
}

/// Stage an update: shallow patch merged locally plus a queued remote patch.
/// Returns the op id or -1.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_stage_update(
    handle: *mut OutboxHandle,
    table: *const c_char,
    record_id: *const c_char,
    patch_json: *const c_char,
) -> i64 {
    let h = unsafe { handle.as_ref() };
    let (table, record_id, patch_s) =
        match (ptr_to_str(table), ptr_to_str(record_id), ptr_to_str(patch_json)) {
            (Ok(a), Ok(b), Ok(c)) => (a, b, c),
            _ => return -1,
        };
    let patch: serde_json::Value = match serde_json::from_str(patch_s) {
        Ok(v) => v,
        Err(_) => return -1,
    };
    if let Some(h) = h {
        match h.engine.stage_update(table, record_id, &patch) {
            Ok(id) => id,
            Err(_) => -1,
        }
    } else {
        -1
    }
}

/// Stage a delete. Returns the op id or -1.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_stage_delete(
    handle: *mut OutboxHandle,
    table: *const c_char,
    record_id: *const c_char,
) -> i64 {
    let h = unsafe { handle.as_ref() };
    let (table, record_id) = match (ptr_to_str(table), ptr_to_str(record_id)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return -1,
    };
    if let Some(h) = h {
        match h.engine.stage_delete(table, record_id) {
            Ok(id) => id,
            Err(_) => -1,
        }
    } else {
        -1
    }
}

/// Fetch a record's locally known body as JSON. Returns an empty string when
/// the record does not exist, null on error.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_get_record(
    handle: *mut OutboxHandle,
    table: *const c_char,
    record_id: *const c_char,
) -> *mut c_char {
    let h = unsafe { handle.as_ref() };
    let (table, record_id) = match (ptr_to_str(table), ptr_to_str(record_id)) {
        (Ok(a), Ok(b)) => (a, b),
        _ => return std::ptr::null_mut(),
    };
    if let Some(h) = h {
        match h.engine.record(table, record_id) {
            Ok(Some(body)) => to_cstring_ptr(&body.to_string()),
            Ok(None) => to_cstring_ptr(""),
            Err(_) => std::ptr::null_mut(),
        }
    } else {
        std::ptr::null_mut()
    }
}

/// List one table's records as a JSON object keyed by record id.
/// Returns a newly allocated C string or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_list_records(
    handle: *mut OutboxHandle,
    table: *const c_char,
) -> *mut c_char {
    let h = unsafe { handle.as_ref() };
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    if let Some(h) = h {
        match h.engine.records(table) {
            Ok(records) => {
                let map: serde_json::Map<String, serde_json::Value> =
                    records.into_iter().collect();
                match serde_json::to_string(&map) {
                    Ok(s) => to_cstring_ptr(&s),
                    Err(_) => std::ptr::null_mut(),
                }
            }
            Err(_) => std::ptr::null_mut(),
        }
    } else {
        std::ptr::null_mut()
    }
}

/// Feed a connectivity transition (non-zero = online). The offline-to-online
/// edge triggers a drain. Returns 0 on success.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_notify_connectivity(handle: *mut OutboxHandle, online: c_int) -> c_int {
    let h = unsafe { handle.as_ref() };
    if let Some(h) = h {
        match h.engine.notify_connectivity(online != 0) {
            Ok(_) => 0,
            Err(_) => 1,
        }
    } else {
        2
    }
}

/// Run one drain pass; the background-sync entry point. Returns the
/// serialized DrainReport as JSON, or null on error.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_attempt_drain(handle: *mut OutboxHandle) -> *mut c_char {
    let h = unsafe { handle.as_ref() };
    if let Some(h) = h {
        match h.engine.attempt_drain() {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(s) => to_cstring_ptr(&s),
                Err(_) => std::ptr::null_mut(),
            },
            Err(_) => std::ptr::null_mut(),
        }
    } else {
        std::ptr::null_mut()
    }
}

/// Queued entries for one table, or -1 on error.
#[unsafe(no_mangle)]
pub extern "C" fn outbox_pending_count(handle: *mut OutboxHandle, table: *const c_char) -> i64 {
    let h = unsafe { handle.as_ref() };
    let table = match ptr_to_str(table) {
        Ok(s) => s,
        Err(_) => return -1,
    };
    if let Some(h) = h {
        match h.engine.pending_count(table) {
            Ok(n) => n,
            Err(_) => -1,
        }
    } else {
        -1
    }
}
