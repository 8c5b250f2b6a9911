//! File handles and the stream registry.
//!
//! `assign` names a file and sizes its record buffer, `reset` /
//! `rewrite` open it for reading or writing, `close` tears it down.
//! Text streams carry a one-byte lookahead so `eof`/`eoln` can test
//! without consuming; binary streams keep the next record preloaded
//! in the file's buffer, which is what `f^` addresses.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::Mutex;

/// The compiler's view of a file variable. Field offsets are fixed
/// ABI: handle at 0, buffer at 8, record size at 16, text flag at 20.
#[repr(C)]
pub struct PasFile {
    pub handle: i32,
    pub buffer: *mut u8,
    pub record_size: i32,
    pub is_text: u8,
}

const STDIN_HANDLE: i32 = 0;
const STDOUT_HANDLE: i32 = 1;
/// Real files get handles from 2 upward.
const FIRST_FILE_HANDLE: i32 = 2;

enum Stream {
    Closed,
    Reading(File),
    Writing(File),
}

struct FileState {
    name: String,
    stream: Stream,
    /// One byte of lookahead for text files.
    peeked: Option<u8>,
    at_eof: bool,
}

static FILES: Mutex<Vec<FileState>> = Mutex::new(Vec::new());
static STDIN_PEEK: Mutex<(Option<u8>, bool)> = Mutex::new((None, false));

fn with_files<R>(f: impl FnOnce(&mut Vec<FileState>) -> R) -> R {
    let mut guard = FILES.lock().expect("file registry poisoned");
    f(&mut guard)
}

fn state_index(handle: i32) -> Option<usize> {
    if handle >= FIRST_FILE_HANDLE {
        Some((handle - FIRST_FILE_HANDLE) as usize)
    } else {
        None
    }
}

unsafe fn file_ref<'a>(f: *mut PasFile) -> Option<&'a mut PasFile> {
    f.as_mut()
}

// ─── byte-level access shared with the text helpers ───────────────────

/// Read one byte with lookahead; handles the standard input when the
/// file pointer is null or names handle 0.
pub(crate) unsafe fn read_byte(f: *const PasFile) -> Option<u8> {
    let handle = if f.is_null() { STDIN_HANDLE } else { (*f).handle };
    if handle == STDIN_HANDLE {
        let mut guard = STDIN_PEEK.lock().expect("stdin state poisoned");
        if let Some(b) = guard.0.take() {
            return Some(b);
        }
        if guard.1 {
            return None;
        }
        let mut buf = [0u8; 1];
        match std::io::stdin().read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => {
                guard.1 = true;
                None
            }
        }
    } else {
        with_files(|files| {
            let idx = state_index(handle)?;
            let st = files.get_mut(idx)?;
            if let Some(b) = st.peeked.take() {
                return Some(b);
            }
            if st.at_eof {
                return None;
            }
            let mut buf = [0u8; 1];
            match &mut st.stream {
                Stream::Reading(file) => match file.read(&mut buf) {
                    Ok(1) => Some(buf[0]),
                    _ => {
                        st.at_eof = true;
                        None
                    }
                },
                _ => None,
            }
        })
    }
}

/// Look at the next byte without consuming it.
pub(crate) unsafe fn peek_byte(f: *const PasFile) -> Option<u8> {
    let b = read_byte(f)?;
    unread_byte(f, b);
    Some(b)
}

pub(crate) unsafe fn unread_byte(f: *const PasFile, b: u8) {
    let handle = if f.is_null() { STDIN_HANDLE } else { (*f).handle };
    if handle == STDIN_HANDLE {
        STDIN_PEEK.lock().expect("stdin state poisoned").0 = Some(b);
    } else {
        with_files(|files| {
            if let Some(idx) = state_index(handle) {
                if let Some(st) = files.get_mut(idx) {
                    st.peeked = Some(b);
                }
            }
        });
    }
}

/// Write raw bytes to the file, or standard output for a null/stdout
/// handle.
pub(crate) unsafe fn write_bytes(f: *const PasFile, bytes: &[u8]) {
    let handle = if f.is_null() { STDOUT_HANDLE } else { (*f).handle };
    if handle == STDOUT_HANDLE || handle == STDIN_HANDLE {
        let mut out = std::io::stdout();
        let _ = out.write_all(bytes);
        return;
    }
    with_files(|files| {
        if let Some(idx) = state_index(handle) {
            if let Some(st) = files.get_mut(idx) {
                if let Stream::Writing(file) = &mut st.stream {
                    let _ = file.write_all(bytes);
                }
            }
        }
    });
}

pub(crate) fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

// ─── file management builtins ─────────────────────────────────────────

/// `assign(f, name)`: bind a name, allocate the record buffer, and
/// register the handle. Does not touch the OS yet.
///
/// # Safety
/// `f` must point to a live `PasFile`; `name` must point to a
/// length-prefixed string.
#[no_mangle]
pub unsafe extern "C" fn __assign(
    f: *mut PasFile,
    name: *const u8,
    record_size: i32,
    is_text: i8,
) {
    let Some(pf) = file_ref(f) else { return };
    let len = *name as usize;
    let bytes = std::slice::from_raw_parts(name.add(1), len);
    let name = String::from_utf8_lossy(bytes).into_owned();

    pf.record_size = record_size.max(1);
    pf.is_text = is_text as u8;
    if pf.buffer.is_null() {
        let buf = vec![0u8; pf.record_size as usize].into_boxed_slice();
        pf.buffer = Box::into_raw(buf) as *mut u8;
    }

    pf.handle = with_files(|files| {
        files.push(FileState {
            name,
            stream: Stream::Closed,
            peeked: None,
            at_eof: false,
        });
        FIRST_FILE_HANDLE + (files.len() - 1) as i32
    });
}

/// `reset(f)`: open for reading. Binary files preload the first
/// record so `f^` is valid immediately.
///
/// # Safety
/// `f` must point to a `PasFile` previously passed to `__assign`.
#[no_mangle]
pub unsafe extern "C" fn __reset(f: *mut PasFile) {
    let Some(pf) = file_ref(f) else { return };
    let handle = pf.handle;
    with_files(|files| {
        let Some(idx) = state_index(handle) else { return };
        let Some(st) = files.get_mut(idx) else { return };
        st.peeked = None;
        st.at_eof = false;
        st.stream = match File::open(&st.name) {
            Ok(file) => Stream::Reading(file),
            Err(e) => {
                eprintln!("reset: cannot open {}: {}", st.name, e);
                Stream::Closed
            }
        };
    });
    if pf.is_text == 0 {
        advance_record(pf);
    }
}

/// `rewrite(f)`: create/truncate for writing.
///
/// # Safety
/// `f` must point to a `PasFile` previously passed to `__assign`.
#[no_mangle]
pub unsafe extern "C" fn __rewrite(f: *mut PasFile) {
    let Some(pf) = file_ref(f) else { return };
    let handle = pf.handle;
    with_files(|files| {
        let Some(idx) = state_index(handle) else { return };
        let Some(st) = files.get_mut(idx) else { return };
        st.peeked = None;
        st.at_eof = false;
        st.stream = match File::create(&st.name) {
            Ok(file) => Stream::Writing(file),
            Err(e) => {
                eprintln!("rewrite: cannot create {}: {}", st.name, e);
                Stream::Closed
            }
        };
    });
}

/// # Safety
/// `f` must point to a live `PasFile` (or be null, a no-op).
#[no_mangle]
pub unsafe extern "C" fn __close(f: *mut PasFile) {
    let Some(pf) = file_ref(f) else { return };
    let handle = pf.handle;
    with_files(|files| {
        if let Some(idx) = state_index(handle) {
            if let Some(st) = files.get_mut(idx) {
                st.stream = Stream::Closed;
            }
        }
    });
}

/// # Safety
/// `f` must be null or point to a live `PasFile`.
#[no_mangle]
pub unsafe extern "C" fn __eof(f: *mut PasFile) -> i8 {
    if let Some(pf) = f.as_ref() {
        // Binary files are at eof once no record is buffered.
        if pf.is_text == 0 {
            let handle = pf.handle;
            return with_files(|files| {
                state_index(handle)
                    .and_then(|idx| files.get(idx))
                    .map_or(true, |st| st.at_eof)
            }) as i8;
        }
    }
    (peek_byte(f).is_none()) as i8
}

/// # Safety
/// `f` must be null or point to a live `PasFile`.
#[no_mangle]
pub unsafe extern "C" fn __eoln(f: *mut PasFile) -> i8 {
    match peek_byte(f) {
        Some(b'\n') | None => 1,
        _ => 0,
    }
}

// ─── binary records ───────────────────────────────────────────────────

/// Pull the next record into the file's buffer.
unsafe fn advance_record(pf: &mut PasFile) {
    let size = pf.record_size.max(1) as usize;
    let dest = std::slice::from_raw_parts_mut(pf.buffer, size);
    let handle = pf.handle;
    with_files(|files| {
        let Some(idx) = state_index(handle) else { return };
        let Some(st) = files.get_mut(idx) else { return };
        if let Stream::Reading(file) = &mut st.stream {
            match file.read_exact(dest) {
                Ok(()) => {}
                Err(_) => st.at_eof = true,
            }
        }
    });
}

/// `read(f, x)` on a binary file: the buffered record moves to the
/// destination and the next one is preloaded.
///
/// # Safety
/// `f` must be an assigned, reset binary file; `dest` must have room
/// for one record.
#[no_mangle]
pub unsafe extern "C" fn __read_bin(f: *mut PasFile, dest: *mut u8) {
    let Some(pf) = file_ref(f) else { return };
    let size = pf.record_size.max(1) as usize;
    std::ptr::copy_nonoverlapping(pf.buffer, dest, size);
    advance_record(pf);
}

/// `write(f, x)` on a binary file.
///
/// # Safety
/// `f` must be an assigned, rewritten binary file; `src` must hold
/// one record.
#[no_mangle]
pub unsafe extern "C" fn __write_bin(f: *mut PasFile, src: *const u8) {
    let Some(pf) = file_ref(f) else { return };
    let size = pf.record_size.max(1) as usize;
    let bytes = std::slice::from_raw_parts(src, size);
    write_bytes(pf, bytes);
}
