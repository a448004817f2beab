//! Native libpam backend
//!
//! Thin FFI over the Linux-PAM application API. Everything here is 1:1
//! marshalling; ordering and locking live in the handle. The conversation
//! trampoline converts `struct pam_message` batches into [`Message`]s and
//! validated replies back into heap-allocated `struct pam_response` arrays
//! owned by the module stack.

use std::ffi::{CStr, CString};
use std::sync::{Mutex, MutexGuard, PoisonError};

use libc::{c_char, c_int, c_uint, c_void};
use zeroize::Zeroize;

use crate::code::{Code, MessageStyle};
use crate::conv::Message;
use crate::error::fatal;
use crate::stack::{Converse, ItemKind, ModuleStack, SessionConfig};

// Number of return values defined by the libpam this backend was written
// against (_PAM_RETURN_VALUES). A libpam that grows the table must fail
// here, not silently map codes the taxonomy cannot represent.
const _: () = assert!(Code::COUNT == 32);

#[repr(C)]
struct PamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct PamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

#[repr(C)]
struct PamConv {
    conv: unsafe extern "C" fn(
        c_int,
        *mut *const PamMessage,
        *mut *mut PamResponse,
        *mut c_void,
    ) -> c_int,
    appdata_ptr: *mut c_void,
}

enum PamHandle {}

#[link(name = "pam")]
extern "C" {
    fn pam_start(
        service: *const c_char,
        user: *const c_char,
        conv: *const PamConv,
        pamh: *mut *mut PamHandle,
    ) -> c_int;
    fn pam_start_confdir(
        service: *const c_char,
        user: *const c_char,
        conv: *const PamConv,
        confdir: *const c_char,
        pamh: *mut *mut PamHandle,
    ) -> c_int;
    fn pam_end(pamh: *mut PamHandle, status: c_int) -> c_int;
    fn pam_authenticate(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_acct_mgmt(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_setcred(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_open_session(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_close_session(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_chauthtok(pamh: *mut PamHandle, flags: c_int) -> c_int;
    fn pam_get_item(pamh: *const PamHandle, item_type: c_int, item: *mut *const c_void) -> c_int;
    fn pam_set_item(pamh: *mut PamHandle, item_type: c_int, item: *const c_void) -> c_int;
    fn pam_getenv(pamh: *mut PamHandle, name: *const c_char) -> *const c_char;
    fn pam_putenv(pamh: *mut PamHandle, name_value: *const c_char) -> c_int;
    fn pam_getenvlist(pamh: *mut PamHandle) -> *mut *mut c_char;
    fn pam_fail_delay(pamh: *mut PamHandle, usec: c_uint) -> c_int;
    fn pam_strerror(pamh: *const PamHandle, errnum: c_int) -> *const c_char;
}

/// Slot the trampoline reads the current bridge from.
///
/// pam_start copies the `pam_conv` struct once, so the appdata pointer has
/// to aim at stable memory that outlives the session; the bridge reference
/// inside it is only populated for the duration of one native call.
struct ConvSlot {
    current: Mutex<Option<*const dyn Converse>>,
}

// The raw bridge pointer is only dereferenced on the thread that made the
// native call, inside the call's window.
unsafe impl Send for ConvSlot {}
unsafe impl Sync for ConvSlot {}

/// One native pam session.
pub struct LibPamSession {
    pamh: *mut PamHandle,
    slot: Box<ConvSlot>,
}

// The handle serializes all access to the session under its operation
// lock; the raw pam handle never moves between concurrent calls.
unsafe impl Send for LibPamSession {}
unsafe impl Sync for LibPamSession {}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

unsafe extern "C" fn conv_trampoline(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    appdata_ptr: *mut c_void,
) -> c_int {
    if appdata_ptr.is_null() {
        fatal("conversation invoked with null appdata pointer");
    }
    if num_msg < 0 {
        fatal("conversation invoked with negative message count");
    }

    let slot = &*(appdata_ptr as *const ConvSlot);
    let conv = match *relock(&slot.current) {
        Some(ptr) => &*ptr,
        None => fatal("conversation invoked outside a native call"),
    };

    let count = num_msg as usize;
    let mut batch = Vec::with_capacity(count);
    if count > 0 {
        // Linux-PAM passes an array of message pointers
        let entries = std::slice::from_raw_parts(msg as *const *const PamMessage, count);
        for entry in entries {
            let record = &**entry;
            let text = if record.msg.is_null() {
                String::new()
            } else {
                CStr::from_ptr(record.msg).to_string_lossy().into_owned()
            };
            batch.push(Message::new(MessageStyle::from_native(record.msg_style as u32), text));
        }
    }

    let replies = match conv.converse(batch) {
        Ok(replies) => replies,
        Err(code) => return code as c_int,
    };

    // One calloc'd response array, ownership passes to the module stack.
    // Unanswered entries stay NULL from calloc.
    let reply_array =
        libc::calloc(count.max(1), std::mem::size_of::<PamResponse>()) as *mut PamResponse;
    if reply_array.is_null() {
        return Code::BufErr as c_int;
    }

    for (index, reply) in replies.into_iter().enumerate() {
        let Some(mut text) = reply else { continue };
        let copied = match CString::new(text.as_str()) {
            Ok(ctext) => {
                let duplicated = libc::strdup(ctext.as_ptr());
                // drop our copies of what is likely a password
                let mut bytes = ctext.into_bytes();
                bytes.zeroize();
                duplicated
            }
            Err(_) => std::ptr::null_mut(),
        };
        text.zeroize();
        if copied.is_null() {
            free_responses(reply_array, index);
            return Code::BufErr as c_int;
        }
        (*reply_array.add(index)).resp = copied;
    }

    *resp = reply_array;
    Code::Success as c_int
}

unsafe fn free_responses(reply_array: *mut PamResponse, built: usize) {
    for index in 0..built {
        libc::free((*reply_array.add(index)).resp as *mut c_void);
    }
    libc::free(reply_array as *mut c_void);
}

/// The real module stack, linked against the system libpam.
#[derive(Clone, Default)]
pub struct LibPam;

impl LibPam {
    pub fn new() -> Self {
        LibPam
    }

    /// Install `conv` in the session's slot for the duration of `call`.
    fn with_conv<R>(
        &self,
        session: &LibPamSession,
        conv: &dyn Converse,
        call: impl FnOnce() -> R,
    ) -> R {
        // SAFETY: the slot's raw pointer is only dereferenced on this
        // thread, inside this call's window (see `ConvSlot` and
        // `conv_trampoline`), so extending the pointer's lifetime here
        // does not allow it to be used past `conv`'s real lifetime.
        let extended: *const dyn Converse =
            unsafe { std::mem::transmute::<&dyn Converse, &'static dyn Converse>(conv) };
        *relock(&session.slot.current) = Some(extended);
        let result = call();
        *relock(&session.slot.current) = None;
        result
    }
}

fn cstring(value: &str, what: &str) -> std::result::Result<CString, Code> {
    // PAM strings cannot carry interior NULs; treat them as caller error
    // surfaced through the conversation/service code rather than panicking
    CString::new(value).map_err(|_| {
        tracing::warn!("{what} contains an interior NUL byte");
        Code::BufErr
    })
}

impl ModuleStack for LibPam {
    type Session = LibPamSession;

    fn start(&self, config: &SessionConfig) -> std::result::Result<Self::Session, Code> {
        let service = cstring(&config.service, "service name")?;
        let user = cstring(&config.user, "user")?;
        let confdir = match &config.confdir {
            Some(path) => Some(cstring(&path.to_string_lossy(), "confdir")?),
            None => None,
        };

        let slot = Box::new(ConvSlot {
            current: Mutex::new(None),
        });
        let conv = PamConv {
            conv: conv_trampoline,
            appdata_ptr: &*slot as *const ConvSlot as *mut c_void,
        };

        let mut pamh: *mut PamHandle = std::ptr::null_mut();
        let code = unsafe {
            match &confdir {
                Some(dir) => pam_start_confdir(
                    service.as_ptr(),
                    user.as_ptr(),
                    &conv,
                    dir.as_ptr(),
                    &mut pamh,
                ),
                None => pam_start(service.as_ptr(), user.as_ptr(), &conv, &mut pamh),
            }
        };

        let code = Code::from_native(code as u32);
        if code != Code::Success {
            return Err(code);
        }
        if pamh.is_null() {
            fatal("pam_start() reported success but returned no handle");
        }
        Ok(LibPamSession { pamh, slot })
    }

    fn end(&self, session: &Self::Session, disposition: Code) {
        unsafe {
            pam_end(session.pamh, disposition as c_int);
        }
    }

    fn authenticate(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.with_conv(session, conv, || {
            Code::from_native(unsafe { pam_authenticate(session.pamh, flags as c_int) } as u32)
        })
    }

    fn acct_mgmt(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.with_conv(session, conv, || {
            Code::from_native(unsafe { pam_acct_mgmt(session.pamh, flags as c_int) } as u32)
        })
    }

    fn setcred(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.with_conv(session, conv, || {
            Code::from_native(unsafe { pam_setcred(session.pamh, flags as c_int) } as u32)
        })
    }

    fn open_session(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.with_conv(session, conv, || {
            Code::from_native(unsafe { pam_open_session(session.pamh, flags as c_int) } as u32)
        })
    }

    fn close_session(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.with_conv(session, conv, || {
            Code::from_native(unsafe { pam_close_session(session.pamh, flags as c_int) } as u32)
        })
    }

    fn chauthtok(&self, session: &Self::Session, flags: u32, conv: &dyn Converse) -> Code {
        self.with_conv(session, conv, || {
            Code::from_native(unsafe { pam_chauthtok(session.pamh, flags as c_int) } as u32)
        })
    }

    fn get_item(
        &self,
        session: &Self::Session,
        item: ItemKind,
    ) -> std::result::Result<Option<String>, Code> {
        let mut value: *const c_void = std::ptr::null();
        let code = unsafe { pam_get_item(session.pamh, item.raw() as c_int, &mut value) };
        let code = Code::from_native(code as u32);
        if code != Code::Success {
            return Err(code);
        }
        if value.is_null() {
            return Ok(None);
        }
        let text = unsafe { CStr::from_ptr(value as *const c_char) };
        Ok(Some(text.to_string_lossy().into_owned()))
    }

    fn set_item(&self, session: &Self::Session, item: ItemKind, value: &str) -> Code {
        let value = match cstring(value, item.name()) {
            Ok(value) => value,
            Err(code) => return code,
        };
        Code::from_native(unsafe {
            pam_set_item(session.pamh, item.raw() as c_int, value.as_ptr() as *const c_void)
        } as u32)
    }

    fn getenv(&self, session: &Self::Session, name: &str) -> Option<String> {
        let name = cstring(name, "environment variable name").ok()?;
        let value = unsafe { pam_getenv(session.pamh, name.as_ptr()) };
        if value.is_null() {
            return None;
        }
        let text = unsafe { CStr::from_ptr(value) };
        Some(text.to_string_lossy().into_owned())
    }

    fn putenv(&self, session: &Self::Session, entry: &str) -> Code {
        let entry = match cstring(entry, "environment entry") {
            Ok(entry) => entry,
            Err(code) => return code,
        };
        Code::from_native(unsafe { pam_putenv(session.pamh, entry.as_ptr()) } as u32)
    }

    fn env_list(&self, session: &Self::Session) -> Vec<(String, String)> {
        let list = unsafe { pam_getenvlist(session.pamh) };
        if list.is_null() {
            return Vec::new();
        }

        let mut entries = Vec::new();
        let mut index = 0;
        unsafe {
            loop {
                let entry = *list.add(index);
                if entry.is_null() {
                    break;
                }
                let text = CStr::from_ptr(entry).to_string_lossy().into_owned();
                libc::free(entry as *mut c_void);
                if let Some((name, value)) = text.split_once('=') {
                    if !value.is_empty() {
                        entries.push((name.to_string(), value.to_string()));
                    }
                }
                index += 1;
            }
            libc::free(list as *mut c_void);
        }
        entries
    }

    fn fail_delay(&self, session: &Self::Session, usec: u32) -> Code {
        Code::from_native(unsafe { pam_fail_delay(session.pamh, usec) } as u32)
    }

    fn strerror(&self, code: Code) -> String {
        // linux-pam ignores the handle argument
        let text = unsafe { pam_strerror(std::ptr::null(), code as c_int) };
        if text.is_null() {
            return code.description().to_string();
        }
        unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
    }
}
