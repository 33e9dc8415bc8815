//! # vhisper-ffi
//!
//! C ABI for the Vhisper voice input engine, for consumption by the host
//! shell (menu-bar app, hot-key monitor, text injector).
//!
//! ## Contract
//!
//! - Every exported function returns quickly and never blocks on the
//!   network; results arrive on the streaming callback from engine-owned
//!   worker threads.
//! - Strings passed to the callback are valid only for the duration of the
//!   call; the host must copy what it wants to keep.
//! - The callback must return promptly and must not call back into the
//!   engine.
//! - Return codes: `0` success, `-1` invalid handle, `-2` operation
//!   rejected (busy, invalid config). `vhisper_last_error` describes the
//!   most recent failure on the calling thread.
//! - `vhisper_destroy` cancels any in-flight streaming and waits for the
//!   worker tasks to observe the cancellation before freeing the handle.

#![allow(clippy::missing_safety_doc)]

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};

use once_cell::sync::Lazy;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use vhisper_config::Settings;
use vhisper_core::PipelineEvent;
use vhisper_pipeline::{EventCallback, VoicePipeline};

/// Process-wide runtime for all pipeline work. Created on first handle,
/// torn down with the process.
static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("vhisper-worker")
        .enable_all()
        .build()
        .expect("failed to build vhisper runtime")
});

/// Logging init, once per process. `VHISPER_LOG` selects the filter.
static TRACING: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::try_from_env("VHISPER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("vhisper=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
});

static VERSION: Lazy<CString> =
    Lazy::new(|| CString::new(env!("CARGO_PKG_VERSION")).unwrap_or_default());

thread_local! {
    /// Last failure message for the calling thread, readable through
    /// `vhisper_last_error`.
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: impl Into<Vec<u8>>) {
    let cstring = CString::new(message).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(cstring));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

// ============================================================================
// Opaque handle
// ============================================================================

/// Opaque handle to one pipeline instance.
///
/// Created by `vhisper_create`, freed by `vhisper_destroy`. Must not be used
/// after destroy. The handle itself may be shared across host threads; the
/// engine synchronizes internally.
#[repr(C)]
pub struct VhisperHandle(*mut c_void);

struct PipelineShell {
    pipeline: VoicePipeline,
}

impl VhisperHandle {
    fn from_boxed(shell: Box<PipelineShell>) -> *mut Self {
        let ptr = Box::into_raw(shell) as *mut c_void;
        Box::into_raw(Box::new(VhisperHandle(ptr)))
    }

    unsafe fn as_ref<'a>(handle: *mut Self) -> Option<&'a PipelineShell> {
        if handle.is_null() {
            return None;
        }
        let wrapper = &*handle;
        if wrapper.0.is_null() {
            return None;
        }
        Some(&*(wrapper.0 as *const PipelineShell))
    }

    unsafe fn into_boxed(handle: *mut Self) -> Option<Box<PipelineShell>> {
        if handle.is_null() {
            return None;
        }
        let wrapper = Box::from_raw(handle);
        if wrapper.0.is_null() {
            return None;
        }
        Some(Box::from_raw(wrapper.0 as *mut PipelineShell))
    }
}

// ============================================================================
// Streaming callback
// ============================================================================

/// Streaming event callback.
///
/// `event_type`: `0` partial, `1` final, `2` error. For partials `text` is
/// the confirmed prefix and `stash` the unconfirmed tail; finals carry only
/// `text`; errors carry only `error`. Unused parameters are null. All
/// strings are UTF-8, null-terminated, and valid only during the call.
pub type VhisperEventCallback = Option<
    unsafe extern "C" fn(
        ctx: *mut c_void,
        event_type: i32,
        text: *const c_char,
        stash: *const c_char,
        error: *const c_char,
    ),
>;

/// Send-safe wrapper for the C callback and its context pointer.
///
/// Safety: the host guarantees `ctx` stays valid until the terminal event of
/// the start-session (or cancel); function pointers are plain addresses.
struct CallbackShim {
    callback: unsafe extern "C" fn(*mut c_void, i32, *const c_char, *const c_char, *const c_char),
    ctx: *mut c_void,
}

unsafe impl Send for CallbackShim {}
unsafe impl Sync for CallbackShim {}

impl CallbackShim {
    fn invoke(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::Partial { confirmed, stash } => {
                let text = CString::new(confirmed.as_str()).unwrap_or_default();
                let stash = CString::new(stash.as_str()).unwrap_or_default();
                unsafe {
                    (self.callback)(self.ctx, 0, text.as_ptr(), stash.as_ptr(), std::ptr::null());
                }
            }
            PipelineEvent::Final { text } => {
                let text = CString::new(text.as_str()).unwrap_or_default();
                unsafe {
                    (self.callback)(self.ctx, 1, text.as_ptr(), std::ptr::null(), std::ptr::null());
                }
            }
            PipelineEvent::Error { message } => {
                let error = CString::new(message.as_str()).unwrap_or_default();
                unsafe {
                    (self.callback)(
                        self.ctx,
                        2,
                        std::ptr::null(),
                        std::ptr::null(),
                        error.as_ptr(),
                    );
                }
            }
        }
    }
}

// ============================================================================
// Exported functions
// ============================================================================

/// Parse `config_json` and construct a pipeline. Returns null on invalid
/// config (see `vhisper_last_error`).
#[no_mangle]
pub unsafe extern "C" fn vhisper_create(config_json: *const c_char) -> *mut VhisperHandle {
    Lazy::force(&TRACING);
    clear_last_error();

    if config_json.is_null() {
        set_last_error("config_json is null");
        return std::ptr::null_mut();
    }
    let json = match CStr::from_ptr(config_json).to_str() {
        Ok(json) => json,
        Err(_) => {
            set_last_error("config_json is not valid UTF-8");
            return std::ptr::null_mut();
        }
    };

    let settings = match Settings::from_json(json) {
        Ok(settings) => settings,
        Err(e) => {
            set_last_error(format!("invalid config: {e}"));
            return std::ptr::null_mut();
        }
    };

    let _guard = RUNTIME.enter();
    match VoicePipeline::new(settings) {
        Ok(pipeline) => VhisperHandle::from_boxed(Box::new(PipelineShell { pipeline })),
        Err(e) => {
            set_last_error(format!("pipeline construction failed: {e}"));
            std::ptr::null_mut()
        }
    }
}

/// Cancel any in-flight streaming, wait for workers, free the handle.
#[no_mangle]
pub unsafe extern "C" fn vhisper_destroy(handle: *mut VhisperHandle) {
    if let Some(shell) = VhisperHandle::into_boxed(handle) {
        RUNTIME.block_on(shell.pipeline.shutdown());
        drop(shell);
    }
}

/// Current state: `0` idle, `1` recording, `2` processing, `-1` invalid
/// handle. Lock-free.
#[no_mangle]
pub unsafe extern "C" fn vhisper_get_state(handle: *mut VhisperHandle) -> i32 {
    match VhisperHandle::as_ref(handle) {
        Some(shell) => shell.pipeline.state().as_i32(),
        None => -1,
    }
}

/// `1` iff the pipeline is recording or processing, `0` otherwise, `-1` on
/// an invalid handle.
#[no_mangle]
pub unsafe extern "C" fn vhisper_is_streaming(handle: *mut VhisperHandle) -> i32 {
    match VhisperHandle::as_ref(handle) {
        Some(shell) => i32::from(shell.pipeline.is_streaming()),
        None => -1,
    }
}

/// Begin streaming. Returns `0` once the pipeline has flipped to recording;
/// device and connection failures arrive asynchronously as one error event.
#[no_mangle]
pub unsafe extern "C" fn vhisper_start_streaming(
    handle: *mut VhisperHandle,
    callback: VhisperEventCallback,
    ctx: *mut c_void,
) -> i32 {
    clear_last_error();
    let Some(shell) = VhisperHandle::as_ref(handle) else {
        return -1;
    };
    let Some(callback) = callback else {
        set_last_error("callback is null");
        return -2;
    };

    let shim = CallbackShim { callback, ctx };
    let event_callback: EventCallback = Arc::new(move |event| shim.invoke(&event));

    match shell.pipeline.start_streaming(event_callback) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e.to_string());
            -2
        }
    }
}

/// End the utterance; the terminal final arrives on the callback. A no-op
/// unless recording.
#[no_mangle]
pub unsafe extern "C" fn vhisper_stop_streaming(handle: *mut VhisperHandle) -> i32 {
    match VhisperHandle::as_ref(handle) {
        Some(shell) => {
            shell.pipeline.stop_streaming();
            0
        }
        None => -1,
    }
}

/// Abort from any state. No callback fires after this returns.
#[no_mangle]
pub unsafe extern "C" fn vhisper_cancel_streaming(handle: *mut VhisperHandle) -> i32 {
    match VhisperHandle::as_ref(handle) {
        Some(shell) => {
            shell.pipeline.cancel_streaming();
            0
        }
        None => -1,
    }
}

/// Replace the configuration. Rejected unless idle.
#[no_mangle]
pub unsafe extern "C" fn vhisper_update_config(
    handle: *mut VhisperHandle,
    config_json: *const c_char,
) -> i32 {
    clear_last_error();
    let Some(shell) = VhisperHandle::as_ref(handle) else {
        return -1;
    };
    if config_json.is_null() {
        set_last_error("config_json is null");
        return -2;
    }
    let json = match CStr::from_ptr(config_json).to_str() {
        Ok(json) => json,
        Err(_) => {
            set_last_error("config_json is not valid UTF-8");
            return -2;
        }
    };
    let settings = match Settings::from_json(json) {
        Ok(settings) => settings,
        Err(e) => {
            set_last_error(format!("invalid config: {e}"));
            return -2;
        }
    };
    match shell.pipeline.update_config(settings) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e.to_string());
            -2
        }
    }
}

/// Free a string the engine returned to the host.
#[no_mangle]
pub unsafe extern "C" fn vhisper_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Semantic version of the engine. Static storage; do not free.
#[no_mangle]
pub extern "C" fn vhisper_version() -> *const c_char {
    VERSION.as_ptr()
}

/// Message for the most recent failure on the calling thread, or null.
/// Owned by the engine; valid until the next failing call on this thread.
#[no_mangle]
pub extern "C" fn vhisper_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|message| message.as_ptr())
            .unwrap_or(std::ptr::null())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"{ "asr": { "provider": "FunAsr", "funasr": {} } }"#;

    fn c_string(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn test_create_and_destroy() {
        let config = c_string(VALID_CONFIG);
        let handle = unsafe { vhisper_create(config.as_ptr()) };
        assert!(!handle.is_null());
        assert_eq!(unsafe { vhisper_get_state(handle) }, 0);
        assert_eq!(unsafe { vhisper_is_streaming(handle) }, 0);
        unsafe { vhisper_destroy(handle) };
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let config = c_string(r#"{ "asr": { "provider": "Sphinx" } }"#);
        let handle = unsafe { vhisper_create(config.as_ptr()) };
        assert!(handle.is_null());
        assert!(!vhisper_last_error().is_null());

        let handle = unsafe { vhisper_create(std::ptr::null()) };
        assert!(handle.is_null());
    }

    #[test]
    fn test_invalid_handle_codes() {
        let null = std::ptr::null_mut();
        assert_eq!(unsafe { vhisper_get_state(null) }, -1);
        assert_eq!(unsafe { vhisper_is_streaming(null) }, -1);
        assert_eq!(unsafe { vhisper_stop_streaming(null) }, -1);
        assert_eq!(unsafe { vhisper_cancel_streaming(null) }, -1);
        assert_eq!(unsafe { vhisper_start_streaming(null, None, std::ptr::null_mut()) }, -1);
    }

    #[test]
    fn test_update_config_codes() {
        let config = c_string(VALID_CONFIG);
        let handle = unsafe { vhisper_create(config.as_ptr()) };
        assert!(!handle.is_null());

        let good = c_string(VALID_CONFIG);
        assert_eq!(unsafe { vhisper_update_config(handle, good.as_ptr()) }, 0);

        let bad = c_string(r#"{ "asr": { "provider": "Qwen" } }"#);
        assert_eq!(unsafe { vhisper_update_config(handle, bad.as_ptr()) }, -2);
        assert!(!vhisper_last_error().is_null());

        unsafe { vhisper_destroy(handle) };
    }

    #[test]
    fn test_null_callback_rejected() {
        let config = c_string(VALID_CONFIG);
        let handle = unsafe { vhisper_create(config.as_ptr()) };
        assert_eq!(
            unsafe { vhisper_start_streaming(handle, None, std::ptr::null_mut()) },
            -2
        );
        unsafe { vhisper_destroy(handle) };
    }

    #[test]
    fn test_version_is_semver() {
        let version = unsafe { CStr::from_ptr(vhisper_version()) };
        let text = version.to_str().unwrap();
        assert_eq!(text.split('.').count(), 3);
    }

    #[test]
    fn test_string_free_accepts_null() {
        unsafe { vhisper_string_free(std::ptr::null_mut()) };
    }
}
