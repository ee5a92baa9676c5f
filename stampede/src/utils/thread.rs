#![allow(unused)]

use anyhow::{Result, anyhow};
use std::ffi::CStr;

// pthread names are capped at 16 bytes, including the null terminator.
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Names the calling thread. Pool threads get their name through
/// `thread::Builder`; this is for the embedding thread serving as worker 0.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is zero-initialized, so it stays null-terminated as long as
    // we write at most MAX_PTHREAD_NAME_LEN - 1 bytes.
    let mut buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for (dst, src) in buf.iter_mut().zip(&bytes[..len]) {
        *dst = *src as libc::c_char;
    }

    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Reads the calling thread's name back through `pthread_getname_np`.
#[cfg(target_os = "linux")]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(libc::pthread_self(), buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };
    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    let c_str = unsafe { CStr::from_ptr(buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("thread name is not valid UTF-8: {e}"))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    Err(anyhow!("thread names are not supported on this platform"))
}
