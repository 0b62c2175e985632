//! Installs a SIGSEGV handler that prints a backtrace before aborting.
//!
//! Rust's default segfault behavior produces no diagnostic at all; this mirrors the panic
//! hook's backtrace output so a crash during FFI or unsafe RPC parsing is still debuggable.

/// Installs the handler. No-op on platforms other than unix.
pub fn install() {
    #[cfg(unix)]
    imp::install();
}

#[cfg(unix)]
mod imp {
    use std::io::Write;

    pub fn install() {
        // SAFETY: replaces the default SIGSEGV disposition with a handler that only calls
        // async-signal-safe functions (write(2)) before re-raising the default action.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(libc::SIGSEGV, &sa, std::ptr::null_mut());
        }
    }

    extern "C" fn handler(_sig: libc::c_int) {
        let _ = std::io::stderr().write_all(b"ekko-supervisor: segmentation fault, aborting\n");
        // SAFETY: restores the default disposition and re-raises so the process exits with
        // the expected signal, rather than looping back into this handler.
        unsafe {
            libc::signal(libc::SIGSEGV, libc::SIG_DFL);
            libc::raise(libc::SIGSEGV);
        }
    }
}
