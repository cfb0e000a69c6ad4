//! Hadron is a cross-platform I/O multiplexer.
//!
//! One [`Poller`] API drives the readiness facilities of every platform
//! (`epoll`, `kqueue`, `select`), Windows I/O completion ports, and Linux
//! `io_uring` poll operations. With [`BackendKind::Auto`] the best backend of
//! the platform is picked at runtime, falling back in [`fallback_chain`]
//! order when a facility cannot be acquired.
//!
//! Readiness backends are level-triggered: a descriptor that is still ready
//! is reported again by the next poll. The one exception is opt-in, io_uring
//! with [`IoUringConfiguration::multishot`] set, which reports a descriptor
//! only when its state changes. Registrations are keyed by raw descriptor
//! values; every event carries the [`Token`] given at registration.

#[cfg(not(any(unix, windows)))]
compile_error!("Target OS is not supported");

#[cfg(unix)]
macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod backend;
mod config;
mod error;
mod event;
mod poller;
mod registry;
mod utils;

mod syscore {
    #[cfg(unix)]
    mod unix;
    #[cfg(unix)]
    pub(crate) use unix::*;

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
    mod linux;
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
    pub(crate) use linux::*;

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    mod bsd;
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    pub(crate) use bsd::*;

    #[cfg(windows)]
    mod windows;
    #[cfg(windows)]
    pub(crate) use windows::*;
}

pub use backend::{fallback_chain, BackendKind};
pub use config::{IoUringConfiguration, PollerConfig, DEFAULT_MAX_BATCH};
pub use error::{Error, Result};
pub use event::{CompletionMarker, Descriptor, Event, EventKind, Interest, Token};
pub use poller::{Poller, Waker};
