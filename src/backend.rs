use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{CompletionMarker, Descriptor, Event, Interest, Token};

///
/// Concrete multiplexer implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// Pick the best backend of the platform, falling back in order.
    #[default]
    Auto,
    /// Readiness, `epoll(7)`.
    Epoll,
    /// Readiness, `kqueue(2)`.
    Kqueue,
    /// Readiness, `select(2)`. Available everywhere, capacity bound.
    Select,
    /// Completion, I/O completion ports.
    Iocp,
    /// Hybrid, `io_uring(7)` poll operations.
    IoUring,
}

impl BackendKind {
    /// Display name of the backend.
    pub const fn name(self) -> &'static str {
        match self {
            BackendKind::Auto => "auto",
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::Select => "select",
            BackendKind::Iocp => "iocp",
            BackendKind::IoUring => "io_uring",
        }
    }

    pub const fn is_completion_based(self) -> bool {
        matches!(self, BackendKind::Iocp)
    }

    /// Whether this backend is compiled for the current platform.
    pub fn is_supported(self) -> bool {
        match self {
            BackendKind::Auto => true,
            kind => fallback_chain().contains(&kind),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "epoll" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "select" => Ok(BackendKind::Select),
            "iocp" => Ok(BackendKind::Iocp),
            "io_uring" | "iouring" | "uring" => Ok(BackendKind::IoUring),
            _ => Err(Error::InvalidBackendName(s.to_owned())),
        }
    }
}

///
/// Platform-ordered candidates tried by [`BackendKind::Auto`].
pub fn fallback_chain() -> &'static [BackendKind] {
    #[cfg(all(target_os = "linux", feature = "iouring"))]
    {
        &[BackendKind::IoUring, BackendKind::Epoll, BackendKind::Select]
    }
    #[cfg(any(
        all(target_os = "linux", not(feature = "iouring")),
        target_os = "android",
        target_os = "illumos"
    ))]
    {
        &[BackendKind::Epoll, BackendKind::Select]
    }
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))]
    {
        &[BackendKind::Kqueue, BackendKind::Select]
    }
    #[cfg(windows)]
    {
        &[BackendKind::Iocp, BackendKind::Select]
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "illumos",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
        windows,
    )))]
    {
        &[BackendKind::Select]
    }
}

///
/// Cross-thread half of a wakeup channel.
pub(crate) trait Wake: Send + Sync {
    /// Forces a blocked or the next `poll` to return. Never blocks; repeated
    /// calls before the poller observes them collapse into one.
    fn wake(&self) -> Result<()>;
}

///
/// Two-phase construction of a backend.
///
/// `create` validates the configuration and allocates in-memory state only;
/// `init` acquires the OS facility and the wakeup channel. Keeping them apart
/// lets callers tell construction failures from resource failures.
pub(crate) trait Setup: Sized {
    type Backend: Backend + 'static;

    fn create(config: &PollerConfig) -> Result<Self>;

    fn init(self) -> Result<Self::Backend>;
}

///
/// Operations every multiplexer implements. Owned and driven by one thread;
/// only the [`Wake`] half is shared.
pub(crate) trait Backend: Send {
    fn kind(&self) -> BackendKind;

    fn add(&mut self, descriptor: Descriptor, interest: Interest, token: Token) -> Result<()>;

    fn modify(&mut self, descriptor: Descriptor, interest: Interest) -> Result<()>;

    fn remove(&mut self, descriptor: Descriptor) -> Result<()>;

    /// Waits for events and dispatches each one to `callback`. Returns the
    /// number of dispatched events.
    fn poll(&mut self, timeout: Option<Duration>, callback: &mut dyn FnMut(&Event))
        -> Result<usize>;

    fn waker(&self) -> std::sync::Arc<dyn Wake>;

    fn is_registered(&self, descriptor: Descriptor) -> bool;

    fn len(&self) -> usize;

    /// Injects a completion for a registered descriptor. Completion backends
    /// only.
    fn post(&mut self, descriptor: Descriptor, _marker: CompletionMarker, _bytes: u32) -> Result<()> {
        Err(Error::unsupported(
            descriptor,
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "completions can only be posted to a completion backend",
            ),
        ))
    }
}

/// Creates and initializes one backend of the given kind.
pub(crate) fn open(kind: BackendKind, config: &PollerConfig) -> Result<Box<dyn Backend>> {
    fn build<S: Setup>(config: &PollerConfig) -> Result<Box<dyn Backend>> {
        let backend = S::create(config)?.init()?;
        Ok(Box::new(backend))
    }

    match kind {
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
        BackendKind::Epoll => build::<crate::syscore::EpollSetup>(config),
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))]
        BackendKind::Kqueue => build::<crate::syscore::KqueueSetup>(config),
        #[cfg(all(target_os = "linux", feature = "iouring"))]
        BackendKind::IoUring => build::<crate::syscore::IoUringSetup>(config),
        #[cfg(windows)]
        BackendKind::Iocp => build::<crate::syscore::IocpSetup>(config),
        BackendKind::Select => build::<crate::syscore::SelectSetup>(config),
        kind => Err(Error::Configuration { kind }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for &kind in fallback_chain() {
            assert_eq!(kind.name().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!(" IOURING ".parse::<BackendKind>().unwrap(), BackendKind::IoUring);
        assert!(matches!(
            "devpoll".parse::<BackendKind>(),
            Err(Error::InvalidBackendName(_))
        ));
    }

    #[test]
    fn select_is_always_last_resort() {
        let chain = fallback_chain();
        assert_eq!(chain.last(), Some(&BackendKind::Select));
        assert!(BackendKind::Select.is_supported());
        assert!(BackendKind::Auto.is_supported());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn foreign_backends_are_rejected() {
        assert!(!BackendKind::Iocp.is_supported());
        assert!(!BackendKind::Kqueue.is_supported());
        let err = open(BackendKind::Iocp, &PollerConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Configuration { kind: BackendKind::Iocp }));
    }
}
