use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{self, fallback_chain, Backend, BackendKind, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{CompletionMarker, Descriptor, Event, Interest, Token};

///
/// I/O multiplexer over the best backend of the platform.
///
/// A `Poller` is driven by a single thread: every operation except waking
/// takes `&mut self`. Other threads interrupt a blocked [`Poller::poll`]
/// through a [`Waker`].
///
/// ```no_run
/// use std::time::Duration;
/// use hadron::{Interest, Poller, PollerConfig, Token};
///
/// # fn main() -> hadron::Result<()> {
/// let (reader, _writer) = std::os::unix::net::UnixStream::pair()?;
/// # use std::os::unix::io::AsRawFd;
/// let mut poller = Poller::new(PollerConfig::default())?;
/// poller.add(reader.as_raw_fd(), Interest::READ, Token(7))?;
///
/// poller.poll(Some(Duration::from_millis(100)), |event| {
///     println!("{:?} is ready: {:?}", event.token(), event.ready());
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct Poller {
    backend: Box<dyn Backend>,
}

impl Poller {
    /// Creates a multiplexer for [`PollerConfig::backend`].
    ///
    /// [`BackendKind::Auto`] tries every candidate of [`fallback_chain`] in
    /// order and keeps the first that initializes. An explicit backend is
    /// used as is, with no fallback.
    pub fn new(config: PollerConfig) -> Result<Poller> {
        Poller::with_opener(config, backend::open)
    }

    pub(crate) fn with_opener<F>(config: PollerConfig, opener: F) -> Result<Poller>
    where
        F: Fn(BackendKind, &PollerConfig) -> Result<Box<dyn Backend>>,
    {
        let backend = match config.backend {
            BackendKind::Auto => Poller::select_backend(&config, fallback_chain(), opener)?,
            kind if !kind.is_supported() => return Err(Error::Configuration { kind }),
            kind => opener(kind, &config)?,
        };

        tracing::debug!(backend = %backend.kind(), "poller created");
        Ok(Poller { backend })
    }

    fn select_backend<F>(
        config: &PollerConfig,
        candidates: &[BackendKind],
        opener: F,
    ) -> Result<Box<dyn Backend>>
    where
        F: Fn(BackendKind, &PollerConfig) -> Result<Box<dyn Backend>>,
    {
        let mut attempted = Vec::with_capacity(candidates.len());
        let mut last = Error::Configuration {
            kind: BackendKind::Auto,
        };

        for &kind in candidates {
            attempted.push(kind);
            match opener(kind, config) {
                Ok(backend) => return Ok(backend),
                Err(e) => {
                    tracing::debug!(backend = %kind, error = %e, "backend unavailable, falling back");
                    last = e;
                }
            }
        }

        Err(Error::NoBackend {
            attempted,
            last: Box::new(last),
        })
    }

    /// Backends compiled for this platform, in fallback order.
    pub fn available() -> &'static [BackendKind] {
        fallback_chain()
    }

    /// Backend serving this instance, never [`BackendKind::Auto`].
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Name of the backend serving this instance.
    pub fn name(&self) -> &'static str {
        self.backend.kind().name()
    }

    /// Whether events of this instance are completions rather than readiness.
    pub fn is_completion_based(&self) -> bool {
        self.backend.kind().is_completion_based()
    }

    /// Registers `descriptor` for `interest`. Events of the descriptor carry
    /// `token`.
    ///
    /// Fails with [`Error::AlreadyRegistered`] for a descriptor this instance
    /// already watches; a failed call leaves no trace of the descriptor.
    pub fn add(&mut self, descriptor: Descriptor, interest: Interest, token: Token) -> Result<()> {
        self.backend.add(descriptor, interest, token)
    }

    /// Replaces the interest of a registered descriptor. The token is kept.
    pub fn modify(&mut self, descriptor: Descriptor, interest: Interest) -> Result<()> {
        self.backend.modify(descriptor, interest)
    }

    /// Stops watching `descriptor`.
    ///
    /// Metadata is always released, even if the OS side of the
    /// deregistration fails. No event of the descriptor is dispatched after
    /// this returns.
    pub fn remove(&mut self, descriptor: Descriptor) -> Result<()> {
        self.backend.remove(descriptor)
    }

    /// Waits for events and hands each one to `callback`.
    ///
    /// `None` blocks until an event or a wakeup, `Some(Duration::ZERO)`
    /// checks without blocking. At most [`PollerConfig::max_batch`] events
    /// are dispatched per call. Returns the number of dispatched events; zero
    /// on timeout, wakeup or signal interruption.
    ///
    /// Readiness is level-triggered on every backend unless io_uring runs
    /// with [`IoUringConfiguration::multishot`](crate::IoUringConfiguration::multishot),
    /// where a descriptor left ready without being drained is not reported
    /// again until its state changes.
    pub fn poll<F>(&mut self, timeout: Option<Duration>, mut callback: F) -> Result<usize>
    where
        F: FnMut(&Event),
    {
        self.backend.poll(timeout, &mut callback)
    }

    /// Interrupts a blocked or the next [`Poller::poll`].
    pub fn wakeup(&self) -> Result<()> {
        self.backend.waker().wake()
    }

    /// Handle waking this poller from other threads.
    pub fn waker(&self) -> Waker {
        Waker {
            inner: self.backend.waker(),
        }
    }

    /// Queues a completion for a registered descriptor.
    ///
    /// Only completion backends accept it; the others report
    /// [`Error::Unsupported`].
    pub fn post(&mut self, descriptor: Descriptor, marker: CompletionMarker, bytes: u32) -> Result<()> {
        self.backend.post(descriptor, marker, bytes)
    }

    pub fn is_registered(&self, descriptor: Descriptor) -> bool {
        self.backend.is_registered(descriptor)
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("backend", &self.kind())
            .field("registered", &self.len())
            .finish()
    }
}

///
/// Cross-thread wakeup handle of a [`Poller`].
///
/// Wakes are non-blocking and coalesce: any number of them before the poller
/// observes one end a single `poll` call.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<dyn Wake>,
}

impl Waker {
    pub fn wake(&self) -> Result<()> {
        self.inner.wake()
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}
