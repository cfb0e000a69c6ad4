use crate::backend::BackendKind;

/// Batch size used when [`PollerConfig::max_batch`] is zero.
pub const DEFAULT_MAX_BATCH: usize = 256;

///
/// Hadron's multiplexer configuration.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Backend to use.
    ///
    /// **[default]**: [`BackendKind::Auto`], which tries the platform's
    /// candidates in order and keeps the first that initializes.
    pub backend: BackendKind,

    /// Upper bound of OS event records fetched, and of callbacks dispatched,
    /// by one `poll` call. Events beyond it are reported by the next call.
    ///
    /// **[default]**: `0`, meaning [`DEFAULT_MAX_BATCH`].
    pub max_batch: usize,

    /// Expected number of registered descriptors. Only presizes the
    /// descriptor registry; it is not a limit.
    ///
    /// **[default]**: 64.
    pub capacity: usize,

    /// **IO_URING Configuration** allows you to configure [io_uring](https://unixism.net/loti/what_is_io_uring.html) backend.
    pub iouring: IoUringConfiguration,
}

impl PollerConfig {
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_iouring(mut self, iouring: IoUringConfiguration) -> Self {
        self.iouring = iouring;
        self
    }

    /// Batch size with the zero default resolved.
    pub fn batch_size(&self) -> usize {
        if self.max_batch == 0 {
            DEFAULT_MAX_BATCH
        } else {
            self.max_batch
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            max_batch: 0,
            capacity: 1 << 6,
            iouring: IoUringConfiguration::default(),
        }
    }
}

/// **IO_URING Configuration**
/// 5.13+ Kernel is required for multishot poll registrations.
#[derive(Clone, Debug)]
pub struct IoUringConfiguration {
    /// Allowed entries in both submission and completion queues.
    ///
    /// **[default]**: By default this value is 2048.
    pub queue_len: u32,

    /// Request stays-armed (multishot) poll registrations.
    ///
    /// Multishot saves a resubmission per notification, but a descriptor is
    /// then reported only when its state changes, unlike the level-triggered
    /// backends. A kernel that rejects them makes the ring fall back to
    /// single-shot registrations, resubmitted after every notification.
    ///
    /// **[default]**: `false`.
    pub multishot: bool,
}

impl Default for IoUringConfiguration {
    fn default() -> Self {
        Self {
            queue_len: 1 << 11,
            multishot: false,
        }
    }
}
