use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendKind, Setup, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{Descriptor, Event, Interest, Token};
use crate::registry::Registry;
use crate::utils::split_micros;

use super::WakePipe;

/// Descriptor values `select(2)` can address.
pub(crate) const SELECT_CAPACITY: usize = libc::FD_SETSIZE as usize;

#[derive(Clone, Copy)]
struct FdSet(libc::fd_set);

impl FdSet {
    fn new() -> FdSet {
        // Safety: an all-zero fd_set is a valid value, FD_ZERO makes it empty.
        unsafe {
            let mut set: libc::fd_set = mem::zeroed();
            libc::FD_ZERO(&mut set);
            FdSet(set)
        }
    }

    // Callers guarantee `0 <= fd < SELECT_CAPACITY`.
    fn insert(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.0) }
    }

    fn remove(&mut self, fd: RawFd) {
        unsafe { libc::FD_CLR(fd, &mut self.0) }
    }

    fn contains(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

fn in_capacity(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < SELECT_CAPACITY
}

pub(crate) struct SelectSetup {
    batch: usize,
    capacity: usize,
}

impl Setup for SelectSetup {
    type Backend = Select;

    fn create(config: &PollerConfig) -> Result<Self> {
        Ok(SelectSetup {
            batch: config.batch_size(),
            capacity: config.capacity.min(SELECT_CAPACITY),
        })
    }

    fn init(self) -> Result<Select> {
        let waker = WakePipe::new().map_err(|e| Error::resource(BackendKind::Select, e))?;
        if !in_capacity(waker.reader()) {
            return Err(Error::resource(
                BackendKind::Select,
                io::Error::new(
                    io::ErrorKind::Other,
                    "wakeup descriptor does not fit into select sets",
                ),
            ));
        }

        let mut read = FdSet::new();
        read.insert(waker.reader());

        tracing::debug!(waker = waker.reader(), "select poller initialized");

        Ok(Select {
            registry: Registry::with_capacity(self.capacity),
            read,
            write: FdSet::new(),
            error: FdSet::new(),
            max_fd: waker.reader(),
            waker: Arc::new(waker),
            ready: Vec::with_capacity(self.batch.min(SELECT_CAPACITY)),
            cursor: 0,
            batch: self.batch,
        })
    }
}

///
/// `select(2)` multiplexer, the fallback of every unix platform.
pub(crate) struct Select {
    registry: Registry,
    /// Live sets, copied before every wait.
    read: FdSet,
    write: FdSet,
    error: FdSet,
    max_fd: RawFd,
    waker: Arc<WakePipe>,
    /// Ready descriptors of the current call, tagged with their scan position.
    ready: Vec<(usize, Event)>,
    /// Scan position the next dispatch starts from.
    cursor: usize,
    batch: usize,
}

impl Select {
    fn apply(&mut self, fd: RawFd, interest: Interest) {
        if interest.is_readable() {
            self.read.insert(fd);
        } else {
            self.read.remove(fd);
        }
        if interest.is_writable() {
            self.write.insert(fd);
        } else {
            self.write.remove(fd);
        }
        if interest.is_error() {
            self.error.insert(fd);
        } else {
            self.error.remove(fd);
        }
    }

    fn recompute_max_fd(&mut self) {
        self.max_fd = self
            .registry
            .iter()
            .map(|(_, entry)| entry.descriptor)
            .fold(self.waker.reader(), RawFd::max);
    }
}

impl Backend for Select {
    fn kind(&self) -> BackendKind {
        BackendKind::Select
    }

    fn add(&mut self, fd: Descriptor, interest: Interest, token: Token) -> Result<()> {
        if !in_capacity(fd) {
            return Err(Error::CapacityExceeded {
                descriptor: fd,
                capacity: SELECT_CAPACITY,
            });
        }
        // One closed descriptor fails the whole wait with EBADF.
        if let Err(e) = syscall!(fcntl(fd, libc::F_GETFD)) {
            return Err(if self.registry.contains(fd) {
                Error::AlreadyRegistered(fd)
            } else {
                Error::unsupported(fd, e)
            });
        }
        self.registry.insert(fd, interest, token)?;
        self.apply(fd, interest);
        self.max_fd = self.max_fd.max(fd);

        tracing::trace!(descriptor = fd, ?interest, "select: registered");
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> Result<()> {
        let entry = self
            .registry
            .lookup_mut(fd)
            .ok_or(Error::NotRegistered(fd))?;
        entry.interest = interest;
        self.apply(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: Descriptor) -> Result<()> {
        self.registry.remove(fd)?;
        self.apply(fd, Interest::NONE);
        if fd == self.max_fd {
            self.recompute_max_fd();
        }

        tracing::trace!(descriptor = fd, "select: deregistered");
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(&Event),
    ) -> Result<usize> {
        // select(2) overwrites the sets it is given.
        let mut read = self.read;
        let mut write = self.write;
        let mut error = self.error;

        let mut tv = timeout.map(|t| {
            let (secs, micros) = split_micros(t, libc::time_t::MAX as u64);
            libc::timeval {
                tv_sec: secs as libc::time_t,
                tv_usec: micros as libc::suseconds_t,
            }
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

        let res = syscall!(select(
            self.max_fd + 1,
            &mut read.0,
            &mut write.0,
            &mut error.0,
            tv_ptr
        ));
        let n = match res {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Facility(e)),
        };
        if n == 0 {
            return Ok(0);
        }

        if read.contains(self.waker.reader()) {
            self.waker.drain();
        }

        self.ready.clear();
        for (position, (_, entry)) in self.registry.iter().enumerate() {
            let fd = entry.descriptor;
            let mut ready = Interest::NONE;
            if read.contains(fd) {
                ready |= Interest::READ;
            }
            if write.contains(fd) {
                ready |= Interest::WRITE;
            }
            if error.contains(fd) {
                ready |= Interest::ERROR;
            }
            if !ready.is_empty() {
                self.ready
                    .push((position, Event::readiness(fd, entry.token, ready)));
            }
        }

        // Start where the previous truncated batch stopped, so every ready
        // descriptor is eventually reported.
        let split = self
            .ready
            .iter()
            .position(|(position, _)| *position >= self.cursor)
            .unwrap_or(self.ready.len());
        let mut dispatched = 0;
        for (position, event) in self.ready[split..].iter().chain(self.ready[..split].iter()) {
            if dispatched == self.batch {
                break;
            }
            callback(event);
            dispatched += 1;
            self.cursor = position + 1;
        }
        if dispatched < self.batch {
            self.cursor = 0;
        }

        Ok(dispatched)
    }

    fn waker(&self) -> Arc<dyn Wake> {
        self.waker.clone()
    }

    fn is_registered(&self, fd: Descriptor) -> bool {
        self.registry.contains(fd)
    }

    fn len(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for Select {
    fn drop(&mut self) {
        tracing::debug!(registered = self.registry.len(), "select poller destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn capacity_is_checked_before_any_state_changes() {
        let mut select = SelectSetup::create(&PollerConfig::default())
            .unwrap()
            .init()
            .unwrap();
        let before = select.max_fd;

        let err = select
            .add(SELECT_CAPACITY as RawFd, Interest::READ, Token(0))
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { capacity, .. } if capacity == SELECT_CAPACITY));
        assert!(matches!(
            select.add(-1, Interest::READ, Token(0)),
            Err(Error::CapacityExceeded { .. })
        ));
        assert_eq!(select.max_fd, before);
        assert_eq!(select.len(), 0);
    }

    #[test]
    fn max_fd_tracks_removals() {
        let mut select = SelectSetup::create(&PollerConfig::default())
            .unwrap()
            .init()
            .unwrap();
        let base = select.waker.reader();
        let (a, b) = UnixStream::pair().unwrap();
        let low = a.as_raw_fd().min(b.as_raw_fd());
        let high = a.as_raw_fd().max(b.as_raw_fd());

        select.add(low, Interest::READ, Token(1)).unwrap();
        select.add(high, Interest::WRITE, Token(2)).unwrap();
        assert_eq!(select.max_fd, high);
        assert!(select.write.contains(high));

        select.remove(high).unwrap();
        assert_eq!(select.max_fd, low);
        assert!(!select.write.contains(high));

        select.remove(low).unwrap();
        assert_eq!(select.max_fd, base);
    }

    #[test]
    fn descriptors_that_are_not_open_are_rejected() {
        let mut select = SelectSetup::create(&PollerConfig::default())
            .unwrap()
            .init()
            .unwrap();
        let before = select.max_fd;
        let unopened = SELECT_CAPACITY as RawFd - 1;

        let err = select.add(unopened, Interest::READ, Token(0)).unwrap_err();
        assert!(matches!(err, Error::Unsupported { descriptor, .. } if descriptor == unopened));
        assert!(!select.read.contains(unopened));
        assert_eq!(select.max_fd, before);
        assert_eq!(select.len(), 0);
    }
}
