use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendKind, Setup, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{Descriptor, Event, Interest, Token};
use crate::registry::{Key, Registry};
use crate::syscore::{is_already_gone, WakePipe};
use crate::utils::timeout_millis;

/// User data of the wakeup pipe's record. Never produced by a registry key in
/// practice: it would need slot `u32::MAX` at generation `u32::MAX`.
const WAKE_DATA: u64 = u64::MAX;

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut flags = 0;
    if interest.is_readable() {
        flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }
    if interest.is_writable() {
        flags |= libc::EPOLLOUT;
    }
    flags as u32
}

fn epoll_to_ready(events: u32) -> Interest {
    let events = events as libc::c_int;
    let mut ready = Interest::NONE;
    if events & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready |= Interest::READ;
    }
    if events & libc::EPOLLOUT != 0 {
        ready |= Interest::WRITE;
    }
    if events & libc::EPOLLERR != 0 {
        ready |= Interest::ERROR;
    }
    if events & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        ready |= Interest::HANGUP;
    }
    ready
}

pub(crate) struct EpollSetup {
    batch: usize,
    capacity: usize,
}

impl Setup for EpollSetup {
    type Backend = Epoll;

    fn create(config: &PollerConfig) -> Result<Self> {
        Ok(EpollSetup {
            batch: config.batch_size(),
            capacity: config.capacity,
        })
    }

    fn init(self) -> Result<Epoll> {
        let resource = |e| Error::resource(BackendKind::Epoll, e);

        let epoll_fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC)).map_err(resource)?;
        // Safety: freshly created, owned by nobody else.
        let epoll_fd = unsafe { OwnedFd::from_raw_fd(epoll_fd) };

        let waker = WakePipe::new().map_err(resource)?;
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_DATA,
        };
        syscall!(epoll_ctl(
            epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            waker.reader(),
            &mut ev
        ))
        .map_err(resource)?;

        tracing::debug!(
            epoll_fd = epoll_fd.as_raw_fd(),
            batch = self.batch,
            "epoll poller initialized"
        );

        Ok(Epoll {
            epoll_fd,
            waker: Arc::new(waker),
            events: Vec::with_capacity(self.batch),
            registry: Registry::with_capacity(self.capacity),
        })
    }
}

///
/// `epoll(7)` multiplexer, level-triggered.
pub(crate) struct Epoll {
    epoll_fd: OwnedFd,
    waker: Arc<WakePipe>,
    /// Event batch of one wait.
    events: Vec<libc::epoll_event>,
    registry: Registry,
}

impl Epoll {
    fn ctl(&self, op: libc::c_int, fd: RawFd, flags: u32, key: Key) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: flags,
            u64: key.as_u64(),
        };
        syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut ev))?;
        Ok(())
    }
}

impl Backend for Epoll {
    fn kind(&self) -> BackendKind {
        BackendKind::Epoll
    }

    fn add(&mut self, fd: Descriptor, interest: Interest, token: Token) -> Result<()> {
        let key = self.registry.insert(fd, interest, token)?;

        if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, fd, interest_to_epoll(interest), key) {
            self.registry.remove(fd)?;
            return Err(match e.raw_os_error() {
                Some(libc::EPERM) => Error::unsupported(fd, e),
                Some(libc::EEXIST) => Error::AlreadyRegistered(fd),
                _ => Error::Facility(e),
            });
        }

        tracing::trace!(descriptor = fd, ?interest, "epoll: registered");
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> Result<()> {
        let key = self.registry.key_of(fd).ok_or(Error::NotRegistered(fd))?;
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest_to_epoll(interest), key)?;

        if let Some(entry) = self.registry.get_mut(key) {
            entry.interest = interest;
        }
        Ok(())
    }

    fn remove(&mut self, fd: Descriptor) -> Result<()> {
        let entry = self.registry.remove(fd)?;

        // Pre-2.6.9 kernels require a non-null event even for deletion.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        match syscall!(epoll_ctl(
            self.epoll_fd.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            &mut ev
        )) {
            Ok(_) => tracing::trace!(descriptor = fd, "epoll: deregistered"),
            Err(e) if is_already_gone(&e) => {
                tracing::trace!(descriptor = fd, error = %e, "epoll: descriptor already gone")
            }
            Err(e) => tracing::warn!(
                descriptor = fd,
                token = entry.token.0,
                error = %e,
                "epoll: deregistration failed, metadata released"
            ),
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(&Event),
    ) -> Result<usize> {
        self.events.clear();
        let res = syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as libc::c_int,
            timeout_millis(timeout)
        ));
        let n = match res {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Facility(e)),
        };
        // Safety: the kernel initialized the first `n` records.
        unsafe { self.events.set_len(n) };

        let mut dispatched = 0;
        for ev in &self.events {
            let (flags, data) = (ev.events, ev.u64);
            if data == WAKE_DATA {
                self.waker.drain();
                continue;
            }

            let Some(entry) = self.registry.get(Key::from_u64(data)) else {
                continue;
            };
            callback(&Event::readiness(
                entry.descriptor,
                entry.token,
                epoll_to_ready(flags),
            ));
            dispatched += 1;
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

impl Drop for Epoll {
    fn drop(&mut self) {
        tracing::debug!(
            epoll_fd = self.epoll_fd.as_raw_fd(),
            registered = self.registry.len(),
            "epoll poller destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_translation() {
        let flags = interest_to_epoll(Interest::READ | Interest::ERROR);
        assert_eq!(flags, (libc::EPOLLIN | libc::EPOLLRDHUP) as u32);
        assert_eq!(
            interest_to_epoll(Interest::WRITE),
            libc::EPOLLOUT as u32
        );
        assert_eq!(interest_to_epoll(Interest::NONE), 0);
    }

    #[test]
    fn readiness_translation() {
        assert_eq!(epoll_to_ready(libc::EPOLLIN as u32), Interest::READ);
        assert_eq!(
            epoll_to_ready((libc::EPOLLIN | libc::EPOLLRDHUP) as u32),
            Interest::READ | Interest::HANGUP
        );
        assert_eq!(
            epoll_to_ready((libc::EPOLLERR | libc::EPOLLHUP) as u32),
            Interest::ERROR | Interest::HANGUP
        );
        assert_eq!(epoll_to_ready(libc::EPOLLOUT as u32), Interest::WRITE);
    }

    #[test]
    fn regular_files_are_unsupported() {
        let mut epoll = EpollSetup::create(&PollerConfig::default())
            .unwrap()
            .init()
            .unwrap();
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();

        let err = epoll
            .add(file.as_raw_fd(), Interest::READ, Token(0))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        // Rolled back: the descriptor can be retried and is not tracked.
        assert!(!epoll.is_registered(file.as_raw_fd()));
    }
}
