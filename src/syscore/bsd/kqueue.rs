use std::collections::hash_map::Entry;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};

use crate::backend::{Backend, BackendKind, Setup, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{Descriptor, Event, Interest, Token};
use crate::registry::{Key, Registry};
use crate::syscore::{is_already_gone, WakePipe};

#[cfg(not(target_os = "netbsd"))]
type Filter = i16;
#[cfg(not(target_os = "netbsd"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Filter = u32;
#[cfg(target_os = "netbsd")]
type Flags = u32;

/// Udata of the wakeup pipe's record.
const WAKE_DATA: usize = usize::MAX;

/// Upper bound of one changelist: delete and add for both filters.
const MAX_CHANGES: usize = 4;

fn kevent(fd: RawFd, filter: Filter, flags: Flags, udata: usize) -> libc::kevent {
    // Safety: kevent is plain old data, zero is a valid value of each field.
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter;
    ev.flags = flags;
    ev.udata = udata as _;
    ev
}

fn record_to_ready(filter: Filter, flags: Flags, fflags: u32) -> Interest {
    let mut ready = Interest::NONE;
    if filter == libc::EVFILT_READ {
        ready |= Interest::READ;
    }
    if filter == libc::EVFILT_WRITE {
        ready |= Interest::WRITE;
    }
    if flags & libc::EV_EOF != 0 {
        ready |= Interest::HANGUP;
        // fflags carries the socket error of an EOF record.
        if fflags != 0 {
            ready |= Interest::ERROR;
        }
    }
    if flags & libc::EV_ERROR != 0 {
        ready |= Interest::ERROR;
    }
    ready
}

pub(crate) struct KqueueSetup {
    batch: usize,
    capacity: usize,
}

impl Setup for KqueueSetup {
    type Backend = Kqueue;

    fn create(config: &PollerConfig) -> Result<Self> {
        Ok(KqueueSetup {
            batch: config.batch_size(),
            capacity: config.capacity,
        })
    }

    fn init(self) -> Result<Kqueue> {
        let resource = |e| Error::resource(BackendKind::Kqueue, e);

        let kqueue_fd = syscall!(kqueue()).map_err(resource)?;
        // Safety: freshly created, owned by nobody else.
        let kqueue_fd = unsafe { OwnedFd::from_raw_fd(kqueue_fd) };
        syscall!(fcntl(
            kqueue_fd.as_raw_fd(),
            libc::F_SETFD,
            libc::FD_CLOEXEC
        ))
        .map_err(resource)?;

        let waker = WakePipe::new().map_err(resource)?;
        let kqueue = Kqueue {
            kqueue_fd,
            waker: Arc::new(waker),
            events: Vec::with_capacity(self.batch),
            merged: HashMap::with_capacity(self.batch),
            ready: Vec::with_capacity(self.batch),
            registry: Registry::with_capacity(self.capacity),
        };
        kqueue
            .submit(
                &[kevent(
                    kqueue.waker.reader(),
                    libc::EVFILT_READ,
                    libc::EV_ADD,
                    WAKE_DATA,
                )],
                &[],
            )
            .map_err(resource)?;

        tracing::debug!(
            kqueue_fd = kqueue.kqueue_fd.as_raw_fd(),
            batch = self.batch,
            "kqueue poller initialized"
        );
        Ok(kqueue)
    }
}

///
/// `kqueue(2)` multiplexer, level-triggered.
///
/// Every descriptor owns up to two kernel records, one per filter. Records of
/// the same descriptor fetched by one wait are merged into a single event.
pub(crate) struct Kqueue {
    kqueue_fd: OwnedFd,
    waker: Arc<WakePipe>,
    events: Vec<libc::kevent>,
    /// Udata of a merged event to its position in `ready`.
    merged: HashMap<usize, usize>,
    ready: Vec<(Descriptor, Token, Interest)>,
    registry: Registry,
}

impl Kqueue {
    /// Applies a changelist. Per-change failures come back as receipts;
    /// errnos in `ignored` are not reported.
    fn submit(&self, changes: &[libc::kevent], ignored: &[i32]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        debug_assert!(changes.len() <= MAX_CHANGES);

        let mut changelist = [kevent(0, 0, 0, 0); MAX_CHANGES];
        let n = changes.len().min(MAX_CHANGES);
        for (slot, change) in changelist.iter_mut().zip(changes) {
            *slot = *change;
            slot.flags |= libc::EV_RECEIPT;
        }
        let mut receipts = changelist;

        syscall!(kevent(
            self.kqueue_fd.as_raw_fd(),
            changelist.as_ptr(),
            n as _,
            receipts.as_mut_ptr(),
            n as _,
            ptr::null()
        ))?;

        for receipt in &receipts[..n] {
            let errno = receipt.data as i32;
            if receipt.flags & libc::EV_ERROR != 0 && errno != 0 && !ignored.contains(&errno) {
                return Err(io::Error::from_raw_os_error(errno));
            }
        }
        Ok(())
    }

    fn filters(fd: RawFd, interest: Interest, flags: Flags, udata: usize, out: &mut Vec<libc::kevent>) {
        if interest.is_readable() {
            out.push(kevent(fd, libc::EVFILT_READ, flags, udata));
        }
        if interest.is_writable() {
            out.push(kevent(fd, libc::EVFILT_WRITE, flags, udata));
        }
    }
}

impl Backend for Kqueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Kqueue
    }

    fn add(&mut self, fd: Descriptor, interest: Interest, token: Token) -> Result<()> {
        let key = self.registry.insert(fd, interest, token)?;

        let mut changes = Vec::with_capacity(2);
        Kqueue::filters(fd, interest, libc::EV_ADD, key.as_usize(), &mut changes);
        // A peer that already closed its end still gets registered.
        if let Err(e) = self.submit(&changes, &[libc::EPIPE]) {
            self.registry.remove(fd)?;
            let mut undo = Vec::with_capacity(2);
            Kqueue::filters(fd, interest, libc::EV_DELETE, 0, &mut undo);
            let _ = self.submit(&undo, &[libc::ENOENT]);

            return Err(match e.raw_os_error() {
                Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENODEV) => {
                    Error::unsupported(fd, e)
                }
                _ => Error::Facility(e),
            });
        }

        tracing::trace!(descriptor = fd, ?interest, "kqueue: registered");
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> Result<()> {
        let key = self.registry.key_of(fd).ok_or(Error::NotRegistered(fd))?;
        let old = self
            .registry
            .get(key)
            .map_or(Interest::NONE, |entry| entry.interest);

        let mut changes = Vec::with_capacity(2);
        Kqueue::filters(fd, old - interest, libc::EV_DELETE, 0, &mut changes);
        Kqueue::filters(fd, interest, libc::EV_ADD, key.as_usize(), &mut changes);
        self.submit(&changes, &[libc::ENOENT, libc::EPIPE])?;

        if let Some(entry) = self.registry.get_mut(key) {
            entry.interest = interest;
        }
        Ok(())
    }

    fn remove(&mut self, fd: Descriptor) -> Result<()> {
        let entry = self.registry.remove(fd)?;

        let mut changes = Vec::with_capacity(2);
        Kqueue::filters(fd, entry.interest, libc::EV_DELETE, 0, &mut changes);
        match self.submit(&changes, &[libc::ENOENT]) {
            Ok(()) => tracing::trace!(descriptor = fd, "kqueue: deregistered"),
            Err(e) if is_already_gone(&e) => {
                tracing::trace!(descriptor = fd, error = %e, "kqueue: descriptor already gone")
            }
            Err(e) => tracing::warn!(
                descriptor = fd,
                token = entry.token.0,
                error = %e,
                "kqueue: deregistration failed, metadata released"
            ),
        }
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(&Event),
    ) -> Result<usize> {
        let timeout = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let timeout_ptr = timeout
            .as_ref()
            .map_or(ptr::null(), |t| t as *const libc::timespec);

        self.events.clear();
        let res = syscall!(kevent(
            self.kqueue_fd.as_raw_fd(),
            ptr::null(),
            0,
            self.events.as_mut_ptr(),
            self.events.capacity() as _,
            timeout_ptr
        ));
        let n = match res {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Facility(e)),
        };
        // Safety: the kernel initialized the first `n` records.
        unsafe { self.events.set_len(n) };

        self.merged.clear();
        self.ready.clear();
        for ev in &self.events {
            let udata = ev.udata as usize;
            if udata == WAKE_DATA {
                self.waker.drain();
                continue;
            }
            let Some(entry) = self.registry.get(Key::from_usize(udata)) else {
                continue;
            };

            let ready = record_to_ready(ev.filter, ev.flags, ev.fflags as u32);
            match self.merged.entry(udata) {
                Entry::Occupied(slot) => self.ready[*slot.get()].2 |= ready,
                Entry::Vacant(slot) => {
                    slot.insert(self.ready.len());
                    self.ready.push((entry.descriptor, entry.token, ready));
                }
            }
        }

        for &(descriptor, token, ready) in &self.ready {
            callback(&Event::readiness(descriptor, token, ready));
        }
        Ok(self.ready.len())
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

impl Drop for Kqueue {
    fn drop(&mut self) {
        tracing::debug!(
            kqueue_fd = self.kqueue_fd.as_raw_fd(),
            registered = self.registry.len(),
            "kqueue poller destroyed"
        );
    }
}
