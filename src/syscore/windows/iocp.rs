use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_INVALID_PARAMETER, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, PostQueuedCompletionStatus, OVERLAPPED,
    OVERLAPPED_ENTRY,
};
use windows_sys::Win32::System::Threading::INFINITE;

use crate::backend::{Backend, BackendKind, Setup, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{CompletionMarker, Descriptor, Event, Interest, Token};
use crate::registry::{DescriptorEntry, Key, Registry};
use crate::utils::timeout_millis;

/// Completion key of wakeup packets.
const WAKE_KEY: usize = usize::MAX;

///
/// Owned completion port handle.
#[derive(Debug)]
struct PortHandle(HANDLE);

// The port is a kernel object; its handle may be used from any thread.
unsafe impl Send for PortHandle {}
unsafe impl Sync for PortHandle {}

impl Drop for PortHandle {
    fn drop(&mut self) {
        // If the function succeeds, the return value is nonzero.
        if unsafe { CloseHandle(self.0) } == 0 {
            tracing::warn!(
                error = %io::Error::last_os_error(),
                "iocp: closing the completion port failed"
            );
        }
    }
}

///
/// Wakeup half of the completion port.
#[derive(Debug)]
pub(crate) struct PortWaker {
    port: PortHandle,
    /// A wakeup packet is queued and not yet dequeued.
    notified: AtomicBool,
}

impl Wake for PortWaker {
    fn wake(&self) -> Result<()> {
        if self.notified.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let res = unsafe { PostQueuedCompletionStatus(self.port.0, 0, WAKE_KEY, ptr::null()) };
        if res == 0 {
            self.notified.store(false, Ordering::Release);
            return Err(Error::Facility(io::Error::last_os_error()));
        }
        Ok(())
    }
}

pub(crate) struct IocpSetup {
    batch: usize,
    capacity: usize,
}

impl Setup for IocpSetup {
    type Backend = Iocp;

    fn create(config: &PollerConfig) -> Result<Self> {
        Ok(IocpSetup {
            batch: config.batch_size(),
            capacity: config.capacity,
        })
    }

    fn init(self) -> Result<Iocp> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(Error::resource(
                BackendKind::Iocp,
                io::Error::last_os_error(),
            ));
        }

        tracing::debug!(batch = self.batch, "iocp poller initialized");

        Ok(Iocp {
            waker: Arc::new(PortWaker {
                port: PortHandle(port),
                notified: AtomicBool::new(false),
            }),
            entries: Vec::with_capacity(self.batch),
            registry: Registry::with_capacity(self.capacity),
            associations: HashMap::with_capacity(self.capacity),
        })
    }
}

///
/// I/O completion port multiplexer.
///
/// Reports completions only: packets of overlapped operations issued on
/// associated handles, and packets posted through [`Backend::post`].
pub(crate) struct Iocp {
    waker: Arc<PortWaker>,
    entries: Vec<OVERLAPPED_ENTRY>,
    registry: Registry,
    /// Completion key each handle was first associated under. A handle can
    /// never leave the port, so re-registrations keep receiving that key.
    associations: HashMap<usize, Descriptor>,
}

impl Iocp {
    fn port(&self) -> HANDLE {
        self.waker.port.0
    }

    fn resolve(&self, completion_key: usize) -> Option<&DescriptorEntry> {
        self.registry
            .get(Key::from_usize(completion_key))
            .or_else(|| {
                let descriptor = *self.associations.get(&completion_key)?;
                self.registry.get(self.registry.key_of(descriptor)?)
            })
    }
}

impl Backend for Iocp {
    fn kind(&self) -> BackendKind {
        BackendKind::Iocp
    }

    fn add(&mut self, fd: Descriptor, interest: Interest, token: Token) -> Result<()> {
        let key = self.registry.insert(fd, interest, token)?;
        let completion_key = key.as_usize();

        let res = unsafe {
            CreateIoCompletionPort(fd as usize as HANDLE, self.port(), completion_key, 0)
        };
        if res.is_null() {
            let e = io::Error::last_os_error();
            let reassociated = e.raw_os_error() == Some(ERROR_INVALID_PARAMETER as i32)
                && self.associations.values().any(|&known| known == fd);
            if !reassociated {
                self.registry.remove(fd)?;
                return Err(Error::unsupported(fd, e));
            }
            tracing::trace!(descriptor = fd, "iocp: handle already associated");
        } else {
            // A recycled handle value replaces the association of its
            // previous owner.
            self.associations.retain(|_, known| *known != fd);
            self.associations.insert(completion_key, fd);
        }

        tracing::trace!(descriptor = fd, ?interest, "iocp: registered");
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> Result<()> {
        let entry = self
            .registry
            .lookup_mut(fd)
            .ok_or(Error::NotRegistered(fd))?;
        entry.interest = interest;
        Ok(())
    }

    fn remove(&mut self, fd: Descriptor) -> Result<()> {
        self.registry.remove(fd)?;
        tracing::trace!(descriptor = fd, "iocp: deregistered");
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(&Event),
    ) -> Result<usize> {
        let millis = match timeout {
            None => INFINITE,
            some => timeout_millis(some) as u32,
        };

        self.entries.clear();
        let mut removed = 0u32;
        let res = unsafe {
            GetQueuedCompletionStatusEx(
                self.port(),
                self.entries.as_mut_ptr(),
                self.entries.capacity() as u32,
                &mut removed,
                millis,
                0,
            )
        };
        if res == 0 {
            let e = io::Error::last_os_error();
            return match e.raw_os_error() {
                Some(code) if code == WAIT_TIMEOUT as i32 => Ok(0),
                _ => Err(Error::Facility(e)),
            };
        }
        // Safety: the port filled the first `removed` entries.
        unsafe { self.entries.set_len(removed as usize) };

        let mut dispatched = 0;
        for entry in &self.entries {
            let completion_key = entry.lpCompletionKey;
            if completion_key == WAKE_KEY && entry.lpOverlapped.is_null() {
                self.waker.notified.store(false, Ordering::Release);
                continue;
            }

            let Some(registered) = self.resolve(completion_key) else {
                tracing::trace!(completion_key, "iocp: stale completion dropped");
                continue;
            };
            callback(&Event::completion(
                registered.descriptor,
                registered.token,
                CompletionMarker(entry.lpOverlapped as usize),
                entry.dwNumberOfBytesTransferred,
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

    fn post(&mut self, fd: Descriptor, marker: CompletionMarker, bytes: u32) -> Result<()> {
        let key = self.registry.key_of(fd).ok_or(Error::NotRegistered(fd))?;
        let res = unsafe {
            PostQueuedCompletionStatus(
                self.port(),
                bytes,
                key.as_usize(),
                marker.0 as *const OVERLAPPED,
            )
        };
        if res == 0 {
            return Err(Error::Facility(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        tracing::debug!(registered = self.registry.len(), "iocp poller destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iocp() -> Iocp {
        IocpSetup::create(&PollerConfig::default())
            .unwrap()
            .init()
            .unwrap()
    }

    #[test]
    fn wakes_coalesce_into_one_packet() {
        let mut iocp = iocp();
        let waker = iocp.waker();
        for _ in 0..100 {
            waker.wake().unwrap();
        }

        let n = iocp
            .poll(Some(Duration::ZERO), &mut |_| panic!("wakeups are not dispatched"))
            .unwrap();
        assert_eq!(n, 0);
        assert!(!iocp.waker.notified.load(Ordering::Acquire));
        // Nothing else was queued.
        assert_eq!(iocp.poll(Some(Duration::ZERO), &mut |_| {}).unwrap(), 0);
    }

    #[test]
    fn posting_requires_registration() {
        let mut iocp = iocp();
        assert!(matches!(
            iocp.post(42, CompletionMarker(1), 0),
            Err(Error::NotRegistered(42))
        ));
    }
}
