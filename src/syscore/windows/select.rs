use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, SocketAddr};
use std::os::windows::io::AsRawSocket;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use windows_sys::Win32::Networking::WinSock::{self, FD_SET, SOCKET, SOCKET_ERROR, TIMEVAL, WSAEINTR};

use crate::backend::{Backend, BackendKind, Setup, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{Descriptor, Event, Interest, Token};
use crate::registry::Registry;
use crate::utils::split_micros;

/// Sockets one `FD_SET` holds, the wakeup socket included.
pub(crate) const SELECT_CAPACITY: usize = 64;

///
/// Connected loopback TCP pair waking a blocked `select`.
#[derive(Debug)]
pub(crate) struct WakeSocket {
    reader: Socket,
    writer: Socket,
}

impl WakeSocket {
    fn new() -> io::Result<WakeSocket> {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        listener.bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)).into())?;
        listener.listen(1)?;

        let writer = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        writer.connect(&listener.local_addr()?)?;
        let (reader, _) = listener.accept()?;

        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        writer.set_nodelay(true)?;
        Ok(WakeSocket { reader, writer })
    }

    fn reader(&self) -> SOCKET {
        self.reader.as_raw_socket() as SOCKET
    }

    fn drain(&self) {
        let mut buf = [MaybeUninit::<u8>::uninit(); 64];
        while let Ok(n) = self.reader.recv(&mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

impl Wake for WakeSocket {
    fn wake(&self) -> Result<()> {
        match self.writer.send(&[1]) {
            Ok(_) => Ok(()),
            // A full socket buffer is already signalled.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Error::Facility(e)),
        }
    }
}

/// Fails for handles that are not open sockets.
fn check_socket(socket: SOCKET) -> io::Result<()> {
    let mut kind = 0i32;
    let mut len = mem::size_of::<i32>() as i32;
    let res = unsafe {
        WinSock::getsockopt(
            socket,
            WinSock::SOL_SOCKET as i32,
            WinSock::SO_TYPE as i32,
            &mut kind as *mut i32 as *mut u8,
            &mut len,
        )
    };
    if res == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct FdSet(FD_SET);

impl FdSet {
    fn new() -> FdSet {
        // Safety: FD_SET is plain old data, a zero count makes it empty.
        FdSet(unsafe { mem::zeroed() })
    }

    fn insert(&mut self, socket: SOCKET) {
        let count = self.0.fd_count as usize;
        if count < self.0.fd_array.len() {
            self.0.fd_array[count] = socket;
            self.0.fd_count += 1;
        }
    }

    fn contains(&self, socket: SOCKET) -> bool {
        self.0.fd_array[..self.0.fd_count as usize].contains(&socket)
    }

    fn as_mut_ptr(&mut self) -> *mut FD_SET {
        if self.0.fd_count == 0 {
            ptr::null_mut()
        } else {
            &mut self.0
        }
    }
}

pub(crate) struct SelectSetup {
    batch: usize,
}

impl Setup for SelectSetup {
    type Backend = Select;

    fn create(config: &PollerConfig) -> Result<Self> {
        Ok(SelectSetup {
            batch: config.batch_size(),
        })
    }

    fn init(self) -> Result<Select> {
        let waker = WakeSocket::new().map_err(|e| Error::resource(BackendKind::Select, e))?;

        tracing::debug!(waker = waker.reader(), "select poller initialized");

        Ok(Select {
            registry: Registry::with_capacity(SELECT_CAPACITY - 1),
            waker: Arc::new(waker),
            cursor: 0,
            batch: self.batch,
        })
    }
}

///
/// WinSock `select` multiplexer. Sockets only.
pub(crate) struct Select {
    registry: Registry,
    waker: Arc<WakeSocket>,
    /// Scan position the next dispatch starts from.
    cursor: usize,
    batch: usize,
}

impl Backend for Select {
    fn kind(&self) -> BackendKind {
        BackendKind::Select
    }

    fn add(&mut self, fd: Descriptor, interest: Interest, token: Token) -> Result<()> {
        if !self.registry.contains(fd) && self.registry.len() + 1 >= SELECT_CAPACITY {
            return Err(Error::CapacityExceeded {
                descriptor: fd,
                capacity: SELECT_CAPACITY,
            });
        }
        // One invalid socket fails the whole wait with WSAENOTSOCK.
        if let Err(e) = check_socket(fd as SOCKET) {
            return Err(if self.registry.contains(fd) {
                Error::AlreadyRegistered(fd)
            } else {
                Error::unsupported(fd, e)
            });
        }
        self.registry.insert(fd, interest, token)?;

        tracing::trace!(descriptor = fd, ?interest, "select: registered");
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
        tracing::trace!(descriptor = fd, "select: deregistered");
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(&Event),
    ) -> Result<usize> {
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        let mut error = FdSet::new();
        read.insert(self.waker.reader());
        for (_, entry) in self.registry.iter() {
            let socket = entry.descriptor as SOCKET;
            if entry.interest.is_readable() {
                read.insert(socket);
            }
            if entry.interest.is_writable() {
                write.insert(socket);
            }
            if entry.interest.is_error() {
                error.insert(socket);
            }
        }

        let tv = timeout.map(|t| {
            let (secs, micros) = split_micros(t, i32::MAX as u64);
            TIMEVAL {
                tv_sec: secs as i32,
                tv_usec: micros as i32,
            }
        });
        let tv_ptr = tv.as_ref().map_or(ptr::null(), |tv| tv as *const TIMEVAL);

        // The first argument is ignored by WinSock.
        let res = unsafe {
            WinSock::select(
                0,
                read.as_mut_ptr(),
                write.as_mut_ptr(),
                error.as_mut_ptr(),
                tv_ptr,
            )
        };
        if res == SOCKET_ERROR {
            let e = io::Error::last_os_error();
            return match e.raw_os_error() {
                Some(WSAEINTR) => Ok(0),
                _ => Err(Error::Facility(e)),
            };
        }
        if res == 0 {
            return Ok(0);
        }

        if read.contains(self.waker.reader()) {
            self.waker.drain();
        }

        let mut ready_events = Vec::new();
        for (position, (_, entry)) in self.registry.iter().enumerate() {
            let socket = entry.descriptor as SOCKET;
            let mut ready = Interest::NONE;
            if read.contains(socket) {
                ready |= Interest::READ;
            }
            if write.contains(socket) {
                ready |= Interest::WRITE;
            }
            if error.contains(socket) {
                ready |= Interest::ERROR;
            }
            if !ready.is_empty() {
                ready_events.push((position, Event::readiness(entry.descriptor, entry.token, ready)));
            }
        }

        let split = ready_events
            .iter()
            .position(|(position, _)| *position >= self.cursor)
            .unwrap_or(ready_events.len());
        let mut dispatched = 0;
        for (position, event) in ready_events[split..].iter().chain(ready_events[..split].iter()) {
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
