mod select;

pub(crate) use select::*;

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::backend::Wake;
use crate::error::{Error, Result};

///
/// Self-pipe wakeup channel of the readiness backends.
///
/// The read end stays registered for readability for the poller's whole life;
/// `wake` writes one byte to the write end.
#[derive(Debug)]
pub(crate) struct WakePipe {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<WakePipe> {
        let mut fds: [RawFd; 2] = [-1; 2];

        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "illumos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        ))]
        {
            syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
        }

        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "illumos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        )))]
        {
            syscall!(pipe(fds.as_mut_ptr()))?;
        }

        // Safety: both descriptors were just returned by the kernel and are
        // owned by nobody else.
        let pipe = unsafe {
            WakePipe {
                reader: OwnedFd::from_raw_fd(fds[0]),
                writer: OwnedFd::from_raw_fd(fds[1]),
            }
        };

        #[cfg(not(any(
            target_os = "linux",
            target_os = "android",
            target_os = "illumos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
        )))]
        {
            for fd in [pipe.reader.as_raw_fd(), pipe.writer.as_raw_fd()] {
                syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
                let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
                syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
            }
        }

        Ok(pipe)
    }

    pub(crate) fn reader(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Empties the pipe so the next poll blocks again.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match syscall!(read(
                self.reader.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len()
            )) {
                Ok(n) if n as usize == buf.len() => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                _ => break,
            }
        }
    }
}

impl Wake for WakePipe {
    fn wake(&self) -> Result<()> {
        let byte = 1u8;
        loop {
            match syscall!(write(
                self.writer.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1
            )) {
                Ok(_) => return Ok(()),
                // A full pipe is already signalled.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Facility(e)),
            }
        }
    }
}

/// Errors of OS-side deregistration meaning the descriptor is already gone
/// from the facility.
pub(crate) fn is_already_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::ENOENT) | Some(libc::EPERM) | Some(libc::EPIPE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_coalesce_into_one_drain() {
        let pipe = WakePipe::new().unwrap();
        for _ in 0..10_000 {
            // Filling the pipe must never block nor fail.
            pipe.wake().unwrap();
        }
        pipe.drain();

        let mut buf = [0u8; 1];
        let res = syscall!(read(
            pipe.reader(),
            buf.as_mut_ptr() as *mut libc::c_void,
            1
        ));
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn already_gone_classes() {
        assert!(is_already_gone(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(is_already_gone(&io::Error::from_raw_os_error(libc::ENOENT)));
        assert!(!is_already_gone(&io::Error::from_raw_os_error(libc::ENOMEM)));
    }
}
