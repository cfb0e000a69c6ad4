mod epoll;
pub(crate) use epoll::*;

#[cfg(all(target_os = "linux", feature = "iouring"))]
mod iouring;
#[cfg(all(target_os = "linux", feature = "iouring"))]
pub(crate) use iouring::*;
