mod iouring;

pub(crate) use iouring::*;
