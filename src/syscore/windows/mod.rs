mod iocp;
mod select;

pub(crate) use iocp::*;
pub(crate) use select::*;
