mod epoll;

pub(crate) use epoll::*;
