use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustix::event::{eventfd, EventfdFlags};
use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};
use rustix_uring::{cqueue, opcode as OP, squeue::Entry as SQEntry, types::Fd, IoUring as Ring, Probe};

use crate::backend::{Backend, BackendKind, Setup, Wake};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::event::{Descriptor, Event, Interest, Token};
use crate::registry::{Key, Registry};

///////////////////
//// Reserved user data
///////////////////

/// Poll on the wakeup eventfd.
const WAKE_DATA: u64 = u64::MAX;
/// Poll on the timeout timerfd.
const TIMER_DATA: u64 = u64::MAX - 1;
/// Completions of `POLL_REMOVE` requests.
const CANCEL_DATA: u64 = u64::MAX - 2;

fn interest_to_poll(interest: Interest) -> u32 {
    let mut mask = 0;
    if interest.is_readable() {
        mask |= libc::POLLIN | libc::POLLRDHUP;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT;
    }
    mask as u32
}

fn poll_to_ready(mask: u32) -> Interest {
    let mask = mask as libc::c_short;
    let mut ready = Interest::NONE;
    if mask & (libc::POLLIN | libc::POLLPRI) != 0 {
        ready |= Interest::READ;
    }
    if mask & libc::POLLOUT != 0 {
        ready |= Interest::WRITE;
    }
    if mask & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Interest::ERROR;
    }
    if mask & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
        ready |= Interest::HANGUP;
    }
    ready
}

fn poll_entry(fd: RawFd, mask: u32, data: u64, multishot: bool) -> SQEntry {
    OP::PollAdd::new(Fd(fd), mask)
        .multi(multishot)
        .build()
        .user_data(data)
}

/// Pushes an SQE, flushing the submission queue once if it is full.
fn push(ring: &mut Ring, sqe: &SQEntry) -> io::Result<()> {
    // Safety: poll entries reference descriptors only, never buffers.
    if unsafe { ring.submission().push(sqe) }.is_ok() {
        return Ok(());
    }
    ring.submit().map_err(io::Error::from)?;
    unsafe { ring.submission().push(sqe) }
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "io_uring submission queue is full"))
}

fn drain_counter(fd: &OwnedFd) {
    let mut buf = [0u8; 8];
    let _ = rustix::io::read(fd, &mut buf);
}

///
/// Eventfd wakeup channel of the ring.
#[derive(Debug)]
pub(crate) struct EventFd(OwnedFd);

impl Wake for EventFd {
    fn wake(&self) -> Result<()> {
        match rustix::io::write(&self.0, &1u64.to_ne_bytes()) {
            // An overflowing counter is already signalled.
            Ok(_) | Err(rustix::io::Errno::AGAIN) => Ok(()),
            Err(e) => Err(Error::Facility(io::Error::from(e))),
        }
    }
}

pub(crate) struct IoUringSetup {
    queue_len: u32,
    multishot: bool,
    batch: usize,
    capacity: usize,
}

impl Setup for IoUringSetup {
    type Backend = IoUring;

    fn create(config: &PollerConfig) -> Result<Self> {
        let queue_len = if config.iouring.queue_len == 0 {
            crate::config::IoUringConfiguration::default().queue_len
        } else {
            config.iouring.queue_len
        };

        Ok(IoUringSetup {
            queue_len,
            multishot: config.iouring.multishot,
            batch: config.batch_size(),
            capacity: config.capacity,
        })
    }

    fn init(self) -> Result<IoUring> {
        let resource = |e| Error::resource(BackendKind::IoUring, e);

        let mut ring = Ring::new(self.queue_len)
            .map_err(io::Error::from)
            .map_err(resource)?;

        let mut probe = Probe::new();
        ring.submitter()
            .register_probe(&mut probe)
            .map_err(io::Error::from)
            .map_err(resource)?;
        if !probe.is_supported(OP::PollAdd::CODE) || !probe.is_supported(OP::PollRemove::CODE) {
            return Err(resource(io::Error::new(
                io::ErrorKind::Unsupported,
                "kernel lacks io_uring poll operations",
            )));
        }

        let waker = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)
            .map_err(io::Error::from)
            .map_err(resource)?;
        let timer = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::CLOEXEC | TimerfdFlags::NONBLOCK,
        )
        .map_err(io::Error::from)
        .map_err(resource)?;

        let readable = libc::POLLIN as u32;
        push(&mut ring, &poll_entry(waker.as_raw_fd(), readable, WAKE_DATA, self.multishot))
            .map_err(resource)?;
        push(&mut ring, &poll_entry(timer.as_raw_fd(), readable, TIMER_DATA, self.multishot))
            .map_err(resource)?;
        // Surfaces sandboxes that allow ring setup but refuse io_uring_enter.
        ring.submit().map_err(io::Error::from).map_err(resource)?;

        tracing::debug!(
            queue_len = self.queue_len,
            multishot = self.multishot,
            "io_uring poller initialized"
        );

        Ok(IoUring {
            ring,
            registry: Registry::with_capacity(self.capacity),
            waker: Arc::new(EventFd(waker)),
            timer,
            multishot: self.multishot,
            rearm: Vec::new(),
            cancels: Vec::new(),
            rearm_waker: false,
            rearm_timer: false,
            batch: self.batch,
        })
    }
}

///
/// `io_uring(7)` multiplexer driving `IORING_OP_POLL_ADD` registrations.
///
/// Multishot registrations stay armed until a completion arrives without
/// `IORING_CQE_F_MORE`; single-shot ones are consumed by every completion.
/// Consumed registrations are resubmitted at the start of the next poll.
pub(crate) struct IoUring {
    ring: Ring,
    registry: Registry,
    waker: Arc<EventFd>,
    timer: OwnedFd,
    /// Request stays-armed registrations. Cleared for good once the kernel
    /// rejects one.
    multishot: bool,
    /// Keys of registrations waiting for resubmission.
    rearm: Vec<Key>,
    /// User data of armed polls left behind by `modify` and `remove`.
    cancels: Vec<u64>,
    rearm_waker: bool,
    rearm_timer: bool,
    batch: usize,
}

/// What one pass over the completion queue observed.
#[derive(Default)]
struct Drained {
    dispatched: usize,
    woke: bool,
}

impl IoUring {
    fn resubmit(&mut self) -> io::Result<()> {
        while let Some(data) = self.cancels.pop() {
            let cancel = OP::PollRemove::new(data).build().user_data(CANCEL_DATA);
            if let Err(e) = push(&mut self.ring, &cancel) {
                self.cancels.push(data);
                return Err(e);
            }
        }

        let readable = libc::POLLIN as u32;
        if self.rearm_waker {
            let sqe = poll_entry(self.waker.0.as_raw_fd(), readable, WAKE_DATA, self.multishot);
            push(&mut self.ring, &sqe)?;
            self.rearm_waker = false;
        }
        if self.rearm_timer {
            let sqe = poll_entry(self.timer.as_raw_fd(), readable, TIMER_DATA, self.multishot);
            push(&mut self.ring, &sqe)?;
            self.rearm_timer = false;
        }

        while let Some(key) = self.rearm.pop() {
            // Keys of removed or modified registrations went stale.
            let Some(entry) = self.registry.get_mut(key) else {
                continue;
            };
            if !entry.rearm {
                continue;
            }
            let sqe = poll_entry(
                entry.descriptor,
                interest_to_poll(entry.interest),
                key.as_u64(),
                self.multishot,
            );
            if let Err(e) = push(&mut self.ring, &sqe) {
                self.rearm.push(key);
                return Err(e);
            }
            entry.rearm = false;
        }
        Ok(())
    }

    fn arm_timer(&self, timeout: Duration) -> io::Result<()> {
        // A zero it_value disarms, keep at least one nanosecond.
        let timeout = timeout.max(Duration::from_nanos(1));
        let value = Itimerspec {
            it_interval: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: Timespec {
                tv_sec: timeout.as_secs().min(i64::MAX as u64) as _,
                tv_nsec: timeout.subsec_nanos() as _,
            },
        };
        timerfd_settime(&self.timer, TimerfdTimerFlags::empty(), &value)?;
        Ok(())
    }

    fn disarm_timer(&self) {
        let value = Itimerspec {
            it_interval: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: Timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        };
        let _ = timerfd_settime(&self.timer, TimerfdTimerFlags::empty(), &value);
    }

    fn drain_completions(&mut self, callback: &mut dyn FnMut(&Event)) -> Drained {
        let mut drained = Drained::default();
        let mut cq = self.ring.completion();

        // Completions past the batch stay queued for the next call.
        while drained.dispatched < self.batch {
            let Some(cqe) = cq.next() else {
                break;
            };
            let (data, res) = (cqe.user_data(), cqe.result());
            let armed = cqueue::more(cqe.flags());

            if matches!(data, WAKE_DATA | TIMER_DATA) && res == -libc::EINVAL && self.multishot {
                tracing::warn!("io_uring: multishot poll rejected, using single-shot registrations");
                self.multishot = false;
            }

            match data {
                WAKE_DATA => {
                    drain_counter(&self.waker.0);
                    drained.woke |= res >= 0;
                    self.rearm_waker |= !armed;
                }
                TIMER_DATA => {
                    drain_counter(&self.timer);
                    self.rearm_timer |= !armed;
                }
                CANCEL_DATA => {}
                raw => {
                    let key = Key::from_u64(raw);
                    let Some(entry) = self.registry.get_mut(key) else {
                        tracing::trace!(user_data = raw, "io_uring: stale completion dropped");
                        continue;
                    };

                    if res == -libc::EINVAL && self.multishot {
                        tracing::warn!(
                            descriptor = entry.descriptor,
                            "io_uring: multishot poll rejected, using single-shot registrations"
                        );
                        self.multishot = false;
                        entry.rearm = true;
                        self.rearm.push(key);
                        continue;
                    }
                    if res == -libc::ECANCELED {
                        entry.rearm = true;
                        self.rearm.push(key);
                        continue;
                    }

                    let ready = if res < 0 {
                        // Resubmitting would fail the same way, the entry stays
                        // disarmed until it is modified.
                        tracing::trace!(
                            descriptor = entry.descriptor,
                            error = %io::Error::from_raw_os_error(-res),
                            "io_uring: poll failed"
                        );
                        Interest::ERROR
                    } else {
                        if !armed {
                            entry.rearm = true;
                            self.rearm.push(key);
                        }
                        poll_to_ready(res as u32)
                    };

                    callback(&Event::readiness(entry.descriptor, entry.token, ready));
                    drained.dispatched += 1;
                }
            }
        }

        drained
    }
}

impl Backend for IoUring {
    fn kind(&self) -> BackendKind {
        BackendKind::IoUring
    }

    fn add(&mut self, fd: Descriptor, interest: Interest, token: Token) -> Result<()> {
        // The ring reports bad descriptors only asynchronously.
        if let Err(e) = syscall!(fcntl(fd, libc::F_GETFD)) {
            return Err(if self.registry.contains(fd) {
                Error::AlreadyRegistered(fd)
            } else {
                Error::unsupported(fd, e)
            });
        }

        let key = self.registry.insert(fd, interest, token)?;
        let sqe = poll_entry(fd, interest_to_poll(interest), key.as_u64(), self.multishot);
        if let Err(e) = push(&mut self.ring, &sqe) {
            self.registry.remove(fd)?;
            return Err(Error::Facility(e));
        }

        tracing::trace!(descriptor = fd, ?interest, "io_uring: poll submitted");
        Ok(())
    }

    fn modify(&mut self, fd: Descriptor, interest: Interest) -> Result<()> {
        let old = self.registry.key_of(fd).ok_or(Error::NotRegistered(fd))?;
        let pending = self.registry.get(old).map_or(false, |entry| entry.rearm);
        let new = self.registry.rekey(fd)?;
        if let Some(entry) = self.registry.get_mut(new) {
            entry.interest = interest;
            entry.rearm = true;
        }

        // Both requests are pushed by the next poll, which retries them
        // until the submission queue takes them.
        if !pending {
            self.cancels.push(old.as_u64());
        }
        self.rearm.push(new);

        tracing::trace!(descriptor = fd, ?interest, "io_uring: poll resubmission queued");
        Ok(())
    }

    fn remove(&mut self, fd: Descriptor) -> Result<()> {
        let key = self.registry.key_of(fd).ok_or(Error::NotRegistered(fd))?;
        let entry = self.registry.remove(fd)?;

        // A rearm-pending registration has no poll left in the ring.
        if !entry.rearm {
            self.cancels.push(key.as_u64());
        }
        tracing::trace!(descriptor = fd, "io_uring: deregistered");
        Ok(())
    }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        callback: &mut dyn FnMut(&Event),
    ) -> Result<usize> {
        self.resubmit()?;

        let wait = timeout.map_or(true, |t| !t.is_zero());
        let deadline = timeout.map(|t| Instant::now() + t);
        if let Some(t) = timeout.filter(|_| wait) {
            self.arm_timer(t)?;
        }

        let mut dispatched = 0;
        let result = loop {
            let mut interrupted = false;
            match self.ring.submit_and_wait(usize::from(wait)).map_err(io::Error::from) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => interrupted = true,
                // Completion queue overflow, or a timed out wait.
                Err(e) if matches!(e.raw_os_error(), Some(libc::EBUSY) | Some(libc::ETIME)) => {}
                Err(e) => break Err(Error::Facility(e)),
            }

            let drained = self.drain_completions(callback);
            dispatched += drained.dispatched;

            if dispatched > 0 || drained.woke || interrupted || !wait {
                break Ok(dispatched);
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                break Ok(dispatched);
            }
            // Only internal or stale completions so far.
            if let Err(e) = self.resubmit() {
                break Err(Error::Facility(e));
            }
        };

        if wait && timeout.is_some() {
            self.disarm_timer();
        }
        result
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

impl Drop for IoUring {
    fn drop(&mut self) {
        tracing::debug!(
            registered = self.registry.len(),
            "io_uring poller destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn interest_translation() {
        assert_eq!(
            interest_to_poll(Interest::READ),
            (libc::POLLIN | libc::POLLRDHUP) as u32
        );
        assert_eq!(
            interest_to_poll(Interest::WRITE | Interest::HANGUP),
            libc::POLLOUT as u32
        );
    }

    #[test]
    fn readiness_translation() {
        assert_eq!(poll_to_ready(libc::POLLIN as u32), Interest::READ);
        assert_eq!(
            poll_to_ready((libc::POLLOUT | libc::POLLHUP) as u32),
            Interest::WRITE | Interest::HANGUP
        );
        assert_eq!(poll_to_ready(libc::POLLNVAL as u32), Interest::ERROR);
    }

    fn ring(multishot: bool) -> Option<IoUring> {
        let config = PollerConfig::default().with_iouring(crate::config::IoUringConfiguration {
            queue_len: 64,
            multishot,
        });
        match IoUringSetup::create(&config).and_then(IoUringSetup::init) {
            Ok(ring) => Some(ring),
            Err(Error::ResourceExhaustion { .. }) => None,
            Err(e) => panic!("io_uring failed to open: {e}"),
        }
    }

    fn collect(ring: &mut IoUring, timeout: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        ring.poll(Some(timeout), &mut |ev| events.push(*ev)).unwrap();
        events
    }

    #[test]
    fn modify_queues_cancel_and_rearm_until_next_poll() {
        let Some(mut ring) = ring(true) else { return };
        let (socket, _peer) = UnixStream::pair().unwrap();
        let fd = socket.as_raw_fd();

        ring.add(fd, Interest::READ, Token(7)).unwrap();
        let old = ring.registry.key_of(fd).unwrap();
        ring.modify(fd, Interest::WRITE).unwrap();
        let new = ring.registry.key_of(fd).unwrap();

        assert_eq!(ring.cancels, vec![old.as_u64()]);
        assert!(ring.rearm.contains(&new));
        assert!(ring.registry.get(new).unwrap().rearm);

        let events = collect(&mut ring, Duration::from_secs(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token(), Token(7));
        assert!(events[0].ready().is_writable());
        assert!(ring.cancels.is_empty());
    }

    #[test]
    fn rearm_pending_registrations_are_not_cancelled() {
        let Some(mut ring) = ring(false) else { return };
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();

        ring.add(fd, Interest::READ, Token(1)).unwrap();
        writer.write_all(b"x").unwrap();
        assert_eq!(collect(&mut ring, Duration::from_secs(1)).len(), 1);
        let key = ring.registry.key_of(fd).unwrap();
        assert!(ring.registry.get(key).unwrap().rearm);

        ring.modify(fd, Interest::READ | Interest::WRITE).unwrap();
        assert!(ring.cancels.is_empty());

        let events = collect(&mut ring, Duration::from_secs(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ready(), Interest::READ | Interest::WRITE);
    }

    #[test]
    fn removal_cancels_the_armed_poll_at_next_poll() {
        let Some(mut ring) = ring(true) else { return };
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();

        ring.add(fd, Interest::READ, Token(2)).unwrap();
        assert!(collect(&mut ring, Duration::ZERO).is_empty());
        let key = ring.registry.key_of(fd).unwrap();
        let armed = !ring.registry.get(key).unwrap().rearm;
        ring.remove(fd).unwrap();
        assert_eq!(ring.cancels, if armed { vec![key.as_u64()] } else { vec![] });

        writer.write_all(b"late").unwrap();
        assert!(collect(&mut ring, Duration::from_millis(50)).is_empty());
        assert!(ring.cancels.is_empty());
    }

    #[test]
    fn reserved_user_data_never_resolves() {
        let mut registry = Registry::with_capacity(1);
        registry.insert(0, Interest::READ, Token(0)).unwrap();
        for data in [WAKE_DATA, TIMER_DATA, CANCEL_DATA] {
            assert!(registry.get(Key::from_u64(data)).is_none());
        }
    }
}
