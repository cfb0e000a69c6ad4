#![cfg(unix)]

use std::collections::HashSet;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use hadron::*;

const PATIENCE: Option<Duration> = Some(Duration::from_secs(1));

fn open(kind: BackendKind, config: PollerConfig) -> Option<Poller> {
    match Poller::new(config.with_backend(kind)) {
        Ok(poller) => Some(poller),
        // Kernels or sandboxes refusing rings are common in CI.
        Err(Error::ResourceExhaustion { .. }) if kind == BackendKind::IoUring => {
            eprintln!("skipping io_uring: ring creation refused");
            None
        }
        Err(e) => panic!("{kind} failed to open: {e}"),
    }
}

/// Every backend of the platform that can be opened here. Under the default
/// configuration all of them are level-triggered.
fn level_triggered(config: PollerConfig) -> Vec<Poller> {
    Poller::available()
        .iter()
        .filter_map(|&kind| open(kind, config.clone()))
        .collect()
}

/// Every backend, plus io_uring a second time in the other registration
/// mode.
fn pollers(config: PollerConfig) -> Vec<Poller> {
    let mut pollers = level_triggered(config.clone());
    if Poller::available().contains(&BackendKind::IoUring) {
        let mut iouring = config.iouring.clone();
        iouring.multishot = !iouring.multishot;
        pollers.extend(open(BackendKind::IoUring, config.with_iouring(iouring)));
    }
    pollers
}

fn collect(poller: &mut Poller, timeout: Option<Duration>) -> Vec<Event> {
    let mut events = Vec::new();
    let n = poller.poll(timeout, |ev| events.push(*ev)).unwrap();
    assert_eq!(n, events.len(), "{}: count mismatch", poller.name());
    events
}

#[test]
fn readable_descriptor_is_reported_once() {
    for mut poller in pollers(PollerConfig::default()) {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        poller
            .add(reader.as_raw_fd(), Interest::READ, Token(11))
            .unwrap();
        writer.write_all(b"ping").unwrap();

        let events = collect(&mut poller, PATIENCE);
        assert_eq!(events.len(), 1, "{}", poller.name());

        let event = events[0];
        assert_eq!(event.descriptor(), reader.as_raw_fd());
        assert_eq!(event.token(), Token(11));
        assert!(!event.is_completion());
        assert!(event.ready().is_readable(), "{}", poller.name());
        assert!(!event.ready().intersects(Interest::WRITE | Interest::ERROR));
    }
}

#[test]
fn zero_timeout_returns_immediately() {
    for mut poller in pollers(PollerConfig::default()) {
        let (reader, _writer) = UnixStream::pair().unwrap();
        poller
            .add(reader.as_raw_fd(), Interest::READ, Token(0))
            .unwrap();

        assert!(collect(&mut poller, Some(Duration::ZERO)).is_empty());
    }
}

#[test]
fn remove_is_not_idempotent_and_allows_readding() {
    for mut poller in pollers(PollerConfig::default()) {
        let (reader, _writer) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();

        assert!(matches!(poller.remove(fd), Err(Error::NotRegistered(d)) if d == fd));

        poller.add(fd, Interest::READ, Token(1)).unwrap();
        assert!(matches!(
            poller.add(fd, Interest::WRITE, Token(2)),
            Err(Error::AlreadyRegistered(_))
        ));
        assert_eq!(poller.len(), 1);

        poller.remove(fd).unwrap();
        assert!(matches!(poller.remove(fd), Err(Error::NotRegistered(_))));
        assert!(poller.is_empty());

        poller.add(fd, Interest::READ, Token(3)).unwrap();
        assert!(poller.is_registered(fd));
    }
}

#[test]
fn modify_switches_interest_and_keeps_token() {
    for mut poller in pollers(PollerConfig::default()) {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let fd = socket.as_raw_fd();

        poller.add(fd, Interest::READ, Token(5)).unwrap();
        assert!(collect(&mut poller, Some(Duration::ZERO)).is_empty());

        poller.modify(fd, Interest::WRITE).unwrap();
        let events = collect(&mut poller, PATIENCE);
        assert_eq!(events.len(), 1, "{}", poller.name());
        assert_eq!(events[0].token(), Token(5));
        assert!(events[0].ready().is_writable());
        assert!(!events[0].ready().is_readable());

        assert!(matches!(
            poller.modify(fd + 1000, Interest::READ),
            Err(Error::NotRegistered(_))
        ));
    }
}

#[test]
fn removed_descriptor_produces_no_events() {
    for mut poller in pollers(PollerConfig::default()) {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let fd = reader.as_raw_fd();

        poller.add(fd, Interest::READ, Token(9)).unwrap();
        writer.write_all(b"late").unwrap();
        poller.remove(fd).unwrap();

        let events = collect(&mut poller, Some(Duration::from_millis(50)));
        assert!(events.is_empty(), "{}: {events:?}", poller.name());
    }
}

#[test]
fn batches_drain_over_consecutive_polls() {
    for mut poller in pollers(PollerConfig::default().with_max_batch(2)) {
        let pairs: Vec<_> = (0..4).map(|_| UnixStream::pair().unwrap()).collect();
        for (i, (reader, writer)) in pairs.iter().enumerate() {
            poller
                .add(reader.as_raw_fd(), Interest::READ, Token(i))
                .unwrap();
            (&*writer).write_all(b"x").unwrap();
        }

        let first = collect(&mut poller, PATIENCE);
        assert_eq!(first.len(), 2, "{}", poller.name());
        let second = collect(&mut poller, PATIENCE);
        assert_eq!(second.len(), 2, "{}", poller.name());

        let seen: HashSet<_> = first.iter().chain(&second).map(|ev| ev.token()).collect();
        assert_eq!(seen.len(), 4, "{}: {seen:?}", poller.name());
    }
}

#[test]
fn closed_peer_reports_hangup() {
    for mut poller in pollers(PollerConfig::default()) {
        let (reader, writer) = UnixStream::pair().unwrap();
        poller
            .add(reader.as_raw_fd(), Interest::READ, Token(4))
            .unwrap();
        drop(writer);

        let events = collect(&mut poller, PATIENCE);
        assert_eq!(events.len(), 1, "{}", poller.name());
        // select(2) only sees end of file as readability.
        if poller.kind() != BackendKind::Select {
            assert!(events[0].ready().is_hangup(), "{}", poller.name());
        }
        assert!(events[0].ready().is_readable());
    }
}

#[test]
fn unread_data_is_reported_again() {
    for mut poller in level_triggered(PollerConfig::default()) {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        poller
            .add(reader.as_raw_fd(), Interest::READ, Token(6))
            .unwrap();
        writer.write_all(b"x").unwrap();

        assert_eq!(collect(&mut poller, PATIENCE).len(), 1, "{}", poller.name());
        let again = collect(&mut poller, Some(Duration::from_millis(200)));
        assert_eq!(again.len(), 1, "{}: unread data", poller.name());
        assert_eq!(again[0].token(), Token(6));
        assert!(again[0].ready().is_readable());
    }
}

#[test]
fn multishot_ring_reports_state_changes_only() {
    if !Poller::available().contains(&BackendKind::IoUring) {
        return;
    }
    let config = PollerConfig::default().with_iouring(IoUringConfiguration {
        multishot: true,
        ..IoUringConfiguration::default()
    });
    let Some(mut poller) = open(BackendKind::IoUring, config) else {
        return;
    };

    let (reader, mut writer) = UnixStream::pair().unwrap();
    poller
        .add(reader.as_raw_fd(), Interest::READ, Token(8))
        .unwrap();
    writer.write_all(b"x").unwrap();

    assert_eq!(collect(&mut poller, PATIENCE).len(), 1);
    assert!(collect(&mut poller, Some(Duration::from_millis(200))).is_empty());

    writer.write_all(b"y").unwrap();
    let events = collect(&mut poller, PATIENCE);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token(), Token(8));
}

#[test]
fn modify_rearms_a_consumed_registration() {
    for mut poller in level_triggered(PollerConfig::default()) {
        let (socket, mut peer) = UnixStream::pair().unwrap();
        let fd = socket.as_raw_fd();
        poller.add(fd, Interest::READ, Token(2)).unwrap();
        peer.write_all(b"x").unwrap();
        assert_eq!(collect(&mut poller, PATIENCE).len(), 1, "{}", poller.name());

        poller.modify(fd, Interest::READ | Interest::WRITE).unwrap();
        let events = collect(&mut poller, PATIENCE);
        assert_eq!(events.len(), 1, "{}", poller.name());
        assert_eq!(events[0].ready(), Interest::READ | Interest::WRITE);
        assert_eq!(events[0].token(), Token(2));
    }
}

#[test]
fn descriptors_that_are_not_open_are_rejected() {
    for mut poller in pollers(PollerConfig::default()) {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        poller
            .add(reader.as_raw_fd(), Interest::READ, Token(1))
            .unwrap();

        // Within select's range, far above anything this process opens.
        let unopened = 1_000;
        assert!(poller.add(unopened, Interest::READ, Token(2)).is_err(), "{}", poller.name());
        if poller.kind() == BackendKind::Select {
            assert!(matches!(
                poller.add(unopened, Interest::READ, Token(2)),
                Err(Error::Unsupported { descriptor: 1_000, .. })
            ));
        }
        assert!(!poller.is_registered(unopened));
        assert_eq!(poller.len(), 1);

        writer.write_all(b"x").unwrap();
        let events = collect(&mut poller, PATIENCE);
        assert_eq!(events.len(), 1, "{}: {events:?}", poller.name());
        assert_eq!(events[0].token(), Token(1));
    }
}

#[test]
fn select_capacity_is_a_hard_ceiling() {
    let mut poller = Poller::new(PollerConfig::default().with_backend(BackendKind::Select)).unwrap();
    let (reader, mut writer) = UnixStream::pair().unwrap();
    poller
        .add(reader.as_raw_fd(), Interest::READ, Token(1))
        .unwrap();

    let err = poller.add(65_536, Interest::READ, Token(2)).unwrap_err();
    assert!(matches!(err, Error::CapacityExceeded { descriptor: 65_536, .. }));
    assert_eq!(poller.len(), 1);

    writer.write_all(b"still here").unwrap();
    let events = collect(&mut poller, PATIENCE);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].token(), Token(1));
}

#[test]
fn auto_backend_reports_peer_writes() {
    let mut poller = Poller::new(PollerConfig::default()).unwrap();
    assert!(Poller::available().contains(&poller.kind()));
    assert!(!poller.is_completion_based());

    let (reader, mut writer) = UnixStream::pair().unwrap();
    poller
        .add(reader.as_raw_fd(), Interest::READ, Token(42))
        .unwrap();
    writer.write_all(b"hello").unwrap();

    let mut seen = None;
    let n = poller
        .poll(PATIENCE, |ev| seen = Some((ev.descriptor(), ev.ready(), ev.token())))
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(seen, Some((reader.as_raw_fd(), Interest::READ, Token(42))));
}
