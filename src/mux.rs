//! The multiplex loop: a single-threaded, readiness-driven scheduler over
//! one tty session, one listener session, and N client sessions.
//!
//! Maintains two invariants while advancing I/O in `poll(2)`-driven steps:
//!   I1: writes to the tty are atomic at record granularity.
//!   I2: every client gets fair access to the tty writer.
//!
//! There is exactly one suspension point per iteration: the `poll` wait.
//! Everything else in a given iteration runs to completion without
//! yielding, so no locks are needed anywhere in this module.

use std::fs::File;
use std::io::Write;
use std::net::TcpListener;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::delim::Buffering;
use crate::error::{Error, Result};
use crate::ring::{Rb, DEFAULT_CAPACITY};
use crate::session::{Session, SessionId, SessionResource, SessionTable};

/// Why `run()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `read()` on the tty returned 0.
    TtyEof,
    /// The SIGTERM flag was observed at the top of an iteration.
    Signal,
}

#[derive(Clone, Copy)]
enum Interest {
    Read,
    Write,
}

pub struct MultiplexLoop {
    sessions: SessionTable,
    tty_id: SessionId,
    listener_id: SessionId,
    buffering: Buffering,
    /// The client whose record is partially written to the tty. While set,
    /// no other client's record may begin writing (invariant I1).
    pending: Option<SessionId>,
    /// The client served most recently by the round-robin writer.
    last: Option<SessionId>,
    shutdown: Arc<AtomicBool>,
}

impl MultiplexLoop {
    pub fn new(
        tty_file: File,
        listener: TcpListener,
        buffering: Buffering,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;

        let tty_ring = Rb::create(DEFAULT_CAPACITY)?;
        let mut sessions = SessionTable::new();
        let tty_id = sessions.insert(Session::tty(tty_file, tty_ring));
        let listener_id = sessions.insert(Session::listener(listener));

        Ok(Self {
            sessions,
            tty_id,
            listener_id,
            buffering,
            pending: None,
            last: None,
            shutdown,
        })
    }

    /// The tty's raw fd, valid for as long as the loop hasn't been dropped.
    /// Callers use this after `run()` returns to restore saved termios
    /// attributes, since the loop (not the caller) owns the `File`.
    pub fn tty_fd(&self) -> RawFd {
        self.sessions.get(self.tty_id).expect("tty session always present").fd()
    }

    pub fn client_count(&self) -> usize {
        self.sessions.clients().count()
    }

    pub fn run(&mut self) -> Result<ShutdownReason> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("SIGTERM observed, shutting down");
                return Ok(ShutdownReason::Signal);
            }

            if let Some(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    /// One iteration of the loop body. Returns `Some(reason)` when the loop
    /// should stop.
    fn step(&mut self) -> Result<Option<ShutdownReason>> {
        self.reap_and_grow_clients()?;

        let (poll_fds_meta, mut fds) = self.build_poll_set();

        // `signal_hook::flag::register` doesn't install SIGTERM with
        // `SA_RESTART`, so a signal delivered while blocked here surfaces
        // as `EINTR` rather than silently restarting the call. Loop back
        // to the top of `run()` instead of propagating: the shutdown flag
        // is already set by the time the handler returns, so the next
        // iteration's check at the top of `run()` picks it up.
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(Error::Errno(e)),
        }

        let mut readable: Vec<(RawFd, SessionId)> = Vec::new();
        let mut tty_writable = false;

        for (pfd, (id, interest)) in fds.iter().zip(poll_fds_meta.iter()) {
            let Some(revents) = pfd.revents() else {
                continue;
            };
            match interest {
                Interest::Read => {
                    if revents.intersects(
                        PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                    ) {
                        if let Some(session) = self.sessions.get(*id) {
                            readable.push((session.fd(), *id));
                        }
                    }
                }
                Interest::Write => {
                    if revents.contains(PollFlags::POLLOUT) {
                        tty_writable = true;
                    }
                }
            }
        }

        readable.sort_by_key(|(fd, _)| *fd);

        for (_, id) in readable {
            if id == self.tty_id {
                if self.service_tty_readable()? {
                    return Ok(Some(ShutdownReason::TtyEof));
                }
            } else if id == self.listener_id {
                self.service_accept();
            } else {
                self.service_client_readable(id)?;
            }
        }

        if tty_writable {
            self.service_tty_writable()?;
        }

        self.service_tty_to_clients()?;

        Ok(None)
    }

    /// Step 1's per-client bookkeeping: reap drained closed sessions, and
    /// grow any ring that's full but still has no complete record.
    fn reap_and_grow_clients(&mut self) -> Result<()> {
        let client_ids: Vec<SessionId> = self.sessions.clients().collect();
        let mut to_reap = Vec::new();

        for id in client_ids {
            let session = self.sessions.get_mut(id).expect("just listed");
            let ring = session.ring.as_mut().expect("clients always have a ring");
            let record_len = self.buffering.record_len(ring);

            if session.is_reapable(record_len > 0) {
                to_reap.push(id);
                continue;
            }

            if record_len == 0 && ring.is_full() {
                log::debug!("client ring full with no delimiter, doubling capacity");
                ring.grow_double()?;
            }
        }

        for id in to_reap {
            log::debug!("reaping drained closed client session");
            self.sessions.remove(id);
            if self.pending == Some(id) {
                self.pending = None;
            }
            if self.last == Some(id) {
                self.last = None;
            }
        }

        Ok(())
    }

    /// Builds the readiness set for this iteration from the session table,
    /// fresh every time -- this is the "ready set abstraction" that avoids
    /// both `FD_SETSIZE` and the realloc-on-accept hazard of the original.
    fn build_poll_set(&self) -> (Vec<(SessionId, Interest)>, Vec<PollFd<'_>>) {
        let mut meta = Vec::new();
        let mut fds = Vec::new();

        for id in self.sessions.ids() {
            let session = self.sessions.get(id).expect("just listed");
            let wants_read = match &session.resource {
                SessionResource::Tty(_) | SessionResource::Listener(_) => true,
                SessionResource::Client(_) => !session.closed,
            };
            if wants_read {
                let fd = unsafe { BorrowedFd::borrow_raw(session.fd()) };
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
                meta.push((id, Interest::Read));
            }
        }

        let any_client_has_record = self.sessions.clients().any(|id| {
            self.sessions
                .get(id)
                .and_then(|s| s.ring.as_ref())
                .map(|r| self.buffering.record_len(r) > 0)
                .unwrap_or(false)
        });

        if self.pending.is_some() || any_client_has_record {
            let tty_fd = self.sessions.get(self.tty_id).expect("tty always present").fd();
            let fd = unsafe { BorrowedFd::borrow_raw(tty_fd) };
            fds.push(PollFd::new(fd, PollFlags::POLLOUT));
            meta.push((self.tty_id, Interest::Write));
        }

        (meta, fds)
    }

    /// Returns `true` on tty EOF.
    fn service_tty_readable(&mut self) -> Result<bool> {
        let tty_fd = self.sessions.get(self.tty_id).expect("tty always present").fd();
        let session = self.sessions.get_mut(self.tty_id).expect("tty always present");
        let ring = session.ring.as_mut().expect("tty always has a ring");

        // A full ring with an undrained record is a transient condition,
        // not a fault -- skip the read this iteration rather than treating
        // it as an error, matching the original's tolerance for a
        // momentarily-full cbuff.
        if ring.is_full() {
            log::debug!("tty ring full, deferring read until drained");
            return Ok(false);
        }

        match ring.fill_from(tty_fd) {
            Ok(0) => {
                log::info!("tty reached EOF");
                self.initiate_shutdown();
                return Ok(true);
            }
            Ok(n) if n < 0 => {
                log::debug!("transient error reading tty, will retry next iteration");
            }
            Ok(n) => log::debug!("read {n} bytes from tty"),
            Err(e) => log::debug!("error reading tty: {e}"),
        }
        Ok(false)
    }

    fn initiate_shutdown(&mut self) {
        self.sessions.remove(self.listener_id);
        for id in self.sessions.clients().collect::<Vec<_>>() {
            if let Some(session) = self.sessions.get_mut(id) {
                session.mark_closed();
            }
        }
    }

    fn service_accept(&mut self) {
        let accept_result = match self.sessions.get(self.listener_id).map(|s| &s.resource) {
            Some(SessionResource::Listener(listener)) => listener.accept(),
            _ => unreachable!("listener session always holds a TcpListener"),
        };

        match accept_result {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    log::warn!("failed to set client {peer} nonblocking: {e}");
                    return;
                }
                match Rb::create(DEFAULT_CAPACITY) {
                    Ok(ring) => {
                        log::info!("connection from {peer}");
                        self.sessions.insert(Session::client(stream, ring, peer));
                    }
                    Err(e) => {
                        log::error!("failed to allocate ring for new client {peer}: {e}");
                    }
                }
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
            }
        }
    }

    fn service_client_readable(&mut self, id: SessionId) -> Result<()> {
        let fd = self.sessions.get(id).expect("just listed").fd();
        let session = self.sessions.get_mut(id).expect("just listed");
        let ring = session.ring.as_mut().expect("clients always have a ring");

        if ring.is_full() {
            log::debug!("client ring full, deferring read until drained");
            return Ok(());
        }

        match ring.fill_from(fd) {
            Ok(0) => {
                log::debug!("client closed, entering drain state");
                session.mark_closed();
            }
            Ok(n) if n < 0 => log::debug!("transient error reading client"),
            Ok(n) => log::debug!("read {n} bytes from client"),
            Err(e) => log::debug!("error reading client: {e}"),
        }
        Ok(())
    }

    /// Step 4: service tty writability, either completing a pending
    /// partial write or running the round-robin election.
    fn service_tty_writable(&mut self) -> Result<()> {
        let tty_fd = self.sessions.get(self.tty_id).expect("tty always present").fd();

        if let Some(pending_id) = self.pending {
            match self.sessions.get_mut(pending_id) {
                Some(session) => {
                    let ring = session.ring.as_mut().expect("clients always have a ring");
                    let n = self.buffering.record_len(ring);
                    if n > 0 {
                        let written = ring.drain_to(tty_fd, n)?;
                        if written == n {
                            log::debug!("completed pending record for client");
                            self.pending = None;
                        }
                    } else {
                        // Record consumed some other way (shouldn't normally
                        // happen); clear pending defensively.
                        self.pending = None;
                    }
                }
                None => self.pending = None,
            }
            return Ok(());
        }

        self.elect_and_write(tty_fd)
    }

    fn elect_and_write(&mut self, tty_fd: RawFd) -> Result<()> {
        let ids: Vec<SessionId> = self.sessions.clients().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let n = ids.len();
        let start = match self.last {
            Some(last_id) => ids
                .iter()
                .position(|&x| x == last_id)
                .map(|p| (p + 1) % n)
                .unwrap_or(0),
            None => 0,
        };

        for offset in 0..n {
            let idx = (start + offset) % n;
            let id = ids[idx];
            let session = self.sessions.get_mut(id).expect("just listed");
            let ring = session.ring.as_mut().expect("clients always have a ring");
            let record_len = self.buffering.record_len(ring);

            if record_len > 0 {
                let written = ring.drain_to(tty_fd, record_len)?;
                log::debug!("wrote {written} of {record_len} bytes to tty from client");
                if written < record_len {
                    self.pending = Some(id);
                }
                self.last = Some(id);
                return Ok(());
            } else if ring.is_full() {
                log::debug!("resizing full client ring with no delimiter");
                ring.grow_double()?;
            }
        }

        Ok(())
    }

    /// Step 5: broadcast a complete tty record to every open client.
    fn service_tty_to_clients(&mut self) -> Result<()> {
        let record_len = {
            let session = self.sessions.get(self.tty_id).expect("tty always present");
            let ring = session.ring.as_ref().expect("tty always has a ring");
            self.buffering.record_len(ring)
        };

        if record_len == 0 {
            let session = self.sessions.get_mut(self.tty_id).expect("tty always present");
            let ring = session.ring.as_mut().expect("tty always has a ring");
            if ring.is_full() {
                log::debug!("tty ring full with no delimiter, doubling capacity");
                ring.grow_double()?;
            }
            return Ok(());
        }

        let mut scratch = vec![0u8; record_len];
        {
            let session = self.sessions.get_mut(self.tty_id).expect("tty always present");
            let ring = session.ring.as_mut().expect("tty always has a ring");
            ring.copy_out(&mut scratch, record_len);
        }

        for id in self.sessions.clients().collect::<Vec<_>>() {
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            if session.closed {
                continue;
            }
            if let SessionResource::Client(stream) = &mut session.resource {
                match stream.write(&scratch) {
                    Ok(written) if written < scratch.len() => {
                        log::debug!(
                            "partial fan-out write ({written} of {} bytes), tail dropped",
                            scratch.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("fan-out write to client failed: {e}");
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::os::fd::FromRawFd;
    use std::thread;
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// A `socketpair(2)` fd pair stands in for the tty: one end is handed to
    /// the loop as its tty `File`, the other is kept by the test to act as
    /// "the serial line".
    fn tty_stand_in() -> (File, File) {
        let (a, b) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None::<nix::sys::socket::SockProtocol>,
            nix::sys::socket::SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        use std::os::fd::IntoRawFd;
        unsafe { (File::from_raw_fd(a.into_raw_fd()), File::from_raw_fd(b.into_raw_fd())) }
    }

    fn bind_loopback() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").unwrap()
    }

    fn read_available(f: &mut File, max: usize) -> Vec<u8> {
        thread::sleep(Duration::from_millis(50));
        let mut buf = vec![0u8; max];
        match f.read(&mut buf) {
            Ok(n) => buf[..n].to_vec(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn scenario_one_client_line_mode() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"hello\nworld\n").unwrap();

        let seen = read_available(&mut test_tty, 64);
        assert_eq!(seen, b"hello\nworld\n");

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn scenario_tty_eof_shuts_down_cleanly() {
        init_logging();
        let (loop_tty, test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        drop(test_tty); // tty EOF

        let reason = handle.join().unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::TtyEof);
    }

    #[test]
    fn scenario_sigterm_flag_stops_loop() {
        init_logging();
        let (loop_tty, _test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        thread::sleep(Duration::from_millis(20));
        shutdown.store(true, Ordering::SeqCst);

        // The loop is parked in `poll` until something makes a descriptor
        // ready; connecting wakes it so it returns to the top of the loop
        // and observes the flag. Real deployments always have other
        // activity (clients, tty bytes) to do this naturally.
        let _ = TcpStream::connect(addr).unwrap();

        let reason = handle.join().unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Signal);
    }

    /// Regression test for the EINTR path specifically: `shutdown.store`
    /// above exercises the flag but never makes `poll` itself fail, so it
    /// can't catch `signal_hook::flag::register` installing SIGTERM without
    /// `SA_RESTART`. This test installs a real handler and raises a real
    /// signal while the loop is parked in `poll`.
    #[test]
    fn scenario_real_sigterm_during_poll_is_not_lost_to_eintr() {
        init_logging();
        let (loop_tty, _test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let shutdown = crate::signal::install_term_flag().unwrap();
        let mut mux = MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown).unwrap();

        let handle = thread::spawn(move || mux.run());

        thread::sleep(Duration::from_millis(50));
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

        let reason = handle.join().unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Signal);
    }

    #[test]
    fn scenario_drain_after_close_reaches_tty() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"X\n").unwrap();
        drop(client); // peer closes right after sending a complete record

        let seen = read_available(&mut test_tty, 8);
        assert_eq!(seen, b"X\n");

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn scenario_broadcast_is_one_write_per_client() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client_a = TcpStream::connect(addr).unwrap();
        let mut client_b = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        test_tty.write_all(b"Y\n").unwrap();

        let mut buf_a = [0u8; 8];
        let mut buf_b = [0u8; 8];
        thread::sleep(Duration::from_millis(50));
        let n_a = client_a.read(&mut buf_a).unwrap();
        let n_b = client_b.read(&mut buf_b).unwrap();
        assert_eq!(&buf_a[..n_a], b"Y\n");
        assert_eq!(&buf_b[..n_b], b"Y\n");

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn scenario_tiu_mode_framing() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Tiu, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"FOO\x4Dbar\x4D").unwrap();

        let seen = read_available(&mut test_tty, 16);
        assert_eq!(seen, b"FOO\x4Dbar\x4D");

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    /// Like `tty_stand_in`, but with the kernel socket buffers shrunk on
    /// both ends so a single `write()` of more than `bufsize`-ish bytes
    /// can't complete in one call, forcing the loop's `pending` partial-
    /// write continuation to actually engage.
    fn tty_stand_in_small_buffer(bufsize: usize) -> (File, File) {
        let (a, b) = nix::sys::socket::socketpair(
            nix::sys::socket::AddressFamily::Unix,
            nix::sys::socket::SockType::Stream,
            None::<nix::sys::socket::SockProtocol>,
            nix::sys::socket::SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        nix::sys::socket::setsockopt(&a, nix::sys::socket::sockopt::SndBuf, &bufsize).unwrap();
        nix::sys::socket::setsockopt(&b, nix::sys::socket::sockopt::RcvBuf, &bufsize).unwrap();
        use std::os::fd::IntoRawFd;
        unsafe { (File::from_raw_fd(a.into_raw_fd()), File::from_raw_fd(b.into_raw_fd())) }
    }

    #[test]
    fn scenario_concurrent_clients_records_never_interleave() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client_a = TcpStream::connect(addr).unwrap();
        let mut client_b = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        let record_a = format!("{}\n", "a".repeat(40));
        let record_b = format!("{}\n", "b".repeat(40));
        client_a.write_all(record_a.as_bytes()).unwrap();
        client_b.write_all(record_b.as_bytes()).unwrap();

        let seen = read_available(&mut test_tty, record_a.len() + record_b.len());
        assert_eq!(seen.len(), record_a.len() + record_b.len());

        // Invariant I1: each record is a single atomic write to the tty, so
        // the two never interleave byte-by-byte no matter which arrives
        // first.
        if seen.starts_with(record_a.as_bytes()) {
            assert_eq!(&seen[record_a.len()..], record_b.as_bytes());
        } else if seen.starts_with(record_b.as_bytes()) {
            assert_eq!(&seen[record_b.len()..], record_a.as_bytes());
        } else {
            panic!("records interleaved on the tty: {seen:?}");
        }

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn scenario_three_simultaneous_clients_are_all_served() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut clients: Vec<TcpStream> =
            (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        thread::sleep(Duration::from_millis(50));

        for (i, client) in clients.iter_mut().enumerate() {
            client.write_all(format!("{i}\n").as_bytes()).unwrap();
        }

        // Invariant I2 (fairness): none of the three is starved within a
        // single round, regardless of which order the round-robin visits
        // them in.
        let seen = read_available(&mut test_tty, 6);
        assert_eq!(seen.len(), 6);
        let mut records: Vec<&[u8]> = seen.chunks(2).collect();
        records.sort();
        assert_eq!(records, vec![b"0\n".as_slice(), b"1\n".as_slice(), b"2\n".as_slice()]);

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn scenario_oversized_record_forces_ring_growth() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in();
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        // 300 bytes with no delimiter forces the client's ring (starting
        // at DEFAULT_CAPACITY, 64) to double past capacity at least twice
        // (64 -> 128 -> 256) before the trailing newline ever completes a
        // record, exercising monotonic growth end to end.
        assert!(300 > DEFAULT_CAPACITY * 4);
        let mut record = vec![b'z'; 300];
        record.push(b'\n');
        client.write_all(&record).unwrap();

        let seen = read_available(&mut test_tty, record.len());
        assert_eq!(seen, record);

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn scenario_partial_tty_write_completes_via_pending_before_next_client() {
        init_logging();
        let (loop_tty, mut test_tty) = tty_stand_in_small_buffer(64);
        let listener = bind_loopback();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut mux =
            MultiplexLoop::new(loop_tty, listener, Buffering::Line, shutdown.clone()).unwrap();

        let handle = thread::spawn(move || mux.run());

        let mut client_a = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        // Much bigger than the shrunk kernel buffer on the tty side, so
        // `drain_to` can't finish this record in a single `write()` and the
        // session sits in `pending` across several loop iterations.
        let record_a = format!("{}\n", "a".repeat(4096));
        client_a.write_all(record_a.as_bytes()).unwrap();
        thread::sleep(Duration::from_millis(50));

        // A second client's record arrives while A is still pending;
        // invariant I1 says it must not interleave into the tty mid-write.
        let mut client_b = TcpStream::connect(addr).unwrap();
        client_b.write_all(b"b\n").unwrap();

        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut buf = [0u8; 512];
        while collected.len() < record_a.len() + 2 && std::time::Instant::now() < deadline {
            match test_tty.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(_) => thread::sleep(Duration::from_millis(10)),
            }
        }

        assert_eq!(collected.len(), record_a.len() + 2);
        assert!(collected.starts_with(record_a.as_bytes()));
        assert_eq!(&collected[record_a.len()..], b"b\n");

        drop(test_tty);
        handle.join().unwrap().unwrap();
    }
}
