//! Socket-facing half of a connection: `send`/`receive`/`shutdown`/`abort`
//! and `Read`/`Write` (spec S4.4, S4.5, S6).
//!
//! Grounded on the teacher's `stream.rs`: the same per-call
//! lock/wait/re-validate discipline, generalized from the teacher's
//! `rvar`/`wvar`/`svar` Condvars to the shared [`EventBus`] each TCB owns.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::err::TcpError;
use crate::event::{self, EventBus};
use crate::manager::Manager;

use super::{ioutil, Quad, State};

pub const NO_DELAY: u8 = 1 << 0;
pub const WAIT_ACK: u8 = 1 << 1;
pub const PUSH: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Send,
    Receive,
    Both,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct TcpStream {
    manager: Arc<Mutex<Manager>>,
    quad: Quad,
    events: Arc<EventBus>,
    timeout: Duration,
}

impl TcpStream {
    pub(crate) fn new(manager: Arc<Mutex<Manager>>, quad: Quad, events: Arc<EventBus>) -> Self {
        TcpStream {
            manager,
            quad,
            events,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn peer_addr(&self) -> Quad {
        self.quad
    }

    pub fn get_state(&self) -> State {
        let manager = self.manager.lock().unwrap();
        manager
            .connections
            .get(&self.quad)
            .map(|tcb| tcb.state)
            .unwrap_or(State::Closed)
    }

    /// `send(data, flags)` (spec S4.4): the seven-step queue loop, plus the
    /// optional `WAIT_ACK` block on `TX_ACKED` once everything is queued.
    pub fn send(&self, data: &[u8], flags: u8) -> Result<usize, TcpError> {
        let mut manager = self.manager.lock().unwrap();
        let mut written = 0;

        while written < data.len() {
            loop {
                let (g, signaled) = self.events.wait_for_events(manager, event::TX_READY, self.timeout);
                manager = g;
                if signaled.is_none() {
                    return Err(TcpError::Timeout);
                }

                let tcb = manager.connections.get_mut(&self.quad).ok_or(TcpError::NotConnected)?;
                match tcb.state {
                    State::Established | State::CloseWait => {}
                    State::Closed => {
                        return Err(if tcb.reset { TcpError::ConnectionReset } else { TcpError::NotConnected });
                    }
                    State::Listen => return Err(TcpError::NotConnected),
                    _ => return Err(TcpError::ConnectionClosing),
                }

                let free = tcb.free_tx();
                if free == 0 {
                    // TX_READY was set, so this should be unreachable; avoid
                    // spinning on NET_MUTEX if it somehow isn't.
                    return Err(TcpError::Failure);
                }

                let n = std::cmp::min(free, data.len() - written);
                let copied = tcb.queue_send(&data[written..written + n]);
                written += copied;

                if tcb.free_tx() == 0 {
                    tcb.events.clear(event::TX_READY);
                }

                break;
            }
        }

        if flags & WAIT_ACK != 0 {
            let (g, signaled) = self.events.wait_for_events(manager, event::TX_ACKED, self.timeout);
            manager = g;
            if signaled.is_none() {
                return Err(TcpError::Timeout);
            }

            let tcb = manager.connections.get(&self.quad).ok_or(TcpError::NotConnected)?;
            if !matches!(tcb.state, State::Established | State::CloseWait) {
                return Err(TcpError::NotConnected);
            }
        }

        let _ = flags & (NO_DELAY | PUSH);
        Ok(written)
    }

    /// `receive(buf, flags)` (spec S4.5): blocks until at least one byte is
    /// delivered or the peer's FIN has been consumed with nothing left
    /// buffered.
    pub fn receive(&self, buf: &mut [u8], _flags: u8) -> Result<usize, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        loop {
            let tcb = manager.connections.get_mut(&self.quad).ok_or(TcpError::NotConnected)?;

            if tcb.rcv_user() > 0 {
                let n = tcb.recv(buf);
                if tcb.rcv_user() == 0 {
                    tcb.events.clear(event::RX_READY);
                }
                return Ok(n);
            }

            if tcb.reset {
                return Err(TcpError::ConnectionReset);
            }

            if matches!(tcb.state, State::CloseWait | State::Closing | State::LastAck | State::TimeWait) {
                return Err(TcpError::EndOfStream);
            }

            if matches!(tcb.state, State::Closed) {
                return Err(TcpError::NotConnected);
            }

            let (g, signaled) = self.events.wait_for_events(manager, event::RX_READY, self.timeout);
            manager = g;
            if signaled.is_none() {
                return Err(TcpError::Timeout);
            }
        }
    }

    /// `shutdown(how)` (spec S4.3.4): SEND flushes and sends FIN|ACK, then
    /// blocks on `TX_SHUTDOWN`; RECEIVE (per spec.md verbatim) also waits on
    /// `TX_SHUTDOWN`, reflecting peer FIN arrival; BOTH runs SEND then
    /// RECEIVE.
    pub fn shutdown(&self, how: ShutdownHow) -> Result<(), TcpError> {
        let mut manager = self.manager.lock().unwrap();

        if matches!(how, ShutdownHow::Send | ShutdownHow::Both) {
            let tcb = manager.connections.get_mut(&self.quad).ok_or(TcpError::NotConnected)?;
            if matches!(tcb.state, State::Closed | State::Listen) {
                return Err(TcpError::NotConnected);
            }
            tcb.close_send_half();

            let (g, signaled) = self.events.wait_for_events(manager, event::TX_SHUTDOWN, self.timeout);
            manager = g;
            if signaled.is_none() {
                return Err(TcpError::Timeout);
            }
        }

        if matches!(how, ShutdownHow::Receive | ShutdownHow::Both) {
            manager.connections.get(&self.quad).ok_or(TcpError::NotConnected)?;
            let (_, signaled) = self.events.wait_for_events(manager, event::TX_SHUTDOWN, self.timeout);
            if signaled.is_none() {
                return Err(TcpError::Timeout);
            }
        }

        Ok(())
    }

    /// `abort()` (spec S4.3.3): sends a RST carrying `snd_nxt` and deletes
    /// the TCB outright, except in TIME_WAIT, where it only relinquishes
    /// ownership and leaves the TCB for the 2MSL reaper (or
    /// `kill_oldest_connection`) to claim.
    pub fn abort(&self) -> Result<(), TcpError> {
        let mut manager = self.manager.lock().unwrap();

        if manager.connections.get(&self.quad).ok_or(TcpError::NotConnected)?.state == State::TimeWait {
            return Ok(());
        }

        let seq = {
            let Manager { connections, .. } = &mut *manager;
            let tcb = connections.get_mut(&self.quad).ok_or(TcpError::NotConnected)?;
            let (_, seq) = tcb.abort_segment().ok_or(TcpError::NotConnected)?;
            tcb.reset = true;
            seq
        };

        {
            let Manager { tun, .. } = &mut *manager;
            if let Some(tun) = tun.as_mut() {
                ioutil::write_local_reset(&self.quad, seq, tun);
            }
        }

        manager.connections.remove(&self.quad);
        self.events
            .signal(event::CLOSED | event::RX_READY | event::TX_ACKED | event::TX_SHUTDOWN);

        Ok(())
    }
}

fn to_io_error(err: TcpError) -> io::Error {
    let kind = match err {
        TcpError::ConnectionReset => io::ErrorKind::ConnectionReset,
        TcpError::NotConnected => io::ErrorKind::NotConnected,
        TcpError::Timeout => io::ErrorKind::TimedOut,
        TcpError::EndOfStream => return io::Error::new(io::ErrorKind::UnexpectedEof, err),
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.receive(buf, 0) {
            Ok(n) => Ok(n),
            Err(TcpError::EndOfStream) => Ok(0),
            Err(e) => Err(to_io_error(e)),
        }
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf, 0).map_err(to_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        loop {
            let tcb = manager.connections.get(&self.quad).ok_or_else(|| to_io_error(TcpError::NotConnected))?;
            if tcb.snd_user() == 0 {
                return Ok(());
            }

            let (g, signaled) = self.events.wait_for_events(manager, event::TX_DONE, self.timeout);
            manager = g;
            if signaled.is_none() {
                return Err(to_io_error(TcpError::Timeout));
            }
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        let _ = self.shutdown(ShutdownHow::Send);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpConfig;
    use crate::tcp::{Dual, TCB};
    use std::net::Ipv4Addr;
    use std::thread;

    fn sample_quad() -> Quad {
        Quad {
            src: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 2), port: 4000 },
            dst: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 80 },
        }
    }

    /// Builds a TCB via `TCB::new_active`, drives it straight to
    /// `ESTABLISHED` the way the fixed `tcb.rs` transition sites do
    /// (`CONNECTED | TX_READY`), and wraps it in a `TcpStream` backed by a
    /// wire-less [`Manager`] test harness.
    fn established_stream(config: TcpConfig) -> (Arc<Mutex<Manager>>, TcpStream) {
        let quad = sample_quad();
        let mut tcb = TCB::new_active(quad, config).unwrap();
        tcb.state = State::Established;
        let events = tcb.events.clone();
        events.signal(event::CONNECTED | event::TX_READY);

        let manager = Manager::test_harness();
        manager.lock().unwrap().connections.insert(quad, tcb);

        let mut stream = TcpStream::new(manager.clone(), quad, events);
        // Nothing drives this wire-less harness's TCB to TX_SHUTDOWN on its
        // own, so keep Drop's implicit `shutdown(Send)` from blocking for
        // the full default timeout once a test is done with the stream.
        stream.set_timeout(Duration::from_millis(200));
        (manager, stream)
    }

    #[test]
    fn send_queues_bytes_and_reports_bytes_written() {
        let (manager, stream) = established_stream(TcpConfig::default());

        let n = stream.send(b"hello", 0).unwrap();
        assert_eq!(n, 5);

        let manager = manager.lock().unwrap();
        let tcb = manager.connections.get(&stream.peer_addr()).unwrap();
        assert_eq!(tcb.snd_user(), 5);
    }

    #[test]
    fn send_stops_at_not_connected_when_tcb_is_gone() {
        let quad = sample_quad();
        let events = Arc::new(EventBus::new());
        events.signal(event::TX_READY);

        let manager = Manager::test_harness();
        let stream = TcpStream::new(manager, quad, events);

        assert_eq!(stream.send(b"x", 0).unwrap_err(), TcpError::NotConnected);
    }

    #[test]
    fn send_after_reset_reports_connection_reset() {
        let (manager, stream) = {
            let quad = sample_quad();
            let mut tcb = TCB::new_active(quad, TcpConfig::default()).unwrap();
            tcb.state = State::Closed;
            tcb.reset = true;
            let events = tcb.events.clone();
            events.signal(event::TX_READY);

            let manager = Manager::test_harness();
            manager.lock().unwrap().connections.insert(quad, tcb);
            let stream = TcpStream::new(manager.clone(), quad, events);
            (manager, stream)
        };

        assert_eq!(manager.lock().unwrap().connections.len(), 1);
        assert_eq!(stream.send(b"x", 0).unwrap_err(), TcpError::ConnectionReset);
    }

    /// Regression test for the sanity branch in `send()`'s loop (spec.md
    /// S4.4 step 3): if `TX_READY` is ever set while `free_tx() == 0`, the
    /// call must fail fast rather than spin on `wait_for_events` while
    /// holding the manager lock.
    #[test]
    fn send_with_zero_free_space_fails_fast_instead_of_spinning() {
        let config = TcpConfig {
            tx_buffer_size: 4,
            ..TcpConfig::default()
        };
        let (manager, stream) = established_stream(config);

        {
            let mut manager = manager.lock().unwrap();
            let tcb = manager.connections.get_mut(&stream.peer_addr()).unwrap();
            assert_eq!(tcb.queue_send(b"abcd"), 4);
            assert_eq!(tcb.free_tx(), 0);
            // Force the fault this branch exists to catch: TX_READY set
            // with no free space.
            tcb.events.signal(event::TX_READY);
        }

        assert_eq!(stream.send(b"e", 0).unwrap_err(), TcpError::Failure);
    }

    #[test]
    fn receive_returns_buffered_bytes_and_clears_rx_ready_once_drained() {
        let (manager, stream) = established_stream(TcpConfig::default());

        {
            let mut manager = manager.lock().unwrap();
            let tcb = manager.connections.get_mut(&stream.peer_addr()).unwrap();
            tcb.rx.push(b"hi there");
            tcb.events.signal(event::RX_READY);
        }

        let mut buf = [0u8; 8];
        let n = stream.receive(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hi there");

        let manager = manager.lock().unwrap();
        let tcb = manager.connections.get(&stream.peer_addr()).unwrap();
        assert_eq!(tcb.events.bits() & event::RX_READY, 0);
    }

    #[test]
    fn receive_blocks_until_data_arrives() {
        let (manager, stream) = established_stream(TcpConfig::default());
        let quad = stream.peer_addr();

        let producer = {
            let manager = manager.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let mut manager = manager.lock().unwrap();
                let tcb = manager.connections.get_mut(&quad).unwrap();
                tcb.rx.push(b"late");
                tcb.events.signal(event::RX_READY);
            })
        };

        let mut buf = [0u8; 4];
        let n = stream.receive(&mut buf, 0).unwrap();
        producer.join().unwrap();

        assert_eq!(&buf[..n], b"late");
    }

    #[test]
    fn receive_after_close_wait_with_empty_rx_reports_end_of_stream() {
        let (_manager, stream) = {
            let quad = sample_quad();
            let mut tcb = TCB::new_active(quad, TcpConfig::default()).unwrap();
            tcb.state = State::CloseWait;
            let events = tcb.events.clone();

            let manager = Manager::test_harness();
            manager.lock().unwrap().connections.insert(quad, tcb);
            let mut stream = TcpStream::new(manager.clone(), quad, events);
            stream.set_timeout(Duration::from_millis(200));
            (manager, stream)
        };

        let mut buf = [0u8; 4];
        assert_eq!(stream.receive(&mut buf, 0).unwrap_err(), TcpError::EndOfStream);
    }

    #[test]
    fn shutdown_send_queues_fin_and_completes_once_acked() {
        let (manager, stream) = established_stream(TcpConfig::default());
        let quad = stream.peer_addr();

        let acker = {
            let manager = manager.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let manager = manager.lock().unwrap();
                let tcb = manager.connections.get(&quad).unwrap();
                tcb.events.signal(event::TX_SHUTDOWN);
            })
        };

        stream.shutdown(ShutdownHow::Send).unwrap();
        acker.join().unwrap();

        let manager = manager.lock().unwrap();
        let tcb = manager.connections.get(&quad).unwrap();
        assert_eq!(tcb.state, State::FinWait1);
    }

    #[test]
    fn shutdown_on_closed_connection_is_not_connected() {
        let quad = sample_quad();
        let tcb = TCB::new_listener(Dual { ipv4: quad.dst.ipv4, port: quad.dst.port }, TcpConfig::default(), 1);
        let events = tcb.events.clone();

        let manager = Manager::test_harness();
        manager.lock().unwrap().connections.insert(quad, tcb);
        let stream = TcpStream::new(manager, quad, events);

        assert_eq!(stream.shutdown(ShutdownHow::Send).unwrap_err(), TcpError::NotConnected);
    }

    #[test]
    fn abort_removes_the_connection_and_wakes_every_waiter() {
        let (manager, stream) = established_stream(TcpConfig::default());
        let quad = stream.peer_addr();

        stream.abort().unwrap();

        assert!(!manager.lock().unwrap().connections.contains_key(&quad));
        assert_eq!(stream.get_state(), State::Closed);
    }

    /// Scenario 6 (spec.md S8): `abort` in TIME_WAIT relinquishes ownership
    /// only — the TCB stays put until the 2MSL reaper claims it.
    #[test]
    fn abort_in_time_wait_leaves_the_tcb_in_place() {
        let quad = sample_quad();
        let mut tcb = TCB::new_active(quad, TcpConfig::default()).unwrap();
        tcb.state = State::TimeWait;
        let events = tcb.events.clone();

        let manager = Manager::test_harness();
        manager.lock().unwrap().connections.insert(quad, tcb);
        let stream = TcpStream::new(manager.clone(), quad, events);

        stream.abort().unwrap();

        let manager = manager.lock().unwrap();
        let tcb = manager.connections.get(&quad).expect("TIME_WAIT abort must not delete the TCB");
        assert_eq!(tcb.state, State::TimeWait);
        assert!(!tcb.reset);
    }

    /// Boundary (spec.md S8): a `send` of exactly `tx_buffer_size` bytes
    /// completes without blocking once queued; `tx_buffer_size + 1` bytes
    /// blocks on `TX_READY` until space frees up.
    #[test]
    fn send_of_exactly_buffer_size_completes_send_of_one_more_blocks() {
        let config = TcpConfig { tx_buffer_size: 4, ..TcpConfig::default() };
        let (manager, stream) = established_stream(config);

        let n = stream.send(b"abcd", 0).unwrap();
        assert_eq!(n, 4);
        assert_eq!(manager.lock().unwrap().connections.get(&stream.peer_addr()).unwrap().free_tx(), 0);

        let quad = stream.peer_addr();
        let drainer = {
            let manager = manager.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let mut manager = manager.lock().unwrap();
                let tcb = manager.connections.get_mut(&quad).unwrap();
                let mut sink = [0u8; 4];
                tcb.tx.drain_into(&mut sink);
                tcb.events.signal(event::TX_READY);
            })
        };

        let n = stream.send(b"e", 0).unwrap();
        drainer.join().unwrap();

        assert_eq!(n, 1);
    }

    #[test]
    fn abort_on_already_gone_connection_is_not_connected() {
        let quad = sample_quad();
        let events = Arc::new(EventBus::new());
        let manager = Manager::test_harness();
        let stream = TcpStream::new(manager, quad, events);

        assert_eq!(stream.abort().unwrap_err(), TcpError::NotConnected);
    }
}
