//! The listener / accept pipeline (spec S4.3.2): a bounded SYN queue of
//! lightweight entries, filled by the segment handler while the listener
//! TCB sits in `LISTEN`, drained by [`TcpListener::accept`].
//!
//! Grounded on the teacher's `listen.rs` Condvar-based accept loop, adapted
//! to the spec's contract that the *listener* only enqueues; the *acceptor*
//! builds the child TCB and sends the SYN|ACK, with the core mutex released
//! around the fallible buffer allocation (spec S2 design notes).

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::TcpConfig;
use crate::err::TcpError;
use crate::event;
use crate::manager::Manager;

use super::stream::TcpStream;
use super::{Dual, TCB};

/// How long `accept()` blocks between re-checking the listener still
/// exists. Not a user-visible timeout: the wait loops until a SYN arrives
/// or the listener is torn down.
const ACCEPT_POLL: Duration = Duration::from_secs(30);

/// A SYN queue entry: enough to build a child TCB and reply, without the
/// cost of a full transmission control block per half-open attempt.
#[derive(Debug, Clone, Copy)]
pub struct SynQueueItem {
    pub ingress_interface: u32,
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dest_addr: Ipv4Addr,
    pub isn: u32,
    pub mss: u16,
}

#[derive(Debug)]
pub struct TcpListener {
    pub(crate) local: Dual,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) config: TcpConfig,
}

impl TcpListener {
    /// Pops one queued SYN and completes the handshake (spec S4.3.2): child
    /// TCB construction and buffer allocation happen with `NET_MUTEX`
    /// released, so one slow allocation never blocks the segment/timer
    /// thread. If sending the SYN|ACK fails, the child is dropped and the
    /// next queued attempt is tried.
    pub fn accept(&self) -> Result<TcpStream, TcpError> {
        loop {
            let item = self.next_syn()?;

            let child = match TCB::new_child(self.local, &item, self.config) {
                Ok(tcb) => tcb,
                Err(_) => continue,
            };

            let mut manager = self.manager.lock().unwrap();
            let quad = child.quad().expect("new_child always sets remote");
            let events = child.events.clone();

            manager.connections.insert(quad, child);

            let ok = {
                let Manager { connections, tun, .. } = &mut *manager;
                let tcb = connections.get_mut(&quad).expect("just inserted");
                match tun.as_mut() {
                    Some(tun) => tcb.send_synack(tun).is_ok(),
                    None => true,
                }
            };

            if !ok {
                manager.connections.remove(&quad);
                continue;
            }

            drop(manager);
            return Ok(TcpStream::new(self.manager.clone(), quad, events));
        }
    }

    fn next_syn(&self) -> Result<SynQueueItem, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        loop {
            let listener = manager
                .listeners
                .get_mut(&self.local.port)
                .ok_or(TcpError::NotConfigured)?;

            if let Some(item) = listener.syn_queue.pop_front() {
                return Ok(item);
            }

            let events = listener.events.clone();
            let (g, _) = events.wait_for_events(manager, event::RX_READY, ACCEPT_POLL);
            manager = g;
        }
    }

    pub fn local_addr(&self) -> Dual {
        self.local
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();
        manager.listeners.remove(&self.local.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::State;
    use std::net::Ipv4Addr;
    use std::thread;

    fn sample_item(src_port: u16) -> SynQueueItem {
        SynQueueItem {
            ingress_interface: 0,
            src_addr: Ipv4Addr::new(10, 0, 0, 2),
            src_port,
            dest_addr: Ipv4Addr::new(10, 0, 0, 1),
            isn: 100,
            mss: 536,
        }
    }

    fn test_listener(local: Dual, config: TcpConfig, backlog: usize) -> TcpListener {
        let manager = Manager::test_harness();
        manager.lock().unwrap().listeners.insert(local.port, TCB::new_listener(local, config, backlog));

        TcpListener {
            local,
            manager,
            config,
        }
    }

    #[test]
    fn accept_completes_handshake_once_a_syn_is_already_queued() {
        let local = Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9000 };
        let config = TcpConfig::default();
        let listener = test_listener(local, config, 4);

        {
            let mut manager = listener.manager.lock().unwrap();
            let tcb = manager.listeners.get_mut(&local.port).unwrap();
            tcb.syn_queue.push_back(sample_item(5555));
        }

        let mut stream = listener.accept().unwrap();
        // Nothing drives this wire-less harness's child TCB to TX_SHUTDOWN,
        // so keep Drop's implicit `shutdown(Send)` from blocking for the
        // full default timeout once the test is done with the stream.
        stream.set_timeout(Duration::from_millis(200));

        assert_eq!(stream.peer_addr().src.port, 5555);
        assert_eq!(stream.get_state(), State::SynRcvd);
    }

    #[test]
    fn accept_blocks_until_a_syn_is_queued_by_the_segment_handler() {
        let local = Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9001 };
        let config = TcpConfig::default();
        let listener = test_listener(local, config, 4);

        let manager = listener.manager.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let events = {
                let mut manager = manager.lock().unwrap();
                let tcb = manager.listeners.get_mut(&local.port).unwrap();
                tcb.syn_queue.push_back(sample_item(6000));
                tcb.events.clone()
            };
            events.signal(event::RX_READY);
        });

        let mut stream = listener.accept().unwrap();
        stream.set_timeout(Duration::from_millis(200));
        handle.join().unwrap();

        assert_eq!(stream.peer_addr().src.port, 6000);
    }

    #[test]
    fn next_syn_reports_not_configured_once_the_listener_is_torn_down() {
        let local = Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9002 };
        let config = TcpConfig::default();
        let manager = Manager::test_harness();

        let listener = TcpListener {
            local,
            manager: manager.clone(),
            config,
        };

        assert_eq!(listener.next_syn().unwrap_err(), TcpError::NotConfigured);
    }

    #[test]
    fn dropping_a_listener_removes_it_from_the_manager() {
        let local = Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9003 };
        let config = TcpConfig::default();
        let listener = test_listener(local, config, 4);
        let manager = listener.manager.clone();

        assert!(manager.lock().unwrap().listeners.contains_key(&local.port));
        drop(listener);
        assert!(!manager.lock().unwrap().listeners.contains_key(&local.port));
    }
}
