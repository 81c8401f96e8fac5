//! The network stack: owns the tun device, the connection/listener tables
//! behind `NET_MUTEX`, and the segment/timer threads (spec S2 item 3, S5).
//!
//! Grounded on the teacher's `lib.rs`: the same `poll`-driven read loop and
//! per-segment dispatch, split into two threads (segment handling, timer
//! ticking) to match the three "logical producers" spec.md S5 names, rather
//! than the teacher's single combined loop.

use std::collections::HashMap;
use std::io::Read;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

use crate::config::TcpConfig;
use crate::err::{Error, TcpError};
use crate::event;
use crate::port::get_dynamic_port;
use crate::tcp::{Action, Dual, Quad, TcpListener, TcpStream, TCB};

pub struct Manager {
    pub(crate) listeners: HashMap<u16, TCB>,
    pub(crate) connections: HashMap<Quad, TCB>,
    /// `None` only for a bare test harness with no wire attached; every
    /// `Manager` built through [`NetStack::new`] always holds `Some`.
    pub(crate) tun: Option<Tun>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("listeners", &self.listeners)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl Manager {
    /// Builds a bare, wire-less `Manager` for tests that exercise the
    /// connection/listener tables without a real tun device.
    pub(crate) fn test_harness() -> Arc<Mutex<Manager>> {
        Arc::new(Mutex::new(Manager {
            listeners: HashMap::new(),
            connections: HashMap::new(),
            tun: None,
        }))
    }
}

/// How often the timer thread scans every live TCB for an expired
/// retransmission, override, probe, or 2MSL deadline.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    local_addr: Ipv4Addr,
    config: TcpConfig,
    segment_thread: thread::JoinHandle<()>,
    timer_thread: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, config: TcpConfig) -> Result<Self, Error> {
        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        let manager = Arc::new(Mutex::new(Manager {
            listeners: HashMap::new(),
            connections: HashMap::new(),
            tun: Some(tun),
        }));

        let segment_thread = {
            let manager = manager.clone();
            thread::spawn(move || segment_loop(manager))
        };

        let timer_thread = {
            let manager = manager.clone();
            thread::spawn(move || timer_loop(manager))
        };

        Ok(NetStack {
            manager,
            local_addr: addr,
            config,
            segment_thread,
            timer_thread,
        })
    }

    /// `listen(backlog)` (spec S4.3.1 table, S6): materializes a TCB in
    /// `LISTEN` bound to `port`. Rejects a second listener on the same
    /// port per the Open Questions §9 resolution (`ALREADY_CONNECTED`).
    pub fn listen(&self, port: u16, backlog: usize) -> Result<TcpListener, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        if manager.listeners.contains_key(&port) {
            return Err(TcpError::AlreadyConnected);
        }

        let local = Dual {
            ipv4: self.local_addr,
            port,
        };

        manager.listeners.insert(port, TCB::new_listener(local, self.config, backlog));

        Ok(TcpListener {
            local,
            manager: self.manager.clone(),
            config: self.config,
        })
    }

    /// `connect(remote_ip, remote_port)` (spec S4.3.1): active open on a
    /// freshly allocated ephemeral port, blocking until `CONNECTED` or
    /// `CLOSED` fires. Per the Open Questions §9 resolution, the wait
    /// checks each named bit individually rather than the union mask.
    pub fn connect(&self, remote: Dual) -> Result<TcpStream, TcpError> {
        let mut manager = self.manager.lock().unwrap();

        let local = Dual {
            ipv4: self.local_addr,
            port: get_dynamic_port(),
        };
        let quad = Quad { src: remote, dst: local };

        let mut tcb = TCB::new_active(quad, self.config)?;
        let events = tcb.events.clone();

        {
            let Manager { tun, .. } = &mut *manager;
            if let Some(tun) = tun.as_mut() {
                tcb.send_syn(tun);
            }
        }
        manager.connections.insert(quad, tcb);

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        loop {
            let (g, signaled) = events.wait_for_events(manager, event::CONNECTED | event::CLOSED, connect_timeout);
            manager = g;

            let Some(signaled) = signaled else {
                manager.connections.remove(&quad);
                return Err(TcpError::Timeout);
            };

            if signaled & event::CONNECTED != 0 {
                return Ok(TcpStream::new(self.manager.clone(), quad, events));
            }

            if signaled & event::CLOSED != 0 {
                let reset = manager.connections.get(&quad).map(|t| t.reset).unwrap_or(true);
                manager.connections.remove(&quad);
                return Err(if reset { TcpError::ConnectionReset } else { TcpError::ConnectionFailed });
            }
        }
    }

    /// `kill_oldest_connection()` (spec S4.6): reclaims the oldest
    /// TIME_WAIT entry when the connection table is full.
    pub fn kill_oldest_connection(&self) -> bool {
        let mut manager = self.manager.lock().unwrap();

        let oldest = manager
            .connections
            .iter()
            .filter(|(_, tcb)| tcb.state == crate::tcp::State::TimeWait)
            .min_by_key(|(_, tcb)| tcb.time_wait_deadline)
            .map(|(quad, _)| *quad);

        match oldest {
            Some(quad) => {
                manager.connections.remove(&quad);
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.manager.lock().unwrap().connections.len()
    }

    pub fn join(self) {
        self.segment_thread.join().unwrap();
        self.timer_thread.join().unwrap();
    }
}

fn segment_loop(manager: Arc<Mutex<Manager>>) -> ! {
    loop {
        let mut buf = [0u8; 1500];

        let fd = {
            let manager = manager.lock().unwrap();
            manager.tun.as_ref().expect("segment_loop requires a live tun").as_raw_fd()
        };

        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        if poll(&mut pfd[..], 50).unwrap_or(0) == 0 {
            continue;
        }

        let mut manager = manager.lock().unwrap();
        let n = match manager.tun.as_mut().expect("segment_loop requires a live tun").read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("tun read failed: {e}");
                continue;
            }
        };

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else { continue };
        let Ok(tcph) = TcpHeaderSlice::from_slice(&buf[(ip4h.ihl() * 4) as usize..n]) else { continue };
        let data = &buf[(ip4h.ihl() * 4 + tcph.data_offset() * 4) as usize..n];

        let src = Dual {
            ipv4: ip4h.source_addr(),
            port: tcph.source_port(),
        };
        let dst = Dual {
            ipv4: ip4h.destination_addr(),
            port: tcph.destination_port(),
        };
        let quad = Quad { src, dst };

        let Manager { connections, listeners, tun } = &mut *manager;
        let tun = tun.as_mut().expect("segment_loop requires a live tun");

        let action = if let Some(tcb) = connections.get_mut(&quad) {
            trace!("{:?} segment for established connection", quad);
            tcb.on_segment(ip4h, tcph, data, tun)
        } else if let Some(tcb) = listeners.get_mut(&dst.port) {
            tcb.on_segment(ip4h, tcph, data, tun)
        } else {
            if tcph.rst() {
                continue;
            }
            crate::tcp::write_reset(&quad, &tcph, data, tun);
            Action::Noop
        };

        match action {
            Action::Noop => {}
            Action::Delete => {
                debug!("{:?} deleted", quad);
                connections.remove(&quad);
            }
        }
    }
}

fn timer_loop(manager: Arc<Mutex<Manager>>) -> ! {
    loop {
        thread::sleep(TICK_INTERVAL);

        let mut manager = manager.lock().unwrap();
        let Manager { connections, tun, .. } = &mut *manager;
        let tun = tun.as_mut().expect("timer_loop requires a live tun");

        let mut dead = Vec::new();
        for (quad, tcb) in connections.iter_mut() {
            if tcb.on_tick(tun) {
                dead.push(*quad);
            }
        }

        for quad in dead {
            if let Some(tcb) = connections.remove(&quad) {
                tcb.events
                    .signal(event::CLOSED | event::RX_READY | event::TX_ACKED | event::TX_SHUTDOWN);
            }
        }
    }
}
