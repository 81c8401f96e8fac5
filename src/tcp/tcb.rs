//! The transmission control block: per-connection state, the 11-state FSM,
//! and the congestion/retransmission timers (spec S3, S4.3, S4.4, S4.5).
//!
//! Grounded on the teacher's `tcb.rs`: the RFC 9293 segment-arrival
//! processing, the RFC 6298 RTO estimator, and the RFC 9293 S3.8.6
//! zero-window-probe/SWS-avoidance logic are kept in the same shape, with
//! the hardcoded constants replaced by [`TcpConfig`] and the raw
//! `VecDeque<u8>` buffers replaced by [`SideBuffer`].

use std::cmp;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice, TcpOptionElement};
use log::{debug, trace, warn};
use rand::Rng;
use tidy_tuntap::Tun;

use super::buffer::SideBuffer;
use super::listener::SynQueueItem;
use super::{is_between_wrapped, wrapping_lt, write_ack, write_data, write_reset, write_syn, write_synack, Dual, Quad};
use crate::config::TcpConfig;
use crate::err::TcpError;
use crate::event::{self, EventBus};

/*
                    RFC 9293 - S3.3.2 - Fig 5

                            +---------+ ---------\      active OPEN
                            |  CLOSED |            \    -----------
                            +---------+<---------\   \   create TCB
                              |     ^              \   \  snd SYN
                 passive OPEN |     |   CLOSE        \   \
                 ------------ |     | ----------       \   \
                  create TCB  |     | delete TCB         \   \
                              V     |                      \   \
          rcv RST (note 1)  +---------+            CLOSE    |    \
       -------------------->|  LISTEN |          ---------- |     |
      /                     +---------+          delete TCB |     |
     /           rcv SYN      |     |     SEND              |     |
    /           -----------   |     |    -------            |     V
+--------+      snd SYN,ACK  /       \   snd SYN          +--------+
|        |<-----------------           ------------------>|        |
|  SYN   |                    rcv SYN                     |  SYN   |
|  RCVD  |<-----------------------------------------------|  SENT  |
|        |                  snd SYN,ACK                   |        |
|        |------------------           -------------------|        |
+--------+   rcv ACK of SYN  \       /  rcv SYN,ACK       +--------+
   |         --------------   |     |   -----------
   |                x         |     |     snd ACK
   |                          V     V
   |  CLOSE                 +---------+
   | -------                |  ESTAB  |
   | snd FIN                +---------+
   |                 CLOSE    |     |    rcv FIN
   V                -------   |     |    -------
+---------+         snd FIN  /       \   snd ACK         +---------+
|  FIN    |<----------------          ------------------>|  CLOSE  |
| WAIT-1  |------------------                            |   WAIT  |
+---------+          rcv FIN  \                          +---------+
  | rcv ACK of FIN   -------   |                          CLOSE  |
  | --------------   snd ACK   |                         ------- |
  V        x                   V                         snd FIN V
+---------+               +---------+                    +---------+
|FINWAIT-2|               | CLOSING |                    | LAST-ACK|
+---------+               +---------+                    +---------+
  |              rcv ACK of FIN |                 rcv ACK of FIN |
  |  rcv FIN     -------------- |    Timeout=2MSL -------------- |
  |  -------            x       V    ------------        x       V
   \ snd ACK              +---------+delete TCB          +---------+
     -------------------->|TIME-WAIT|------------------->| CLOSED  |
                          +---------+                    +---------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

/// Congestion-recovery phase (spec S3: `congest_state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestState {
    Idle,
    Recovery,
    LossRecovery,
}

/*
                RFC 9293 - S3.3.1 - Fig 3

           1         2          3          4
      ----------|----------|----------|----------
             SND.UNA    SND.NXT    SND.UNA
                                  +SND.WND
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendSpace {
    pub una: u32,
    pub nxt: u32,
    pub wnd: u16,
    pub wl1: u32,
    pub wl2: u32,
    pub iss: u32,
    pub mss: u16,
    pub max_wnd: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecvSpace {
    pub nxt: u32,
    pub wnd: u16,
    pub irs: u32,
    pub mss: u16,
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
    sno: u32,
    una: u32,
    len: u32,
    fin: bool,
    syn: bool,
    ack: bool,

    retry: bool,
    total_ret_time: u128,
    sent: Option<Instant>,
    mss: Option<u16>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.sno.wrapping_add(self.len).wrapping_sub(1)
    }

    fn unacked_data_len(&self) -> usize {
        (self.end().wrapping_sub(self.una) + 1) as usize - if self.fin { 1 } else { 0 }
    }
}

/// What the segment/timer-thread handler must do with the table entry after
/// processing. Event-bit signaling is handled internally by the TCB (it owns
/// its [`EventBus`]); this only carries the bookkeeping the owning table
/// can't infer on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Noop,
    /// Remove this entry from its table: aborted handshake, RST, or the
    /// final ACK of a graceful close.
    Delete,
}

/// A TCP connection's full state, from the packet handler's RFC 9293
/// segment-arrival processing to the user-facing send/receive contract.
#[derive(Debug)]
pub struct TCB {
    pub(crate) local: Dual,
    pub(crate) remote: Option<Dual>,
    pub(crate) kind: Kind,
    pub(crate) state: State,
    pub(crate) reset: bool,
    pub(crate) time_wait_deadline: Option<Instant>,

    pub(crate) snd: SendSpace,
    pub(crate) rcv: RecvSpace,

    srtt_ms: u128,
    rttvar_ms: u128,
    pub(crate) rto_ms: u128,
    rtt_measured: bool,
    retransmit_deadline: Option<Instant>,
    override_deadline: Option<Instant>,
    probe_deadline: Option<Instant>,

    pub(crate) cwnd: u32,
    pub(crate) ssthresh: u32,
    pub(crate) recover: u32,
    pub(crate) congest_state: CongestState,

    pub(crate) tx: SideBuffer,
    pub(crate) rx: SideBuffer,
    segments: VecDeque<Segment>,

    pub(crate) syn_queue: VecDeque<SynQueueItem>,
    pub(crate) syn_queue_size: usize,

    pub(crate) events: std::sync::Arc<EventBus>,
    pub(crate) config: TcpConfig,
}

impl TCB {
    /// `listen(backlog)` (spec S4.3.1 table, S4.3.2).
    pub fn new_listener(local: Dual, config: TcpConfig, backlog: usize) -> Self {
        TCB {
            local,
            remote: None,
            kind: Kind::Passive,
            state: State::Listen,
            reset: false,
            time_wait_deadline: None,
            snd: zero_send_space(config.default_mss),
            rcv: zero_recv_space(config.default_mss),
            srtt_ms: 0,
            rttvar_ms: 0,
            rto_ms: config.initial_rto_ms as u128,
            rtt_measured: false,
            retransmit_deadline: None,
            override_deadline: None,
            probe_deadline: None,
            cwnd: 0,
            ssthresh: u32::MAX,
            recover: 0,
            congest_state: CongestState::Idle,
            tx: SideBuffer::allocate(1).expect("listener never buffers data"),
            rx: SideBuffer::allocate(1).expect("listener never buffers data"),
            segments: VecDeque::new(),
            syn_queue: VecDeque::new(),
            syn_queue_size: config.clamp_backlog(backlog),
            events: std::sync::Arc::new(EventBus::new()),
            config,
        }
    }

    /// Active open (spec S4.3.1). Allocates buffers, picks `iss`, and queues
    /// the initial SYN; the caller is responsible for writing it to the wire
    /// once the TCB is installed in the connection table (mirroring
    /// `socket_open` running outside the core mutex).
    pub fn new_active(quad: Quad, config: TcpConfig) -> Result<Self, TcpError> {
        let tx = SideBuffer::allocate(config.tx_buffer_size)?;
        let rx = SideBuffer::allocate(config.rx_buffer_size)?;

        let iss = random_u32();
        let smss = config.default_mss;

        let mut tcb = TCB {
            local: quad.dst,
            remote: Some(quad.src),
            kind: Kind::Active,
            state: State::SynSent,
            reset: false,
            time_wait_deadline: None,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                wl1: 0,
                wl2: 0,
                iss,
                mss: smss,
                max_wnd: 0,
            },
            rcv: zero_recv_space(config.default_mss),
            srtt_ms: 0,
            rttvar_ms: 0,
            rto_ms: config.initial_rto_ms as u128,
            rtt_measured: false,
            retransmit_deadline: None,
            override_deadline: None,
            probe_deadline: None,
            cwnd: config.initial_cwnd(smss),
            ssthresh: u32::MAX,
            recover: iss,
            congest_state: CongestState::Idle,
            tx,
            rx,
            segments: VecDeque::new(),
            syn_queue: VecDeque::new(),
            syn_queue_size: 0,
            events: std::sync::Arc::new(EventBus::new()),
            config,
        };

        tcb.rcv.wnd = tcb.rx.capacity() as u16;
        tcb.segments.push_back(Segment {
            sno: iss,
            una: iss,
            len: 1,
            fin: false,
            syn: true,
            ack: false,
            retry: false,
            total_ret_time: 0,
            sent: None,
            mss: Some(smss),
        });
        tcb.snd.nxt = iss.wrapping_add(1);

        Ok(tcb)
    }

    /// Completes the child half of passive open (spec S4.3.2): allocates the
    /// child's buffers, inherits sizing from the listener, and prepares the
    /// SYN|ACK to send. Returns the TCB in `SYN_RECEIVED`; the caller must
    /// still call [`TCB::send_synack`] and handle its failure by dropping
    /// the child and trying the next queued item.
    pub fn new_child(listener_local: Dual, item: &SynQueueItem, config: TcpConfig) -> Result<Self, TcpError> {
        let tx = SideBuffer::allocate(config.tx_buffer_size)?;
        let rx = SideBuffer::allocate(config.rx_buffer_size)?;

        let iss = random_u32();
        let smss = cmp::min(item.mss, config.max_mss);
        let rmss = cmp::min(rx.capacity() as u16, config.max_mss);

        let mut tcb = TCB {
            local: Dual {
                ipv4: item.dest_addr,
                port: listener_local.port,
            },
            remote: Some(Dual {
                ipv4: item.src_addr,
                port: item.src_port,
            }),
            kind: Kind::Passive,
            state: State::SynRcvd,
            reset: false,
            time_wait_deadline: None,
            snd: SendSpace {
                una: iss,
                nxt: iss,
                wnd: 0,
                wl1: 0,
                wl2: 0,
                iss,
                mss: smss,
                max_wnd: 0,
            },
            rcv: RecvSpace {
                nxt: item.isn.wrapping_add(1),
                wnd: rx.capacity() as u16,
                irs: item.isn,
                mss: rmss,
            },
            srtt_ms: 0,
            rttvar_ms: 0,
            rto_ms: config.initial_rto_ms as u128,
            rtt_measured: false,
            retransmit_deadline: None,
            override_deadline: None,
            probe_deadline: None,
            cwnd: config.initial_cwnd(smss),
            ssthresh: u32::MAX,
            recover: iss,
            congest_state: CongestState::Idle,
            tx,
            rx,
            segments: VecDeque::new(),
            syn_queue: VecDeque::new(),
            syn_queue_size: 0,
            events: std::sync::Arc::new(EventBus::new()),
            config,
        };

        tcb.segments.push_back(Segment {
            sno: iss,
            una: iss,
            len: 1,
            fin: false,
            syn: true,
            ack: true,
            retry: false,
            total_ret_time: 0,
            sent: None,
            mss: None,
        });
        tcb.snd.nxt = iss.wrapping_add(1);

        Ok(tcb)
    }

    pub fn quad(&self) -> Option<Quad> {
        self.remote.map(|remote| Quad {
            src: remote,
            dst: self.local,
        })
    }

    /// Sends the pending SYN|ACK for a freshly-built child. Returns an error
    /// if the wire collaborator rejects emission (spec S4.3.2: the accept
    /// loop aborts this child and tries the next queued item).
    pub fn send_synack(&mut self, tun: &mut Tun) -> Result<(), TcpError> {
        let quad = self.quad().ok_or(TcpError::Failure)?;
        write_synack(&quad, self.snd.iss, self.rcv.nxt, self.rcv.wnd, self.snd.mss, tun);
        self.retransmit_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));
        Ok(())
    }

    pub fn send_syn(&mut self, tun: &mut Tun) {
        if let Some(quad) = self.quad() {
            write_syn(&quad, self.snd.iss, self.rcv.wnd, self.snd.mss, tun);
            self.retransmit_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));
        }
    }

    fn is_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn available_data_len(&self) -> usize {
        let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        self.tx.len() - sent_len
    }

    /// Bytes the user has queued but that are not yet on the wire
    /// (`snd_user` in spec S3).
    pub fn snd_user(&self) -> usize {
        self.available_data_len()
    }

    /// Bytes received and buffered but not yet consumed by the user
    /// (`rcv_user` in spec S3).
    pub fn rcv_user(&self) -> usize {
        self.rx.len()
    }

    fn is_fin_acked(&self) -> bool {
        self.tx.is_empty() && self.segments.is_empty() && self.snd.una == self.snd.nxt
    }

    /*
            RFC 9293 - S3.8.6.2.1. Sender's Algorithm -- When to Send Data

        U = SND.UNA + SND.WND - SND.NXT
        Send if min(D,U) >= Eff.snd.MSS, or D <= U, or
        min(D,U) >= Fs * Max(SND.WND), or the override timeout fires.
    */
    fn sws_allows_send(&self) -> bool {
        let d = self.available_data_len();
        let u = self
            .snd
            .una
            .wrapping_add(self.snd.wnd as u32)
            .wrapping_sub(self.snd.nxt) as usize;

        cmp::min(d, u) >= self.snd.mss as usize
            || d <= u
            || cmp::min(d, u) >= (0.5 * self.snd.max_wnd as f64) as usize
    }

    /// Arms the Nagle/SWS override timer (spec S4.4 step 5).
    pub fn arm_override_timer(&mut self) {
        self.override_deadline =
            Some(Instant::now() + Duration::from_millis(self.config.override_timeout_ms));
    }

    /// `shutdown(SEND)` (spec S4.3.4): appends a FIN to the segment queue
    /// (piggybacked on the last data segment if one is still unsent, or
    /// standalone otherwise) and transitions per the state table in S4.3.
    pub fn close_send_half(&mut self) {
        self.state = match self.state {
            State::Established | State::SynRcvd => State::FinWait1,
            State::CloseWait => State::LastAck,
            other => other,
        };

        if self.available_data_len() == 0 {
            let fin = Segment {
                sno: self.snd.nxt,
                una: self.snd.nxt,
                len: 1,
                fin: true,
                syn: false,
                ack: true,
                retry: false,
                total_ret_time: 0,
                sent: None,
                mss: None,
            };
            self.segments.push_back(fin);
            self.snd.nxt = self.snd.nxt.wrapping_add(1);
        }
    }

    /// RST from any connected state (spec S4.3.3 table).
    pub fn abort_segment(&mut self) -> Option<(Quad, u32)> {
        self.quad().map(|quad| (quad, self.snd.nxt))
    }

    /// Copies up to `buf.len()` received bytes out, removing them, and
    /// updates `rcv.wnd` per the RFC 9293 S3.8.6.2.2 receiver SWS-avoidance
    /// rule (advance the right window edge only once the freed space clears
    /// `min(Fr * RCV.BUFF, Eff.snd.MSS)`).
    pub fn recv(&mut self, buf: &mut [u8]) -> usize {
        let len = self.rx.drain_into(buf);

        if self.rx.capacity() - self.rx.len() - self.rcv.wnd as usize
            >= cmp::min((0.5 * self.rx.capacity() as f64) as usize, self.rcv.mss as usize)
        {
            self.rcv.wnd = (self.rx.capacity() - self.rx.len()) as u16;
        }

        len
    }

    /// Appends user bytes to the TX buffer, returning how many fit.
    pub fn queue_send(&mut self, data: &[u8]) -> usize {
        let was_empty = self.snd_user() == 0;
        let written = self.tx.push(data);

        if written > 0 && was_empty {
            self.arm_override_timer();
        }

        written
    }

    pub fn free_tx(&self) -> usize {
        self.config.tx_buffer_size - (self.snd_user() + (self.snd.nxt.wrapping_sub(self.snd.una)) as usize)
    }

    /// Timer-thread tick (spec S2 item 3 "timers"): retransmission, the
    /// override/SWS timer, zero-window probing, and the 2MSL reaper.
    /// Returns `true` if the TCB should now be deleted.
    pub fn on_tick(&mut self, tun: &mut Tun) -> bool {
        let Some(quad) = self.quad() else { return false };

        if let Some(deadline) = self.retransmit_deadline {
            if Instant::now() >= deadline && self.retransmit_head(quad, tun) {
                return true;
            }
        }

        if self.override_deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            self.override_deadline = None;
            self.try_send(quad, tun);
        } else if !self.tx.is_empty() {
            self.try_send(quad, tun);
        } else if !self.segments.is_empty() {
            self.send_head_if_unsent(quad, tun);
        }

        if let Some(deadline) = self.time_wait_deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }

        if let Some(deadline) = self.probe_deadline {
            if Instant::now() >= deadline {
                write_data(
                    quad,
                    self.snd.una.wrapping_sub(1),
                    self.rcv.nxt,
                    self.rcv.wnd,
                    tun,
                    &[0u8],
                    false,
                    false,
                    true,
                    None,
                );
                self.probe_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));
            }
        }

        false
    }

    fn retransmit_head(&mut self, quad: Quad, tun: &mut Tun) -> bool {
        let rto_ms = self.rto_ms;
        const R1_SYN_MS: u128 = 60_000;
        const R2_SYN_MS: u128 = 180_000;
        const R1_MS: u128 = 50_000;
        const R2_MS: u128 = 100_000;

        let mut data = Vec::new();
        let (syn, total_ret_time) = {
            let Some(seg) = self.segments.front_mut() else { return false };

            self.tx.peek(0, &mut data, seg.unacked_data_len());

            trace!("{:?} retransmit seq={} len={}", quad, seg.sno, data.len());

            seg.retry = true;
            seg.total_ret_time += rto_ms;
            seg.sent = Some(Instant::now());

            (seg.syn, seg.total_ret_time)
        };

        let seg = self.segments.front().unwrap();
        write_data(
            quad,
            seg.sno,
            self.rcv.nxt,
            self.rcv.wnd,
            tun,
            &data,
            seg.fin,
            seg.syn,
            seg.ack,
            seg.mss,
        );

        self.rto_ms = rto_ms * 2;
        self.retransmit_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));

        self.on_congestion_event();

        if syn {
            if total_ret_time > R1_SYN_MS {
                warn!("{:?} SYN retransmission threshold R1 reached", quad);
            }
            if total_ret_time > R2_SYN_MS {
                warn!("{:?} SYN retransmission threshold R2 reached, closing", quad);
                return true;
            }
        } else {
            if total_ret_time > R1_MS {
                warn!("{:?} retransmission threshold R1 reached", quad);
            }
            if total_ret_time > R2_MS {
                warn!("{:?} retransmission threshold R2 reached, closing", quad);
                return true;
            }
        }

        false
    }

    fn try_send(&mut self, quad: Quad, tun: &mut Tun) {
        if !self.sws_allows_send() {
            return;
        }

        let sent_len = self.snd.nxt.wrapping_sub(self.snd.una) as usize;
        let available_len = self.tx.len() - sent_len;
        let to_be_sent = cmp::min(cmp::min(available_len, self.cwnd as usize), self.snd.wnd as usize);
        if to_be_sent == 0 {
            return;
        }

        let data_len = cmp::min(to_be_sent, self.snd.mss as usize);
        let fin = data_len == to_be_sent && matches!(self.state, State::FinWait1 | State::LastAck);

        let mut data = Vec::new();
        self.tx.peek(sent_len, &mut data, data_len);

        write_data(quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun, &data, fin, false, true, None);

        let seg = Segment {
            sno: self.snd.nxt,
            una: self.snd.nxt,
            len: data_len as u32,
            fin,
            syn: false,
            ack: true,
            retry: false,
            total_ret_time: 0,
            sent: Some(Instant::now()),
            mss: None,
        };

        if self.retransmit_deadline.is_none() {
            self.retransmit_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));
        }

        self.segments.push_back(seg);
        self.snd.nxt = self.snd.nxt.wrapping_add(data_len as u32).wrapping_add(if fin { 1 } else { 0 });
    }

    fn send_head_if_unsent(&mut self, quad: Quad, tun: &mut Tun) {
        let Some(seg) = self.segments.front_mut() else { return };
        if seg.sent.is_some() {
            return;
        }

        write_data(quad, seg.sno, self.rcv.nxt, self.rcv.wnd, tun, &[], seg.fin, seg.syn, seg.ack, seg.mss);
        seg.sent = Some(Instant::now());

        if self.retransmit_deadline.is_none() {
            self.retransmit_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));
        }
    }

    /// RFC 9293 S3.8.6.2.1 slow-start/congestion-avoidance window growth.
    fn grow_cwnd(&mut self) {
        if self.is_slow_start() {
            self.cwnd += self.snd.mss as u32;
        } else {
            self.cwnd += cmp::max(((self.snd.mss as f64 * self.snd.mss as f64) / self.cwnd as f64) as u32, 1);
        }
    }

    /// RFC 5681-style loss response: halve (approximately) the window and
    /// restart slow start, entering `LossRecovery` until `snd_una` passes
    /// the fence recorded at the moment of loss.
    fn on_congestion_event(&mut self) {
        if self.congest_state == CongestState::Idle {
            let flight = self.snd.nxt.wrapping_sub(self.snd.una);
            self.ssthresh = cmp::max(flight / 2, 2 * self.snd.mss as u32);
            self.cwnd = self.snd.mss as u32;
            self.recover = self.snd.nxt;
            self.congest_state = CongestState::LossRecovery;
            debug!("congestion event: ssthresh={} cwnd={}", self.ssthresh, self.cwnd);
        }
    }

    fn process_ack(&mut self, ackno: u32) -> (bool, Option<u128>) {
        self.snd.una = ackno;

        let mut compute_rto = false;
        let mut r = 0u128;
        let before_len = self.tx.len();

        while let Some(seg) = self.segments.front() {
            let end = seg.end();

            if is_between_wrapped(seg.una, ackno, end.wrapping_add(1)) {
                let acked = ackno.wrapping_sub(seg.una);
                self.tx.drain_front(acked as usize);
                let retry = seg.retry;
                let sent = seg.sent;
                self.segments.front_mut().unwrap().una = ackno;
                compute_rto = !retry;
                r = sent.map(|s| (Instant::now() - s).as_millis()).unwrap_or(0);
                break;
            } else if wrapping_lt(end, ackno) {
                compute_rto = !seg.retry;
                r = seg.sent.map(|s| (Instant::now() - s).as_millis()).unwrap_or(0);
                let seg = self.segments.pop_front().unwrap();
                self.tx.drain_front(seg.unacked_data_len());
            } else {
                break;
            }
        }

        if self.segments.is_empty() {
            self.retransmit_deadline = None;
        } else {
            let seg = self.segments.front().unwrap();
            self.retransmit_deadline = seg.sent.map(|s| s + Duration::from_millis(self.rto_ms as u64));
        }

        if wrapping_lt(self.recover, ackno) || self.recover == ackno {
            self.congest_state = CongestState::Idle;
        }

        (before_len > self.tx.len() || self.tx.is_empty(), compute_rto.then_some(r))
    }

    /*
        RFC 6298 RTO estimator.
        First sample: SRTT <- R, RTTVAR <- R/2.
        Subsequent:   RTTVAR <- (1-beta)*RTTVAR + beta*|SRTT-R'|
                      SRTT   <- (1-alpha)*SRTT + alpha*R'
        RTO <- SRTT + max(G, K*RTTVAR), rounded up to >= 1s.
    */
    fn compute_rto(&mut self, r: u128) {
        if !self.rtt_measured {
            self.srtt_ms = r;
            self.rttvar_ms = r / 2;
            self.rtt_measured = true;
        } else {
            self.rttvar_ms =
                ((1.0 - 0.25) * self.rttvar_ms as f64 + 0.25 * self.srtt_ms.abs_diff(r) as f64) as u128;
            self.srtt_ms = ((1.0 - 0.125) * self.srtt_ms as f64 + 0.125 * r as f64) as u128;
        }

        self.rto_ms = self.srtt_ms + cmp::max(100, 4 * self.rttvar_ms);
        self.rto_ms = cmp::max(self.rto_ms, 1000);
    }

    /// RFC 9293 S3.10.7 segment-arrival processing. Mutates state and
    /// signals this TCB's event bits directly; returns only the bookkeeping
    /// action the owning connection table must perform.
    pub fn on_segment(&mut self, ip4h: Ipv4HeaderSlice, tcph: TcpHeaderSlice, data: &[u8], tun: &mut Tun) -> Action {
        match self.state {
            State::Listen => self.on_segment_listen(&ip4h, &tcph),
            State::SynSent => self.on_segment_syn_sent(&tcph, tun),
            _ => self.on_segment_synchronized(&tcph, data, tun),
        }
    }

    fn on_segment_listen(&mut self, ip4h: &Ipv4HeaderSlice, tcph: &TcpHeaderSlice) -> Action {
        if tcph.rst() || tcph.ack() {
            return Action::Noop;
        }

        if tcph.syn() {
            if self.syn_queue.len() >= self.syn_queue_size {
                warn!("syn queue full on port {}, dropping SYN", self.local.port);
                return Action::Noop;
            }

            let mss = tcph
                .options_iterator()
                .find_map(|op| match op.ok()? {
                    TcpOptionElement::MaximumSegmentSize(mss) => Some(mss),
                    _ => None,
                })
                .unwrap_or(self.config.default_mss);

            self.syn_queue.push_back(SynQueueItem {
                ingress_interface: 0,
                src_addr: ip4h.source_addr(),
                src_port: tcph.source_port(),
                dest_addr: ip4h.destination_addr(),
                isn: tcph.sequence_number(),
                mss,
            });

            self.events.signal(event::RX_READY);
        }

        Action::Noop
    }

    fn on_segment_syn_sent(&mut self, tcph: &TcpHeaderSlice, tun: &mut Tun) -> Action {
        let Some(quad) = self.quad() else { return Action::Noop };

        if tcph.ack() {
            if !is_between_wrapped(self.snd.una.wrapping_sub(1), tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1)) {
                if !tcph.rst() {
                    write_reset(&quad, tcph, &[], tun);
                }
                return Action::Noop;
            }

            if tcph.rst() {
                self.reset = true;
                self.events.signal(event::CLOSED);
                return Action::Delete;
            }
        }

        if tcph.syn() {
            self.rcv.nxt = tcph.sequence_number().wrapping_add(1);
            self.rcv.irs = tcph.sequence_number();
            self.snd.una = tcph.acknowledgment_number();

            if wrapping_lt(self.snd.iss, self.snd.una) {
                self.snd.wnd = tcph.window_size();
                self.snd.wl1 = tcph.sequence_number();
                self.snd.wl2 = tcph.acknowledgment_number();
                self.snd.max_wnd = self.snd.wnd;

                self.segments.pop_front();
                self.retransmit_deadline = None;

                self.state = State::Established;
                write_ack(&quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);

                self.events.signal(event::CONNECTED | event::TX_READY);
                Action::Noop
            } else {
                self.state = State::SynRcvd;
                write_synack(&quad, self.snd.iss, self.rcv.nxt, self.rcv.wnd, self.snd.mss, tun);
                Action::Noop
            }
        } else {
            Action::Noop
        }
    }

    /// RFC 9293 S3.10.7.4: SYN-RECEIVED through TIME-WAIT.
    fn on_segment_synchronized(&mut self, tcph: &TcpHeaderSlice, data: &[u8], tun: &mut Tun) -> Action {
        let Some(quad) = self.quad() else { return Action::Noop };

        let seg_len = data.len() + if tcph.fin() { 1 } else { 0 };

        if !self.is_segment_valid(tcph, seg_len as u32) {
            if !tcph.rst() {
                write_ack(&quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
            }
            return Action::Noop;
        }

        if tcph.rst() {
            return match self.state {
                State::SynRcvd if self.kind == Kind::Passive => Action::Delete,
                State::SynRcvd => {
                    self.reset = true;
                    self.events.signal(event::CLOSED);
                    Action::Delete
                }
                State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait => {
                    self.reset = true;
                    self.events
                        .signal(event::CLOSED | event::RX_READY | event::TX_ACKED | event::TX_SHUTDOWN);
                    Action::Delete
                }
                _ => Action::Noop,
            };
        }

        if tcph.syn() {
            match self.state {
                State::SynRcvd if self.kind == Kind::Passive => return Action::Delete,
                State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait
                | State::Closing
                | State::LastAck
                | State::TimeWait => {
                    write_reset(&quad, tcph, data, tun);
                    self.reset = true;
                    self.events.signal(event::CLOSED);
                    return Action::Delete;
                }
                _ => {}
            }
        }

        if !tcph.ack() {
            return Action::Noop;
        }

        let mut wake_rx = false;
        let mut wake_tx = false;

        match self.state {
            State::SynRcvd => {
                if is_between_wrapped(self.snd.una, tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1)) {
                    self.state = State::Established;
                    self.snd.wnd = tcph.window_size();
                    self.snd.wl1 = tcph.sequence_number();
                    self.snd.wl2 = tcph.acknowledgment_number();
                    self.snd.max_wnd = self.snd.wnd;
                    self.segments.pop_front();
                    self.retransmit_deadline = None;
                    self.events.signal(event::CONNECTED | event::TX_READY);
                } else {
                    write_reset(&quad, tcph, data, tun);
                    return Action::Noop;
                }
            }
            State::Established | State::FinWait1 | State::FinWait2 | State::CloseWait | State::Closing => {
                if is_between_wrapped(self.snd.una, tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1)) {
                    self.grow_cwnd();
                    let (can_write, r) = self.process_ack(tcph.acknowledgment_number());
                    if let Some(r) = r {
                        self.compute_rto(r);
                    }
                    wake_tx = can_write;
                } else if wrapping_lt(self.snd.nxt, tcph.acknowledgment_number()) {
                    write_ack(&quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
                    return Action::Noop;
                }

                if is_between_wrapped(self.snd.una.wrapping_sub(1), tcph.acknowledgment_number(), self.snd.nxt.wrapping_add(1))
                    && (wrapping_lt(self.snd.wl1, tcph.sequence_number())
                        || (self.snd.wl1 == tcph.sequence_number()
                            && wrapping_lt(self.snd.wl2, tcph.acknowledgment_number().wrapping_add(1))))
                {
                    self.snd.wnd = tcph.window_size();
                    self.snd.wl1 = tcph.sequence_number();
                    self.snd.wl2 = tcph.acknowledgment_number();
                    self.snd.max_wnd = cmp::max(self.snd.max_wnd, self.snd.wnd);

                    if self.snd.wnd == 0 {
                        self.probe_deadline = Some(Instant::now() + Duration::from_millis(self.rto_ms as u64));
                    } else {
                        self.probe_deadline = None;
                    }
                }
            }
            State::LastAck => {
                self.process_ack(tcph.acknowledgment_number());
                if self.is_fin_acked() {
                    self.events.signal(event::CLOSED);
                    return Action::Delete;
                }
            }
            State::TimeWait => {
                self.time_wait_deadline = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                write_ack(&quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
            }
            _ => {}
        }

        if self.state == State::FinWait1 && self.is_fin_acked() {
            self.state = State::FinWait2;
        }

        if self.state == State::FinWait2 {
            self.events.signal(event::TX_SHUTDOWN);
        }

        let mut process_fin = tcph.fin();

        if matches!(self.state, State::Established | State::FinWait1 | State::FinWait2) {
            let new = self.rcv.nxt.wrapping_sub(tcph.sequence_number()) as usize;
            let new_len = data.len().saturating_sub(new);
            let acc_len = cmp::min(new_len, self.rcv.wnd as usize);

            let accepted = &data[new.min(data.len())..(new + acc_len).min(data.len())];
            process_fin &= new_len == acc_len;

            self.rx.push(accepted);

            let pre_nxt = self.rcv.nxt;
            self.rcv.nxt = self
                .rcv
                .nxt
                .wrapping_add(acc_len as u32)
                .wrapping_add(if process_fin { 1 } else { 0 });
            self.rcv.wnd -= acc_len as u16;

            if wrapping_lt(pre_nxt, self.rcv.nxt) || self.rcv.wnd == 0 {
                write_ack(&quad, self.snd.nxt, self.rcv.nxt, self.rcv.wnd, tun);
            }

            wake_rx = !accepted.is_empty();
        }

        if process_fin {
            match self.state {
                State::Listen | State::SynSent => return Action::Noop,
                State::SynRcvd | State::Established => {
                    self.state = State::CloseWait;
                    wake_rx = true;
                }
                State::FinWait1 => {
                    if self.is_fin_acked() {
                        self.state = State::TimeWait;
                        self.retransmit_deadline = None;
                        self.time_wait_deadline = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                    } else {
                        self.state = State::Closing;
                    }
                }
                State::FinWait2 => {
                    self.state = State::TimeWait;
                    self.retransmit_deadline = None;
                    self.time_wait_deadline = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                }
                State::CloseWait | State::Closing | State::LastAck => return Action::Noop,
                State::TimeWait => {
                    self.time_wait_deadline = Some(Instant::now() + Duration::from_secs(2 * 2 * 60));
                }
                _ => {}
            }
            wake_rx = true;
        }

        let mut mask = 0;
        if wake_rx {
            mask |= event::RX_READY;
        }
        if wake_tx {
            mask |= event::TX_READY | event::TX_ACKED | event::TX_DONE;
        }
        if mask != 0 {
            self.events.signal(mask);
        }

        Action::Noop
    }

    /*
        RFC 9293 S3.4 acceptability test.

        Segment Length   Receive Window   Test
        0                0                SEG.SEQ = RCV.NXT
        0                >0               RCV.NXT <= SEG.SEQ < RCV.NXT+RCV.WND
        >0               0                not acceptable
        >0               >0               RCV.NXT <= SEG.SEQ < RCV.NXT+RCV.WND, or
                                           RCV.NXT <= SEG.SEQ+SEG.LEN-1 < RCV.NXT+RCV.WND
    */
    fn is_segment_valid(&self, tcph: &TcpHeaderSlice, seg_len: u32) -> bool {
        let seg_seq = tcph.sequence_number();
        let rcv_wnd = self.rcv.wnd as u32;
        let rcv_nxt = self.rcv.nxt;

        match (seg_len, rcv_wnd) {
            (0, 0) => seg_seq == rcv_nxt,
            (0, w) if w > 0 => is_between_wrapped(rcv_nxt.wrapping_sub(1), seg_seq, rcv_nxt.wrapping_add(rcv_wnd)),
            (_, 0) => false,
            (_, _) => {
                is_between_wrapped(rcv_nxt.wrapping_sub(1), seg_seq, rcv_nxt.wrapping_add(rcv_wnd))
                    || is_between_wrapped(
                        rcv_nxt.wrapping_sub(1),
                        seg_seq.wrapping_add(seg_len).wrapping_sub(1),
                        rcv_nxt.wrapping_add(rcv_wnd),
                    )
            }
        }
    }
}

fn zero_send_space(mss: u16) -> SendSpace {
    SendSpace {
        una: 0,
        nxt: 0,
        wnd: 0,
        wl1: 0,
        wl2: 0,
        iss: 0,
        mss,
        max_wnd: 0,
    }
}

fn zero_recv_space(mss: u16) -> RecvSpace {
    RecvSpace {
        nxt: 0,
        wnd: 0,
        irs: 0,
        mss,
    }
}

fn random_u32() -> u32 {
    rand::thread_rng().gen()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn quad() -> Quad {
        Quad {
            src: Dual { ipv4: Ipv4Addr::new(192, 0, 2, 1), port: 9000 },
            dst: Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 443 },
        }
    }

    #[test]
    fn new_active_starts_in_syn_sent_with_iss_plus_one_next() {
        let tcb = TCB::new_active(quad(), TcpConfig::default()).unwrap();
        assert_eq!(tcb.state, State::SynSent);
        assert_eq!(tcb.snd.nxt, tcb.snd.iss.wrapping_add(1));
        assert_eq!(tcb.snd.una, tcb.snd.iss);
    }

    #[test]
    fn initial_cwnd_matches_saturated_formula() {
        let config = TcpConfig::default();
        let tcb = TCB::new_active(quad(), config).unwrap();
        assert_eq!(tcb.cwnd, config.initial_cwnd(config.default_mss));
        assert!(tcb.cwnd >= tcb.snd.mss as u32);
    }

    #[test]
    fn listener_clamps_backlog() {
        let local = Dual { ipv4: Ipv4Addr::new(10, 0, 0, 1), port: 9090 };
        let listener = TCB::new_listener(local, TcpConfig::default(), 0);
        assert_eq!(listener.syn_queue_size, crate::config::TCP_DEFAULT_SYN_QUEUE_SIZE);

        let listener = TCB::new_listener(local, TcpConfig::default(), 1000);
        assert_eq!(listener.syn_queue_size, crate::config::TCP_MAX_SYN_QUEUE_SIZE);
    }

    #[test]
    fn send_then_ack_advances_una_and_drains_tx() {
        let mut tcb = TCB::new_active(quad(), TcpConfig::default()).unwrap();
        tcb.state = State::Established;
        tcb.snd.una = tcb.snd.nxt;
        tcb.queue_send(b"hello");
        tcb.snd.wnd = 1000;
        tcb.snd.max_wnd = 1000;

        let base = tcb.snd.nxt;
        tcb.segments.push_back(Segment {
            sno: base,
            una: base,
            len: 5,
            fin: false,
            syn: false,
            ack: true,
            retry: false,
            total_ret_time: 0,
            sent: Some(Instant::now()),
            mss: None,
        });
        tcb.snd.nxt = base.wrapping_add(5);

        let (_, _) = tcb.process_ack(base.wrapping_add(5));
        assert_eq!(tcb.snd.una, base.wrapping_add(5));
        assert!(tcb.segments.is_empty());
        assert!(tcb.tx.is_empty());
    }
}
