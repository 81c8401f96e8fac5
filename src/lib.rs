//! A from-scratch TCP connection engine running over a tun device, covering
//! the TCB lifecycle, the 11-state FSM (RFC 9293), congestion control
//! (RFC 5681), RTO estimation (RFC 6298), and a small blocking socket API
//! (connect/listen/accept/send/receive/shutdown/abort).
//!
//! [`manager::NetStack`] is the entry point: it owns the tun device and
//! spawns the segment and timer threads that drive every [`tcp::TCB`] under
//! one coarse mutex (spec S2, S5).

pub mod config;
mod err;
pub mod event;
pub mod manager;
pub mod port;
mod tcp;

pub use err::{Error, TcpError};
pub use manager::NetStack;
pub use tcp::{Dual, Quad, ShutdownHow, State, TcpListener, TcpStream, NO_DELAY, PUSH, WAIT_ACK};
