//! Tunable constants for the TCP connection engine.
//!
//! Values are bit-exact with the specification; callers that need a
//! different profile (e.g. a smaller test harness) can build their own
//! [`TcpConfig`] rather than mutate these defaults.

/// Sender MSS used for active opens before any negotiation takes place.
pub const TCP_DEFAULT_MSS: u16 = 536;
/// Hard ceiling on any negotiated MSS, ours or the peer's.
pub const TCP_MAX_MSS: u16 = 1430;
/// Multiplier applied to SMSS to derive the initial congestion window.
pub const TCP_INITIAL_WINDOW: u32 = 3;
/// Retransmission timeout used before any RTT sample has been taken.
pub const TCP_INITIAL_RTO_MS: u64 = 1000;
/// Nagle/SWS escape-hatch timer (RFC 1122 S4.2.3.4).
pub const TCP_OVERRIDE_TIMEOUT_MS: u64 = 500;
/// Upper bound a listener's backlog is clamped to.
pub const TCP_MAX_SYN_QUEUE_SIZE: usize = 16;
/// Backlog used when the caller asks for zero or does not specify one.
pub const TCP_DEFAULT_SYN_QUEUE_SIZE: usize = 4;
/// Upper bound on a connection's receive-side buffer.
pub const TCP_MAX_RX_BUFFER_SIZE: usize = 22880;
/// Upper bound on a connection's send-side buffer.
pub const TCP_MAX_TX_BUFFER_SIZE: usize = 22880;
/// Maximum number of chunk descriptors backing a side-buffer.
pub const MAX_CHUNK_COUNT: usize = 15;
/// How long `connect()` waits for `CONNECTED`/`CLOSED` before giving up
/// (spec.md S8 scenario 3).
pub const TCP_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Low end of the ephemeral port range used by [`crate::port::get_dynamic_port`].
pub const EPHEMERAL_MIN: u16 = 49152;
/// High end of the ephemeral port range (inclusive).
pub const EPHEMERAL_MAX: u16 = 65535;

/// Per-[`crate::manager::NetStack`] knobs threaded down into every TCB it
/// creates. The teacher hardcodes these; this crate generalizes them into a
/// struct without changing any default value.
#[derive(Debug, Clone, Copy)]
pub struct TcpConfig {
    pub tx_buffer_size: usize,
    pub rx_buffer_size: usize,
    pub default_mss: u16,
    pub max_mss: u16,
    pub initial_window: u32,
    pub initial_rto_ms: u64,
    pub override_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            tx_buffer_size: TCP_MAX_TX_BUFFER_SIZE,
            rx_buffer_size: TCP_MAX_RX_BUFFER_SIZE,
            default_mss: TCP_DEFAULT_MSS,
            max_mss: TCP_MAX_MSS,
            initial_window: TCP_INITIAL_WINDOW,
            initial_rto_ms: TCP_INITIAL_RTO_MS,
            override_timeout_ms: TCP_OVERRIDE_TIMEOUT_MS,
            connect_timeout_ms: TCP_CONNECT_TIMEOUT_MS,
        }
    }
}

impl TcpConfig {
    /// `min(INITIAL_WINDOW * smss, tx_buffer_size)` computed in 32-bit space
    /// and saturated into the field width `cwnd` is stored at.
    ///
    /// Resolves the discrepancy noted in spec.md S9: both the active-open
    /// and accept paths must use this single formula.
    pub fn initial_cwnd(&self, smss: u16) -> u32 {
        let iw = self.initial_window.saturating_mul(smss as u32);
        std::cmp::min(iw, self.tx_buffer_size as u32)
    }

    pub fn clamp_backlog(&self, backlog: usize) -> usize {
        if backlog == 0 {
            TCP_DEFAULT_SYN_QUEUE_SIZE
        } else {
            std::cmp::min(backlog, TCP_MAX_SYN_QUEUE_SIZE)
        }
    }
}
