//! Dynamic (ephemeral) port allocation (spec S4.2).

use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

use crate::config::{EPHEMERAL_MAX, EPHEMERAL_MIN};

/// Process-wide monotonic counter. Stored as `u32` so "unset" (0, outside the
/// ephemeral range) is distinguishable from any valid port.
static NEXT_PORT: AtomicU32 = AtomicU32::new(0);

/// Returns the next ephemeral port, wrapping at `EPHEMERAL_MAX` back to
/// `EPHEMERAL_MIN`. Re-seeds from a cryptographic-quality RNG on first use or
/// after the counter drifts outside the range. Does not check for collisions
/// with already-bound sockets — that is the bind layer's job.
pub fn get_dynamic_port() -> u16 {
    let mut current = NEXT_PORT.load(Ordering::Acquire);

    loop {
        let in_range = current >= EPHEMERAL_MIN as u32 && current <= EPHEMERAL_MAX as u32;

        let port = if in_range {
            current as u16
        } else {
            rand::thread_rng().gen_range(EPHEMERAL_MIN..=EPHEMERAL_MAX)
        };

        let next = if port == EPHEMERAL_MAX {
            EPHEMERAL_MIN as u32
        } else {
            port as u32 + 1
        };

        match NEXT_PORT.compare_exchange_weak(
            current,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return port,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_k_distinct_values_modulo_range_size() {
        let range_size = (EPHEMERAL_MAX - EPHEMERAL_MIN) as usize + 1;
        let k = 50;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..k {
            let port = get_dynamic_port();
            assert!(port >= EPHEMERAL_MIN && port <= EPHEMERAL_MAX);
            seen.insert(port);
        }

        assert_eq!(seen.len(), std::cmp::min(k, range_size));
    }

    #[test]
    fn wraps_at_max() {
        NEXT_PORT.store(EPHEMERAL_MAX as u32, Ordering::Release);
        assert_eq!(get_dynamic_port(), EPHEMERAL_MAX);
        assert_eq!(get_dynamic_port(), EPHEMERAL_MIN);
    }
}
