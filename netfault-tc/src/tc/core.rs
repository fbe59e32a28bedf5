//! Time conversion utilities for traffic control.
//!
//! The Linux kernel's traffic control subsystem uses its own time units ("ticks").
//! This module provides utilities to convert between human-readable time values
//! and kernel ticks.

use std::io;
use std::sync::LazyLock;

/// Path to the kernel's packet scheduler timing information.
pub const PSCHED_PATH: &str = "/proc/net/psched";

/// Standard Ethernet MTU in bytes.
pub const MTU_ETHERNET: u32 = 1_500;

/// Ticks per microsecond reported by every kernel since the high resolution scheduler clock
/// (`t2us = 1000`, `us2t = 64`). Used when `/proc/net/psched` cannot be read.
pub const FALLBACK_TICK_IN_USEC: f64 = 15.625;

/// Parse the contents of `/proc/net/psched` into the number of ticks per microsecond.
///
/// The file format is: `t2us us2t clock resolution`, all hex encoded. The ratio `t2us / us2t`
/// gives the ticks per microsecond.
///
/// Adapted from `iproute2/tc/tc_core.c`.
pub fn parse_psched(contents: &str) -> io::Result<f64> {
    let mut iter = contents.split_whitespace();
    let mut next_hex = |field: &str| -> io::Result<u32> {
        let raw = iter
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("missing {field}")))?;
        u32::from_str_radix(raw, 16).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    };

    let t2us = next_hex("t2us")?;
    let us2t = next_hex("us2t")?;
    if us2t == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "us2t is zero"));
    }

    Ok(t2us as f64 / us2t as f64)
}

/// Read `/proc/net/psched` and return the number of ticks per microsecond.
pub fn tc_core_init() -> io::Result<f64> {
    let contents = std::fs::read_to_string(PSCHED_PATH)?;
    let tick_in_usec = parse_psched(&contents)?;

    tracing::debug!(tick_in_usec, "read {PSCHED_PATH}");

    Ok(tick_in_usec)
}

/// Cached value of ticks per microsecond, initialized lazily on first use.
pub static TICK_IN_USEC: LazyLock<f64> = LazyLock::new(|| {
    tc_core_init().unwrap_or_else(|e| {
        tracing::warn!(?e, fallback = FALLBACK_TICK_IN_USEC, "failed to read {PSCHED_PATH}");
        FALLBACK_TICK_IN_USEC
    })
});

/// Convert microseconds to kernel packet scheduler ticks.
pub fn usec_to_ticks(delay_usec: u32) -> u32 {
    (delay_usec as f64 * *TICK_IN_USEC) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_psched_modern_kernel() {
        let ticks = parse_psched("000003e8 00000040 000f4240 3b9aca00\n").unwrap();
        assert_eq!(ticks, 15.625);
    }

    #[test]
    fn parse_psched_rejects_garbage() {
        assert!(parse_psched("").is_err());
        assert!(parse_psched("zz 40").is_err());
        assert!(parse_psched("3e8 0").is_err());
    }
}
