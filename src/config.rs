//! Tunables. Mirrors the `#define`d constants of the original C engine,
//! grouped behind a config struct so callers can override them per-socket
//! instead of recompiling.

use std::cmp;

pub const ETHERNET_MTU: usize = 1500;
pub const IPV4_HEADER_SIZE: usize = 20;
pub const UDP_HEADER_SIZE: usize = 8;
pub const GRE_HEADER_SIZE: usize = 24;
pub const PPPOE_HEADER_SIZE: usize = 8;
pub const MPPE_HEADER_SIZE: usize = 2;
pub const FUDGE_HEADER_SIZE: usize = 36;

/// On-wire MSS for IPv4: budget for the worst-case tunnel overhead the
/// original engine assumed. This is the payload chunk size used to
/// segment writes (spec.md §4.4/§8), not a further-reduced "packet minus
/// our own header" figure — the original keeps those as two distinct
/// constants and this one matches its `UDP_IPV4_MTU`.
pub const MSS: usize =
    ETHERNET_MTU - IPV4_HEADER_SIZE - UDP_HEADER_SIZE - GRE_HEADER_SIZE - PPPOE_HEADER_SIZE - MPPE_HEADER_SIZE - FUDGE_HEADER_SIZE;

pub const QUEUE_SIZE_MAX: usize = 16 * 1024;
pub const BUFFER_SIZE_MAX: u32 = 16 * 1024 * 1024;
pub const WINDOW_SIZE_MAX: u32 = BUFFER_SIZE_MAX;
pub const WINDOW_SIZE_DEFAULT: u32 = BUFFER_SIZE_MAX / 4;

pub const WINDOW_SHRINK_FACTOR: u32 = 2;
pub const WINDOW_EXPAND_FACTOR: u32 = 2;

pub const MAX_CONNS_PER_SOCKET: usize = 1024;

pub const RETRANSMIT_TIMEOUT_MIN: u64 = 200;
pub const RETRANSMIT_TIMEOUT_MAX: u64 = 1000;
pub const RETRANSMIT_TIMEOUT_DEFAULT: u64 = 500;

pub const KEEPALIVE_INTERVAL: u64 = 29_000;

pub const WAIT_SYN_RECV: u64 = 10_000;
pub const WAIT_FIN_SENT: u64 = 10_000;

pub const MAX_VEC: usize = 1024;

pub const ACK_NR_RECV_BEHIND_ALLOWED: u16 = 10;

/// Values for the `interval_action` deadline clamp. Not specified in
/// spec.md; see SPEC_FULL.md's Open-Question disposition.
pub const SOCKET_CHECK_MIN: u64 = 1;
pub const SOCKET_CHECK_MAX: u64 = 500;
pub const SOCKET_CHECK_DEFAULT: u64 = 500;

/// Return a valid retransmit timeout in milliseconds, substituting the
/// default when `t` is zero (no estimate yet) rather than clamping it up.
pub fn limited_retransmit_timeout(t: u64) -> u64 {
    if t > 0 {
        cmp::min(RETRANSMIT_TIMEOUT_MAX, cmp::max(RETRANSMIT_TIMEOUT_MIN, t))
    } else {
        RETRANSMIT_TIMEOUT_DEFAULT
    }
}

/// Return a valid window size in bytes, substituting the default when `t`
/// is zero. The floor is one MSS-sized packet, not zero.
pub fn limited_window(t: u32) -> u32 {
    if t > 0 {
        cmp::min(WINDOW_SIZE_MAX, cmp::max(MSS as u32, t))
    } else {
        WINDOW_SIZE_DEFAULT
    }
}

/// Per-socket configuration. `Default` reproduces the original engine's
/// compiled-in constants; callers may override individual fields (e.g. in
/// tests, to shrink `max_conns` or speed up wait caps).
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub max_conns: usize,
    pub send_buffer_size: u32,
    pub recv_buffer_size: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            max_conns: MAX_CONNS_PER_SOCKET,
            send_buffer_size: BUFFER_SIZE_MAX,
            recv_buffer_size: BUFFER_SIZE_MAX,
        }
    }
}
