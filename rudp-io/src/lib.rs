//! Socket and Timing Layer for the Reliable UDP Engine
//!
//! Thin wrappers over `socket2` and the monotonic clock: a non-blocking UDP
//! socket, the wrapping millisecond clock the whole engine timestamps with,
//! periodic timers, and a token-bucket rate limiter for bandwidth caps.

pub mod socket;
pub mod time;

pub use socket::{DatagramSocket, SocketError, RECV_BUFFER_SIZE};
pub use time::{ms_since, Clock, RateLimiter, Timer};
