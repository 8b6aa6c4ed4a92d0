//! Per-connection tunables and the protocol/QoS option bits a caller may
//! request of `connect`/`socket`.

use std::time::Duration;

/// Options requested when opening or listening on a connection, mirroring
/// the `RDP`, `HMAC`, `XTEA`, `CRC32`, and `QOS` bits in `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnOptions {
    pub reliable: bool,
    pub hmac: bool,
    pub xtea: bool,
    pub crc32: bool,
    pub qos: bool,
    pub window_size: u16,
    pub conn_timeout: Duration,
    pub packet_timeout: Duration,
}

impl ConnOptions {
    pub const DEFAULT_WINDOW_SIZE: u16 = 3;
    pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_millis(1000);

    pub fn reliable() -> Self {
        ConnOptions {
            reliable: true,
            ..Default::default()
        }
    }
}

impl Default for ConnOptions {
    fn default() -> Self {
        ConnOptions {
            reliable: false,
            hmac: false,
            xtea: false,
            crc32: false,
            qos: false,
            window_size: Self::DEFAULT_WINDOW_SIZE,
            conn_timeout: Self::DEFAULT_CONN_TIMEOUT,
            packet_timeout: Self::DEFAULT_PACKET_TIMEOUT,
        }
    }
}

/// Process-wide tunables for the connection table and stack.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    pub conn_max: usize,
    pub rx_queue_length: usize,
    pub my_address: u8,
}

impl StackConfig {
    pub const DEFAULT_CONN_MAX: usize = 10;
    pub const DEFAULT_RX_QUEUE_LENGTH: usize = 100;
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            conn_max: Self::DEFAULT_CONN_MAX,
            rx_queue_length: Self::DEFAULT_RX_QUEUE_LENGTH,
            my_address: 0,
        }
    }
}
