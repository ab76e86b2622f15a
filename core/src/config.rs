//! Network controller configuration

/// W5200 controller configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// MAC address programmed into the source hardware address register
    pub mac_addr: [u8; 6],
    /// Hardware retransmission count (RCR)
    pub retry_count: u8,
    /// Number of DNS queries sent before giving up
    pub dns_retry_max: u8,
    /// Delay between polls for a DNS response in milliseconds
    pub dns_poll_ms: u32,
    /// Polls per DNS query before it is re-sent
    pub dns_poll_max: u16,
    /// First port handed out when a socket is opened with port 0
    pub dynamic_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mac_addr: [0xde, 0xad, 0xbe, 0xef, 0xfe, 0xed],
            retry_count: 8,
            dns_retry_max: 4,
            dns_poll_ms: 10,
            dns_poll_max: 30,
            dynamic_port: 49152,
        }
    }
}
