//! Driver error types

/// Peripheral driver operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Device identification does not match the expected chip
    IdentificationMismatch,
    /// Argument outside the supported range (erase size, address, port)
    InvalidArgument,
    /// Operation not supported by the socket's protocol
    InvalidProtocol,
    /// Operation issued from a state without a valid transition
    InvalidState,
    /// Socket pool exhausted or hardware rejected the open
    BindFailed,
    /// DNS retries exhausted without an address record
    AddressResolutionFailed,
    /// DHCP collaborator failed to obtain a lease
    DhcpFailed,
    /// Remote end closed the connection
    PeerClosed,
    /// Hardware status never reached the expected value
    HardwareFault,
    /// SPI bus or chip-select pin reported an error
    Transport,
    /// Bus acquired again before the current owner released it
    BusBusy,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IdentificationMismatch => write!(f, "Device identification mismatch"),
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::InvalidProtocol => write!(f, "Invalid protocol for operation"),
            Self::InvalidState => write!(f, "Invalid socket state"),
            Self::BindFailed => write!(f, "Socket bind failed"),
            Self::AddressResolutionFailed => write!(f, "Address resolution failed"),
            Self::DhcpFailed => write!(f, "DHCP lease failed"),
            Self::PeerClosed => write!(f, "Connection closed by peer"),
            Self::HardwareFault => write!(f, "Hardware fault"),
            Self::Transport => write!(f, "SPI transport error"),
            Self::BusBusy => write!(f, "SPI bus already acquired"),
        }
    }
}

// Implement core::error::Error for no_std compatibility
impl core::error::Error for Error {}

impl embedded_io::Error for Error {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            Self::InvalidArgument | Self::InvalidProtocol => embedded_io::ErrorKind::InvalidInput,
            Self::InvalidState => embedded_io::ErrorKind::NotConnected,
            Self::PeerClosed => embedded_io::ErrorKind::BrokenPipe,
            Self::BindFailed => embedded_io::ErrorKind::AddrInUse,
            Self::AddressResolutionFailed => embedded_io::ErrorKind::AddrNotAvailable,
            Self::HardwareFault => embedded_io::ErrorKind::TimedOut,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}
