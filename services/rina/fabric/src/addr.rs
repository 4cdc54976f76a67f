//! Application addressing.
//!
//! The SIP stack keys transports on fixed-size addresses, so an application
//! name is packed into a 16-byte structure (the size of an IPv6 address).
//! Longer names are truncated on a character boundary.

use std::fmt;

/// Size of the packed application address
pub const APP_ADDR_LEN: usize = 16;

/// Port advertised for RINA transports in SIP host-port names
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Application name packed into a fixed-size address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppAddr {
    bytes: [u8; APP_ADDR_LEN],
}

impl AppAddr {
    /// Pack an application name, truncating it to fit
    pub fn from_name(name: &str) -> Self {
        let mut len = name.len().min(APP_ADDR_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }

        let mut bytes = [0u8; APP_ADDR_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { bytes }
    }

    /// Application name stored in the address
    pub fn name(&self) -> &str {
        let len = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(APP_ADDR_LEN);
        std::str::from_utf8(&self.bytes[..len]).unwrap_or_default()
    }

    /// Raw packed bytes
    pub fn as_bytes(&self) -> &[u8; APP_ADDR_LEN] {
        &self.bytes
    }

    /// SIP host-port name for this address
    pub fn host_port(&self) -> HostPort {
        HostPort {
            host: self.name().to_string(),
            port: DEFAULT_SIP_PORT,
        }
    }
}

impl From<&str> for AppAddr {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl fmt::Display for AppAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for AppAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppAddr({:?})", self.name())
    }
}

/// Host and port as advertised in SIP headers
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPort {
    /// Host part (the application name)
    pub host: String,
    /// Port part
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
