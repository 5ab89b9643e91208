//! Choice of the local port a client socket binds to.
//!
//! Many servers only trust requests coming from reserved ports, so the
//! client first tries a few random ports from a restricted range and only
//! then lets the OS pick one.

use std::io;
use std::ops::RangeInclusive;

use rand::Rng;
use tracing::trace;

/// Lowest port tried by the default policy.
pub const MIN_CLIENT_PORT: u16 = 665;
/// Ports below this one are reserved for privileged processes.
pub const RESERVED_PORT_LIMIT: u16 = 1024;
/// Number of random ports tried before falling back to an OS-assigned one.
pub const DEFAULT_BIND_ATTEMPTS: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindPolicy {
    /// Random ports to try before port 0
    pub attempts: u32,
    /// Range the random ports are drawn from
    pub ports: RangeInclusive<u16>,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self { attempts: DEFAULT_BIND_ATTEMPTS, ports: MIN_CLIENT_PORT..=RESERVED_PORT_LIMIT - 1 }
    }
}

impl BindPolicy {
    /// Skips the random attempts and binds to an OS-assigned port directly.
    pub fn os_assigned() -> Self {
        Self { attempts: 0, ports: MIN_CLIENT_PORT..=RESERVED_PORT_LIMIT - 1 }
    }

    /// Calls `bind` with up to `attempts` random ports from the range, then
    /// with port 0. Returns the bound socket and the port that was asked for
    /// (0 for the fallback). Only the fallback's error is reported.
    pub fn bind_with_retry<S>(
        &self,
        mut bind: impl FnMut(u16) -> io::Result<S>,
    ) -> io::Result<(S, u16)> {
        if !self.ports.is_empty() {
            let mut rng = rand::rng();
            for attempt in 0..self.attempts {
                let port = rng.random_range(self.ports.clone());
                match bind(port) {
                    Ok(socket) => return Ok((socket, port)),
                    Err(e) => trace!("Bind attempt {} to port {} failed: {}", attempt, port, e),
                }
            }
        }
        bind(0).map(|socket| (socket, 0))
    }
}
