//! Tunables handed in by the mount layer.
//!
//! Mount option text is parsed elsewhere; these structs only carry the
//! resulting values.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::protocol::xdr::nfs4;
use crate::transport::{BindPolicy, Protocol};

/// Default lease assumed until the server reports its own.
pub const DEFAULT_LEASE_TIME: Duration = Duration::from_secs(90);

/// Per-mount behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountConfig {
    /// Hard mounts retry forever, soft mounts give up after `retry_limit`
    /// timeouts.
    pub hard: bool,
    pub retry_limit: u32,
    /// Time to wait for a reply before retransmitting
    pub timeout: Duration,
    pub cache_attributes: bool,
    pub cache_data: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            hard: true,
            retry_limit: 3,
            timeout: Duration::from_secs(60),
            cache_attributes: true,
            cache_data: true,
        }
    }
}

/// Where and how to mount.
#[derive(Clone, Debug, Default)]
pub struct MountSpec {
    /// Host name or address literal
    pub host: String,
    /// Transport override; TCP otherwise
    pub protocol: Option<Protocol>,
    /// Port override; 2049 otherwise
    pub port: Option<u16>,
    pub config: MountConfig,
}

impl MountSpec {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into(), ..Default::default() }
    }
}

/// Settings shared by every mount of one server.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub lease_time: Duration,
    /// Name sent in the AUTH_UNIX credential and the client id string
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    /// Local port selection for the server connection
    pub bind: BindPolicy,
    /// First delay between reconnect attempts of the reply reader
    pub initial_reconnect_delay: Duration,
    /// Upper bound for the reconnect delay
    pub max_reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lease_time: DEFAULT_LEASE_TIME,
            machine_name: "localhost".to_string(),
            uid: 0,
            gid: 0,
            bind: BindPolicy::default(),
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Where the callback server listens and which program number it answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackConfig {
    pub listen_ip: IpAddr,
    /// 0 lets the OS pick
    pub port: u16,
    pub program: u32,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            program: nfs4::DEFAULT_CB_PROGRAM,
        }
    }
}
