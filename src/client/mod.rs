//! Client side of the NFSv4 session layer.
//!
//! - `server`: shared connection handle that matches replies to calls
//! - `request`: one call with its retry and timeout handling
//! - `session`: client id, lease renewal and reboot recovery per server
//! - `callback`: listener for server-initiated callback calls
//! - `filesystem`: state of a mounted export the session acts on
//! - `registry`: sessions keyed by server address, mount and unmount
//! - `services`: work queue and callback server shared by all sessions
//! - `config`: mount and session settings

pub mod callback;
pub mod config;
pub mod filesystem;
pub mod registry;
pub mod request;
pub mod server;
pub mod services;
pub mod session;

pub use callback::CallbackServer;
pub use config::{CallbackConfig, MountConfig, MountSpec, SessionConfig};
pub use filesystem::{
    CachedAttributes, DelegatedFile, Delegation, DelegationKind, ExportLocator, FileSystem,
    FsIds, OpenFile,
};
pub use registry::SessionRegistry;
pub use request::{Cookie, Request, RetryPolicy};
pub use server::RpcServer;
pub use services::Services;
pub use session::Session;
