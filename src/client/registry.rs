//! Sessions keyed by server address, and the mount/unmount entry points.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use crate::client::config::{MountSpec, SessionConfig};
use crate::client::filesystem::{ExportLocator, FileSystem, FsIds};
use crate::client::services::Services;
use crate::client::session::Session;
use crate::error::{RpcError, RpcResult};
use crate::protocol::xdr::nfs4::nfs_fh4;
use crate::transport::{AddressResolver, PeerAddress};

/// All sessions of this client. Mounts of the same server address share
/// one session.
pub struct SessionRegistry {
    services: Services,
    config: SessionConfig,
    sessions: tokio::sync::Mutex<HashMap<PeerAddress, Arc<Session>>>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(services: Services, config: SessionConfig) -> Arc<SessionRegistry> {
        Arc::new_cyclic(|this| SessionRegistry {
            services,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Returns the session for `peer`, connecting a new one if needed.
    pub async fn acquire(&self, peer: PeerAddress) -> RpcResult<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&peer) {
            return Ok(session.clone());
        }
        let session = Session::connect(peer, self.config.clone(), self.services.clone()).await?;
        debug!("New session for {}", peer);
        sessions.insert(peer, session.clone());
        Ok(session)
    }

    /// Drops `session` from the registry and shuts it down once no file
    /// system uses it.
    pub async fn release(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            if session.has_file_systems() {
                return;
            }
            let peer = session.peer();
            match sessions.get(&peer) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(&peer),
                _ => None,
            }
        };
        if let Some(session) = removed {
            session.shutdown().await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Mounts an export: resolves the host, then tries each candidate
    /// address until one yields a session with a valid client id.
    pub async fn mount(
        &self,
        spec: &MountSpec,
        ids: FsIds,
        root: nfs_fh4,
        locator: Option<Arc<dyn ExportLocator>>,
    ) -> RpcResult<Arc<FileSystem>> {
        let mut resolver = AddressResolver::resolve(&spec.host).await?;
        if let Some(port) = spec.port {
            resolver.force_port(port);
        }
        if let Some(protocol) = spec.protocol {
            resolver.force_protocol(protocol);
        }

        let mut last_error = RpcError::AddressNotFound;
        while let Ok(peer) = resolver.next_address() {
            match self.mount_at(peer, spec, ids, root.clone(), locator.clone()).await {
                Ok(fs) => return Ok(fs),
                Err(e) => {
                    warn!("Mounting {} via {} failed: {}", spec.host, peer, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn mount_at(
        &self,
        peer: PeerAddress,
        spec: &MountSpec,
        ids: FsIds,
        root: nfs_fh4,
        locator: Option<Arc<dyn ExportLocator>>,
    ) -> RpcResult<Arc<FileSystem>> {
        let session = self.acquire(peer).await?;
        if let Err(e) = session.client_id(None, false).await {
            self.release(&session).await;
            return Err(e);
        }
        let fs = FileSystem::new(ids, root, spec.config.clone(), session.clone());
        let fs = match locator {
            Some(locator) => fs.with_relocation(self.this.clone(), locator),
            None => fs,
        };
        let fs = Arc::new(fs);
        session.add_file_system(&fs);
        info!("Mounted {:?} from {}", ids, peer);
        Ok(fs)
    }

    /// Unregisters `fs` from its session, shutting the session down if it
    /// was the last user.
    pub async fn unmount(&self, fs: &Arc<FileSystem>) {
        let session = fs.session();
        session.remove_file_system(fs);
        self.release(&session).await;
        info!("Unmounted {:?}", fs.ids());
    }

    /// Shuts every session down.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown().await;
        }
    }
}
