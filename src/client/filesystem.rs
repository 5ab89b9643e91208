//! The boundary between the session layer and a mounted file system.
//!
//! The file system layer owns inode translation, caching and the POSIX
//! operations. This module keeps just enough of its state for the session
//! to act on: the open files whose state must be reclaimed after a server
//! reboot and the delegations the server may recall.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::config::MountConfig;
use crate::client::registry::SessionRegistry;
use crate::client::session::Session;
use crate::protocol::xdr::nfs4::{clientid4, nfs_fh4, stateid4};
use crate::transport::PeerAddress;

/// An open file as far as the session layer is concerned.
#[async_trait]
pub trait OpenFile: Send + Sync {
    fn file_handle(&self) -> nfs_fh4;

    /// Re-establishes the open state under a new client id after the
    /// server lost it.
    async fn reclaim(&self, client_id: clientid4) -> anyhow::Result<()>;
}

/// Locally cached attributes of a delegated file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CachedAttributes {
    pub size: u64,
    pub change: u64,
    /// Modified locally and not yet flushed
    pub dirty: bool,
}

/// A file the server has delegated to this client.
#[async_trait]
pub trait DelegatedFile: Send + Sync {
    fn cached_attributes(&self) -> CachedAttributes;

    /// Flushes what the server must see and returns the delegation.
    async fn return_delegation(&self, stateid: stateid4, truncate: bool) -> anyhow::Result<()>;
}

/// Finds where an export went after the server reported it moved.
#[async_trait]
pub trait ExportLocator: Send + Sync {
    async fn locate(&self, fs: &FileSystem) -> anyhow::Result<PeerAddress>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DelegationKind {
    Read,
    Write,
}

#[derive(Clone)]
pub struct Delegation {
    pub fh: nfs_fh4,
    pub stateid: stateid4,
    pub kind: DelegationKind,
    /// Client id the delegation was granted to
    pub client_id: clientid4,
    pub file: Arc<dyn DelegatedFile>,
}

impl std::fmt::Debug for Delegation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegation")
            .field("fh", &self.fh)
            .field("stateid", &self.stateid)
            .field("kind", &self.kind)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Identity of a mounted export.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FsIds {
    pub dev_id: u64,
    pub fsid_major: u64,
    pub fsid_minor: u64,
}

/// Open files and the session counting them.
///
/// `counted_by` is set while the file system is registered with a session;
/// opens and closes only touch that session's use count, under this lock.
struct OpenFiles {
    files: Vec<Arc<dyn OpenFile>>,
    counted_by: Weak<Session>,
}

/// One mounted export of a server.
pub struct FileSystem {
    ids: FsIds,
    root: nfs_fh4,
    config: MountConfig,
    session: RwLock<Arc<Session>>,
    open_files: Mutex<OpenFiles>,
    delegations: Mutex<BTreeMap<nfs_fh4, Delegation>>,
    registry: Weak<SessionRegistry>,
    locator: Option<Arc<dyn ExportLocator>>,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem").field("ids", &self.ids).field("root", &self.root).finish()
    }
}

impl FileSystem {
    /// Creates a file system bound to `session`. The caller registers it
    /// with [`Session::add_file_system`].
    pub fn new(ids: FsIds, root: nfs_fh4, config: MountConfig, session: Arc<Session>) -> Self {
        Self {
            ids,
            root,
            config,
            session: RwLock::new(session),
            open_files: Mutex::new(OpenFiles { files: Vec::new(), counted_by: Weak::new() }),
            delegations: Mutex::new(BTreeMap::new()),
            registry: Weak::new(),
            locator: None,
        }
    }

    /// Lets [`lease_moved`](Self::lease_moved) find the export's new home.
    pub fn with_relocation(
        mut self,
        registry: Weak<SessionRegistry>,
        locator: Arc<dyn ExportLocator>,
    ) -> Self {
        self.registry = registry;
        self.locator = Some(locator);
        self
    }

    pub fn ids(&self) -> FsIds {
        self.ids
    }

    pub fn root(&self) -> &nfs_fh4 {
        &self.root
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.read().expect("unable to lock session").clone()
    }

    /// Records an open file. It counts towards the session's use count only
    /// while this file system is registered with the session.
    pub fn add_open_file(&self, file: Arc<dyn OpenFile>) {
        let mut open = self.open_files.lock().expect("unable to lock open files");
        open.files.push(file);
        if let Some(session) = open.counted_by.upgrade() {
            session.add_usage(1);
        }
    }

    /// Drops the open file with handle `fh`. Returns false if there was none.
    pub fn remove_open_file(&self, fh: &nfs_fh4) -> bool {
        let mut open = self.open_files.lock().expect("unable to lock open files");
        let Some(index) = open.files.iter().position(|file| file.file_handle() == *fh) else {
            return false;
        };
        open.files.remove(index);
        if let Some(session) = open.counted_by.upgrade() {
            session.sub_usage(1);
        }
        true
    }

    /// Snapshot of the open files, taken under the list lock.
    pub fn open_files(&self) -> Vec<Arc<dyn OpenFile>> {
        self.open_files.lock().expect("unable to lock open files").files.clone()
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.lock().expect("unable to lock open files").files.len()
    }

    /// Moves the open-file count into `session`'s use count. Later opens
    /// and closes go to the same session until [`Self::stop_counting`].
    pub(crate) fn start_counting(&self, session: &Arc<Session>) {
        let mut open = self.open_files.lock().expect("unable to lock open files");
        if let Some(previous) = open.counted_by.upgrade() {
            if Arc::ptr_eq(&previous, session) {
                return;
            }
            previous.sub_usage(open.files.len());
        }
        session.add_usage(open.files.len());
        open.counted_by = Arc::downgrade(session);
    }

    /// Withdraws the open-file count from `session` if it is the one
    /// counting this file system.
    pub(crate) fn stop_counting(&self, session: &Session) {
        let mut open = self.open_files.lock().expect("unable to lock open files");
        if std::ptr::eq(open.counted_by.as_ptr(), session) {
            session.sub_usage(open.files.len());
            open.counted_by = Weak::new();
        }
    }

    /// Records a delegation, replacing any earlier one for the same file.
    pub fn add_delegation(&self, delegation: Delegation) {
        debug!("Delegation {:?} on {:?}", delegation.kind, delegation.fh);
        let mut delegations = self.delegations.lock().expect("unable to lock delegations");
        delegations.insert(delegation.fh.clone(), delegation);
    }

    pub fn remove_delegation(&self, fh: &nfs_fh4) -> Option<Delegation> {
        self.delegations.lock().expect("unable to lock delegations").remove(fh)
    }

    pub fn find_delegation(&self, fh: &nfs_fh4) -> Option<Delegation> {
        self.delegations.lock().expect("unable to lock delegations").get(fh).cloned()
    }

    pub fn delegations(&self) -> Vec<Delegation> {
        self.delegations.lock().expect("unable to lock delegations").values().cloned().collect()
    }

    /// Forgets every delegation. Used when the state they were granted
    /// under is gone.
    pub fn invalidate_delegations(&self) -> usize {
        let mut delegations = self.delegations.lock().expect("unable to lock delegations");
        let count = delegations.len();
        delegations.clear();
        count
    }

    /// Moves this file system to `session`, re-registering it and dropping
    /// delegations granted to the old client id.
    pub fn migrate(self: &Arc<Self>, session: Arc<Session>) {
        let previous = {
            let mut current = self.session.write().expect("unable to lock session");
            std::mem::replace(&mut *current, session.clone())
        };
        if Arc::ptr_eq(&previous, &session) {
            return;
        }
        previous.remove_file_system(self);
        let dropped = self.invalidate_delegations();
        session.add_file_system(self);
        info!(
            "Migrated {:?} from {} to {} ({} delegations dropped)",
            self.ids,
            previous.peer(),
            session.peer(),
            dropped
        );
    }

    /// Follows the export after the server answered RENEW with
    /// NFS4ERR_LEASE_MOVED and reclaims the open files at its new home.
    pub async fn lease_moved(self: &Arc<Self>) -> anyhow::Result<()> {
        let (Some(locator), Some(registry)) = (self.locator.clone(), self.registry.upgrade())
        else {
            warn!("Lease moved for {:?} but no way to locate it", self.ids);
            return Ok(());
        };
        let current = self.session();
        let target = locator.locate(self).await?;
        if target == current.peer() {
            debug!("{:?} still served by {}", self.ids, target);
            return Ok(());
        }
        let session = registry.acquire(target).await?;
        let client_id = session.client_id(None, false).await?;
        self.migrate(session);
        registry.release(&current).await;
        for file in self.open_files() {
            if let Err(e) = file.reclaim(client_id).await {
                warn!("Reclaim of {:?} on {} failed: {:?}", file.file_handle(), target, e);
            }
        }
        Ok(())
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        let Ok(open) = self.open_files.get_mut() else {
            return;
        };
        if let Some(session) = open.counted_by.upgrade() {
            session.sub_usage(open.files.len());
        }
    }
}
