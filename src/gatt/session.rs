use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;
use tokio::sync::oneshot;
use tracing::debug;

use crate::att::{Handle, HandleRange, Status};
use crate::gap::Uuid;
use crate::le::RawAddr;
use crate::SyncMutex;

use super::stack::{ClientEvents, GattClient, Stack, ValueRead, ValueWritten};
use super::tree::{Service, Tree};
use super::{CccdValue, Config, Error, Result};

/// Maps peer addresses to live GATT sessions: at most one session per peer,
/// lazily attached on first reference after connection. Lookups of unknown
/// or disconnected peers fail with [`Error::NoConnection`].
#[derive(Debug)]
pub(super) struct Sessions {
    stack: Arc<dyn Stack>,
    cfg: Config,
    map: SyncMutex<HashMap<RawAddr, Arc<Session>>>,
}

impl Sessions {
    pub fn new(stack: Arc<dyn Stack>, cfg: Config) -> Self {
        Self {
            stack,
            cfg,
            map: SyncMutex::new(HashMap::new()),
        }
    }

    /// Returns the session for `peer`. A session whose connection was lost
    /// is dropped and re-attached if the peer reconnected.
    pub fn get(&self, peer: RawAddr) -> Result<Arc<Session>> {
        let mut map = self.map.lock();
        if let Some(s) = map.get(&peer) {
            if s.is_alive() {
                return Ok(Arc::clone(s));
            }
            map.remove(&peer);
        }
        let shared = Arc::new(Shared::new(peer));
        let events: Arc<dyn ClientEvents> = shared.clone();
        let client = (self.stack.attach(peer, events)).ok_or(Error::NoConnection { peer })?;
        let s = Arc::new(Session {
            peer,
            client,
            shared,
            cfg: self.cfg,
        });
        map.insert(peer, Arc::clone(&s));
        Ok(s)
    }

    /// Drops every session. Stale sessions have caused nondeterministic
    /// failures across back-to-back test runs, so resets invalidate
    /// everything rather than tracking fine-grained lifecycles. Idempotent.
    pub fn clear_all(&self) {
        self.map.lock().clear();
    }
}

/// One connection's client-side GATT state: the attribute tree snapshot,
/// discovery progress, and the wait slots bridging stack callbacks back into
/// suspended units of work.
#[derive(Debug)]
pub(super) struct Session {
    peer: RawAddr,
    client: Arc<dyn GattClient>,
    shared: Arc<Shared>,
    cfg: Config,
}

impl Session {
    #[inline]
    fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Starts MTU negotiation. Success means only that the stack accepted
    /// the request; the negotiated value arrives later and may differ.
    pub fn request_mtu(&self, mtu: u16) -> Result<()> {
        if self.client.request_mtu(mtu) {
            Ok(())
        } else {
            Err(Error::Rejected { op: "MTU exchange" })
        }
    }

    /// Walks the peer's attribute database and snapshots it into the local
    /// tree. No-op once discovery has completed for the current tree
    /// generation.
    pub async fn discover_services(&self) -> Result<()> {
        if self.shared.state.lock().discovery == Discovery::Complete {
            return Ok(());
        }
        let rx = self.shared.arm(SlotKind::Discovery, None);
        if !self.client.discover_services() {
            return Err(Error::DiscoveryFailed { peer: self.peer });
        }
        self.shared.state.lock().discovery = Discovery::InProgress;
        match rx.await {
            // The snapshot below reflects whatever the stack holds, even
            // when the completion status reports a failure.
            Ok(Reply::Discovered(_status)) => {}
            Ok(_) | Err(_) => return Err(Error::Closed),
        }
        let tree = Tree::build(&self.client.services())?;
        let mut state = self.shared.state.lock();
        state.tree = Some(tree);
        state.discovery = Discovery::Complete;
        Ok(())
    }

    /// Returns the flattened wire forest, discovering first if needed.
    pub async fn service_tree(&self) -> Result<Vec<Service>> {
        self.discover_services().await?;
        self.with_tree(Tree::flatten)
    }

    /// Fire-and-forget targeted discovery. The stack provides no completion
    /// callback for this path and may itself still be running the discovery
    /// it starts right after connection, with no way to ask; a fixed
    /// settling delay is imposed first (20 s to 28 s observed in practice).
    pub async fn discover_service_by_uuid(&self, uuid: Uuid) -> Result<()> {
        tokio::time::sleep(self.cfg.discover_by_uuid_settle).await;
        if self.client.discover_service_by_uuid(uuid) {
            Ok(())
        } else {
            Err(Error::Rejected { op: "discovery by UUID" })
        }
    }

    /// Reads the characteristic or descriptor with the given flat handle.
    /// The completion is returned verbatim; a non-success status is data.
    pub async fn read_attribute(&self, hdl: Handle) -> Result<ValueRead> {
        self.discover_services().await?;
        let (rx, accepted) = match self.resolve(hdl)? {
            AttrKind::Characteristic => (
                self.shared.arm(SlotKind::CharRead, Some(hdl)),
                self.client.read_characteristic(hdl),
            ),
            AttrKind::Descriptor => (
                self.shared.arm(SlotKind::DescRead, Some(hdl)),
                self.client.read_descriptor(hdl),
            ),
        };
        if !accepted {
            return Err(Error::Rejected { op: "read" });
        }
        match rx.await {
            Ok(Reply::Read(v)) => Ok(v),
            Ok(_) | Err(_) => Err(Error::Closed),
        }
    }

    /// Writes the characteristic or descriptor with the given flat handle.
    pub async fn write_attribute(&self, hdl: Handle, value: &[u8]) -> Result<ValueWritten> {
        self.discover_services().await?;
        let (rx, accepted) = match self.resolve(hdl)? {
            AttrKind::Characteristic => (
                self.shared.arm(SlotKind::CharWrite, Some(hdl)),
                self.client.write_characteristic(hdl, value),
            ),
            AttrKind::Descriptor => (
                self.shared.arm(SlotKind::DescWrite, Some(hdl)),
                self.client.write_descriptor(hdl, value),
            ),
        };
        if !accepted {
            return Err(Error::Rejected { op: "write" });
        }
        match rx.await {
            Ok(Reply::Written(w)) => Ok(w),
            Ok(_) | Err(_) => Err(Error::Closed),
        }
    }

    /// Reads every characteristic matching `uuid` within `range`, preserving
    /// the order the stack reports.
    pub async fn read_characteristics_by_uuid(
        &self,
        uuid: Uuid,
        range: HandleRange,
    ) -> Result<Vec<ValueRead>> {
        self.discover_services().await?;
        let rx = self.shared.arm(SlotKind::ReadByUuid, None);
        if !self.client.read_characteristics_by_uuid(uuid, range) {
            return Err(Error::Rejected { op: "read by UUID" });
        }
        match rx.await {
            Ok(Reply::ReadByUuid(v)) => Ok(v),
            Ok(_) | Err(_) => Err(Error::Closed),
        }
    }

    /// Subscribes the peer to notifications or indications through the given
    /// CCC descriptor and returns the descriptor write completion.
    pub async fn set_notification(&self, desc: Handle, value: CccdValue) -> Result<ValueWritten> {
        self.discover_services().await?;
        let chr = self
            .with_tree(|t| t.characteristic_of(desc).map(|c| c.hdl))?
            .ok_or(Error::NoAttribute { hdl: desc.into() })?;
        if !self.client.set_characteristic_notification(chr, true) {
            return Err(Error::Rejected { op: "notification setup" });
        }
        let rx = self.shared.arm(SlotKind::DescWrite, Some(desc));
        if !self.client.write_descriptor(desc, &value.bytes()) {
            return Err(Error::Rejected { op: "descriptor write" });
        }
        match rx.await {
            Ok(Reply::Written(w)) => Ok(w),
            Ok(_) | Err(_) => Err(Error::Closed),
        }
    }

    /// Waits for the next change event on the given characteristic value
    /// handle. Returns `false` if none arrives within the configured bound.
    pub async fn wait_for_notification(&self, chr: Handle) -> Result<bool> {
        self.discover_services().await?;
        self.with_tree(|t| t.find_characteristic(chr).map(|_| ()))?
            .ok_or(Error::NoAttribute { hdl: chr.into() })?;
        let rx = self.shared.add_wait(chr);
        match tokio::time::timeout(self.cfg.notification_wait, rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Ok(false),
        }
    }

    /// Drops the stack's attribute cache for this connection and resets
    /// discovery state, so the next operation re-walks the database.
    pub fn clear_cache(&self) -> Result<()> {
        if !self.client.refresh() {
            return Err(Error::RefreshFailed { peer: self.peer });
        }
        let mut state = self.shared.state.lock();
        state.tree = None;
        state.discovery = Discovery::NotStarted;
        Ok(())
    }

    /// Resolves a flat handle against the current tree, characteristic
    /// first, then descriptor.
    fn resolve(&self, hdl: Handle) -> Result<AttrKind> {
        self.with_tree(|t| {
            if t.find_characteristic(hdl).is_some() {
                Some(AttrKind::Characteristic)
            } else if t.find_descriptor(hdl).is_some() {
                Some(AttrKind::Descriptor)
            } else {
                None
            }
        })?
        .ok_or(Error::NoAttribute { hdl: hdl.into() })
    }

    fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> Result<R> {
        match self.shared.state.lock().tree {
            Some(ref t) => Ok(f(t)),
            None => Err(Error::Closed),
        }
    }
}

/// Kind of attribute a flat handle resolves to.
#[derive(Clone, Copy, Debug)]
enum AttrKind {
    Characteristic,
    Descriptor,
}

/// Discovery progress for one session's attribute tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Discovery {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}

/// State shared between the session and the stack's callback threads.
///
/// Callback threads only deliver values into the wait slot and notification
/// waits; the tree and discovery flag are mutated exclusively by units of
/// work running on the coordination worker, so no further locking is needed.
#[derive(Debug)]
struct Shared {
    peer: RawAddr,
    alive: AtomicBool,
    state: SyncMutex<ClientState>,
    slot: SyncMutex<Option<Slot>>,
    waits: SyncMutex<HashMap<Handle, SmallVec<[oneshot::Sender<()>; 2]>>>,
}

#[derive(Debug, Default)]
struct ClientState {
    tree: Option<Tree>,
    discovery: Discovery,
}

/// Single-resolution wait slot for the one in-flight stack operation.
#[derive(Debug)]
struct Slot {
    kind: SlotKind,
    hdl: Option<Handle>,
    tx: oneshot::Sender<Reply>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotKind {
    Discovery,
    CharRead,
    CharWrite,
    DescRead,
    DescWrite,
    ReadByUuid,
}

#[derive(Debug)]
enum Reply {
    Discovered(Status),
    Read(ValueRead),
    Written(ValueWritten),
    ReadByUuid(Vec<ValueRead>),
}

impl Shared {
    fn new(peer: RawAddr) -> Self {
        Self {
            peer,
            alive: AtomicBool::new(true),
            state: SyncMutex::new(ClientState::default()),
            slot: SyncMutex::new(None),
            waits: SyncMutex::new(HashMap::new()),
        }
    }

    /// Arms the wait slot for the next stack completion. A previously armed
    /// slot belongs to a caller that gave up; replacing it abandons it.
    fn arm(&self, kind: SlotKind, hdl: Option<Handle>) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self.slot.lock().replace(Slot { kind, hdl, tx }) {
            debug!("{} abandoning {:?} wait slot", self.peer, stale.kind);
        }
        rx
    }

    /// Delivers a stack completion into the armed slot. A delivery that does
    /// not match the slot's operation kind and target handle is a late
    /// callback for an abandoned wait and is dropped.
    fn deliver(&self, kind: SlotKind, hdl: Option<Handle>, reply: Reply) {
        let mut slot = self.slot.lock();
        match slot.take() {
            Some(s) if s.kind == kind && s.hdl == hdl => {
                // A failed send means the caller just gave up; harmless.
                let _ = s.tx.send(reply);
            }
            Some(s) => {
                debug!("{} dropping stale {kind:?} completion", self.peer);
                *slot = Some(s);
            }
            None => debug!("{} dropping unsolicited {kind:?} completion", self.peer),
        }
    }

    /// Registers a one-shot wait for the next change event on `hdl`.
    fn add_wait(&self, hdl: Handle) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waits.lock().entry(hdl).or_default().push(tx);
        rx
    }
}

impl ClientEvents for Shared {
    fn services_discovered(&self, status: Status) {
        self.deliver(SlotKind::Discovery, None, Reply::Discovered(status));
    }

    fn characteristic_read(&self, read: ValueRead) {
        let hdl = read.hdl;
        self.deliver(SlotKind::CharRead, Some(hdl), Reply::Read(read));
    }

    fn characteristic_written(&self, written: ValueWritten) {
        self.deliver(SlotKind::CharWrite, Some(written.hdl), Reply::Written(written));
    }

    fn descriptor_read(&self, read: ValueRead) {
        let hdl = read.hdl;
        self.deliver(SlotKind::DescRead, Some(hdl), Reply::Read(read));
    }

    fn descriptor_written(&self, written: ValueWritten) {
        self.deliver(SlotKind::DescWrite, Some(written.hdl), Reply::Written(written));
    }

    fn characteristics_read_by_uuid(&self, reads: Vec<ValueRead>) {
        self.deliver(SlotKind::ReadByUuid, None, Reply::ReadByUuid(reads));
    }

    fn characteristic_changed(&self, hdl: Handle, value: Vec<u8>) {
        debug!("{} characteristic {hdl} changed ({} bytes)", self.peer, value.len());
        if let Some(waits) = self.waits.lock().remove(&hdl) {
            for tx in waits {
                // A closed receiver is a wait that timed out or was dropped.
                let _ = tx.send(());
            }
        }
    }

    fn mtu_changed(&self, mtu: u16, status: Status) {
        debug!("{} MTU changed to {mtu} ({status})", self.peer);
    }

    fn disconnected(&self) {
        debug!("{} disconnected", self.peer);
        self.alive.store(false, Ordering::Release);
    }
}
