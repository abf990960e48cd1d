//! In-memory stack used by the tests.
//!
//! Completion callbacks are delivered from spawned tasks, so the wait-slot
//! handoff crosses task boundaries the same way it crosses threads under a
//! real stack. Manual mode queues completions instead, letting a test
//! release them late or out of order.

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::att::{Handle, HandleRange, Status};
use crate::gap::Uuid;
use crate::le::RawAddr;
use crate::SyncMutex;

use super::stack::{
    ClientEvents, GattClient, GattServer, ServerEvents, ServiceDef, ServiceId, Stack,
    UuidBroadcast, ValueRead, ValueWritten,
};

type Completion = Box<dyn FnOnce() + Send>;

/// Scriptable in-memory stack.
pub(super) struct MockStack {
    clients: SyncMutex<HashMap<RawAddr, Arc<MockClient>>>,
    server: SyncMutex<Option<Arc<MockServer>>>,
    uuid_tx: broadcast::Sender<UuidBroadcast>,
    sdp: SyncMutex<HashMap<RawAddr, Vec<UuidBroadcast>>>,
}

impl MockStack {
    pub fn new() -> Arc<Self> {
        let (uuid_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            clients: SyncMutex::new(HashMap::new()),
            server: SyncMutex::new(None),
            uuid_tx,
            sdp: SyncMutex::new(HashMap::new()),
        })
    }

    /// Marks `peer` as connected with the given remote attribute database.
    pub fn connect(&self, peer: RawAddr, db: Vec<ServiceDef>) -> Arc<MockClient> {
        let client = Arc::new(MockClient::new(peer, db));
        self.clients.lock().insert(peer, Arc::clone(&client));
        client
    }

    /// Drops the connection, reporting it to the attached session.
    pub fn disconnect(&self, peer: RawAddr) {
        if let Some(client) = self.clients.lock().remove(&peer) {
            if let Some(events) = client.events.lock().clone() {
                events.disconnected();
            }
        }
    }

    /// Scripts the broadcasts sent in response to an SDP fetch for `peer`.
    pub fn script_sdp(&self, peer: RawAddr, signals: Vec<UuidBroadcast>) {
        self.sdp.lock().insert(peer, signals);
    }

    /// Returns the hosted server's current service list, usable as the
    /// remote database of a peer connected to this device.
    pub fn host_db(&self) -> Vec<ServiceDef> {
        (self.server.lock().as_ref()).map_or_else(Vec::new, |s| s.services.lock().clone())
    }

    /// Returns the hosted mock server.
    pub fn mock_server(&self) -> Arc<MockServer> {
        Arc::clone(self.server.lock().as_ref().expect("server not created"))
    }
}

impl Debug for MockStack {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockStack").finish_non_exhaustive()
    }
}

impl Stack for MockStack {
    fn attach(&self, peer: RawAddr, events: Arc<dyn ClientEvents>) -> Option<Arc<dyn GattClient>> {
        let clients = self.clients.lock();
        let client = clients.get(&peer)?;
        *client.events.lock() = Some(events);
        let client: Arc<dyn GattClient> = client.clone();
        Some(client)
    }

    fn server(&self, events: Arc<dyn ServerEvents>) -> Arc<dyn GattServer> {
        let server = Arc::new(MockServer::new(events));
        *self.server.lock() = Some(Arc::clone(&server));
        server
    }

    fn fetch_uuids(&self, peer: RawAddr) -> bool {
        let Some(signals) = self.sdp.lock().remove(&peer) else {
            return false;
        };
        let tx = self.uuid_tx.clone();
        tokio::spawn(async move {
            for signal in signals {
                let _ = tx.send(signal);
            }
        });
        true
    }

    fn uuid_events(&self) -> broadcast::Receiver<UuidBroadcast> {
        self.uuid_tx.subscribe()
    }
}

/// One connection's scriptable GATT client.
pub(super) struct MockClient {
    peer: RawAddr,
    events: SyncMutex<Option<Arc<dyn ClientEvents>>>,
    db: SyncMutex<Vec<ServiceDef>>,
    values: SyncMutex<HashMap<u16, Vec<u8>>>,
    statuses: SyncMutex<HashMap<u16, Status>>,
    refused: SyncMutex<HashSet<&'static str>>,
    ops: SyncMutex<Vec<String>>,
    manual: AtomicBool,
    pending: SyncMutex<Vec<Completion>>,
}

impl MockClient {
    fn new(peer: RawAddr, db: Vec<ServiceDef>) -> Self {
        Self {
            peer,
            events: SyncMutex::new(None),
            db: SyncMutex::new(db),
            values: SyncMutex::new(HashMap::new()),
            statuses: SyncMutex::new(HashMap::new()),
            refused: SyncMutex::new(HashSet::new()),
            ops: SyncMutex::new(Vec::new()),
            manual: AtomicBool::new(false),
            pending: SyncMutex::new(Vec::new()),
        }
    }

    /// Returns the operations issued so far, in issue order.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    /// Makes the named operation refuse to start.
    pub fn refuse(&self, op: &'static str) {
        self.refused.lock().insert(op);
    }

    /// Queues completions instead of delivering them.
    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::Release);
    }

    /// Delivers all queued completions in queue order.
    pub fn release_pending(&self) {
        let pending: Vec<_> = std::mem::take(&mut *self.pending.lock());
        for complete in pending {
            complete();
        }
    }

    /// Pushes an unsolicited value change to the attached session.
    pub fn push_notification(&self, hdl: Handle, value: &[u8]) {
        self.sink().characteristic_changed(hdl, value.to_vec());
    }

    /// Returns the stored value for an attribute.
    pub fn value(&self, hdl: u16) -> Option<Vec<u8>> {
        self.values.lock().get(&hdl).cloned()
    }

    /// Overrides the status reported for completions on `hdl`.
    pub fn set_status(&self, hdl: u16, status: Status) {
        self.statuses.lock().insert(hdl, status);
    }

    fn sink(&self) -> Arc<dyn ClientEvents> {
        self.events.lock().clone().expect("client not attached")
    }

    fn accept(&self, op: &'static str) -> bool {
        !self.refused.lock().contains(op)
    }

    fn log(&self, op: String) {
        self.ops.lock().push(op);
    }

    fn complete(&self, f: impl FnOnce(Arc<dyn ClientEvents>) + Send + 'static) {
        let events = self.sink();
        let run = move || f(events);
        if self.manual.load(Ordering::Acquire) {
            self.pending.lock().push(Box::new(run));
        } else {
            tokio::spawn(async move { run() });
        }
    }

    fn status_for(&self, hdl: Handle) -> Status {
        (self.statuses.lock().get(&hdl.into())).copied().unwrap_or(Status::SUCCESS)
    }

    fn value_read(&self, hdl: Handle) -> ValueRead {
        ValueRead {
            hdl,
            value: self.values.lock().get(&hdl.into()).cloned().unwrap_or_default(),
            status: self.status_for(hdl),
        }
    }
}

impl Debug for MockClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MockClient").field(&self.peer).finish()
    }
}

impl GattClient for MockClient {
    fn request_mtu(&self, mtu: u16) -> bool {
        if !self.accept("request_mtu") {
            return false;
        }
        self.log(format!("request_mtu {mtu}"));
        self.complete(move |e| e.mtu_changed(mtu, Status::SUCCESS));
        true
    }

    fn discover_services(&self) -> bool {
        if !self.accept("discover_services") {
            return false;
        }
        self.log("discover_services".to_owned());
        self.complete(|e| e.services_discovered(Status::SUCCESS));
        true
    }

    fn discover_service_by_uuid(&self, uuid: Uuid) -> bool {
        if !self.accept("discover_service_by_uuid") {
            return false;
        }
        self.log(format!("discover_service_by_uuid {uuid}"));
        true
    }

    fn services(&self) -> Vec<ServiceDef> {
        self.db.lock().clone()
    }

    fn read_characteristic(&self, hdl: Handle) -> bool {
        if !self.accept("read_characteristic") {
            return false;
        }
        self.log(format!("read_characteristic {hdl}"));
        let read = self.value_read(hdl);
        self.complete(move |e| e.characteristic_read(read));
        true
    }

    fn read_characteristics_by_uuid(&self, uuid: Uuid, range: HandleRange) -> bool {
        if !self.accept("read_characteristics_by_uuid") {
            return false;
        }
        self.log(format!("read_characteristics_by_uuid {uuid}"));
        let mut reads = Vec::new();
        for s in self.db.lock().iter() {
            for c in &s.characteristics {
                let Some(hdl) = Handle::new(c.hdl) else { continue };
                if c.uuid == uuid && range.contains(&hdl) {
                    reads.push(self.value_read(hdl));
                }
            }
        }
        self.complete(move |e| e.characteristics_read_by_uuid(reads));
        true
    }

    fn read_descriptor(&self, hdl: Handle) -> bool {
        if !self.accept("read_descriptor") {
            return false;
        }
        self.log(format!("read_descriptor {hdl}"));
        let read = self.value_read(hdl);
        self.complete(move |e| e.descriptor_read(read));
        true
    }

    fn write_characteristic(&self, hdl: Handle, value: &[u8]) -> bool {
        if !self.accept("write_characteristic") {
            return false;
        }
        self.log(format!("write_characteristic {hdl} {value:02X?}"));
        self.values.lock().insert(hdl.into(), value.to_vec());
        let written = ValueWritten {
            hdl,
            status: self.status_for(hdl),
        };
        self.complete(move |e| e.characteristic_written(written));
        true
    }

    fn write_descriptor(&self, hdl: Handle, value: &[u8]) -> bool {
        if !self.accept("write_descriptor") {
            return false;
        }
        self.log(format!("write_descriptor {hdl} {value:02X?}"));
        self.values.lock().insert(hdl.into(), value.to_vec());
        let written = ValueWritten {
            hdl,
            status: self.status_for(hdl),
        };
        self.complete(move |e| e.descriptor_written(written));
        true
    }

    fn set_characteristic_notification(&self, hdl: Handle, enable: bool) -> bool {
        if !self.accept("set_characteristic_notification") {
            return false;
        }
        self.log(format!("set_characteristic_notification {hdl} {enable}"));
        true
    }

    fn refresh(&self) -> bool {
        if !self.accept("refresh") {
            return false;
        }
        self.log("refresh".to_owned());
        true
    }
}

/// Scriptable local GATT server. Assigns sequential handles on
/// registration.
pub(super) struct MockServer {
    events: Arc<dyn ServerEvents>,
    next_hdl: AtomicU16,
    services: SyncMutex<Vec<ServiceDef>>,
    refused: AtomicBool,
    fail: SyncMutex<Option<Status>>,
    manual: AtomicBool,
    pending: SyncMutex<Vec<Completion>>,
}

impl MockServer {
    fn new(events: Arc<dyn ServerEvents>) -> Self {
        Self {
            events,
            next_hdl: AtomicU16::new(1),
            services: SyncMutex::new(Vec::new()),
            refused: AtomicBool::new(false),
            fail: SyncMutex::new(None),
            manual: AtomicBool::new(false),
            pending: SyncMutex::new(Vec::new()),
        }
    }

    /// Makes registration refuse to start.
    pub fn refuse(&self) {
        self.refused.store(true, Ordering::Release);
    }

    /// Completes the next registration with the given failure status.
    pub fn fail_with(&self, status: Status) {
        *self.fail.lock() = Some(status);
    }

    /// Queues registration completions instead of delivering them.
    pub fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::Release);
    }

    /// Delivers the queued completion at `idx`.
    pub fn release(&self, idx: usize) {
        let complete = self.pending.lock().remove(idx);
        complete();
    }
}

impl Debug for MockServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer").finish_non_exhaustive()
    }
}

impl GattServer for MockServer {
    fn add_service(&self, id: ServiceId, mut service: ServiceDef) -> bool {
        if self.refused.load(Ordering::Acquire) {
            return false;
        }
        service.hdl = self.next_hdl.fetch_add(1, Ordering::Relaxed);
        for c in &mut service.characteristics {
            c.hdl = self.next_hdl.fetch_add(1, Ordering::Relaxed);
            for d in &mut c.descriptors {
                d.hdl = self.next_hdl.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.services.lock().push(service.clone());
        let status = self.fail.lock().take().unwrap_or(Status::SUCCESS);
        let events = Arc::clone(&self.events);
        let run = move || events.service_added(id, status, service);
        if self.manual.load(Ordering::Acquire) {
            self.pending.lock().push(Box::new(run));
        } else {
            tokio::spawn(async move { run() });
        }
        true
    }
}
