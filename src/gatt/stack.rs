//! External stack boundary.
//!
//! The platform Bluetooth stack implements [`Stack`], [`GattClient`], and
//! [`GattServer`]; this crate only drives those primitives and consumes
//! their completion callbacks through [`ClientEvents`] and [`ServerEvents`].
//! Methods returning `bool` report whether the stack accepted the operation;
//! results arrive later on the matching callback, invoked from an
//! unspecified thread.

use std::fmt::Debug;
use std::sync::Arc;

use smallvec::SmallVec;
use tokio::sync::broadcast;

use crate::att::{Handle, HandleRange, Status};
use crate::gap::Uuid;
use crate::le::RawAddr;

use super::{Perm, Prop, ServiceType};

/// Platform Bluetooth stack: resolves connections to GATT clients, hosts the
/// local GATT server, and carries the device UUID broadcast channel used for
/// SDP discovery.
pub trait Stack: Debug + Send + Sync {
    /// Resolves a peer address to a live GATT client, registering `events`
    /// as its callback sink, or returns [`None`] if the peer is not
    /// connected.
    fn attach(&self, peer: RawAddr, events: Arc<dyn ClientEvents>) -> Option<Arc<dyn GattClient>>;

    /// Returns the locally hosted GATT server, registering `events` as the
    /// sink for registration completions.
    fn server(&self, events: Arc<dyn ServerEvents>) -> Arc<dyn GattServer>;

    /// Starts an SDP UUID fetch for `peer`. Results arrive on
    /// [`Self::uuid_events`], possibly across several broadcasts, some with
    /// no payload.
    fn fetch_uuids(&self, peer: RawAddr) -> bool;

    /// Subscribes to the device UUID broadcast channel.
    fn uuid_events(&self) -> broadcast::Receiver<UuidBroadcast>;
}

/// Client-side GATT primitives for one connection.
pub trait GattClient: Debug + Send + Sync {
    /// Starts MTU negotiation. The negotiated value is reported via
    /// [`ClientEvents::mtu_changed`] and may differ from the request.
    fn request_mtu(&self, mtu: u16) -> bool;

    /// Starts a full service discovery, completed by
    /// [`ClientEvents::services_discovered`].
    fn discover_services(&self) -> bool;

    /// Starts a targeted discovery for one service UUID. This stack path has
    /// no completion callback.
    fn discover_service_by_uuid(&self, uuid: Uuid) -> bool;

    /// Returns a snapshot of the stack's attribute cache for this
    /// connection.
    fn services(&self) -> Vec<ServiceDef>;

    fn read_characteristic(&self, hdl: Handle) -> bool;

    /// Reads every characteristic matching `uuid` within `range`, completed
    /// by [`ClientEvents::characteristics_read_by_uuid`].
    fn read_characteristics_by_uuid(&self, uuid: Uuid, range: HandleRange) -> bool;

    fn read_descriptor(&self, hdl: Handle) -> bool;

    fn write_characteristic(&self, hdl: Handle, value: &[u8]) -> bool;

    fn write_descriptor(&self, hdl: Handle, value: &[u8]) -> bool;

    /// Enables or disables local routing of value-change events for the
    /// characteristic. The peer's CCC descriptor must be written separately.
    fn set_characteristic_notification(&self, hdl: Handle, enable: bool) -> bool;

    /// Drops the stack's attribute cache for this connection.
    fn refresh(&self) -> bool;
}

/// Completion callbacks for client operations.
///
/// Implementations only deliver values into wait slots; they never mutate
/// session state directly, so the stack may invoke them from any thread.
pub trait ClientEvents: Send + Sync {
    fn services_discovered(&self, status: Status);

    fn characteristic_read(&self, read: ValueRead);

    fn characteristic_written(&self, written: ValueWritten);

    fn descriptor_read(&self, read: ValueRead);

    fn descriptor_written(&self, written: ValueWritten);

    /// Ordered values for a by-UUID read, exactly as the stack reports them.
    fn characteristics_read_by_uuid(&self, reads: Vec<ValueRead>);

    /// Unsolicited value-change push for a subscribed characteristic.
    fn characteristic_changed(&self, hdl: Handle, value: Vec<u8>);

    fn mtu_changed(&self, mtu: u16, status: Status);

    fn disconnected(&self);
}

/// Locally hosted GATT server.
pub trait GattServer: Debug + Send + Sync {
    /// Submits a service definition for hosting. The matching
    /// [`ServerEvents::service_added`] completion carries the same `id`.
    fn add_service(&self, id: ServiceId, service: ServiceDef) -> bool;
}

/// Server registration completions.
pub trait ServerEvents: Send + Sync {
    /// Reports a completed registration. `service` carries the
    /// stack-assigned handles, which are authoritative from this point on.
    fn service_added(&self, id: ServiceId, status: Status, service: ServiceDef);
}

/// Registration identity token. Completions are matched by token rather than
/// by service content, so two structurally identical definitions registered
/// concurrently cannot cross-resolve.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ServiceId(u64);

impl ServiceId {
    #[inline(always)]
    #[must_use]
    pub(super) const fn new(v: u64) -> Self {
        Self(v)
    }
}

/// One device UUID broadcast. `uuids` is [`None`] when the platform sends an
/// empty signal, which it is known to do.
#[derive(Clone, Debug)]
pub struct UuidBroadcast {
    pub peer: RawAddr,
    pub uuids: Option<Vec<Uuid>>,
}

/// Stack-native service definition: the nested form used both for attribute
/// cache snapshots and for submitting a service to the local server.
#[derive(Clone, Debug)]
pub struct ServiceDef {
    /// Attribute handle, or `0` before the stack assigns one.
    pub hdl: u16,
    pub uuid: Uuid,
    pub typ: ServiceType,
    /// Handles of included services.
    pub includes: SmallVec<[u16; 2]>,
    pub characteristics: Vec<CharacteristicDef>,
}

/// Stack-native characteristic definition.
#[derive(Clone, Debug)]
pub struct CharacteristicDef {
    /// Value attribute handle, or `0` before the stack assigns one.
    pub hdl: u16,
    pub uuid: Uuid,
    pub props: Prop,
    pub perms: Perm,
    pub descriptors: Vec<DescriptorDef>,
}

/// Stack-native descriptor definition.
#[derive(Clone, Debug)]
pub struct DescriptorDef {
    /// Attribute handle, or `0` before the stack assigns one.
    pub hdl: u16,
    pub uuid: Uuid,
    pub perms: Perm,
}

/// Completed read reported by the stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueRead {
    pub hdl: Handle,
    pub value: Vec<u8>,
    pub status: Status,
}

/// Completed write reported by the stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValueWritten {
    pub hdl: Handle,
    pub status: Status,
}
