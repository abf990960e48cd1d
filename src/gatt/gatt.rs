//! GATT remote-control surface.
//!
//! [`Gatt`] exposes each operation of the request/response protocol as an
//! async method. Every session-touching operation becomes a unit of work on
//! a single-worker coordination context, so concurrent callers observe
//! stack-level side effects in submission order and overlapping operations
//! against one peer can never race inside the stack.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::broadcast;
use tracing::info;

use crate::att::{Handle, HandleRange, Status};
use crate::gap::Uuid;
use crate::le::RawAddr;

pub use {consts::*, server::Registered, tree::{Characteristic, Descriptor, Service}};

use exec::SerialExecutor;
use server::ServerManager;
use session::Sessions;
use stack::{CharacteristicDef, DescriptorDef, ServiceDef, Stack, UuidBroadcast};

pub mod stack;

mod consts;
mod exec;
mod server;
mod session;
mod tree;

#[cfg(test)]
mod mock;
#[cfg(test)]
mod tests;

/// Error type returned by the remote-control interface.
///
/// Protocol-level status codes reported by the stack for completed reads and
/// writes are response data ([`crate::att::Status`]), never errors; a test
/// driver needs to observe them.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No live connection is associated with the peer address.
    #[error("no connection for {peer}")]
    NoConnection { peer: RawAddr },
    /// The current attribute tree has no attribute with this handle.
    #[error("no attribute with handle {hdl:#06X}")]
    NoAttribute { hdl: u16 },
    /// Start handle greater than end handle.
    #[error("invalid handle range {start:#06X}..={end:#06X}")]
    InvalidRange { start: u16, end: u16 },
    /// Not a canonical UUID string.
    #[error("invalid UUID {0:?}")]
    InvalidUuid(String),
    /// The stack synchronously refused to start an operation.
    #[error("{op} rejected by the stack")]
    Rejected { op: &'static str },
    /// The stack refused to start service discovery.
    #[error("service discovery failed to start for {peer}")]
    DiscoveryFailed { peer: RawAddr },
    /// The stack refused to drop its attribute cache.
    #[error("attribute cache refresh failed for {peer}")]
    RefreshFailed { peer: RawAddr },
    /// Service registration completed with a failure status.
    #[error("service registration failed with {status}")]
    RegistrationFailed { status: Status },
    /// The stack reported an attribute tree this crate cannot represent.
    #[error("invalid attribute tree: {0}")]
    InvalidTree(&'static str),
    /// The UUID broadcast yielded no service records for the peer.
    #[error("no SDP records received for {peer}")]
    SdpExhausted { peer: RawAddr },
    /// The interface was torn down while the request was outstanding.
    #[error("remote-control interface closed")]
    Closed,
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Timing constants for the operations that have no stack completion signal.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Settling delay imposed before a by-UUID discovery, allowing any
    /// discovery the stack started on its own after connection to finish.
    /// There is no way to ask the stack whether one is in progress; 20 s to
    /// 28 s has been observed, so the default allows 32 s.
    pub discover_by_uuid_settle: Duration,
    /// Upper bound on a notification wait before reporting that no change
    /// event arrived.
    pub notification_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discover_by_uuid_settle: Duration::from_secs(32),
            notification_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ExchangeMtuRequest {
    pub connection: RawAddr,
    pub mtu: u16,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExchangeMtuResponse {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WriteRequest {
    pub connection: RawAddr,
    pub handle: u16,
    pub value: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WriteResponse {
    pub handle: u16,
    pub status: Status,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ReadRequest {
    pub connection: RawAddr,
    pub handle: u16,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReadResponse {
    pub handle: u16,
    pub value: Vec<u8>,
    pub status: Status,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReadByUuidRequest {
    pub connection: RawAddr,
    pub uuid: String,
    pub start_handle: u16,
    pub end_handle: u16,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReadByUuidResponse {
    /// One entry per matching value, in the order the stack reported them.
    pub characteristics_read: Vec<ReadResponse>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DiscoverServicesRequest {
    pub connection: RawAddr,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiscoverServicesResponse {
    pub services: Vec<Service>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DiscoverServiceByUuidRequest {
    pub connection: RawAddr,
    pub uuid: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiscoverServiceByUuidResponse {}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DiscoverServicesSdpRequest {
    pub address: RawAddr,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiscoverServicesSdpResponse {
    /// Canonical uppercase UUID strings.
    pub service_uuids: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ClearCacheRequest {
    pub connection: RawAddr,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClearCacheResponse {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegisterServiceRequest {
    pub service: ServiceParams,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegisterServiceResponse {
    /// Handle-annotated tree of the now-hosted service.
    pub service: Service,
}

/// Server-side service description submitted for hosting.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceParams {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicParams>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CharacteristicParams {
    pub uuid: String,
    pub properties: u8,
    pub permissions: u16,
    pub descriptors: Vec<DescriptorParams>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DescriptorParams {
    pub uuid: String,
    pub permissions: u16,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SetNotificationRequest {
    pub connection: RawAddr,
    /// Handle of the Client Characteristic Configuration descriptor.
    pub handle: u16,
    pub enable: CccdValue,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SetNotificationResponse {
    pub handle: u16,
    pub status: Status,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct NotificationWaitRequest {
    pub connection: RawAddr,
    /// Characteristic value handle to watch.
    pub handle: u16,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NotificationWaitResponse {
    pub received: bool,
}

/// GATT remote-control façade.
#[derive(Debug)]
pub struct Gatt {
    exec: SerialExecutor,
    stack: Arc<dyn Stack>,
    sessions: Arc<Sessions>,
    server: Arc<ServerManager>,
}

impl Gatt {
    /// Creates the façade over `stack` with default timing. Must be called
    /// within a Tokio runtime.
    #[inline]
    #[must_use]
    pub fn new(stack: Arc<dyn Stack>) -> Self {
        Self::with_config(stack, Config::default())
    }

    /// Creates the façade with explicit timing constants.
    #[must_use]
    pub fn with_config(stack: Arc<dyn Stack>, cfg: Config) -> Self {
        let sessions = Arc::new(Sessions::new(Arc::clone(&stack), cfg));
        let server = Arc::new(ServerManager::new(stack.as_ref()));
        Self {
            exec: SerialExecutor::new(),
            stack,
            sessions,
            server,
        }
    }

    /// Starts MTU negotiation with the peer. Only the start-ack is awaited;
    /// the negotiated value may differ from the request.
    pub async fn exchange_mtu(&self, req: ExchangeMtuRequest) -> Result<ExchangeMtuResponse> {
        info!("exchange_mtu connection={} mtu={}", req.connection, req.mtu);
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                sessions.get(req.connection)?.request_mtu(req.mtu)?;
                Ok(ExchangeMtuResponse {})
            })
            .await
    }

    /// Writes the attribute with the given flat handle, characteristic or
    /// descriptor, and returns the completion verbatim.
    pub async fn write_attribute(&self, req: WriteRequest) -> Result<WriteResponse> {
        info!(
            "write_attribute connection={} handle={:#06X}",
            req.connection, req.handle
        );
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let s = sessions.get(req.connection)?;
                let w = s.write_attribute(handle(req.handle)?, &req.value).await?;
                Ok(WriteResponse {
                    handle: w.hdl.into(),
                    status: w.status,
                })
            })
            .await
    }

    /// Reads the attribute with the given flat handle. A non-success status
    /// is returned as data, with whatever value the stack reported.
    pub async fn read_attribute(&self, req: ReadRequest) -> Result<ReadResponse> {
        info!(
            "read_attribute connection={} handle={:#06X}",
            req.connection, req.handle
        );
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let s = sessions.get(req.connection)?;
                let r = s.read_attribute(handle(req.handle)?).await?;
                Ok(ReadResponse {
                    handle: r.hdl.into(),
                    value: r.value,
                    status: r.status,
                })
            })
            .await
    }

    /// Reads every characteristic matching the UUID within the handle range,
    /// preserving stack-reported order.
    pub async fn read_attributes_by_uuid(
        &self,
        req: ReadByUuidRequest,
    ) -> Result<ReadByUuidResponse> {
        info!(
            "read_attributes_by_uuid connection={} uuid={}",
            req.connection, req.uuid
        );
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let uuid = uuid(&req.uuid)?;
                let (start, end) = (handle(req.start_handle)?, handle(req.end_handle)?);
                if end < start {
                    return Err(Error::InvalidRange {
                        start: req.start_handle,
                        end: req.end_handle,
                    });
                }
                let s = sessions.get(req.connection)?;
                let reads = s
                    .read_characteristics_by_uuid(uuid, HandleRange::new(start, end))
                    .await?;
                Ok(ReadByUuidResponse {
                    characteristics_read: reads
                        .into_iter()
                        .map(|r| ReadResponse {
                            handle: r.hdl.into(),
                            value: r.value,
                            status: r.status,
                        })
                        .collect(),
                })
            })
            .await
    }

    /// Discovers the peer's services and returns the attribute tree in wire
    /// form. Idempotent until the cache is cleared.
    pub async fn discover_services(
        &self,
        req: DiscoverServicesRequest,
    ) -> Result<DiscoverServicesResponse> {
        info!("discover_services connection={}", req.connection);
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let services = sessions.get(req.connection)?.service_tree().await?;
                Ok(DiscoverServicesResponse { services })
            })
            .await
    }

    /// Best-effort targeted discovery: imposes the configured settling delay
    /// and then issues the request. The stack reports nothing back for this
    /// path, so an empty response only means the request was issued.
    pub async fn discover_service_by_uuid(
        &self,
        req: DiscoverServiceByUuidRequest,
    ) -> Result<DiscoverServiceByUuidResponse> {
        info!(
            "discover_service_by_uuid connection={} uuid={}",
            req.connection, req.uuid
        );
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let uuid = uuid(&req.uuid)?;
                sessions.get(req.connection)?.discover_service_by_uuid(uuid).await?;
                Ok(DiscoverServiceByUuidResponse {})
            })
            .await
    }

    /// Fetches the peer's service UUIDs over SDP. Collects up to two
    /// broadcasts for the device, some of which the platform is known to
    /// send empty, and returns the first non-empty payload.
    pub async fn discover_services_sdp(
        &self,
        req: DiscoverServicesSdpRequest,
    ) -> Result<DiscoverServicesSdpResponse> {
        info!("discover_services_sdp address={}", req.address);
        let stack = Arc::clone(&self.stack);
        self.exec
            .submit(async move {
                // Subscribe first; the fetch may complete immediately.
                let mut rx = stack.uuid_events();
                if !stack.fetch_uuids(req.address) {
                    return Err(Error::Rejected { op: "SDP fetch" });
                }
                let mut signals = 0;
                while signals < 2 {
                    let ev: UuidBroadcast = match rx.recv().await {
                        Ok(ev) => ev,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
                    };
                    if ev.peer != req.address {
                        continue;
                    }
                    signals += 1;
                    if let Some(uuids) = ev.uuids {
                        if !uuids.is_empty() {
                            return Ok(DiscoverServicesSdpResponse {
                                service_uuids: uuids.iter().map(Uuid::to_string).collect(),
                            });
                        }
                    }
                }
                Err(Error::SdpExhausted { peer: req.address })
            })
            .await
    }

    /// Invalidates the attribute cache for the connection. The next
    /// operation re-runs discovery.
    pub async fn clear_cache(&self, req: ClearCacheRequest) -> Result<ClearCacheResponse> {
        info!("clear_cache connection={}", req.connection);
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                sessions.get(req.connection)?.clear_cache()?;
                Ok(ClearCacheResponse {})
            })
            .await
    }

    /// Registers a service on the local GATT server and returns its
    /// handle-annotated tree once the stack confirms the registration.
    pub async fn register_service(
        &self,
        req: RegisterServiceRequest,
    ) -> Result<RegisterServiceResponse> {
        info!("register_service uuid={}", req.service.uuid);
        let server = Arc::clone(&self.server);
        self.exec
            .submit(async move {
                let def = service_def(&req.service)?;
                let service = server.register(def).await?;
                Ok(RegisterServiceResponse { service })
            })
            .await
    }

    /// Subscribes the peer to notifications or indications through a CCC
    /// descriptor and returns the descriptor write completion.
    pub async fn set_notification(
        &self,
        req: SetNotificationRequest,
    ) -> Result<SetNotificationResponse> {
        info!(
            "set_notification connection={} handle={:#06X} enable={:?}",
            req.connection, req.handle, req.enable
        );
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let s = sessions.get(req.connection)?;
                let w = s.set_notification(handle(req.handle)?, req.enable).await?;
                Ok(SetNotificationResponse {
                    handle: w.hdl.into(),
                    status: w.status,
                })
            })
            .await
    }

    /// Waits for the next change event on a characteristic. `received` is
    /// `false` if none arrived within the configured bound.
    pub async fn wait_for_notification(
        &self,
        req: NotificationWaitRequest,
    ) -> Result<NotificationWaitResponse> {
        info!(
            "wait_for_notification connection={} handle={:#06X}",
            req.connection, req.handle
        );
        let sessions = Arc::clone(&self.sessions);
        self.exec
            .submit(async move {
                let s = sessions.get(req.connection)?;
                let received = s.wait_for_notification(handle(req.handle)?).await?;
                Ok(NotificationWaitResponse { received })
            })
            .await
    }

    /// Subscribes to the stream of newly registered server services.
    #[inline]
    pub fn service_registrations(&self) -> broadcast::Receiver<Registered> {
        self.server.registrations()
    }

    /// Tears the interface down: stops the coordination worker and drops
    /// every session, so nothing stale carries over into a back-to-back test
    /// run. Idempotent.
    pub fn close(&self) {
        info!("close");
        self.exec.stop();
        self.sessions.clear_all();
    }
}

/// Converts a wire handle, rejecting the reserved zero value.
fn handle(raw: u16) -> Result<Handle> {
    Handle::new(raw).ok_or(Error::NoAttribute { hdl: raw })
}

/// Parses a canonical UUID string from the wire.
fn uuid(s: &str) -> Result<Uuid> {
    s.parse().map_err(|_| Error::InvalidUuid(s.to_owned()))
}

/// Builds the stack-native definition for a service description. Handles
/// stay zero until the stack assigns them.
fn service_def(params: &ServiceParams) -> Result<ServiceDef> {
    let mut characteristics = Vec::with_capacity(params.characteristics.len());
    for c in &params.characteristics {
        let mut descriptors = Vec::with_capacity(c.descriptors.len());
        for d in &c.descriptors {
            descriptors.push(DescriptorDef {
                hdl: 0,
                uuid: uuid(&d.uuid)?,
                perms: Perm::from_bits_retain(d.permissions),
            });
        }
        characteristics.push(CharacteristicDef {
            hdl: 0,
            uuid: uuid(&c.uuid)?,
            props: Prop::from_bits_retain(c.properties),
            perms: Perm::from_bits_retain(c.permissions),
            descriptors,
        });
    }
    Ok(ServiceDef {
        hdl: 0,
        uuid: uuid(&params.uuid)?,
        typ: ServiceType::Primary,
        includes: SmallVec::new(),
        characteristics,
    })
}
