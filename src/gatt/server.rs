use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::att::Status;

use super::stack::{GattServer, ServerEvents, ServiceDef, ServiceId, Stack};
use super::tree::{Service, Tree};
use super::{Error, Result};

/// Completed service registration, as published on the registration stream.
#[derive(Clone, Debug)]
pub struct Registered {
    pub id: ServiceId,
    pub status: Status,
    /// Handle-annotated definition; the assigned handles are authoritative.
    pub service: ServiceDef,
}

/// Owns the locally hosted GATT server and exposes newly registered services
/// as an observable stream.
#[derive(Debug)]
pub(super) struct ServerManager {
    server: Arc<dyn GattServer>,
    added: broadcast::Sender<Registered>,
    next_id: AtomicU64,
}

/// Forwards stack registration completions into the broadcast stream.
#[derive(Debug)]
struct Completions(broadcast::Sender<Registered>);

impl ServerEvents for Completions {
    fn service_added(&self, id: ServiceId, status: Status, service: ServiceDef) {
        // No receivers means no registration in flight; nothing to resolve.
        let _ = self.0.send(Registered {
            id,
            status,
            service,
        });
    }
}

impl ServerManager {
    pub fn new(stack: &dyn Stack) -> Self {
        let (added, _) = broadcast::channel(16);
        let server = stack.server(Arc::new(Completions(added.clone())));
        Self {
            server,
            added,
            next_id: AtomicU64::new(1),
        }
    }

    /// Submits `def` for hosting, waits for its registration to complete,
    /// and returns the handle-annotated wire tree.
    ///
    /// The completion is matched by registration identity rather than by
    /// content: two structurally identical definitions registered
    /// concurrently each resolve their own call.
    pub async fn register(&self, def: ServiceDef) -> Result<Service> {
        let id = ServiceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        // Subscribe before submitting so the completion cannot be missed.
        let mut rx = self.added.subscribe();
        if !self.server.add_service(id, def) {
            return Err(Error::Rejected {
                op: "service registration",
            });
        }
        loop {
            let r = match rx.recv().await {
                Ok(r) => r,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Registration stream lagged by {n}");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Closed),
            };
            if r.id != id {
                continue;
            }
            if !r.status.is_success() {
                return Err(Error::RegistrationFailed { status: r.status });
            }
            let mut services = Tree::build(std::slice::from_ref(&r.service))?.flatten();
            return services.pop().ok_or(Error::InvalidTree("empty registration"));
        }
    }

    /// Subscribes to the stream of newly registered services.
    #[inline]
    pub fn registrations(&self) -> broadcast::Receiver<Registered> {
        self.added.subscribe()
    }
}
