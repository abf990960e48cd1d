use std::sync::Arc;
use std::time::Duration;

use matches::assert_matches;
use smallvec::SmallVec;

use crate::att::{ErrorCode, Handle, Status};
use crate::gap::{Uuid, Uuid16};
use crate::le::RawAddr;

use super::mock::{MockClient, MockStack};
use super::server::ServerManager;
use super::stack::{CharacteristicDef, DescriptorDef, ServiceDef, Stack, UuidBroadcast};
use super::*;

const HR_SERVICE: &str = "0000180D-0000-1000-8000-00805F9B34FB";
const HR_MEASUREMENT: &str = "00002A37-0000-1000-8000-00805F9B34FB";
const CCC_DESCRIPTOR: &str = "00002902-0000-1000-8000-00805F9B34FB";

fn addr(s: &str) -> RawAddr {
    s.parse().unwrap()
}

fn uuid16(v: u16) -> Uuid {
    Uuid16::new(v).unwrap().as_uuid()
}

fn svc(hdl: u16, uuid: u16, chars: Vec<CharacteristicDef>) -> ServiceDef {
    ServiceDef {
        hdl,
        uuid: uuid16(uuid),
        typ: ServiceType::Primary,
        includes: SmallVec::new(),
        characteristics: chars,
    }
}

fn chr(hdl: u16, uuid: u16, props: Prop, descs: Vec<DescriptorDef>) -> CharacteristicDef {
    CharacteristicDef {
        hdl,
        uuid: uuid16(uuid),
        props,
        perms: Perm::READ | Perm::WRITE,
        descriptors: descs,
    }
}

fn desc(hdl: u16, uuid: u16) -> DescriptorDef {
    DescriptorDef {
        hdl,
        uuid: uuid16(uuid),
        perms: Perm::READ | Perm::WRITE,
    }
}

/// Heart-rate-shaped remote database: a NOTIFY characteristic with a CCC
/// descriptor at 2..3 and a second same-UUID characteristic at 4.
fn heart_rate_db() -> Vec<ServiceDef> {
    vec![svc(
        1,
        0x180D,
        vec![
            chr(2, 0x2A37, Prop::NOTIFY, vec![desc(3, 0x2902)]),
            chr(4, 0x2A37, Prop::READ | Prop::WRITE, vec![]),
        ],
    )]
}

fn gatt_over(stack: &Arc<MockStack>) -> Gatt {
    let stack: Arc<dyn Stack> = stack.clone();
    Gatt::with_config(stack, test_cfg())
}

fn test_cfg() -> Config {
    Config {
        notification_wait: Duration::from_millis(100),
        ..Config::default()
    }
}

fn connected() -> (Arc<Gatt>, Arc<MockStack>, Arc<MockClient>, RawAddr) {
    let peer = addr("11:22:33:44:55:66");
    let stack = MockStack::new();
    let client = stack.connect(peer, heart_rate_db());
    let gatt = Arc::new(gatt_over(&stack));
    (gatt, stack, client, peer)
}

#[tokio::test(start_paused = true)]
async fn stack_side_effects_follow_submission_order() {
    let (gatt, _stack, client, peer) = connected();
    let (a, b, c, d) = tokio::join!(
        gatt.write_attribute(WriteRequest {
            connection: peer,
            handle: 2,
            value: vec![0xAB],
        }),
        gatt.write_attribute(WriteRequest {
            connection: peer,
            handle: 4,
            value: vec![0xCD],
        }),
        gatt.read_attribute(ReadRequest {
            connection: peer,
            handle: 2,
        }),
        gatt.exchange_mtu(ExchangeMtuRequest {
            connection: peer,
            mtu: 64,
        }),
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok() && d.is_ok());
    assert_eq!(
        client.ops(),
        [
            "discover_services",
            "write_characteristic 0x0002 [AB]",
            "write_characteristic 0x0004 [CD]",
            "read_characteristic 0x0002",
            "request_mtu 64",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn read_after_write_round_trip() {
    let (gatt, _stack, _client, peer) = connected();
    let w = gatt
        .write_attribute(WriteRequest {
            connection: peer,
            handle: 4,
            value: vec![0xDE, 0xAD],
        })
        .await
        .unwrap();
    assert_eq!(w, WriteResponse { handle: 4, status: Status::SUCCESS });
    let r = gatt
        .read_attribute(ReadRequest {
            connection: peer,
            handle: 4,
        })
        .await
        .unwrap();
    assert_eq!(
        r,
        ReadResponse {
            handle: 4,
            value: vec![0xDE, 0xAD],
            status: Status::SUCCESS,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn descriptor_resolved_when_no_characteristic_matches() {
    let (gatt, _stack, client, peer) = connected();
    let w = gatt
        .write_attribute(WriteRequest {
            connection: peer,
            handle: 3,
            value: vec![0x01, 0x00],
        })
        .await
        .unwrap();
    assert_eq!(w.handle, 3);
    let r = gatt
        .read_attribute(ReadRequest {
            connection: peer,
            handle: 3,
        })
        .await
        .unwrap();
    assert_eq!(r.value, vec![0x01, 0x00]);
    let ops = client.ops();
    assert!(ops.contains(&"write_descriptor 0x0003 [01, 00]".to_owned()));
    assert!(ops.contains(&"read_descriptor 0x0003".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn protocol_status_is_returned_as_data() {
    let (gatt, _stack, client, peer) = connected();
    client.set_status(4, ErrorCode::ReadNotPermitted.into());
    let r = gatt
        .read_attribute(ReadRequest {
            connection: peer,
            handle: 4,
        })
        .await
        .unwrap();
    assert_eq!(r.status, ErrorCode::ReadNotPermitted.into());
    assert!(r.value.is_empty());
}

#[tokio::test(start_paused = true)]
async fn unresolvable_handles_fail_with_not_found() {
    let (gatt, _stack, _client, peer) = connected();
    // Discovery succeeded, but these handles were never assigned.
    assert_matches!(
        gatt.read_attribute(ReadRequest { connection: peer, handle: 9 }).await,
        Err(Error::NoAttribute { hdl: 9 })
    );
    assert_matches!(
        gatt.read_attribute(ReadRequest { connection: peer, handle: 0 }).await,
        Err(Error::NoAttribute { hdl: 0 })
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_connection_fails_with_not_found() {
    let (gatt, _stack, _client, _peer) = connected();
    let stranger = addr("66:55:44:33:22:11");
    assert_matches!(
        gatt.discover_services(DiscoverServicesRequest { connection: stranger }).await,
        Err(Error::NoConnection { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_invalidates_the_session() {
    let (gatt, stack, _client, peer) = connected();
    gatt.discover_services(DiscoverServicesRequest { connection: peer })
        .await
        .unwrap();
    stack.disconnect(peer);
    assert_matches!(
        gatt.read_attribute(ReadRequest { connection: peer, handle: 2 }).await,
        Err(Error::NoConnection { .. })
    );
    // Reconnection builds a fresh session with fresh discovery state.
    let client = stack.connect(peer, heart_rate_db());
    gatt.discover_services(DiscoverServicesRequest { connection: peer })
        .await
        .unwrap();
    assert_eq!(client.ops(), ["discover_services"]);
}

#[tokio::test(start_paused = true)]
async fn discovery_is_idempotent_until_cache_clear() {
    let (gatt, _stack, client, peer) = connected();
    let req = DiscoverServicesRequest { connection: peer };
    gatt.discover_services(req).await.unwrap();
    gatt.discover_services(req).await.unwrap();
    assert_eq!(client.ops(), ["discover_services"]);
    gatt.clear_cache(ClearCacheRequest { connection: peer }).await.unwrap();
    gatt.discover_services(req).await.unwrap();
    assert_eq!(
        client.ops(),
        ["discover_services", "refresh", "discover_services"]
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_stack_refusals() {
    let (gatt, _stack, client, peer) = connected();
    client.refuse("discover_services");
    assert_matches!(
        gatt.discover_services(DiscoverServicesRequest { connection: peer }).await,
        Err(Error::DiscoveryFailed { .. })
    );
    let (gatt, _stack, client, peer) = connected();
    client.refuse("refresh");
    assert_matches!(
        gatt.clear_cache(ClearCacheRequest { connection: peer }).await,
        Err(Error::RefreshFailed { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn mtu_success_is_only_a_start_ack() {
    let (gatt, _stack, client, peer) = connected();
    let rsp = gatt
        .exchange_mtu(ExchangeMtuRequest { connection: peer, mtu: 247 })
        .await
        .unwrap();
    assert_eq!(rsp, ExchangeMtuResponse {});
    assert_eq!(client.ops(), ["request_mtu 247"]);

    client.refuse("request_mtu");
    assert_matches!(
        gatt.exchange_mtu(ExchangeMtuRequest { connection: peer, mtu: 23 }).await,
        Err(Error::Rejected { op: "MTU exchange" })
    );
}

#[tokio::test(start_paused = true)]
async fn read_by_uuid_preserves_stack_order_and_range() {
    let (gatt, _stack, _client, peer) = connected();
    for (handle, value) in [(2, vec![1u8]), (4, vec![2u8])] {
        gatt.write_attribute(WriteRequest { connection: peer, handle, value })
            .await
            .unwrap();
    }
    let rsp = gatt
        .read_attributes_by_uuid(ReadByUuidRequest {
            connection: peer,
            uuid: HR_MEASUREMENT.to_owned(),
            start_handle: 1,
            end_handle: 0xFFFF,
        })
        .await
        .unwrap();
    let handles: Vec<u16> = rsp.characteristics_read.iter().map(|r| r.handle).collect();
    assert_eq!(handles, [2, 4]);
    assert_eq!(rsp.characteristics_read[1].value, vec![2]);

    let rsp = gatt
        .read_attributes_by_uuid(ReadByUuidRequest {
            connection: peer,
            uuid: HR_MEASUREMENT.to_owned(),
            start_handle: 3,
            end_handle: 6,
        })
        .await
        .unwrap();
    let handles: Vec<u16> = rsp.characteristics_read.iter().map(|r| r.handle).collect();
    assert_eq!(handles, [4]);

    assert_matches!(
        gatt.read_attributes_by_uuid(ReadByUuidRequest {
            connection: peer,
            uuid: HR_MEASUREMENT.to_owned(),
            start_handle: 6,
            end_handle: 3,
        })
        .await,
        Err(Error::InvalidRange { start: 6, end: 3 })
    );
}

#[tokio::test(start_paused = true)]
async fn set_notification_writes_the_ccc_descriptor() {
    let (gatt, _stack, client, peer) = connected();
    let rsp = gatt
        .set_notification(SetNotificationRequest {
            connection: peer,
            handle: 3,
            enable: CccdValue::Notification,
        })
        .await
        .unwrap();
    assert_eq!(rsp, SetNotificationResponse { handle: 3, status: Status::SUCCESS });
    assert_eq!(client.value(3), Some(vec![0x01, 0x00]));
    let ops = client.ops();
    let setup = ops.iter().position(|o| o == "set_characteristic_notification 0x0002 true");
    let write = ops.iter().position(|o| o == "write_descriptor 0x0003 [01, 00]");
    assert!(setup.unwrap() < write.unwrap());

    gatt.set_notification(SetNotificationRequest {
        connection: peer,
        handle: 3,
        enable: CccdValue::Indication,
    })
    .await
    .unwrap();
    assert_eq!(client.value(3), Some(vec![0x02, 0x00]));

    // The handle must name a descriptor, not its characteristic.
    assert_matches!(
        gatt.set_notification(SetNotificationRequest {
            connection: peer,
            handle: 2,
            enable: CccdValue::Notification,
        })
        .await,
        Err(Error::NoAttribute { hdl: 2 })
    );
}

#[tokio::test(start_paused = true)]
async fn notification_wait_resolves_on_change_event() {
    let (gatt, _stack, client, peer) = connected();
    let g = Arc::clone(&gatt);
    let wait = tokio::spawn(async move {
        g.wait_for_notification(NotificationWaitRequest { connection: peer, handle: 2 })
            .await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    client.push_notification(Handle::new(2).unwrap(), &[0x60]);
    let rsp = wait.await.unwrap().unwrap();
    assert!(rsp.received);
}

#[tokio::test(start_paused = true)]
async fn notification_wait_times_out_and_ignores_other_handles() {
    let (gatt, _stack, client, peer) = connected();
    let g = Arc::clone(&gatt);
    let wait = tokio::spawn(async move {
        g.wait_for_notification(NotificationWaitRequest { connection: peer, handle: 2 })
            .await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    // A change on a different characteristic must not resolve the wait.
    client.push_notification(Handle::new(4).unwrap(), &[0x61]);
    let rsp = wait.await.unwrap().unwrap();
    assert!(!rsp.received);

    assert_matches!(
        gatt.wait_for_notification(NotificationWaitRequest { connection: peer, handle: 9 }).await,
        Err(Error::NoAttribute { hdl: 9 })
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_wait_slot_never_resolves_a_later_operation() {
    let (gatt, _stack, client, peer) = connected();
    gatt.discover_services(DiscoverServicesRequest { connection: peer })
        .await
        .unwrap();
    client.set_manual(true);

    // The read's completion is withheld, so the caller times out and gives
    // up, abandoning the armed wait slot.
    let read = gatt.read_attribute(ReadRequest { connection: peer, handle: 2 });
    assert!(tokio::time::timeout(Duration::from_millis(50), read).await.is_err());

    let g = Arc::clone(&gatt);
    let write = tokio::spawn(async move {
        g.write_attribute(WriteRequest {
            connection: peer,
            handle: 4,
            value: vec![0x77],
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Release the stale read completion followed by the write completion.
    // The former must be dropped, not delivered into the write's slot.
    client.release_pending();
    let w = write.await.unwrap().unwrap();
    assert_eq!(w, WriteResponse { handle: 4, status: Status::SUCCESS });
}

#[tokio::test(start_paused = true)]
async fn register_service_returns_handle_annotated_tree() {
    let peer = addr("11:22:33:44:55:66");
    let stack = MockStack::new();
    let gatt = gatt_over(&stack);
    let rsp = gatt
        .register_service(RegisterServiceRequest {
            service: ServiceParams {
                uuid: HR_SERVICE.to_owned(),
                characteristics: vec![CharacteristicParams {
                    uuid: HR_MEASUREMENT.to_owned(),
                    properties: Prop::NOTIFY.bits(),
                    permissions: Perm::READ.bits(),
                    descriptors: vec![DescriptorParams {
                        uuid: CCC_DESCRIPTOR.to_owned(),
                        permissions: (Perm::READ | Perm::WRITE).bits(),
                    }],
                }],
            },
        })
        .await
        .unwrap();

    let service = &rsp.service;
    assert_eq!(service.uuid, HR_SERVICE);
    assert_eq!(service.service_type, ServiceType::Primary);
    let chr = &service.characteristics[0];
    let dsc = &chr.descriptors[0];
    assert_eq!(chr.uuid, HR_MEASUREMENT);
    assert_eq!(dsc.uuid, CCC_DESCRIPTOR);
    assert!(service.handle != 0 && chr.handle != 0 && dsc.handle != 0);
    assert!(service.handle != chr.handle && chr.handle != dsc.handle);

    // A peer connected to this server discovers the identical tree.
    stack.connect(peer, stack.host_db());
    let discovered = gatt
        .discover_services(DiscoverServicesRequest { connection: peer })
        .await
        .unwrap();
    assert_eq!(discovered.services, vec![rsp.service.clone()]);
}

#[tokio::test(start_paused = true)]
async fn register_service_refusal_and_failure() {
    let request = RegisterServiceRequest {
        service: ServiceParams {
            uuid: HR_SERVICE.to_owned(),
            characteristics: Vec::new(),
        },
    };

    let stack = MockStack::new();
    let gatt = gatt_over(&stack);
    stack.mock_server().fail_with(ErrorCode::InsufficientResources.into());
    assert_matches!(
        gatt.register_service(request.clone()).await,
        Err(Error::RegistrationFailed { .. })
    );

    stack.mock_server().refuse();
    assert_matches!(
        gatt.register_service(request).await,
        Err(Error::Rejected { op: "service registration" })
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_registrations_resolve_by_identity() {
    let stack = MockStack::new();
    let mgr = Arc::new(ServerManager::new(stack.as_ref()));
    let server = stack.mock_server();
    server.set_manual(true);

    // Two structurally identical definitions.
    let def = svc(0, 0x180D, vec![chr(0, 0x2A37, Prop::NOTIFY, vec![])]);
    let (m1, m2) = (Arc::clone(&mgr), Arc::clone(&mgr));
    let first = {
        let def = def.clone();
        tokio::spawn(async move { m1.register(def).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let second = tokio::spawn(async move { m2.register(def).await });
    tokio::time::sleep(Duration::from_millis(1)).await;

    // Complete the registrations out of order; each call must resolve with
    // its own submission, not whichever completion arrives first.
    server.release(1);
    tokio::time::sleep(Duration::from_millis(1)).await;
    server.release(0);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.handle, 1);
    assert_eq!(first.characteristics[0].handle, 2);
    assert_eq!(second.handle, 3);
    assert_eq!(second.characteristics[0].handle, 4);
}

#[tokio::test(start_paused = true)]
async fn sdp_returns_first_non_empty_broadcast() {
    let peer = addr("11:22:33:44:55:66");
    let other = addr("66:55:44:33:22:11");
    let stack = MockStack::new();
    let gatt = gatt_over(&stack);
    stack.script_sdp(
        peer,
        vec![
            // Broadcasts for other devices are filtered out entirely.
            UuidBroadcast { peer: other, uuids: Some(vec![uuid16(0x1234)]) },
            UuidBroadcast { peer, uuids: None },
            UuidBroadcast { peer, uuids: Some(vec![uuid16(0x110A), uuid16(0x180D)]) },
        ],
    );
    let rsp = gatt
        .discover_services_sdp(DiscoverServicesSdpRequest { address: peer })
        .await
        .unwrap();
    assert_eq!(
        rsp.service_uuids,
        [
            "0000110A-0000-1000-8000-00805F9B34FB",
            "0000180D-0000-1000-8000-00805F9B34FB",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn sdp_gives_up_after_two_empty_signals() {
    let peer = addr("11:22:33:44:55:66");
    let stack = MockStack::new();
    let gatt = gatt_over(&stack);
    stack.script_sdp(
        peer,
        vec![
            UuidBroadcast { peer, uuids: None },
            UuidBroadcast { peer, uuids: Some(Vec::new()) },
        ],
    );
    assert_matches!(
        gatt.discover_services_sdp(DiscoverServicesSdpRequest { address: peer }).await,
        Err(Error::SdpExhausted { .. })
    );

    // An unscripted peer means the fetch cannot start.
    assert_matches!(
        gatt.discover_services_sdp(DiscoverServicesSdpRequest { address: peer }).await,
        Err(Error::Rejected { op: "SDP fetch" })
    );
}

#[tokio::test(start_paused = true)]
async fn discovery_by_uuid_settles_before_issuing() {
    let (gatt, _stack, client, peer) = connected();
    let g = Arc::clone(&gatt);
    let task = tokio::spawn(async move {
        g.discover_service_by_uuid(DiscoverServiceByUuidRequest {
            connection: peer,
            uuid: HR_SERVICE.to_owned(),
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    // Nothing may reach the stack during the settling window.
    assert!(client.ops().is_empty());
    tokio::time::sleep(Duration::from_secs(32)).await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(
        client.ops(),
        [format!("discover_service_by_uuid {HR_SERVICE}")]
    );
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_rejects_further_work() {
    let (gatt, _stack, _client, peer) = connected();
    gatt.close();
    tokio::task::yield_now().await;
    assert_matches!(
        gatt.discover_services(DiscoverServicesRequest { connection: peer }).await,
        Err(Error::Closed)
    );
    // Idempotent.
    gatt.close();
}
