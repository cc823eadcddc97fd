//! Device Handshake Integration Tests
//!
//! Drives PROTOCOLVERSION, SERVICE_REQUEST and USERAUTH_REQUEST through a
//! running connection worker and checks what the device sees.


use integration_harness::{SYSTEM_ID, TestEngine, USERNAME, join};
use mps_engine::{
    AuthRejection, CloseReason, ConnectionKind, DirectoryEvent, EngineConfig, GroupMode,
    KeepaliveOptions, amt_node_id,
};
use mps_protocol::Frame;
use std::time::Duration;

#[tokio::test]
async fn test_unmatched_username_fails_and_closes() {
    let engine = TestEngine::hardware();
    let (mut device, worker) = engine.connect();

    device.start_handshake("zzzzzzzzzzzzzzzz").await.unwrap();
    let frames = device.drain_to_eof().await.unwrap();
    assert_eq!(
        frames,
        vec![Frame::UserauthFailure {
            methods: "password".to_string(),
            partial: false
        }]
    );

    assert!(matches!(
        join(worker).await,
        CloseReason::AuthenticationFailed(AuthRejection::UnknownGroup)
    ));
    assert_eq!(engine.ctx.registry.count(), 0);
}

#[tokio::test]
async fn test_hardware_device_provisioned_and_registered() {
    let engine = TestEngine::hardware();
    let mut events = engine.bus.subscribe();
    let (mut device, worker) = engine.connect();

    device.authenticate().await.unwrap();

    let device_key = format!("node//{}", amt_node_id(&SYSTEM_ID));
    assert_eq!(engine.directory.device_count(""), 1);
    assert_eq!(engine.ctx.registry.connections(&device_key).len(), 1);

    let (_, event) = events.recv().await.unwrap();
    assert!(matches!(event, DirectoryEvent::DeviceAdded { ref device_id, .. } if *device_id == device_key));

    // Announced after the publish delay
    let (_, event) = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        DirectoryEvent::Connectivity {
            device_id: device_key.clone(),
            group_id: "mesh//abcdefghijklmnopqrstuvwxyz".to_string(),
            kind: ConnectionKind::Direct,
            connected: true,
        }
    );

    device.send(Frame::Disconnect { reason: 11 }).await.unwrap();
    assert!(matches!(join(worker).await, CloseReason::PeerDisconnect(11)));
    assert!(engine.ctx.registry.connections(&device_key).is_empty());

    let (_, event) = events.recv().await.unwrap();
    assert!(matches!(
        event,
        DirectoryEvent::Connectivity {
            connected: false,
            ..
        }
    ));
}

#[tokio::test]
async fn test_over_quota_drops_without_reply() {
    let engine = TestEngine::new(EngineConfig::default(), GroupMode::Amt, Some(0));
    let (mut device, worker) = engine.connect();

    device.start_handshake(USERNAME).await.unwrap();
    assert!(device.drain_to_eof().await.unwrap().is_empty());
    assert!(matches!(join(worker).await, CloseReason::QuotaExceeded));
    assert_eq!(engine.directory.device_count(""), 0);
}

#[tokio::test]
async fn test_managed_group_requires_existing_device() {
    let engine = TestEngine::new(EngineConfig::default(), GroupMode::Agent, None);
    let (mut device, worker) = engine.connect();

    device.start_handshake(USERNAME).await.unwrap();
    assert_eq!(
        device.drain_to_eof().await.unwrap(),
        vec![Frame::UserauthFailure {
            methods: "password".to_string(),
            partial: false
        }]
    );
    assert!(matches!(
        join(worker).await,
        CloseReason::AuthenticationFailed(AuthRejection::UnknownDevice)
    ));
    assert_eq!(engine.directory.device_count(""), 0);
}

#[tokio::test]
async fn test_shared_secret_mismatch() {
    let config = EngineConfig {
        shared_secret: Some("not-the-secret".to_string()),
        ..Default::default()
    };
    let engine = TestEngine::new(config, GroupMode::Amt, None);
    let (mut device, worker) = engine.connect();

    device.start_handshake(USERNAME).await.unwrap();
    let frames = device.drain_to_eof().await.unwrap();
    assert!(matches!(frames.as_slice(), [Frame::UserauthFailure { .. }]));
    assert!(matches!(
        join(worker).await,
        CloseReason::AuthenticationFailed(AuthRejection::BadCredential)
    ));
}

#[tokio::test]
async fn test_keepalive_options_follow_success() {
    let config = EngineConfig {
        keepalive: Some(KeepaliveOptions {
            interval: 30,
            timeout: 90,
        }),
        ..Default::default()
    };
    let engine = TestEngine::new(config, GroupMode::Amt, None);
    let (mut device, _worker) = engine.connect();

    device.authenticate().await.unwrap();
    assert_eq!(
        device.recv().await.unwrap(),
        Frame::KeepaliveOptionsRequest {
            interval: 30,
            timeout: 90
        }
    );

    device.send(Frame::KeepaliveRequest { cookie: 42 }).await.unwrap();
    assert_eq!(
        device.recv().await.unwrap(),
        Frame::KeepaliveReply { cookie: 42 }
    );
}

#[tokio::test]
async fn test_relay_connection_kind() {
    let engine = TestEngine::hardware();
    let (mut device, _worker) = engine.connect();

    device
        .send(Frame::JsonControl {
            json: r#"{"action":"connType","value":1}"#.to_string(),
        })
        .await
        .unwrap();
    device.authenticate().await.unwrap();

    let device_key = format!("node//{}", amt_node_id(&SYSTEM_ID));
    let connections = engine.ctx.registry.connections(&device_key);
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].kind(), ConnectionKind::Relay);
}

#[tokio::test]
async fn test_oversized_frame_terminates() {
    let engine = TestEngine::hardware();
    let (mut device, worker) = engine.connect();
    device.authenticate().await.unwrap();

    // CHANNEL_DATA declaring 5,000,000 bytes
    let mut raw = vec![94u8];
    raw.extend_from_slice(&1u32.to_be_bytes());
    raw.extend_from_slice(&5_000_000u32.to_be_bytes());
    device.send_raw(&raw).await.unwrap();

    assert!(device.drain_to_eof().await.unwrap().is_empty());
    assert!(matches!(join(worker).await, CloseReason::Fatal(_)));
    assert_eq!(engine.ctx.registry.count(), 0);
}

#[tokio::test]
async fn test_handshake_split_across_writes() {
    let engine = TestEngine::hardware();
    let (mut device, _worker) = engine.connect();

    let mut bytes = Vec::new();
    for frame in [
        Frame::ProtocolVersion(mps_protocol::ProtocolVersion {
            major: 1,
            minor: 0,
            system_id: SYSTEM_ID,
        }),
        Frame::ServiceRequest {
            service: mps_protocol::SERVICE_AUTH.to_string(),
        },
    ] {
        bytes.extend_from_slice(&frame.to_bytes());
    }
    for chunk in bytes.chunks(7) {
        device.send_raw(chunk).await.unwrap();
        tokio::task::yield_now().await;
    }

    assert_eq!(
        device.recv().await.unwrap(),
        Frame::ServiceAccept {
            service: mps_protocol::SERVICE_AUTH.to_string()
        }
    );
}
