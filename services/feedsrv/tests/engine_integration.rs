//! End-to-end tests: a bound engine and fake feeders over loopback TCP

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use feedsrv::database::{AlertKind, MealOrigin};
use feedsrv::protocol::codec::Action;
use feedsrv::protocol::{DeviceIdentifier, MealPlan, MealSlot, TimeValue};
use feedsrv::{EngineConfig, FeedSrvError};

use crate::common::{eventually, feeder_id, grams, FakeDevice, TestServer, FEEDER_ID};

#[tokio::test]
async fn test_identification_registers_feeder() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect(server.addr, FEEDER_ID).await;

    let reply = device.identify().await;
    assert_eq!(reply.len(), 6);
    assert_eq!(&reply[..4], &[0x9D, 0xA1, 0x06, 0x01]);
    let minutes = u16::from_be_bytes([reply[4], reply[5]]);
    assert!(minutes < 1440);

    let registry = server.engine.registry();
    assert!(eventually(|| registry.lookup(&feeder_id()).is_some()).await);
    assert!(eventually(|| server.database.feeder(&feeder_id()).is_some()).await);

    let record = server.database.feeder(&feeder_id()).unwrap();
    assert_eq!(record.default_amount, grams(5));
    assert!(record.ip.is_loopback());

    let status = server.engine.get_feeder(&feeder_id()).await.unwrap().unwrap();
    assert!(status.is_available);

    server.stop().await;
}

#[tokio::test]
async fn test_feed_now_round_trip() {
    let server = TestServer::start().await;
    let device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;
    let emulator = device.spawn_auto_ack();

    server.engine.feed_now(&feeder_id(), grams(50)).await.unwrap();
    assert!(
        eventually(|| server
            .database
            .meals()
            .iter()
            .any(|meal| meal.origin == MealOrigin::Remote && meal.quantity == grams(50)))
        .await
    );

    server.stop().await;
    let commands = emulator.await.unwrap();
    assert_eq!(commands[0].as_ref(), &[0x9D, 0xA1, 0x06, 0xA2, 0x00, 0x32]);
}

#[tokio::test]
async fn test_set_default_quantity_round_trip() {
    let server = TestServer::start().await;
    let device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;
    let emulator = device.spawn_auto_ack();
    assert!(eventually(|| server.database.feeder(&feeder_id()).is_some()).await);

    server
        .engine
        .set_default_quantity(&feeder_id(), grams(50))
        .await
        .unwrap();
    assert!(
        eventually(|| server
            .database
            .feeder(&feeder_id())
            .is_some_and(|record| record.default_amount == grams(50)))
        .await
    );

    server.stop().await;
    let commands = emulator.await.unwrap();
    assert_eq!(commands[0].as_ref(), &[0x9D, 0xA1, 0x06, 0xC3, 0x00, 0x32]);
}

#[tokio::test]
async fn test_set_planning_waits_for_storage() {
    let server = TestServer::start().await;
    let device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;
    let emulator = device.spawn_auto_ack();
    assert!(eventually(|| server.database.feeder(&feeder_id()).is_some()).await);

    let plan = MealPlan::new(vec![
        MealSlot::from_raw(11, 30, 10.0, true).unwrap(),
        MealSlot::from_raw(17, 20, 15.0, true).unwrap(),
        MealSlot::from_raw(12, 45, 40.0, false).unwrap(),
    ]);
    server
        .engine
        .set_planning(&feeder_id(), plan.clone())
        .await
        .unwrap();

    // Stored before set_planning returned
    assert_eq!(server.database.current_plan(&feeder_id()), Some(plan));

    server.stop().await;
    let commands = emulator.await.unwrap();
    assert_eq!(
        commands[0].as_ref(),
        &[0x9D, 0xA1, 0x2D, 0xC4, 0x02, 0x04, 0x92, 0x00, 0x0A, 0x00, 0x50, 0x00, 0x0F]
    );
}

#[tokio::test]
async fn test_command_times_out_without_acknowledgement() {
    let server = TestServer::start_with(EngineConfig {
        command_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    })
    .await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    let result = server.engine.feed_now(&feeder_id(), grams(20)).await;
    assert!(matches!(result, Err(FeedSrvError::Timeout { .. })));

    // The command still reached the feeder
    let command = device.read_command().await;
    assert_eq!(command.as_ref(), &[0x9D, 0xA1, 0x06, 0xA2, 0x00, 0x14]);
    assert!(server.database.meals().is_empty());

    // A late acknowledgement is ignored and the feeder stays usable
    device.acknowledge(Action::FeedNow).await;
    assert!(server.engine.registry().lookup(&feeder_id()).is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_overlapping_commands_rejected() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    let engine = server.engine.clone();
    let first = tokio::spawn(async move { engine.feed_now(&feeder_id(), grams(30)).await });
    device.read_command().await;

    let second = server.engine.set_default_quantity(&feeder_id(), grams(40)).await;
    assert!(matches!(second, Err(FeedSrvError::ConcurrentCommand(_))));

    device.acknowledge(Action::FeedNow).await;
    first.await.unwrap().unwrap();

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_acknowledgement_does_not_satisfy_command() {
    let server = TestServer::start_with(EngineConfig {
        command_timeout: Duration::from_millis(300),
        ..EngineConfig::default()
    })
    .await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    let engine = server.engine.clone();
    let pending = tokio::spawn(async move { engine.feed_now(&feeder_id(), grams(30)).await });
    device.read_command().await;
    device.acknowledge(Action::ChangePlanning).await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(FeedSrvError::Timeout { .. })));

    server.stop().await;
}

#[tokio::test]
async fn test_manual_meal_recorded() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    device.manual_meal(grams(25)).await;
    assert!(
        eventually(|| server
            .database
            .meals()
            .iter()
            .any(|meal| meal.origin == MealOrigin::Manual && meal.quantity == grams(25)))
        .await
    );
    assert_eq!(
        server.database.feeder(&feeder_id()).unwrap().default_amount,
        grams(25)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_empty_feeder_alert_recorded() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    device
        .empty_alert(TimeValue::new(6, 53).unwrap(), grams(30))
        .await;
    assert!(eventually(|| !server.database.alerts().is_empty()).await);

    let alert = &server.database.alerts()[0];
    assert_eq!(alert.kind, AlertKind::Empty);
    assert_eq!(
        alert.data,
        serde_json::json!({"time": "06:53", "quantity": 30})
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_data_closes_connection() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect(server.addr, FEEDER_ID).await;

    device.send_raw(b"GET / HTTP/1.1\r\n\r\n").await;
    assert!(device.is_closed_by_server().await);
    assert!(eventually(|| server.database.unknown_data().len() == 1).await);

    let record = &server.database.unknown_data()[0];
    assert_eq!(record.kind, "unknown");
    assert_eq!(record.data.as_ref(), b"GET / HTTP/1.1\r\n\r\n");
    assert!(record.ip.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_identifier_stored_whole() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect(server.addr, FEEDER_ID).await;

    // Identification from "AB-1"
    let raw = hex::decode("9da11441422d3101d0010000").unwrap();
    device.send_raw(&raw).await;
    assert!(device.is_closed_by_server().await);
    assert!(eventually(|| server.database.unknown_data().len() == 1).await);

    let record = &server.database.unknown_data()[0];
    assert_eq!(record.kind, "invalid");
    assert_eq!(record.data.as_ref(), &raw[..]);
    assert!(server
        .engine
        .registry()
        .snapshot(Duration::from_secs(30))
        .is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_out_of_range_manual_meal_closes_connection() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    // Manual meal of 200 g
    let raw = hex::decode("9da11441424331323334353637383921038400c8").unwrap();
    device.send_raw(&raw).await;
    assert!(device.is_closed_by_server().await);
    assert!(eventually(|| server.database.unknown_data().len() == 1).await);

    let record = &server.database.unknown_data()[0];
    assert_eq!(record.kind, "invalid");
    assert_eq!(record.data.as_ref(), &raw[..]);
    assert!(server.database.meals().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_out_of_range_alert_time_closes_connection() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    // Empty alert whose encoded minute count is 1440
    let raw = hex::decode("9da1144142433132333435363738392105a0001e").unwrap();
    device.send_raw(&raw).await;
    assert!(device.is_closed_by_server().await);
    assert!(eventually(|| server.database.unknown_data().len() == 1).await);

    let record = &server.database.unknown_data()[0];
    assert_eq!(record.kind, "invalid");
    assert_eq!(record.data.as_ref(), &raw[..]);
    assert!(server.database.alerts().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_unauthorized_feeder_rejected() {
    let allowed = DeviceIdentifier::new("ALLOWED1").unwrap();
    let server = TestServer::start_with(EngineConfig {
        allow_list: [allowed].into_iter().collect(),
        ..EngineConfig::default()
    })
    .await;

    let mut intruder = FakeDevice::connect(server.addr, FEEDER_ID).await;
    intruder
        .send_raw(&feedsrv::protocol::codec::identification_frame(&feeder_id()))
        .await;
    assert!(intruder.is_closed_by_server().await);
    assert!(eventually(|| server.database.unknown_data().len() == 1).await);
    assert_eq!(server.database.unknown_data()[0].kind, "unauthorized");
    assert!(server.engine.registry().is_empty());

    let _ok = FakeDevice::connect_identified(server.addr, "ALLOWED1").await;
    assert_eq!(server.engine.registry().len(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_closes_superseded_socket() {
    let server = TestServer::start().await;
    let mut first = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;
    let second = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    assert!(first.is_closed_by_server().await);
    assert_eq!(server.engine.registry().len(), 1);

    // Commands go to the new socket
    let emulator = second.spawn_auto_ack();
    server.engine.feed_now(&feeder_id(), grams(10)).await.unwrap();

    server.stop().await;
    assert_eq!(emulator.await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_disconnect_marks_session() {
    let server = TestServer::start().await;
    let device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;
    drop(device);

    let registry = server.engine.registry();
    assert!(eventually(|| registry.lookup(&feeder_id()).is_none()).await);

    let status = server.engine.get_feeder(&feeder_id()).await.unwrap().unwrap();
    assert!(!status.is_available);
    assert!(status.last_responded.is_some());
    assert!(matches!(
        server.engine.feed_now(&feeder_id(), grams(10)).await,
        Err(FeedSrvError::NotConnected(_))
    ));
    assert_eq!(registry.len(), 1, "session kept for status queries");

    server.stop().await;
}

#[tokio::test]
async fn test_split_and_repeated_identification() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect(server.addr, FEEDER_ID).await;
    let frame = feedsrv::protocol::codec::identification_frame(&feeder_id());

    device.send_raw(&frame[..7]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut rest = frame[7..].to_vec();
    rest.extend_from_slice(&frame);
    device.send_raw(&rest).await;

    let reply = device.read_command().await;
    assert_eq!(&reply[..4], &[0x9D, 0xA1, 0x06, 0x01]);
    assert!(eventually(|| server.engine.registry().lookup(&feeder_id()).is_some()).await);

    server.stop().await;
}

#[tokio::test]
async fn test_idle_sessions_evicted() {
    let server = TestServer::start_with(EngineConfig {
        idle_timeout: Duration::from_millis(200),
        eviction_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    })
    .await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;

    let registry = server.engine.registry();
    assert!(eventually(|| registry.is_empty()).await);
    assert!(device.is_closed_by_server().await);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_feeders() {
    let server = TestServer::start().await;
    let mut device = FakeDevice::connect_identified(server.addr, FEEDER_ID).await;
    let registry = server.engine.registry().clone();

    server.stop().await;
    assert!(device.is_closed_by_server().await);
    assert!(eventually(|| registry
        .status(&feeder_id(), Duration::from_secs(30))
        .is_some_and(|status| !status.is_available))
    .await);
    assert!(registry
        .snapshot(Duration::from_secs(30))
        .iter()
        .all(|status| !status.is_available));
    assert!(registry.lookup(&feeder_id()).is_none());
}
