//! Monitor orchestration: detection, caching, failure handling, provider
//! snapshots.

mod common;

use std::sync::Arc;

use common::MockTransport;
use nutups_lib::model::{DetectedProtocol, StatusFlags, TestResult, TestState};
use nutups_lib::transport::{ReportType, Transport};
use nutups_lib::{Config, UpsDataProvider, UpsMonitor};

const APC_VID: u16 = 0x051D;
const APC_PID: u16 = 0x0002;

fn healthy_apc_transport() -> MockTransport {
    MockTransport::new(APC_VID, APC_PID)
        .with_report(ReportType::Input, &[0x0C, 0x63, 0x67, 0x02])
        .with_report(ReportType::Input, &[0x16, 0x05])
        .with_report(ReportType::Input, &[0x31, 0xE6, 0x00])
        .with_report(ReportType::Input, &[0x50, 0x07])
}

fn monitor_with(transport: Arc<MockTransport>) -> Arc<UpsMonitor> {
    let monitor = Arc::new(UpsMonitor::new(Config::default()));
    monitor.attach_transport(transport as Arc<dyn Transport>);
    monitor
}

#[tokio::test]
async fn detects_decodes_and_caches() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));

    monitor.update().await;

    assert!(monitor.has_active_decoder().await);
    let data = monitor.cached_data();
    assert_eq!(data.device.detected_protocol, DetectedProtocol::ApcHid);
    assert_eq!(data.battery.level, 99.0);
    assert_eq!(data.power.status, "OL CHRG");

    // Snapshot through the provider interface works and is by-value.
    let snapshot = monitor.snapshot().expect("snapshot present");
    assert_eq!(snapshot.power.input_voltage, 230.0);
}

#[tokio::test]
async fn online_and_on_battery_stay_exclusive() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));

    monitor.update().await;
    let flags = monitor.cached_data().power.status_flags;
    assert!(flags.contains(StatusFlags::ONLINE) != flags.contains(StatusFlags::ON_BATTERY));
}

#[tokio::test]
async fn detected_protocol_survives_read_cycles() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));

    monitor.update().await;
    let first = monitor.cached_data().device.detected_protocol;
    monitor.update().await;
    let second = monitor.cached_data().device.detected_protocol;

    assert_eq!(first, DetectedProtocol::ApcHid);
    assert_eq!(first, second);
}

#[tokio::test]
async fn snapshot_is_none_before_first_successful_read() {
    let transport = Arc::new(MockTransport::new(APC_VID, APC_PID));
    let monitor = monitor_with(transport);
    assert!(monitor.snapshot().is_none());
}

#[tokio::test]
async fn disconnect_drops_decoder_and_snapshot() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));

    monitor.update().await;
    assert!(monitor.snapshot().is_some());

    transport.set_connected(false);
    monitor.update().await;

    assert!(!monitor.has_active_decoder().await);
    assert!(monitor.snapshot().is_none());
    assert!(!monitor.is_connected());
}

#[tokio::test]
async fn persistent_read_failures_force_redetection() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));

    monitor.update().await;
    assert!(monitor.has_active_decoder().await);

    // The device stops answering entirely; the re-detection probe at the
    // third failure finds nothing and the decoder is dropped.
    transport.clear_reports();
    for _ in 0..3 {
        monitor.update().await;
    }
    assert!(!monitor.has_active_decoder().await);
}

#[tokio::test]
async fn instcmd_routes_to_decoder() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));
    monitor.update().await;

    assert!(monitor.instcmd("test.battery.start.quick").await);
    assert!(!monitor.instcmd("no.such.command").await);

    let writes = transport.recorded_writes();
    assert_eq!(writes[0], (ReportType::Feature, 0x52, vec![0x52, 1]));
}

#[tokio::test]
async fn test_commands_drive_state_transitions() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));
    monitor.update().await;

    assert!(monitor.start_battery_test_quick().await);
    let test = monitor.cached_data().test;
    assert_eq!(test.current_test_state, TestState::BatteryQuickRunning);
    assert_eq!(test.current_test_type, "battery.quick");
    assert_eq!(test.last_battery_test_result, TestResult::InProgress);

    // The in-flight state survives a full read cycle.
    monitor.update().await;
    assert_eq!(
        monitor.cached_data().test.current_test_state,
        TestState::BatteryQuickRunning
    );

    assert!(monitor.stop_battery_test().await);
    let test = monitor.cached_data().test;
    assert_eq!(test.current_test_state, TestState::Aborted);
    assert_eq!(test.last_battery_test_result, TestResult::Aborted);
}

#[tokio::test]
async fn active_countdown_switches_to_fast_polling() {
    // CyberPower device with a 30-second shutdown countdown running.
    let transport = Arc::new(
        MockTransport::new(0x0764, 0x0501)
            .with_report(ReportType::Feature, &[0x0B, 0x01])
            .with_report(ReportType::Feature, &[0x13, 0x07])
            .with_report(ReportType::Feature, &[0x15, 30, 0]),
    );
    let monitor = monitor_with(Arc::clone(&transport));

    monitor.update().await;
    assert!(monitor.has_active_decoder().await);

    monitor.poll_timers().await;
    assert!(monitor.is_fast_polling());
    assert_eq!(monitor.cached_data().test.timer_shutdown, 30);

    // Countdown over: back to the configured interval.
    transport
        .hid_set_report(
            nutups_lib::transport::ReportType::Feature,
            0x15,
            &[0x15, 0xFF, 0xFF],
            1000,
        )
        .await
        .unwrap();
    monitor.poll_timers().await;
    assert!(!monitor.is_fast_polling());
    assert_eq!(monitor.cached_data().test.timer_shutdown, -1);
}

#[tokio::test]
async fn command_list_reflects_connectivity() {
    let transport = Arc::new(healthy_apc_transport());
    let monitor = monitor_with(Arc::clone(&transport));

    assert!(monitor
        .available_commands()
        .contains(&"test.battery.start.quick"));

    transport.set_connected(false);
    assert!(monitor.available_commands().is_empty());
}
