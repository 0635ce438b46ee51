//! APC HID decoder behavior against scripted reports.

mod common;

use std::sync::Arc;

use common::{test_context, MockTransport};
use nutups_lib::model::{StatusFlags, UpsData};
use nutups_lib::protocol::{ApcHidDecoder, UpsDecoder};
use nutups_lib::transport::{ReportType, Transport};

const APC_VID: u16 = 0x051D;
const APC_PID: u16 = 0x0002;

fn decoder_for(transport: MockTransport) -> (Arc<MockTransport>, ApcHidDecoder) {
    let transport = Arc::new(transport);
    let decoder = ApcHidDecoder::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        test_context(),
    );
    (transport, decoder)
}

#[tokio::test]
async fn healthy_back_ups_decodes_summary_and_status() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_report(ReportType::Input, &[0x0C, 0x63, 0x67, 0x02])
            .with_report(ReportType::Input, &[0x16, 0x05]),
    );

    assert!(decoder.detect().await.unwrap());
    assert!(decoder.initialize().await.unwrap());

    let mut data = UpsData::new();
    assert!(decoder.read_data(&mut data).await.unwrap());

    assert_eq!(data.battery.level, 99.0);
    assert_eq!(data.battery.runtime_minutes, 615.0);
    assert_eq!(
        data.power.status_flags,
        StatusFlags::ONLINE | StatusFlags::CHARGING
    );
    assert_eq!(data.power.status_flags.nut_string(), "OL CHRG");
    assert_eq!(data.device.manufacturer, "APC");
    // No product string descriptor: the model stays unset.
    assert!(data.device.model.is_empty());
}

#[tokio::test]
async fn on_battery_low_sets_flags() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID).with_report(ReportType::Input, &[0x16, 0x0A]),
    );
    assert!(decoder.detect().await.unwrap());

    let mut data = UpsData::new();
    assert!(decoder.read_data(&mut data).await.unwrap());

    assert!(data.power.status_flags.contains(StatusFlags::ON_BATTERY));
    assert!(data.power.status_flags.contains(StatusFlags::LOW_BATTERY));
    assert!(!data.power.status_flags.contains(StatusFlags::ONLINE));
    assert_eq!(data.power.status_flags.nut_string(), "OB LB");
}

#[tokio::test]
async fn all_ones_input_voltage_is_not_published() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_report(ReportType::Input, &[0x16, 0x05])
            .with_report(ReportType::Input, &[0x31, 0xFF, 0xFF]),
    );

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert!(data.power.input_voltage.is_nan());
}

#[tokio::test]
async fn zero_runtime_is_a_value_not_unset() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_report(ReportType::Input, &[0x0C, 50, 0x00, 0x00]),
    );

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(data.battery.runtime_minutes, 0.0);
}

#[tokio::test]
async fn legacy_output_voltage_scales_down_tenths() {
    // 0x08FC = 2300 raw, reported in tenths of a volt.
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_report(ReportType::Input, &[0x09, 0xFC, 0x08]),
    );

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(data.power.output_voltage, 230.0);
}

#[tokio::test]
async fn input_voltage_and_load_decode_directly() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_report(ReportType::Input, &[0x31, 0xE6, 0x00])
            .with_report(ReportType::Input, &[0x50, 0x2A]),
    );

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(data.power.input_voltage, 230.0);
    assert_eq!(data.power.load_percent, 42.0);
}

#[tokio::test]
async fn product_string_supplies_model() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_product_string("Smart-UPS 1500")
            .with_report(ReportType::Input, &[0x16, 0x05]),
    );
    decoder.initialize().await.unwrap();

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(data.device.model, "Smart-UPS 1500");
}

#[tokio::test]
async fn detect_fails_on_silent_device() {
    let (_, mut decoder) = decoder_for(MockTransport::new(APC_VID, APC_PID));
    assert!(!decoder.detect().await.unwrap());
}

#[tokio::test]
async fn feature_reports_answer_when_input_is_silent() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID)
            .with_report(ReportType::Feature, &[0x0C, 0x40, 0x1E, 0x00]),
    );
    assert!(decoder.detect().await.unwrap());

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(data.battery.level, 64.0);
    assert_eq!(data.battery.runtime_minutes, 30.0);
}

#[tokio::test]
async fn battery_test_commands_write_test_report() {
    let (transport, mut decoder) = decoder_for(
        MockTransport::new(APC_VID, APC_PID).with_report(ReportType::Input, &[0x16, 0x05]),
    );

    assert!(decoder.start_battery_test_quick().await.unwrap());
    assert!(decoder.stop_battery_test().await.unwrap());

    let writes = transport.recorded_writes();
    assert_eq!(writes[0], (ReportType::Feature, 0x52, vec![0x52, 1]));
    assert_eq!(writes[1], (ReportType::Feature, 0x52, vec![0x52, 3]));
}
