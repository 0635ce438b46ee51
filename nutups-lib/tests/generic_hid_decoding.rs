//! Generic fallback decoder behavior.

mod common;

use std::sync::Arc;

use common::{test_context, MockTransport};
use nutups_lib::model::{StatusFlags, UpsData};
use nutups_lib::protocol::{GenericHidDecoder, UpsDecoder};
use nutups_lib::transport::{ReportType, Transport};

// A vendor with no dedicated decoder.
const NO_NAME_VID: u16 = 0x1234;

fn decoder_for(transport: MockTransport) -> (Arc<MockTransport>, GenericHidDecoder) {
    let transport = Arc::new(transport);
    let decoder = GenericHidDecoder::new(
        Arc::clone(&transport) as Arc<dyn Transport>,
        test_context(),
    );
    (transport, decoder)
}

#[tokio::test]
async fn steps_aside_for_specialized_vendors() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(0x051D, 0x0002).with_report(ReportType::Input, &[0x0C, 90, 10, 0]),
    );
    assert!(!decoder.detect().await.unwrap());

    let (_, mut decoder) = decoder_for(
        MockTransport::new(0x0764, 0x0501).with_report(ReportType::Input, &[0x0C, 90, 10, 0]),
    );
    assert!(!decoder.detect().await.unwrap());
}

#[tokio::test]
async fn detects_and_enumerates_unknown_vendor() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(NO_NAME_VID, 0x0001)
            .with_report(ReportType::Input, &[0x0C, 88, 25, 0])
            .with_report(ReportType::Feature, &[0x30, 0xE6, 0x00])
            .with_report(ReportType::Input, &[0x50, 150]),
    );

    assert!(decoder.detect().await.unwrap());
    assert!(decoder.initialize().await.unwrap());
    assert_eq!(decoder.report_size(0x0C), Some(4));
    assert_eq!(decoder.report_size(0x77), None);

    let mut data = UpsData::new();
    assert!(decoder.read_data(&mut data).await.unwrap());

    assert_eq!(data.battery.level, 88.0);
    assert_eq!(data.battery.runtime_minutes, 25.0);
    assert_eq!(data.power.input_voltage, 230.0);
    // 100..=200 band reads as half-percent units.
    assert_eq!(data.power.load_percent, 75.0);
}

#[tokio::test]
async fn initialize_fails_on_silent_device() {
    let (_, mut decoder) = decoder_for(MockTransport::new(NO_NAME_VID, 0x0001));
    assert!(!decoder.initialize().await.unwrap());
}

#[tokio::test]
async fn status_reports_decode_both_layouts() {
    // Report 0x06: loose per-bit layout.
    let (_, mut decoder) = decoder_for(
        MockTransport::new(NO_NAME_VID, 0x0001)
            .with_report(ReportType::Input, &[0x06, 0b0000_0101, 70]),
    );
    decoder.initialize().await.unwrap();
    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert!(data.power.status_flags.contains(StatusFlags::ONLINE));
    assert!(data.power.status_flags.contains(StatusFlags::LOW_BATTERY));
    assert_eq!(data.battery.level, 70.0);

    // Report 0x16: the shared PresentStatus bitmap.
    let (_, mut decoder) = decoder_for(
        MockTransport::new(NO_NAME_VID, 0x0001)
            .with_report(ReportType::Input, &[0x16, 0x0A]),
    );
    decoder.initialize().await.unwrap();
    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(
        data.power.status_flags,
        StatusFlags::ON_BATTERY | StatusFlags::LOW_BATTERY
    );
}

#[tokio::test]
async fn unknown_reports_are_scanned_heuristically() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(NO_NAME_VID, 0x0001)
            // 0x42 is nothing standard: percent at byte 1, voltage after.
            .with_report(ReportType::Feature, &[0x42, 55, 0xE6, 0x00]),
    );
    decoder.initialize().await.unwrap();

    let mut data = UpsData::new();
    assert!(decoder.read_data(&mut data).await.unwrap());
    assert_eq!(data.battery.level, 55.0);
    assert_eq!(data.power.input_voltage, 230.0);
}

#[tokio::test]
async fn identity_copied_from_descriptor_strings() {
    let (_, mut decoder) = decoder_for(
        MockTransport::new(NO_NAME_VID, 0x0001)
            .with_manufacturer_string("PowerVendor")
            .with_product_string("Rack UPS 1000")
            .with_report(ReportType::Input, &[0x16, 0x05]),
    );
    decoder.initialize().await.unwrap();

    let mut data = UpsData::new();
    decoder.read_data(&mut data).await.unwrap();
    assert_eq!(data.device.manufacturer, "PowerVendor");
    assert_eq!(data.device.model, "Rack UPS 1000");
}

#[tokio::test]
async fn battery_test_falls_through_candidate_reports() {
    let (transport, mut decoder) = decoder_for(
        MockTransport::new(NO_NAME_VID, 0x0001)
            .with_report(ReportType::Input, &[0x16, 0x05]),
    );
    decoder.initialize().await.unwrap();

    assert!(decoder.start_battery_test_quick().await.unwrap());
    let writes = transport.recorded_writes();
    assert_eq!(writes[0], (ReportType::Feature, 0x14, vec![0x14, 1]));
}
