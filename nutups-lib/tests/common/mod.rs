//! Shared test fixtures: a fully scripted transport plus helpers.

// Not every test file uses every helper.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use nutups_lib::error::UpsError;
use nutups_lib::protocol::DecoderContext;
use nutups_lib::transport::{ReportType, Transport};

/// Scripted in-memory transport. GET_REPORT answers from a (type, id) map,
/// SET_REPORT overwrites the stored report and records the write, and the
/// interrupt endpoints replay queued byte-stream responses.
pub struct MockTransport {
    vendor_id: u16,
    product_id: u16,
    input_only: bool,
    connected: AtomicBool,
    manufacturer: Option<String>,
    product: Option<String>,
    serial: Option<String>,
    reports: StdMutex<HashMap<(ReportType, u8), Vec<u8>>>,
    strings: StdMutex<HashMap<u8, String>>,
    writes: StdMutex<Vec<(ReportType, u8, Vec<u8>)>>,
    stream_responses: StdMutex<VecDeque<Vec<u8>>>,
    stream_writes: StdMutex<Vec<Vec<u8>>>,
}

impl MockTransport {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            input_only: false,
            connected: AtomicBool::new(true),
            manufacturer: None,
            product: None,
            serial: None,
            reports: StdMutex::new(HashMap::new()),
            strings: StdMutex::new(HashMap::new()),
            writes: StdMutex::new(Vec::new()),
            stream_responses: StdMutex::new(VecDeque::new()),
            stream_writes: StdMutex::new(Vec::new()),
        }
    }

    pub fn input_only(mut self) -> Self {
        self.input_only = true;
        self
    }

    pub fn with_product_string(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }

    pub fn with_manufacturer_string(mut self, manufacturer: &str) -> Self {
        self.manufacturer = Some(manufacturer.to_string());
        self
    }

    pub fn with_report(self, report_type: ReportType, data: &[u8]) -> Self {
        assert!(!data.is_empty(), "report payload must carry the report id");
        self.reports
            .lock()
            .unwrap()
            .insert((report_type, data[0]), data.to_vec());
        self
    }

    pub fn with_string(self, index: u8, value: &str) -> Self {
        self.strings.lock().unwrap().insert(index, value.to_string());
        self
    }

    pub fn with_stream_response(self, data: &[u8]) -> Self {
        self.stream_responses.lock().unwrap().push_back(data.to_vec());
        self
    }

    pub fn queue_stream_response(&self, data: &[u8]) {
        self.stream_responses.lock().unwrap().push_back(data.to_vec());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn clear_reports(&self) {
        self.reports.lock().unwrap().clear();
    }

    pub fn recorded_writes(&self) -> Vec<(ReportType, u8, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn recorded_stream_writes(&self) -> Vec<Vec<u8>> {
        self.stream_writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn initialize(&self) -> Result<(), UpsError> {
        Ok(())
    }

    async fn deinitialize(&self) -> Result<(), UpsError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn is_input_only(&self) -> bool {
        self.input_only
    }

    fn manufacturer_string(&self) -> Option<String> {
        self.manufacturer.clone()
    }

    fn product_string(&self) -> Option<String> {
        self.product.clone()
    }

    fn serial_string(&self) -> Option<String> {
        self.serial.clone()
    }

    async fn hid_get_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        buf: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, UpsError> {
        if !self.is_connected() {
            return Err(UpsError::NotConnected);
        }
        let reports = self.reports.lock().unwrap();
        let Some(data) = reports.get(&(report_type, report_id)) else {
            return Err(UpsError::InvalidReport(format!(
                "no scripted report ({report_type:?}, 0x{report_id:02x})"
            )));
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn hid_set_report(
        &self,
        report_type: ReportType,
        report_id: u8,
        data: &[u8],
        _timeout_ms: u32,
    ) -> Result<(), UpsError> {
        if !self.is_connected() {
            return Err(UpsError::NotConnected);
        }
        self.writes
            .lock()
            .unwrap()
            .push((report_type, report_id, data.to_vec()));
        // Writes take effect: the next GET_REPORT sees the new payload.
        self.reports
            .lock()
            .unwrap()
            .insert((report_type, report_id), data.to_vec());
        Ok(())
    }

    async fn get_string_descriptor(
        &self,
        index: u8,
        _timeout_ms: u32,
    ) -> Result<String, UpsError> {
        if index == 0 {
            return Err(UpsError::InvalidReport(
                "string descriptor index 0".to_string(),
            ));
        }
        self.strings
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .ok_or_else(|| UpsError::InvalidReport(format!("no scripted string {index}")))
    }

    async fn interrupt_read(&self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, UpsError> {
        if !self.is_connected() {
            return Err(UpsError::NotConnected);
        }
        let Some(data) = self.stream_responses.lock().unwrap().pop_front() else {
            // Queue exhausted reads as a timed-out endpoint.
            return Err(UpsError::Protocol("stream response queue empty".to_string()));
        };
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    async fn interrupt_write(&self, data: &[u8], _timeout_ms: u32) -> Result<usize, UpsError> {
        if self.input_only {
            return Err(UpsError::NotSupported("device is input-only".to_string()));
        }
        if !self.is_connected() {
            return Err(UpsError::NotConnected);
        }
        self.stream_writes.lock().unwrap().push(data.to_vec());
        Ok(data.len())
    }
}

/// Context with the default nominal voltage, matching the daemon default.
pub fn test_context() -> DecoderContext {
    DecoderContext::default()
}

/// Decode hex string to bytes for report fixtures.
pub fn hex_to_bytes(hex_data: &str) -> Vec<u8> {
    hex::decode(hex_data).expect("failed to decode hex")
}
