//! UPS core: transport lifecycle, protocol detection, periodic polling,
//! the shared data cache, sink publication and the control API.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::UpsError;
use crate::model::{clamp_percent, TestResult, TestState, UpsData};
use crate::nut::UpsDataProvider;
use crate::protocol::{DecoderContext, ProtocolRegistry, UpsDecoder};
use crate::rate_limit::{RateLimitState, RateLimiter};
use crate::sink::{keys, TelemetrySink};
use crate::transport::{create_transport, Transport};

/// Consecutive read failures that trigger an in-place re-detection probe.
const REDETECT_AFTER_FAILURES: u32 = 3;

/// Consecutive failures after which the active decoder is dropped.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Poll interval while a countdown timer is active.
const FAST_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Forwards a control operation to the active decoder; without one (or on
/// error) the operation reports unsupported.
macro_rules! forward_to_decoder {
    ($name:ident $(, $arg:ident : $ty:ty)*) => {
        pub async fn $name(&self $(, $arg: $ty)*) -> bool {
            let mut guard = self.decoder.lock().await;
            match guard.as_mut() {
                Some(decoder) => match decoder.$name($($arg),*).await {
                    Ok(ok) => ok,
                    Err(e) => {
                        debug!(concat!(stringify!($name), " failed: {}"), e);
                        false
                    }
                },
                None => {
                    debug!(concat!(stringify!($name), " ignored, no active decoder"));
                    false
                }
            }
        }
    };
}

/// Drives one UPS. Owns the shared [`UpsData`] cache; decoders run on the
/// monitor task, the NUT server and sinks only ever see by-value copies.
pub struct UpsMonitor {
    config: Config,
    registry: ProtocolRegistry,
    context: DecoderContext,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    decoder: tokio::sync::Mutex<Option<Box<dyn UpsDecoder>>>,
    data: StdMutex<UpsData>,
    have_data: AtomicBool,
    failed: AtomicBool,
    consecutive_failures: AtomicU32,
    last_successful_read: StdMutex<Option<Instant>>,
    fast_polling: AtomicBool,
    last_full_read: StdMutex<Option<Instant>>,
    sinks: StdMutex<Vec<Arc<dyn TelemetrySink>>>,
    usb_errors: StdMutex<RateLimitState>,
    protocol_errors: StdMutex<RateLimitState>,
    limiter: RateLimiter,
    epoch: Instant,
    test_tracking: StdMutex<TestTracking>,
}

/// Host-side view of a self-test in flight. Few devices report their test
/// progress; the control API keeps this in step with the commands it sent
/// and the read cycle grafts it back onto each fresh snapshot.
#[derive(Debug, Clone, Default)]
struct TestTracking {
    state: TestState,
    test_type: String,
    battery_result: TestResult,
    ups_result: TestResult,
}

impl UpsMonitor {
    pub fn new(config: Config) -> Self {
        let context = DecoderContext::from_config(&config);
        Self {
            config,
            registry: ProtocolRegistry::standard(),
            context,
            transport: StdMutex::new(None),
            decoder: tokio::sync::Mutex::new(None),
            data: StdMutex::new(UpsData::new()),
            have_data: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_successful_read: StdMutex::new(None),
            fast_polling: AtomicBool::new(false),
            last_full_read: StdMutex::new(None),
            sinks: StdMutex::new(Vec::new()),
            usb_errors: StdMutex::new(RateLimitState::default()),
            protocol_errors: StdMutex::new(RateLimitState::default()),
            limiter: RateLimiter::default(),
            epoch: Instant::now(),
            test_tracking: StdMutex::new(TestTracking::default()),
        }
    }

    pub fn register_sink(&self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().unwrap().clone()
    }

    /// Installs an already-initialized transport, bypassing `setup`.
    /// Embedders with custom transports (and tests) use this.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock().unwrap() = Some(transport);
    }

    /// Whether a decoder is currently bound to the device.
    pub async fn has_active_decoder(&self) -> bool {
        self.decoder.lock().await.is_some()
    }

    /// Builds and initializes the transport. Decoder detection is
    /// deferred to the first `update` so asynchronous USB enumeration can
    /// complete in the background.
    pub async fn setup(&self) -> Result<(), UpsError> {
        let transport = create_transport(&self.config);
        transport.initialize().await?;
        info!(
            "transport initialized (simulation: {})",
            self.config.simulation_mode
        );
        *self.transport.lock().unwrap() = Some(transport);
        Ok(())
    }

    pub async fn teardown(&self) {
        let mut guard = self.decoder.lock().await;
        *guard = None;
        drop(guard);
        if let Some(transport) = self.transport.lock().unwrap().take() {
            let _ = transport.deinitialize().await;
        }
    }

    /// One periodic poll cycle.
    pub async fn update(&self) {
        let Some(transport) = self.transport() else {
            return;
        };

        if !transport.is_connected() {
            {
                let mut state = self.usb_errors.lock().unwrap();
                if self.limiter.should_log(&mut state, self.now_ms()) {
                    let suppressed = self.limiter.take_suppressed(&mut state);
                    if suppressed > 0 {
                        debug!("suppressed {suppressed} similar messages");
                    }
                    debug!("waiting for UPS device");
                }
            }

            // Whatever decoder was active belongs to the departed device.
            let mut decoder = self.decoder.lock().await;
            if decoder.is_some() {
                info!("device gone, dropping active decoder");
                *decoder = None;
                self.have_data.store(false, Ordering::SeqCst);
            }
            return;
        }

        let mut decoder_guard = self.decoder.lock().await;

        if decoder_guard.is_none() {
            match self.detect_protocol(&transport).await {
                Some(decoder) => {
                    info!("protocol detected: {}", decoder.name());
                    *decoder_guard = Some(decoder);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.failed.store(false, Ordering::SeqCst);
                }
                None => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!("protocol detection failed ({failures} consecutive)");
                    if failures > MAX_CONSECUTIVE_FAILURES {
                        error!("too many detection failures, marking component failed");
                        self.failed.store(true, Ordering::SeqCst);
                        self.consecutive_failures.store(0, Ordering::SeqCst);
                    }
                    return;
                }
            }
        }

        let decoder = decoder_guard.as_mut().expect("decoder present");
        let success = self.read_cycle(decoder).await;

        if success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            *self.last_successful_read.lock().unwrap() = Some(Instant::now());
            *self.last_full_read.lock().unwrap() = Some(Instant::now());
            self.have_data.store(true, Ordering::SeqCst);

            let timers_active = self.data.lock().unwrap().test.any_timer_active();
            self.set_fast_polling(timers_active);
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut state = self.protocol_errors.lock().unwrap();
                if self.limiter.should_log(&mut state, self.now_ms()) {
                    let suppressed = self.limiter.take_suppressed(&mut state);
                    if suppressed > 0 {
                        warn!("suppressed {suppressed} similar messages");
                    }
                    warn!("UPS data read failed ({failures} consecutive)");
                }
            }

            if failures == REDETECT_AFTER_FAILURES {
                // A cheap probe tells a confused decoder from a lost device.
                match decoder.detect().await {
                    Ok(true) => debug!("decoder still answers probe, keeping it"),
                    _ => {
                        warn!("re-detection probe failed, dropping decoder");
                        *decoder_guard = None;
                    }
                }
            } else if failures > MAX_CONSECUTIVE_FAILURES {
                warn!("too many read failures, dropping decoder for re-detection");
                *decoder_guard = None;
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
        }
        drop(decoder_guard);

        self.check_staleness();
        self.publish_to_sinks();
    }

    /// Fast-poll slice: refresh the countdown timers only.
    pub async fn poll_timers(&self) {
        let mut decoder_guard = self.decoder.lock().await;
        let Some(decoder) = decoder_guard.as_mut() else {
            return;
        };

        let mut scratch = self.data.lock().unwrap().clone();
        match decoder.read_timer_data(&mut scratch).await {
            Ok(true) => {
                let timers_active;
                {
                    let mut data = self.data.lock().unwrap();
                    data.test.timer_shutdown = scratch.test.timer_shutdown;
                    data.test.timer_start = scratch.test.timer_start;
                    data.test.timer_reboot = scratch.test.timer_reboot;
                    timers_active = data.test.any_timer_active();
                }
                self.set_fast_polling(timers_active);
                self.publish_to_sinks();
            }
            Ok(false) => {}
            Err(e) => debug!("timer poll failed: {e}"),
        }
    }

    async fn detect_protocol(
        &self,
        transport: &Arc<dyn Transport>,
    ) -> Option<Box<dyn UpsDecoder>> {
        let mut decoder = if self.config.protocol_selection.eq_ignore_ascii_case("auto") {
            self.registry
                .create_for_vendor(transport.vendor_id(), transport, self.context)
                .await?
        } else {
            self.registry
                .create_by_name(&self.config.protocol_selection, transport, self.context)?
        };

        match decoder.initialize().await {
            Ok(true) => {
                // Record the identity on the shared cache immediately so a
                // snapshot between now and the first read carries it.
                self.data.lock().unwrap().device.detected_protocol = decoder.protocol();
                Some(decoder)
            }
            Ok(false) => {
                warn!("decoder '{}' failed to initialize", decoder.name());
                None
            }
            Err(e) => {
                warn!("decoder '{}' initialization error: {e}", decoder.name());
                None
            }
        }
    }

    /// Reset-then-fill read into a scratch record, atomically swapped into
    /// the cache on success. The detected protocol survives the reset.
    async fn read_cycle(&self, decoder: &mut Box<dyn UpsDecoder>) -> bool {
        let detected = self.data.lock().unwrap().device.detected_protocol;

        let mut fresh = UpsData::new();
        fresh.device.detected_protocol = detected;

        match decoder.read_data(&mut fresh).await {
            Ok(true) => {
                fresh.power.status = fresh.power.status_flags.nut_string();
                self.apply_test_tracking(&mut fresh);
                *self.data.lock().unwrap() = fresh;
                true
            }
            Ok(false) => {
                debug!("decoder produced no usable fields");
                false
            }
            Err(e) => {
                debug!("decoder read error: {e}");
                false
            }
        }
    }

    /// Marks data stale when no successful read happened within the
    /// (clamped) protocol timeout.
    fn check_staleness(&self) {
        let timeout = Duration::from_millis(self.config.clamped_protocol_timeout_ms() as u64);
        let stale = self
            .last_successful_read
            .lock()
            .unwrap()
            .is_some_and(|at| at.elapsed() > timeout);
        if stale && self.have_data.swap(false, Ordering::SeqCst) {
            warn!("no successful read within protocol timeout, marking data stale");
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
    }

    fn set_fast_polling(&self, enable: bool) {
        if self.fast_polling.swap(enable, Ordering::SeqCst) != enable {
            if enable {
                info!("fast polling enabled for timer countdown");
            } else {
                info!("fast polling disabled, returning to normal interval");
            }
        }
    }

    pub fn is_fast_polling(&self) -> bool {
        self.fast_polling.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn update_interval(&self) -> Duration {
        Duration::from_millis(self.config.update_interval_ms)
    }

    /// The periodic tick. Full polls at the configured interval; while a
    /// countdown timer runs, 2-second slices refresh the timers and the
    /// full poll happens when its interval comes due.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.is_fast_polling() {
                tokio::time::sleep(FAST_POLL_INTERVAL).await;
                let full_due = self
                    .last_full_read
                    .lock()
                    .unwrap()
                    .is_none_or(|at| at.elapsed() >= self.update_interval());
                if full_due {
                    self.update().await;
                } else {
                    self.poll_timers().await;
                }
            } else {
                tokio::time::sleep(self.update_interval()).await;
                self.update().await;
            }
        }
    }

    /// Current cache copy, regardless of staleness. Mostly for tests and
    /// diagnostics; consumers needing validity should go through
    /// [`UpsDataProvider::snapshot`].
    pub fn cached_data(&self) -> UpsData {
        self.data.lock().unwrap().clone()
    }

    fn publish_to_sinks(&self) {
        let sinks = self.sinks.lock().unwrap();
        if sinks.is_empty() {
            return;
        }
        let data = self.data.lock().unwrap().clone();

        // (key, value, clamp-into-range rather than drop)
        let numeric: &[(&str, f32, bool)] = &[
            (keys::BATTERY_LEVEL, data.battery.level, true),
            (keys::BATTERY_VOLTAGE, data.battery.voltage, false),
            (
                keys::BATTERY_VOLTAGE_NOMINAL,
                data.battery.voltage_nominal,
                false,
            ),
            (keys::BATTERY_RUNTIME, data.battery.runtime_minutes, false),
            (
                keys::BATTERY_RUNTIME_LOW,
                data.battery.runtime_low_minutes,
                false,
            ),
            (keys::INPUT_VOLTAGE, data.power.input_voltage, false),
            (
                keys::INPUT_VOLTAGE_NOMINAL,
                data.power.input_voltage_nominal,
                false,
            ),
            (keys::INPUT_FREQUENCY, data.power.frequency, false),
            (
                keys::INPUT_TRANSFER_LOW,
                data.power.input_transfer_low,
                false,
            ),
            (
                keys::INPUT_TRANSFER_HIGH,
                data.power.input_transfer_high,
                false,
            ),
            (keys::OUTPUT_VOLTAGE, data.power.output_voltage, false),
            (keys::UPS_LOAD, data.power.load_percent, true),
            (
                keys::UPS_REALPOWER_NOMINAL,
                data.power.realpower_nominal,
                false,
            ),
        ];
        for &(key, value, clamp) in numeric {
            if value.is_nan() {
                continue;
            }
            let value = if clamp { clamp_percent(value) } else { value };
            for sink in sinks.iter() {
                sink.publish_numeric(key, value);
            }
        }

        let delays: &[(&str, i32)] = &[
            (keys::UPS_DELAY_SHUTDOWN, data.config.delay_shutdown),
            (keys::UPS_DELAY_START, data.config.delay_start),
            (keys::UPS_DELAY_REBOOT, data.config.delay_reboot),
            (keys::UPS_TIMER_SHUTDOWN, data.test.timer_shutdown),
            (keys::UPS_TIMER_START, data.test.timer_start),
            (keys::UPS_TIMER_REBOOT, data.test.timer_reboot),
        ];
        for &(key, value) in delays {
            if value >= 0 {
                for sink in sinks.iter() {
                    sink.publish_numeric(key, value as f32);
                }
            }
        }

        let flags = data.power.status_flags;
        for sink in sinks.iter() {
            sink.publish_binary(
                keys::UPS_ONLINE,
                flags.contains(crate::model::StatusFlags::ONLINE),
            );
            sink.publish_binary(
                keys::UPS_ON_BATTERY,
                flags.contains(crate::model::StatusFlags::ON_BATTERY),
            );
            sink.publish_binary(
                keys::UPS_LOW_BATTERY,
                flags.contains(crate::model::StatusFlags::LOW_BATTERY),
            );
        }

        let texts: &[(&str, &str)] = &[
            (keys::UPS_STATUS, &data.power.status),
            (keys::UPS_MFR, &data.device.manufacturer),
            (keys::UPS_MODEL, &data.device.model),
            (keys::UPS_SERIAL, &data.device.serial_number),
            (keys::UPS_FIRMWARE, &data.device.firmware_version),
            (keys::BATTERY_STATUS, &data.battery.status),
            (keys::UPS_BEEPER_STATUS, &data.config.beeper_status),
            (keys::INPUT_SENSITIVITY, &data.config.input_sensitivity),
            (keys::UPS_TEST_RESULT, &data.test.ups_test_result),
        ];
        for &(key, value) in texts {
            if !value.is_empty() {
                for sink in sinks.iter() {
                    sink.publish_text(key, value);
                }
            }
        }

        let protocol = data.device.detected_protocol.to_string();
        for sink in sinks.iter() {
            sink.publish_text(keys::UPS_PROTOCOL, &protocol);
        }
    }

    forward_to_decoder!(beeper_enable);
    forward_to_decoder!(beeper_disable);
    forward_to_decoder!(beeper_mute);
    forward_to_decoder!(beeper_test);
    forward_to_decoder!(set_shutdown_delay, seconds: i32);
    forward_to_decoder!(set_start_delay, seconds: i32);
    forward_to_decoder!(set_reboot_delay, seconds: i32);

    async fn forward_test_op(
        &self,
        op: for<'b> fn(
            &'b mut dyn UpsDecoder,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<bool, UpsError>> + Send + 'b>,
        >,
    ) -> bool {
        let mut guard = self.decoder.lock().await;
        match guard.as_mut() {
            Some(decoder) => match op(decoder.as_mut()).await {
                Ok(ok) => ok,
                Err(e) => {
                    debug!("test command failed: {e}");
                    false
                }
            },
            None => false,
        }
    }

    /// Copies the host-side test bookkeeping onto a fresh snapshot when
    /// the decoder did not report test progress itself.
    fn apply_test_tracking(&self, data: &mut UpsData) {
        let tracking = self.test_tracking.lock().unwrap().clone();
        if data.test.current_test_state == TestState::Idle && tracking.state != TestState::Idle {
            data.test.current_test_state = tracking.state;
            data.test.current_test_type = tracking.test_type.clone();
            data.test.ups_test_result = tracking.state.to_string();
        }
        if data.test.last_battery_test_result == TestResult::NoTest {
            data.test.last_battery_test_result = tracking.battery_result;
        }
        if data.test.last_ups_test_result == TestResult::NoTest {
            data.test.last_ups_test_result = tracking.ups_result;
        }
    }

    /// Records a test transition and mirrors it into the live cache so
    /// snapshots between polls already show it.
    fn note_test_transition(&self, state: TestState, test_type: &str, result: TestResult) {
        let battery = matches!(
            state,
            TestState::BatteryQuickRunning | TestState::BatteryDeepRunning
        ) || test_type.starts_with("battery");
        {
            let mut tracking = self.test_tracking.lock().unwrap();
            tracking.state = state;
            tracking.test_type = test_type.to_string();
            if battery {
                tracking.battery_result = result;
            } else {
                tracking.ups_result = result;
            }
        }
        let mut data = self.data.lock().unwrap();
        data.test.current_test_state = state;
        data.test.current_test_type = test_type.to_string();
        data.test.ups_test_result = state.to_string();
        if battery {
            data.test.last_battery_test_result = result;
        } else {
            data.test.last_ups_test_result = result;
        }
        data.test.last_test_result = result;
    }

    pub async fn start_battery_test_quick(&self) -> bool {
        let ok = self.forward_test_op(|d| d.start_battery_test_quick()).await;
        if ok {
            self.note_test_transition(
                TestState::BatteryQuickRunning,
                "battery.quick",
                TestResult::InProgress,
            );
        }
        ok
    }

    pub async fn start_battery_test_deep(&self) -> bool {
        let ok = self.forward_test_op(|d| d.start_battery_test_deep()).await;
        if ok {
            self.note_test_transition(
                TestState::BatteryDeepRunning,
                "battery.deep",
                TestResult::InProgress,
            );
        }
        ok
    }

    pub async fn stop_battery_test(&self) -> bool {
        let ok = self.forward_test_op(|d| d.stop_battery_test()).await;
        if ok {
            self.note_test_transition(TestState::Aborted, "battery", TestResult::Aborted);
        }
        ok
    }

    pub async fn start_ups_test(&self) -> bool {
        let ok = self.forward_test_op(|d| d.start_ups_test()).await;
        if ok {
            self.note_test_transition(
                TestState::UpsTestRunning,
                "ups",
                TestResult::InProgress,
            );
        }
        ok
    }

    pub async fn stop_ups_test(&self) -> bool {
        let ok = self.forward_test_op(|d| d.stop_ups_test()).await;
        if ok {
            self.note_test_transition(TestState::Aborted, "ups", TestResult::Aborted);
        }
        ok
    }
}

#[async_trait]
impl UpsDataProvider for UpsMonitor {
    fn snapshot(&self) -> Option<UpsData> {
        if !self.is_connected() || !self.have_data.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.data.lock().unwrap().clone())
    }

    fn is_connected(&self) -> bool {
        self.transport().is_some_and(|t| t.is_connected())
    }

    async fn instcmd(&self, command: &str) -> bool {
        match command {
            "beeper.enable" => self.beeper_enable().await,
            "beeper.disable" => self.beeper_disable().await,
            "beeper.mute" => self.beeper_mute().await,
            "beeper.test" => self.beeper_test().await,
            "test.battery.start.quick" => self.start_battery_test_quick().await,
            "test.battery.start.deep" => self.start_battery_test_deep().await,
            "test.battery.stop" => self.stop_battery_test().await,
            "test.panel.start" | "test.ups.start" => self.start_ups_test().await,
            "test.panel.stop" | "test.ups.stop" => self.stop_ups_test().await,
            _ => false,
        }
    }

    fn available_commands(&self) -> Vec<&'static str> {
        if !self.is_connected() {
            return Vec::new();
        }
        vec![
            "beeper.enable",
            "beeper.disable",
            "beeper.mute",
            "beeper.test",
            "test.battery.start.quick",
            "test.battery.start.deep",
            "test.battery.stop",
            "test.panel.start",
            "test.panel.stop",
            "test.ups.start",
            "test.ups.stop",
        ]
    }
}
