//! End-to-end tests for the driver
//!
//! Every test runs a real driver task against simulated instruments:
//! - Half-duplex correlation and timeout recovery on the FT-817
//! - Polled and pushed live streams
//! - Open failures and unsolicited disconnects
//! - Rate conditioning for the BLE counter
//!
//! Most tests run with paused time so timeouts and poll ticks fire
//! deterministically as soon as the runtime is idle.

use std::sync::Arc;
use std::time::Duration;

use inst_link::{
    spawn_driver, ConnectionState, Connector, DriverConfig, DriverEvent, DriverHandle, Endpoint,
    InstrumentConfig, StaticRegistry, SystemConnector, VirtualPorts,
};
use inst_protocol::blue_onyx::BlueOnyxProfile;
use inst_protocol::{Address, InstrumentKind, RadioMode, Reading, Request};
use inst_sim::{
    attach_ft817, attach_onyx, attach_sigma25, VirtualBlueOnyx, VirtualFt817, VirtualFt817Command,
    VirtualOnyx, VirtualSigma25,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    /// Longest (virtual) time to wait for any single event
    const EVENT_WAIT: Duration = Duration::from_secs(60);

    pub fn virtual_instrument(id: &str, kind: InstrumentKind) -> InstrumentConfig {
        InstrumentConfig {
            id: id.to_string(),
            name: String::new(),
            kind,
            endpoint: Endpoint::Virtual {
                name: id.to_string(),
            },
        }
    }

    pub fn start_driver(
        instruments: Vec<InstrumentConfig>,
        connector: Arc<dyn Connector>,
        config: DriverConfig,
    ) -> (DriverHandle, mpsc::Receiver<DriverEvent>) {
        let registry = StaticRegistry::from_configs(instruments);
        spawn_driver(Arc::new(registry), connector, config)
    }

    /// Driver over virtual ports with default settings
    pub fn virtual_driver(
        ports: &VirtualPorts,
        instruments: Vec<InstrumentConfig>,
    ) -> (DriverHandle, mpsc::Receiver<DriverEvent>) {
        start_driver(instruments, Arc::new(ports.clone()), DriverConfig::default())
    }

    pub async fn next_event(events: &mut mpsc::Receiver<DriverEvent>) -> DriverEvent {
        timeout(EVENT_WAIT, events.recv())
            .await
            .expect("timed out waiting for a driver event")
            .expect("driver event channel closed")
    }

    pub async fn expect_status(events: &mut mpsc::Receiver<DriverEvent>, portopen: bool) {
        let event = next_event(events).await;
        assert_eq!(event.portopen(), Some(portopen), "unexpected event {:?}", event);
    }

    pub async fn next_reading(events: &mut mpsc::Receiver<DriverEvent>) -> Reading {
        let event = next_event(events).await;
        match event.data() {
            Some(data) => data.reading.clone(),
            None => panic!("Expected a reading, got {:?}", event),
        }
    }

    /// Skip readings until one matches
    pub async fn reading_where(
        events: &mut mpsc::Receiver<DriverEvent>,
        pred: impl Fn(&Reading) -> bool,
    ) -> Reading {
        loop {
            let reading = next_reading(events).await;
            if pred(&reading) {
                return reading;
            }
        }
    }

    /// Read exactly `len` bytes the driver wrote to a raw peer
    pub async fn read_written(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        timeout(EVENT_WAIT, peer.read_exact(&mut buf))
            .await
            .expect("timed out waiting for bytes")
            .expect("peer read failed");
        buf
    }

    /// Assert the driver writes nothing more for a while
    pub async fn assert_silent(peer: &mut DuplexStream) {
        let mut buf = [0u8; 16];
        let result = timeout(Duration::from_secs(5), peer.read(&mut buf)).await;
        assert!(result.is_err(), "unexpected write {:?}", result);
    }
}

use helpers::*;

// ============================================================================
// Half-duplex correlation
// ============================================================================

mod half_duplex_tests {
    use super::*;

    fn radio() -> VirtualFt817 {
        let mut radio = VirtualFt817::new("ft817");
        radio.set_frequency(7_074_000);
        radio.set_mode(RadioMode::Dig);
        radio
    }

    #[tokio::test(start_paused = true)]
    async fn replies_are_correlated_in_issue_order() {
        let ports = VirtualPorts::new();
        let _radio = attach_ft817(&ports, "ft817", radio());
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("ft817", InstrumentKind::Ft817)]);

        driver.open_port("ft817").await.unwrap();
        expect_status(&mut events, true).await;

        driver.output(Request::GetFrequency).await.unwrap();
        driver.output(Request::TxRxStatus).await.unwrap();
        driver.output(Request::Lock { on: true }).await.unwrap();
        driver
            .output(Request::SetFrequency { hz: 14_074_000 })
            .await
            .unwrap();
        driver.output(Request::GetFrequency).await.unwrap();

        assert_eq!(
            next_reading(&mut events).await,
            Reading::Radio {
                frequency_hz: 7_074_000,
                mode: RadioMode::Dig
            }
        );
        assert!(matches!(
            next_reading(&mut events).await,
            Reading::RxStatus { smeter: 0, .. }
        ));
        assert_eq!(
            next_reading(&mut events).await,
            Reading::Lock { was_locked: false }
        );
        assert_eq!(
            next_reading(&mut events).await,
            Reading::Radio {
                frequency_hz: 14_074_000,
                mode: RadioMode::Dig
            }
        );

        let snapshot = driver.sync().await.unwrap();
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.state, ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_command_times_out_and_queue_moves_on() {
        let ports = VirtualPorts::new();
        let mut muted = radio();
        muted.set_muted(true);
        let radio_tx = attach_ft817(&ports, "ft817", muted);
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("ft817", InstrumentKind::Ft817)]);

        driver.open_port("ft817").await.unwrap();
        expect_status(&mut events, true).await;

        driver.output(Request::GetFrequency).await.unwrap();
        driver.output(Request::TxRxStatus).await.unwrap();
        assert_eq!(driver.sync().await.unwrap().queued, 2);

        // Let the muted radio swallow the first command before it wakes up
        tokio::time::sleep(Duration::from_millis(100)).await;
        radio_tx
            .send(VirtualFt817Command::SetMuted(false))
            .await
            .unwrap();

        // The frequency read is dropped; the status read goes out after the timeout
        assert!(matches!(
            next_reading(&mut events).await,
            Reading::RxStatus { .. }
        ));

        driver.output(Request::GetFrequency).await.unwrap();
        assert!(matches!(
            next_reading(&mut events).await,
            Reading::Radio {
                frequency_hz: 7_074_000,
                ..
            }
        ));
        assert_eq!(driver.sync().await.unwrap().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_query_is_retried_once_when_enabled() {
        let ports = VirtualPorts::new();
        let mut muted = radio();
        muted.set_muted(true);
        let radio_tx = attach_ft817(&ports, "ft817", muted);
        let config = DriverConfig {
            retry_queries: true,
            ..Default::default()
        };
        let (driver, mut events) = start_driver(
            vec![virtual_instrument("ft817", InstrumentKind::Ft817)],
            Arc::new(ports.clone()),
            config,
        );

        driver.open_port("ft817").await.unwrap();
        expect_status(&mut events, true).await;

        driver.output(Request::GetFrequency).await.unwrap();
        driver.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        radio_tx
            .send(VirtualFt817Command::SetMuted(false))
            .await
            .unwrap();

        assert!(matches!(
            next_reading(&mut events).await,
            Reading::Radio {
                frequency_hz: 7_074_000,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reads_frequency_until_stopped() {
        let ports = VirtualPorts::new();
        let radio_tx = attach_ft817(&ports, "ft817", radio());
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("ft817", InstrumentKind::Ft817)]);

        driver.open_port("ft817").await.unwrap();
        expect_status(&mut events, true).await;
        driver.start_live_stream(Some(0.5)).await.unwrap();

        assert!(matches!(
            next_reading(&mut events).await,
            Reading::Radio {
                frequency_hz: 7_074_000,
                ..
            }
        ));
        radio_tx
            .send(VirtualFt817Command::SetFrequency(10_136_000))
            .await
            .unwrap();
        reading_where(&mut events, |r| {
            matches!(r, Reading::Radio { frequency_hz: 10_136_000, .. })
        })
        .await;

        driver.stop_live_stream().await.unwrap();
        let snapshot = driver.sync().await.unwrap();
        assert!(!snapshot.streaming);
    }
}

// ============================================================================
// Streaming
// ============================================================================

mod streaming_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let ports = VirtualPorts::new();
        let mut peer = ports.create("sigma", 1024);
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("sigma", InstrumentKind::Sigma25)]);

        driver.open_port("sigma").await.unwrap();
        expect_status(&mut events, true).await;

        driver.start_live_stream(None).await.unwrap();
        driver.start_live_stream(None).await.unwrap();
        assert!(driver.sync().await.unwrap().streaming);
        assert_eq!(read_written(&mut peer, 1).await, b"S");
        assert_silent(&mut peer).await;

        driver.stop_live_stream().await.unwrap();
        driver.stop_live_stream().await.unwrap();
        assert!(!driver.sync().await.unwrap().streaming);
        assert_eq!(read_written(&mut peer, 1).await, b"s");
        assert_silent(&mut peer).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_requested_while_opening_starts_on_open() {
        let ports = VirtualPorts::new();
        let mut peer = ports.create("sigma", 1024);
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("sigma", InstrumentKind::Sigma25)]);

        driver.open_port("sigma").await.unwrap();
        driver.start_live_stream(None).await.unwrap();
        expect_status(&mut events, true).await;

        assert_eq!(read_written(&mut peer, 1).await, b"S");
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_spectra_become_readings() {
        let ports = VirtualPorts::new();
        let _device = attach_sigma25(
            &ports,
            "sigma",
            VirtualSigma25::new("sigma", 4),
            Duration::from_millis(250),
        );
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("sigma", InstrumentKind::Sigma25)]);

        driver.open_port("sigma").await.unwrap();
        expect_status(&mut events, true).await;
        driver.start_live_stream(None).await.unwrap();

        assert_eq!(
            next_reading(&mut events).await,
            Reading::Spectrum {
                channels: vec![1, 1, 3, 1]
            }
        );
        assert_eq!(
            next_reading(&mut events).await,
            Reading::Spectrum {
                channels: vec![2, 2, 6, 2]
            }
        );

        driver.send_unique_id().await.unwrap();
        reading_where(&mut events, |r| matches!(r, Reading::UniqueId { .. })).await;
    }

    #[tokio::test(start_paused = true)]
    async fn onyx_is_polled_and_reports_its_guid() {
        let ports = VirtualPorts::new();
        let mut counter = VirtualOnyx::new("onyx", "0042-BEEF");
        counter.set_cpm(42.0, true);
        let _counter = attach_onyx(&ports, "onyx", counter);
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("onyx", InstrumentKind::Onyx)]);

        driver.open_port("onyx").await.unwrap();
        expect_status(&mut events, true).await;
        driver.start_live_stream(Some(2.0)).await.unwrap();

        let reading = next_reading(&mut events).await;
        assert_eq!(reading, Reading::rate(42.0, true));

        driver.send_unique_id().await.unwrap();
        let reading =
            reading_where(&mut events, |r| matches!(r, Reading::UniqueId { .. })).await;
        assert_eq!(
            reading,
            Reading::UniqueId {
                id: "0042-BEEF".into()
            }
        );
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn unknown_instrument_reports_open_error() {
        let ports = VirtualPorts::new();
        let (driver, mut events) = virtual_driver(&ports, Vec::new());

        driver.open_port("nope").await.unwrap();
        match next_reading(&mut events).await {
            Reading::OpenError { reason, description } => {
                assert_eq!(reason, "Unknown instrument");
                assert_eq!(description.as_deref(), Some("nope"));
            }
            other => panic!("Expected an open error, got {:?}", other),
        }
        assert_eq!(driver.sync().await.unwrap().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn missing_device_reports_open_error() {
        let ports = VirtualPorts::new();
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("onyx", InstrumentKind::Onyx)]);

        driver.open_port("onyx").await.unwrap();
        let event = next_event(&mut events).await;
        let data = event.data().expect("open error event");
        assert!(data.is_open_error());
        assert!(!data.valid);
        assert!(matches!(
            &data.reading,
            Reading::OpenError { reason, .. } if reason == "Device not found"
        ));

        let snapshot = driver.sync().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Error);
        assert!(snapshot.instrument.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_publishes_final_status_then_nothing() {
        let ports = VirtualPorts::new();
        let _radio = attach_ft817(&ports, "ft817", VirtualFt817::new("ft817"));
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("ft817", InstrumentKind::Ft817)]);

        driver.open_port("ft817").await.unwrap();
        expect_status(&mut events, true).await;
        driver.start_live_stream(Some(1.0)).await.unwrap();
        next_reading(&mut events).await;

        driver.close_port().await.unwrap();
        loop {
            let event = next_event(&mut events).await;
            if event.portopen() == Some(false) {
                break;
            }
            assert!(event.data().is_some(), "unexpected status {:?}", event);
        }

        let snapshot = driver.sync().await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Closed);
        assert!(!snapshot.streaming);

        tokio::time::sleep(Duration::from_secs(5)).await;
        driver.output(Request::GetFrequency).await.unwrap();
        driver.sync().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn close_while_opening_is_reported_once() {
        let ports = VirtualPorts::new();
        let _peer = ports.create("sigma", 64);
        let (driver, mut events) =
            virtual_driver(&ports, vec![virtual_instrument("sigma", InstrumentKind::Sigma25)]);

        driver.open_port("sigma").await.unwrap();
        driver.close_port().await.unwrap();
        driver.close_port().await.unwrap();

        loop {
            if next_event(&mut events).await.portopen() == Some(false) {
                break;
            }
        }
        driver.sync().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(driver.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_hangup_reconnects_when_configured() {
        let ports = VirtualPorts::new();
        let first = ports.create("sigma", 1024);
        let mut second = ports.create("sigma", 1024);
        let config = DriverConfig {
            reconnect_delay_ms: Some(1000),
            ..Default::default()
        };
        let (driver, mut events) = start_driver(
            vec![virtual_instrument("sigma", InstrumentKind::Sigma25)],
            Arc::new(ports.clone()),
            config,
        );

        driver.open_port("sigma").await.unwrap();
        expect_status(&mut events, true).await;
        driver.start_live_stream(None).await.unwrap();

        drop(first);
        expect_status(&mut events, false).await;
        assert_eq!(driver.sync().await.unwrap().state, ConnectionState::Closed);

        expect_status(&mut events, true).await;
        // The live stream survives the reconnect
        assert_eq!(read_written(&mut second, 1).await, b"S");

        second.write_all(b"C:1,2,3\n").await.unwrap();
        assert_eq!(
            next_reading(&mut events).await,
            Reading::Spectrum {
                channels: vec![1, 2, 3]
            }
        );
    }

    #[tokio::test]
    async fn recording_toggle_is_announced() {
        let ports = VirtualPorts::new();
        let (driver, mut events) = virtual_driver(&ports, Vec::new());

        driver.set_recording(true).await.unwrap();
        match next_event(&mut events).await {
            DriverEvent::Status(status) => {
                assert!(!status.portopen);
                assert_eq!(status.recording, Some(true));
            }
            other => panic!("Expected a status, got {:?}", other),
        }
        assert!(driver.sync().await.unwrap().recording);
    }

    #[tokio::test]
    async fn shutdown_stops_the_driver() {
        let ports = VirtualPorts::new();
        let (driver, mut events) = virtual_driver(&ports, Vec::new());

        driver.shutdown().await.unwrap();
        assert!(events.recv().await.is_none());
        assert!(driver.open_port("anything").await.is_err());
    }
}

// ============================================================================
// BLE counter
// ============================================================================

mod ble_tests {
    use super::*;

    const ADDRESS: &str = "C8:2B:96:00:11:22";

    fn ble_driver(device: &VirtualBlueOnyx) -> (DriverHandle, mpsc::Receiver<DriverEvent>) {
        let connector = SystemConnector::new().with_gatt(Arc::new(device.clone()));
        let instrument = InstrumentConfig {
            id: "blue".into(),
            name: "Blue Onyx".into(),
            kind: InstrumentKind::BlueOnyx,
            endpoint: Endpoint::Gatt {
                address: ADDRESS.into(),
            },
        };
        start_driver(vec![instrument], Arc::new(connector), DriverConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn first_open_cycles_the_connection_quietly() {
        let device = VirtualBlueOnyx::new(ADDRESS);
        let (driver, mut events) = ble_driver(&device);

        driver.open_port("blue").await.unwrap();
        expect_status(&mut events, true).await;
        device.wait_subscribed().await;

        assert_eq!(device.connects(), 2);
        let writes = device.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, b"0");
        assert_eq!(
            Some(Address::Gatt {
                service: writes[0].service,
                characteristic: writes[0].characteristic,
            }),
            Some(BlueOnyxProfile::mode_address())
        );

        // The cycle itself is not announced
        driver.sync().await.unwrap();
        assert!(events.try_recv().is_err());
        assert!(driver.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn counts_become_a_windowed_rate() {
        let device = VirtualBlueOnyx::new(ADDRESS);
        let (driver, mut events) = ble_driver(&device);

        driver.open_port("blue").await.unwrap();
        expect_status(&mut events, true).await;
        device.wait_subscribed().await;

        // 90 s window of 5 s samples
        for sample in 1..=18 {
            assert!(device.notify_counts(5));
            match next_reading(&mut events).await {
                Reading::Rate { cpm, valid, .. } => {
                    assert!((cpm - 60.0).abs() < 0.1, "cpm {}", cpm);
                    assert_eq!(valid, sample == 18, "sample {}", sample);
                }
                other => panic!("Expected a rate, got {:?}", other),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        // No more counts: the rate goes stale
        match next_reading(&mut events).await {
            Reading::Rate { valid, .. } => assert!(!valid),
            other => panic!("Expected a rate, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_reruns_initialization() {
        let device = VirtualBlueOnyx::new(ADDRESS);
        let connector = SystemConnector::new().with_gatt(Arc::new(device.clone()));
        let instrument = InstrumentConfig {
            id: "blue".into(),
            name: String::new(),
            kind: InstrumentKind::BlueOnyx,
            endpoint: Endpoint::Gatt {
                address: ADDRESS.into(),
            },
        };
        let config = DriverConfig {
            reconnect_delay_ms: Some(1000),
            ..Default::default()
        };
        let (driver, mut events) = start_driver(vec![instrument], Arc::new(connector), config);

        driver.open_port("blue").await.unwrap();
        expect_status(&mut events, true).await;
        device.wait_subscribed().await;
        assert_eq!(device.connects(), 2);

        device.drop_connection();
        expect_status(&mut events, false).await;
        expect_status(&mut events, true).await;
        device.wait_subscribed().await;

        // The counter may have rebooted into its bootloader
        assert_eq!(device.connects(), 4);
        let writes = device.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].value, b"0");
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_reports_open_error() {
        let device = VirtualBlueOnyx::new(ADDRESS);
        device.fail_next_connects(1);
        let (driver, mut events) = ble_driver(&device);

        driver.open_port("blue").await.unwrap();
        assert!(matches!(
            next_reading(&mut events).await,
            Reading::OpenError { .. }
        ));
        assert_eq!(driver.sync().await.unwrap().state, ConnectionState::Error);
        assert_eq!(device.connects(), 0);
    }
}
