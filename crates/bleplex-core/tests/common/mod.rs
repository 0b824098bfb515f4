//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use bleplex_core::mock::{MockCharacteristic, MockPeripheral, MockService, MockTransport};
use bleplex_core::{
    CentralSession, Characteristic, ConnectOptions, DeviceSession, SessionConfig, uuids,
};
use bleplex_types::{DeviceId, RadioState};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

pub const SENSOR: DeviceId = DeviceId::new(Uuid::from_u128(0xA1));
pub const OTHER: DeviceId = DeviceId::new(Uuid::from_u128(0xB2));
pub const OFFLINE: DeviceId = DeviceId::new(Uuid::from_u128(0xC3));

pub const CONTROL_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const COMMAND: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Install a test subscriber once; `RUST_LOG=bleplex_core=debug` shows the
/// session layer's logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A peripheral with a notifying battery level, a read-only model number and
/// a writable command characteristic.
pub fn sensor(id: DeviceId) -> MockPeripheral {
    MockPeripheral::new(id)
        .name("Sensor")
        .service(
            MockService::new(uuids::BATTERY_SERVICE)
                .characteristic(MockCharacteristic::notifying(uuids::BATTERY_LEVEL, vec![87])),
        )
        .service(
            MockService::new(uuids::DEVICE_INFO_SERVICE)
                .characteristic(MockCharacteristic::readable(uuids::MODEL_NUMBER, "M-100")),
        )
        .service(
            MockService::new(CONTROL_SERVICE).characteristic(MockCharacteristic::writable(COMMAND)),
        )
}

pub struct Harness {
    pub central: CentralSession,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    /// A powered-on central session over a mock with the given peripherals.
    pub async fn new(peripherals: Vec<MockPeripheral>) -> Self {
        Self::with_config(peripherals, SessionConfig::default()).await
    }

    pub async fn with_config(peripherals: Vec<MockPeripheral>, config: SessionConfig) -> Self {
        init_tracing();
        let (transport, events) = MockTransport::new();
        for peripheral in peripherals {
            transport.add_peripheral(peripheral);
        }
        let central =
            CentralSession::new(transport.clone(), events, config).expect("valid config");
        transport.power_on();
        central
            .radio()
            .wait_for(RadioState::PoweredOn)
            .await
            .expect("radio powers on");
        Self { central, transport }
    }

    /// The default harness with [`SENSOR`] and [`OTHER`] present.
    pub async fn with_sensors() -> Self {
        Self::new(vec![sensor(SENSOR), sensor(OTHER)]).await
    }

    pub async fn connect(&self, id: DeviceId) -> DeviceSession {
        self.central
            .connect(&self.central.device(id), ConnectOptions::new())
            .await
            .expect("connect succeeds")
    }

    pub async fn characteristic(
        &self,
        device: &DeviceSession,
        service: Uuid,
        characteristic: Uuid,
    ) -> Characteristic {
        device
            .find_characteristic(service, characteristic)
            .await
            .expect("discovery succeeds")
            .expect("characteristic exists")
    }

    /// Yield until the mock has seen `count` commands matching `predicate`.
    pub async fn wait_for_commands(
        &self,
        count: usize,
        predicate: impl Fn(&bleplex_core::mock::MockCommand) -> bool,
    ) {
        while self.transport.count(&predicate) < count {
            tokio::task::yield_now().await;
        }
    }
}
