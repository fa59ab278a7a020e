//! Household energy meter adapters
//!
//! Read-only to the controller. Sign conventions are fixed across all
//! backends: `power_grid` is positive when importing, `power_battery` is
//! positive when the home battery discharges into the house. The identity
//! `power_consumption ≈ power_pv + power_grid + power_battery` holds within
//! rounding for every snapshot.

use crate::config::parse_section;
use crate::error::{PvControlError, Result};
use crate::logging::get_logger;
use crate::metrics::METRICS;
use crate::service::{ServiceData, ServiceState, ServiceView};
use crate::wallbox::{SharedWallbox, Wallbox as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MeterConfig {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestMeterConfig {
    /// [W] max charge/discharge power of the simulated home battery, 0 = none
    pub battery_max: f64,
    /// [%] initial state of charge
    pub soc_battery: f64,
}

impl Default for TestMeterConfig {
    fn default() -> Self {
        Self {
            battery_max: 0.0,
            soc_battery: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeterData {
    pub error: u32,
    /// [W] power delivered by PV
    pub power_pv: f64,
    /// [W] power consumption (including car charging)
    pub power_consumption: f64,
    /// [W] power from/to grid, + import / - export
    pub power_grid: f64,
    /// [W] home battery power, + discharge / - charge
    pub power_battery: f64,
    /// [%] home battery state of charge
    pub soc_battery: f64,
    /// [Wh]
    pub energy_consumption: f64,
    /// [Wh]
    pub energy_consumption_grid: f64,
    /// [Wh]
    pub energy_consumption_pv: f64,
}

impl ServiceData for MeterData {
    fn set_error(&mut self, error: u32) {
        self.error = error;
    }
}

fn publish_metrics(m: &MeterData) {
    METRICS.meter_power.with_label_values(&["pv"]).set(m.power_pv);
    METRICS.meter_power.with_label_values(&["grid"]).set(m.power_grid);
    METRICS.meter_power_consumption_total.set(m.power_consumption);
}

/// Household-side readings, polled once per controller tick.
#[async_trait::async_trait]
pub trait Meter: Send {
    /// Read meter data, update gauges and cache the snapshot.
    async fn read_data(&mut self) -> MeterData;

    fn get_data(&self) -> MeterData;

    fn view(&self) -> ServiceView;

    /// Release external I/O resources.
    async fn close(&mut self) {}
}

pub type SharedMeter = Arc<Mutex<dyn Meter + Send>>;

/// Cache policy shared by all meter backends: a successful read replaces
/// the snapshot and clears the error counter; a failure keeps returning the
/// last-known snapshot until three consecutive failures, after which only an
/// empty record with the error count is served.
pub(crate) fn apply_meter_read<C>(
    service: &mut ServiceState<C, MeterData>,
    result: Result<MeterData>,
) -> MeterData {
    match result {
        Ok(m) => {
            service.reset_error_counter();
            service.set_data(m);
        }
        Err(e) => {
            get_logger("meter").error(&format!("Meter read failed: {}", e));
            if service.inc_error_counter() >= 3 {
                service.set_data(MeterData::default());
            }
        }
    }
    publish_metrics(service.data_ref());
    service.data()
}

/// Sinusoidal PV and home-load model for demo deployments.
///
/// Consumption includes the wallbox's own draw, which is why the controller
/// reads the wallbox before the meter.
pub struct SimulatedMeter {
    service: ServiceState<MeterConfig, MeterData>,
    wallbox: SharedWallbox,
}

impl SimulatedMeter {
    pub fn new(config: MeterConfig, wallbox: SharedWallbox) -> Self {
        Self {
            service: ServiceState::new("SimulatedMeter", config, MeterData::default()),
            wallbox,
        }
    }
}

#[async_trait::async_trait]
impl Meter for SimulatedMeter {
    async fn read_data(&mut self) -> MeterData {
        let power_car = self.wallbox.lock().await.get_data().power;
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let pv = (7000.0 * (2.0 * std::f64::consts::PI * t / 3600.0).sin().abs()).floor();
        let consumption =
            500.0 + (500.0 * (2.0 * std::f64::consts::PI * t / 300.0).sin().abs()).floor() + power_car;
        let grid = consumption - pv;
        let m = MeterData {
            error: 0,
            power_pv: pv,
            power_consumption: consumption,
            power_grid: grid,
            ..MeterData::default()
        };
        apply_meter_read(&mut self.service, Ok(m))
    }

    fn get_data(&self) -> MeterData {
        self.service.data()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }
}

/// Deterministic meter for tests and E2E scenarios.
///
/// PV, home load and energy counters are set explicitly. The optional home
/// battery absorbs surplus (and covers deficit) up to `battery_max`,
/// integrating its SoC by `-power_battery/120` Wh per tick (30 s cycle),
/// saturating at [0, 100].
pub struct TestMeter {
    service: ServiceState<TestMeterConfig, MeterData>,
    wallbox: SharedWallbox,
    pv: f64,
    home: f64,
    soc: f64,
    energy_grid: f64,
    energy_pv: f64,
}

impl TestMeter {
    pub fn new(config: TestMeterConfig, wallbox: SharedWallbox) -> Self {
        let soc = config.soc_battery;
        Self {
            service: ServiceState::new("TestMeter", config, MeterData::default()),
            wallbox,
            pv: 0.0,
            home: 0.0,
            soc,
            energy_grid: 0.0,
            energy_pv: 0.0,
        }
    }

    pub fn set_data(&mut self, pv: f64, home: f64) {
        self.pv = pv;
        self.home = home;
    }

    pub fn set_energy(&mut self, energy_consumption_grid: f64, energy_consumption_pv: f64) {
        self.energy_grid = energy_consumption_grid;
        self.energy_pv = energy_consumption_pv;
    }

    pub fn set_soc(&mut self, soc: f64) {
        self.soc = soc;
    }
}

#[async_trait::async_trait]
impl Meter for TestMeter {
    async fn read_data(&mut self) -> MeterData {
        let power_car = self.wallbox.lock().await.get_data().power;
        let consumption = self.home + power_car;
        let surplus = self.pv - consumption;
        let battery_max = self.service.config().battery_max;
        let battery = if battery_max > 0.0 && surplus > 0.0 && self.soc < 100.0 {
            -surplus.min(battery_max)
        } else if battery_max > 0.0 && surplus < 0.0 && self.soc > 0.0 {
            (-surplus).min(battery_max)
        } else {
            0.0
        };
        let grid = consumption - self.pv - battery;
        self.soc = (self.soc - battery / 120.0).clamp(0.0, 100.0);
        let m = MeterData {
            error: 0,
            power_pv: self.pv,
            power_consumption: consumption,
            power_grid: grid,
            power_battery: battery,
            soc_battery: self.soc,
            energy_consumption: self.energy_grid + self.energy_pv,
            energy_consumption_grid: self.energy_grid,
            energy_consumption_pv: self.energy_pv,
        };
        apply_meter_read(&mut self.service, Ok(m))
    }

    fn get_data(&self) -> MeterData {
        self.service.data()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }
}

pub struct MeterFactory;

impl MeterFactory {
    pub fn new_meter(
        type_tag: &str,
        wallbox: SharedWallbox,
        section: &serde_json::Value,
    ) -> Result<SharedMeter> {
        match type_tag {
            "SimulatedMeter" => Ok(Arc::new(Mutex::new(SimulatedMeter::new(
                parse_section(section, "meter")?,
                wallbox,
            )))),
            "TestMeter" => Ok(Arc::new(Mutex::new(TestMeter::new(
                parse_section(section, "meter")?,
                wallbox,
            )))),
            _ => Err(PvControlError::config(format!(
                "Bad meter type: {}",
                type_tag
            ))),
        }
    }
}
