//! Car telemetry adapters
//!
//! Optional SoC and range data, polled on a slower cadence than the control
//! loop by its own scheduler. The OAuth-authenticated vendor clients are
//! wired in by the deployment; here live the simulated variant and `NoCar`,
//! which keeps its error counter raised so the UI greys out the SoC panel.

use crate::config::parse_section;
use crate::error::{PvControlError, Result};
use crate::metrics::METRICS;
use crate::service::{ServiceData, ServiceState, ServiceView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CarConfig {
    /// [s] cycle time for reading car data, used by the car scheduler
    pub cycle_time: u32,
    /// [Wh] usable battery energy per percent SoC
    pub energy_one_percent_soc: u32,
    /// Greys out car data without removing the adapter
    pub disabled: bool,
}

impl Default for CarConfig {
    fn default() -> Self {
        Self {
            cycle_time: 5 * 60,
            energy_one_percent_soc: 580,
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CarData {
    pub error: u32,
    pub data_captured_at: DateTime<Utc>,
    /// [%] state of charge
    pub soc: f64,
    /// [km]
    pub cruising_range: u32,
    /// [km]
    pub mileage: u32,
}

impl Default for CarData {
    fn default() -> Self {
        Self {
            error: 0,
            data_captured_at: DateTime::<Utc>::MIN_UTC,
            soc: 0.0,
            cruising_range: 0,
            mileage: 0,
        }
    }
}

impl ServiceData for CarData {
    fn set_error(&mut self, error: u32) {
        self.error = error;
    }
}

/// Gauge updates plus the discharge-event energy counter: whenever SoC
/// strictly decreases between reads, `(last_soc - soc) * energy_one_percent_soc`
/// is added, preserving consumption accounting across charge cycles.
fn record_metrics(config: &CarConfig, last_soc: &mut f64, d: &CarData) {
    METRICS.car_soc.set(d.soc / 100.0);
    METRICS.car_cruising_range.set(f64::from(d.cruising_range) * 1000.0);
    METRICS.car_mileage.set(f64::from(d.mileage) * 1000.0);
    if d.soc < *last_soc {
        METRICS
            .car_energy_consumption
            .inc_by((*last_soc - d.soc) * f64::from(config.energy_one_percent_soc));
    }
    *last_soc = d.soc;
}

/// Car telemetry contract, polled by the car scheduler.
#[async_trait::async_trait]
pub trait Car: Send {
    async fn read_data(&mut self) -> CarData;

    fn get_data(&self) -> CarData;

    fn get_config(&self) -> CarConfig;

    fn view(&self) -> ServiceView;

    async fn close(&mut self) {}
}

pub type SharedCar = Arc<Mutex<dyn Car + Send>>;

pub struct SimulatedCar {
    service: ServiceState<CarConfig, CarData>,
    last_soc: f64,
}

impl SimulatedCar {
    pub fn new(config: CarConfig) -> Self {
        let mut service = ServiceState::new("SimulatedCar", config, CarData::default());
        service.set_data(CarData {
            error: 0,
            data_captured_at: Utc::now(),
            soc: 50.0,
            cruising_range: 150,
            mileage: 10000,
        });
        Self {
            service,
            last_soc: 0.0,
        }
    }

    pub fn set_data(&mut self, d: CarData) {
        self.service.set_data(d);
    }
}

#[async_trait::async_trait]
impl Car for SimulatedCar {
    async fn read_data(&mut self) -> CarData {
        if self.service.config().disabled {
            // report an obviously empty reading instead of stale telemetry
            self.service.inc_error_counter();
            self.service.set_data(CarData {
                data_captured_at: Utc::now(),
                ..CarData::default()
            });
            return self.service.data();
        }
        let d = self.service.data();
        let config = self.service.config().clone();
        record_metrics(&config, &mut self.last_soc, &d);
        d
    }

    fn get_data(&self) -> CarData {
        self.service.data()
    }

    fn get_config(&self) -> CarConfig {
        self.service.config().clone()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }
}

/// Placeholder for installations without car telemetry. The pre-raised
/// error counter makes every snapshot render as degraded.
pub struct NoCar {
    service: ServiceState<CarConfig, CarData>,
}

impl NoCar {
    pub fn new(config: CarConfig) -> Self {
        let mut service = ServiceState::new("NoCar", config, CarData::default());
        for _ in 0..4 {
            service.inc_error_counter();
        }
        Self { service }
    }
}

#[async_trait::async_trait]
impl Car for NoCar {
    async fn read_data(&mut self) -> CarData {
        self.service.set_data(CarData {
            data_captured_at: Utc::now(),
            ..CarData::default()
        });
        self.service.data()
    }

    fn get_data(&self) -> CarData {
        self.service.data()
    }

    fn get_config(&self) -> CarConfig {
        self.service.config().clone()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }
}

pub struct CarFactory;

impl CarFactory {
    pub fn new_car(type_tag: &str, section: &serde_json::Value) -> Result<SharedCar> {
        match type_tag {
            "SimulatedCar" => Ok(Arc::new(Mutex::new(SimulatedCar::new(parse_section(
                section, "car",
            )?)))),
            "NoCar" => Ok(Arc::new(Mutex::new(NoCar::new(parse_section(
                section, "car",
            )?)))),
            _ => Err(PvControlError::config(format!("Bad car type: {}", type_tag))),
        }
    }
}
