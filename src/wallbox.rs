//! Wallbox adapters
//!
//! Car-side state and mutators. The controller only talks to the [`Wallbox`]
//! trait; behind it sit the simulated variants used for development and
//! tests and the go-e charger HTTP adapter. Phase switching goes through the
//! external phase relay and always ends in a wallbox reset so the charger
//! resynchronises its phase view.

use crate::config::parse_section;
use crate::error::{PvControlError, Result};
use crate::logging::get_logger;
use crate::metrics::METRICS;
use crate::relay::{PhaseRelay as _, SharedPhaseRelay};
use crate::service::{ServiceData, ServiceState, ServiceView};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WallboxConfig {
    pub min_supported_current: u8,
    pub max_supported_current: u8,
}

impl Default for WallboxConfig {
    fn default() -> Self {
        Self {
            min_supported_current: 6,
            max_supported_current: 16,
        }
    }
}

/// SAE J1772 pilot-derived state reported by the wallbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CarStatus {
    /// Charging station ready, no vehicle
    NoVehicle = 1,
    Charging = 2,
    WaitingForVehicle = 3,
    /// Charge finished, vehicle still connected
    ChargingFinished = 4,
}

impl TryFrom<u8> for CarStatus {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            1 => Ok(CarStatus::NoVehicle),
            2 => Ok(CarStatus::Charging),
            3 => Ok(CarStatus::WaitingForVehicle),
            4 => Ok(CarStatus::ChargingFinished),
            v => Err(format!("invalid car status: {}", v)),
        }
    }
}

impl From<CarStatus> for u8 {
    fn from(value: CarStatus) -> Self {
        value as u8
    }
}

/// Wallbox error status (distinct from `error`, the communication counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum WbError {
    Ok = 0,
    /// RCCB (Residual Current Device)
    Rccb = 1,
    /// Phase disturbance
    Phase = 3,
    /// Earthing detection
    NoGround = 8,
    Internal = 10,
    /// Inconsistency between phase relay and phases-in
    PhaseRelayErr = 100,
}

impl WbError {
    /// Map a vendor error code. Codes above `Internal` are informational
    /// (e.g. 20 is reported while allow_charging is on) and count as OK.
    pub fn from_vendor_code(code: u32) -> Self {
        match code {
            0 => WbError::Ok,
            1 => WbError::Rccb,
            3 => WbError::Phase,
            8 => WbError::NoGround,
            10 => WbError::Internal,
            c if c > 10 => WbError::Ok,
            _ => WbError::Internal,
        }
    }
}

impl TryFrom<u32> for WbError {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(WbError::Ok),
            1 => Ok(WbError::Rccb),
            3 => Ok(WbError::Phase),
            8 => Ok(WbError::NoGround),
            10 => Ok(WbError::Internal),
            100 => Ok(WbError::PhaseRelayErr),
            v => Err(format!("invalid wallbox error: {}", v)),
        }
    }
}

impl From<WbError> for u32 {
    fn from(value: WbError) -> Self {
        value as u32
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WallboxData {
    pub error: u32,
    pub wb_error: WbError,
    pub car_status: CarStatus,
    /// [A]
    pub max_current: u8,
    pub allow_charging: bool,
    /// 0..3
    pub phases_in: u8,
    /// 0..3
    pub phases_out: u8,
    /// [W]
    pub power: f64,
    /// [Wh], energy of last charging
    pub charged_energy: f64,
    /// [Wh], total charged energy
    pub total_energy: f64,
    /// [°C]
    pub temperature: f64,
}

impl Default for WallboxData {
    fn default() -> Self {
        Self {
            error: 0,
            wb_error: WbError::Ok,
            car_status: CarStatus::NoVehicle,
            max_current: 16,
            allow_charging: false,
            phases_in: 3,
            phases_out: 0,
            power: 0.0,
            charged_energy: 0.0,
            total_energy: 0.0,
            temperature: 0.0,
        }
    }
}

impl ServiceData for WallboxData {
    fn set_error(&mut self, error: u32) {
        self.error = error;
    }
}

fn publish_metrics(wb: &WallboxData) {
    METRICS.wallbox_car_status.set(i64::from(u8::from(wb.car_status)));
    METRICS.wallbox_power.set(wb.power);
    METRICS.wallbox_phases_in.set(i64::from(wb.phases_in));
    METRICS.wallbox_phases_out.set(i64::from(wb.phases_out));
    METRICS.wallbox_max_current.set(i64::from(wb.max_current));
    METRICS.wallbox_allow_charging.set(i64::from(wb.allow_charging));
    METRICS.wallbox_temperature.set(wb.temperature);
}

/// Wallbox contract exposed to the charge controller.
#[async_trait::async_trait]
pub trait Wallbox: Send {
    /// Refresh the cached snapshot, update gauges and return it. Transport
    /// failures return the last-known snapshot and bump the error counter.
    async fn read_data(&mut self) -> WallboxData;

    fn get_data(&self) -> WallboxData;

    /// Supported current limits and common settings.
    fn get_config(&self) -> WallboxConfig;

    fn error_counter(&self) -> u32;

    fn view(&self) -> ServiceView;

    /// Permit or deny current draw; writes only on change.
    async fn allow_charging(&mut self, flag: bool);

    /// Set the per-phase current limit; writes only on change.
    async fn set_max_current(&mut self, max_current: u8);

    /// Route 1 or 3 phases to the wallbox. Accepted only while the error
    /// counter is zero and no phase is charging; the relay flip is followed
    /// by a wallbox reset after `switch_phases_reset_delay`.
    async fn set_phases_in(&mut self, phases: u8);

    /// Vendor-specific reset; idempotent.
    async fn trigger_reset(&mut self);

    /// Release external I/O resources.
    async fn close(&mut self) {}

    /// Simulation-only mutator backing the car-status API endpoint.
    fn set_car_status(&mut self, _status: CarStatus) -> Result<()> {
        Err(PvControlError::validation(
            "car_status",
            "only available for a simulated wallbox",
        ))
    }
}

pub type SharedWallbox = Arc<Mutex<dyn Wallbox + Send>>;

/// A wallbox simulation for testing.
///
/// While charging is allowed and a car is connected and drawing, the model
/// charges with `phases * max_current * 230 W` and integrates energy
/// assuming a 30 s cycle time.
pub struct SimulatedWallbox {
    service: ServiceState<WallboxConfig, WallboxData>,
    charging_session: bool,
    trigger_reset_count: u32,
}

impl SimulatedWallbox {
    pub fn new(config: WallboxConfig) -> Self {
        Self {
            service: ServiceState::new("SimulatedWallbox", config, WallboxData::default()),
            charging_session: false,
            trigger_reset_count: 0,
        }
    }

    fn with_name(name: &'static str, config: WallboxConfig) -> Self {
        Self {
            service: ServiceState::new(name, config, WallboxData::default()),
            charging_session: false,
            trigger_reset_count: 0,
        }
    }

    fn simulate_read(&mut self) -> WallboxData {
        let mut wb = self.service.data();
        if wb.allow_charging && wb.car_status == CarStatus::Charging {
            if !self.charging_session {
                // new charging session starts a fresh session counter
                wb.charged_energy = 0.0;
                self.charging_session = true;
            }
            wb.phases_out = wb.phases_in;
            wb.power = f64::from(wb.phases_out) * f64::from(wb.max_current) * 230.0;
            wb.charged_energy += wb.power / 120.0;
            wb.total_energy += wb.power / 120.0;
        } else {
            wb.phases_out = 0;
            wb.power = 0.0;
        }
        wb
    }

    pub fn set_wb_error(&mut self, err: WbError) {
        self.service.data_mut().wb_error = err;
    }

    pub fn trigger_reset_count(&self) -> u32 {
        self.trigger_reset_count
    }

    /// Rewind the last simulated energy increment. Keeps table-driven
    /// controller tests independent of accumulated charge.
    pub fn decrement_charge_energy_for_tests(&mut self) {
        let wb = self.service.data_mut();
        if wb.allow_charging {
            let inc = wb.power / 120.0;
            wb.charged_energy -= inc;
            wb.total_energy -= inc;
        }
    }
}

#[async_trait::async_trait]
impl Wallbox for SimulatedWallbox {
    async fn read_data(&mut self) -> WallboxData {
        let wb = self.simulate_read();
        self.service.set_data(wb);
        publish_metrics(self.service.data_ref());
        self.service.data()
    }

    fn get_data(&self) -> WallboxData {
        self.service.data()
    }

    fn get_config(&self) -> WallboxConfig {
        *self.service.config()
    }

    fn error_counter(&self) -> u32 {
        self.service.error_counter()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }

    async fn allow_charging(&mut self, flag: bool) {
        if !flag {
            self.charging_session = false;
        }
        self.service.data_mut().allow_charging = flag;
    }

    async fn set_max_current(&mut self, max_current: u8) {
        self.service.data_mut().max_current = max_current;
    }

    async fn set_phases_in(&mut self, phases: u8) {
        self.service.data_mut().phases_in = phases;
    }

    async fn trigger_reset(&mut self) {
        self.trigger_reset_count += 1;
    }

    fn set_car_status(&mut self, status: CarStatus) -> Result<()> {
        self.service.data_mut().car_status = status;
        Ok(())
    }
}

/// Simulated wallbox whose `phases_in` mirrors the phase relay.
pub struct SimulatedWallboxWithRelay {
    inner: SimulatedWallbox,
    relay: SharedPhaseRelay,
    logger: crate::logging::StructuredLogger,
}

impl SimulatedWallboxWithRelay {
    pub fn new(config: WallboxConfig, relay: SharedPhaseRelay) -> Self {
        Self {
            inner: SimulatedWallbox::with_name("SimulatedWallboxWithRelay", config),
            relay,
            logger: get_logger("wallbox"),
        }
    }
}

#[async_trait::async_trait]
impl Wallbox for SimulatedWallboxWithRelay {
    async fn read_data(&mut self) -> WallboxData {
        let relay_phases = self.relay.lock().await.get_phases();
        {
            let data = self.inner.service.data_mut();
            if relay_phases != 0 {
                data.phases_in = relay_phases;
            }
        }
        self.inner.read_data().await
    }

    fn get_data(&self) -> WallboxData {
        self.inner.get_data()
    }

    fn get_config(&self) -> WallboxConfig {
        self.inner.get_config()
    }

    fn error_counter(&self) -> u32 {
        self.inner.error_counter()
    }

    fn view(&self) -> ServiceView {
        self.inner.view()
    }

    async fn allow_charging(&mut self, flag: bool) {
        self.inner.allow_charging(flag).await;
    }

    async fn set_max_current(&mut self, max_current: u8) {
        self.inner.set_max_current(max_current).await;
    }

    async fn set_phases_in(&mut self, phases: u8) {
        let errcnt = self.inner.error_counter();
        let phases_out = self.inner.get_data().phases_out;
        if errcnt == 0 && phases_out == 0 {
            self.relay.lock().await.set_phases(phases);
            self.trigger_reset().await;
        } else {
            self.logger.warn(&format!(
                "Rejected set_phases_in({}): phases_out={}, error_counter={}",
                phases, phases_out, errcnt
            ));
        }
    }

    async fn trigger_reset(&mut self) {
        self.inner.trigger_reset().await;
    }

    fn set_car_status(&mut self, status: CarStatus) -> Result<()> {
        self.inner.set_car_status(status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GoeWallboxConfig {
    #[serde(flatten)]
    pub wallbox: WallboxConfig,
    pub url: String,
    /// [s] request timeout
    pub timeout: u64,
    /// [s] delay between switching phase relay and triggering a WB reset
    pub switch_phases_reset_delay: u64,
}

impl Default for GoeWallboxConfig {
    fn default() -> Self {
        Self {
            wallbox: WallboxConfig::default(),
            url: "http://go-echarger.fritz.box".to_string(),
            timeout: 5,
            switch_phases_reset_delay: 2,
        }
    }
}

/// go-e charger, driven over its local HTTP API.
pub struct GoeWallbox {
    service: ServiceState<GoeWallboxConfig, WallboxData>,
    relay: SharedPhaseRelay,
    client: reqwest::Client,
    status_url: String,
    mqtt_url: String,
    logger: crate::logging::StructuredLogger,
}

impl GoeWallbox {
    pub fn new(config: GoeWallboxConfig, relay: SharedPhaseRelay) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()?;
        let status_url = format!("{}/status", config.url);
        let mqtt_url = format!("{}/mqtt", config.url);
        Ok(Self {
            service: ServiceState::new("GoeWallbox", config, WallboxData::default()),
            relay,
            client,
            status_url,
            mqtt_url,
            logger: get_logger("wallbox"),
        })
    }

    async fn fetch_status(&self) -> Result<serde_json::Value> {
        let res = self.client.get(&self.status_url).send().await?;
        Ok(res.error_for_status()?.json().await?)
    }

    /// Send one key=value command; the charger answers with a full status
    /// payload which refreshes the cache.
    async fn send_payload(&mut self, payload: &str) -> Result<()> {
        let res = self
            .client
            .get(&self.mqtt_url)
            .query(&[("payload", payload)])
            .send()
            .await?;
        let json: serde_json::Value = res.error_for_status()?.json().await?;
        let (enabled, phases) = {
            let mut relay = self.relay.lock().await;
            (relay.is_enabled(), relay.get_phases())
        };
        let wb = decode_status(&json, enabled, phases)?;
        self.service.set_data(wb);
        publish_metrics(self.service.data_ref());
        Ok(())
    }
}

#[async_trait::async_trait]
impl Wallbox for GoeWallbox {
    async fn read_data(&mut self) -> WallboxData {
        let (enabled, phases) = {
            let mut relay = self.relay.lock().await;
            (relay.is_enabled(), relay.get_phases())
        };
        let status = self.fetch_status().await;
        match status.and_then(|json| decode_status(&json, enabled, phases)) {
            Ok(wb) => {
                self.service.reset_error_counter();
                self.service.set_data(wb);
                publish_metrics(self.service.data_ref());
            }
            Err(e) => {
                self.logger.error(&format!("Wallbox read failed: {}", e));
                self.service.inc_error_counter();
                // last known data is returned; there is no safe fallback state
            }
        }
        self.service.data()
    }

    fn get_data(&self) -> WallboxData {
        self.service.data()
    }

    fn get_config(&self) -> WallboxConfig {
        self.service.config().wallbox
    }

    fn error_counter(&self) -> u32 {
        self.service.error_counter()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }

    async fn allow_charging(&mut self, flag: bool) {
        if flag != self.service.data_ref().allow_charging {
            self.logger.debug(&format!("set allow_charging={}", flag));
            if let Err(e) = self.send_payload(&format!("alw={}", u8::from(flag))).await {
                self.logger.error(&format!("set allow_charging failed: {}", e));
            }
        }
    }

    async fn set_max_current(&mut self, max_current: u8) {
        if max_current != self.service.data_ref().max_current {
            self.logger.debug(&format!("set max_current={}", max_current));
            if let Err(e) = self.send_payload(&format!("amx={}", max_current)).await {
                self.logger.error(&format!("set max_current failed: {}", e));
            }
        }
    }

    async fn set_phases_in(&mut self, phases: u8) {
        let errcnt = self.service.error_counter();
        let phases_out = self.service.data_ref().phases_out;
        if errcnt == 0 && phases_out == 0 {
            self.relay.lock().await.set_phases(phases);
            self.logger.debug(&format!("set phases_in={}", phases));
            // the charger needs a reset after a relay change to resync its phase view
            let delay = self.service.config().switch_phases_reset_delay;
            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            self.trigger_reset().await;
        } else {
            self.logger.warn(&format!(
                "Rejected set_phases_in({}): phases_out={}, error_counter={}",
                phases, phases_out, errcnt
            ));
        }
    }

    async fn trigger_reset(&mut self) {
        self.logger.debug("trigger reset");
        let res = self
            .client
            .get(&self.mqtt_url)
            .query(&[("payload", "rst=1")])
            .send()
            .await;
        if let Err(e) = res {
            self.logger.error(&format!("trigger reset failed: {}", e));
        }
    }
}

fn parse_u32(json: &serde_json::Value, key: &str) -> Result<u32> {
    let value = &json[key];
    value
        .as_u64()
        .map(|v| v as u32)
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| PvControlError::api(format!("bad wallbox status field '{}'", key)))
}

fn parse_f64(json: &serde_json::Value, key: &str) -> f64 {
    let value = &json[key];
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0.0)
}

/// Decode a go-e status payload into a [`WallboxData`] snapshot.
///
/// `pha` is a bitfield: bits 0..2 report voltage after the internal relays
/// (phases used for charging), bits 3..5 before them (phases wired in).
/// `phases_out` is clamped to `phases_in`; a `phases_in` that contradicts
/// the phase relay while the charger itself reports no error becomes the
/// synthetic [`WbError::PhaseRelayErr`].
pub fn decode_status(
    json: &serde_json::Value,
    relay_enabled: bool,
    relay_phases: u8,
) -> Result<WallboxData> {
    let mut wb_error = WbError::from_vendor_code(parse_u32(json, "err")?);
    let car_status = CarStatus::try_from(parse_u32(json, "car")? as u8)
        .map_err(|e| PvControlError::api(e))?;
    let max_current = parse_u32(json, "amp")? as u8;
    let allow_charging = parse_u32(json, "alw")? == 1;
    let pha = parse_u32(json, "pha")?;
    let phases_in = (pha >> 3 & 1) + (pha >> 4 & 1) + (pha >> 5 & 1);
    let phases_out = ((pha & 1) + (pha >> 1 & 1) + (pha >> 2 & 1)).min(phases_in);
    let power = json["nrg"][11]
        .as_f64()
        .ok_or_else(|| PvControlError::api("bad wallbox status field 'nrg'"))?
        * 10.0;
    let charged_energy = f64::from(parse_u32(json, "dws")?) / 360.0;
    let total_energy = f64::from(parse_u32(json, "eto")?) * 100.0;
    let temperature = parse_f64(json, "tmp");

    // check if phases_in is consistent with the phase relay, WB errors dominate
    if relay_enabled && wb_error == WbError::Ok && phases_in as u8 != relay_phases {
        wb_error = WbError::PhaseRelayErr;
    }

    Ok(WallboxData {
        error: 0,
        wb_error,
        car_status,
        max_current,
        allow_charging,
        phases_in: phases_in as u8,
        phases_out: phases_out as u8,
        power,
        charged_energy,
        total_energy,
        temperature,
    })
}

pub struct WallboxFactory;

impl WallboxFactory {
    pub fn new_wallbox(
        type_tag: &str,
        relay: SharedPhaseRelay,
        section: &serde_json::Value,
    ) -> Result<SharedWallbox> {
        match type_tag {
            "SimulatedWallbox" => Ok(Arc::new(Mutex::new(SimulatedWallbox::new(parse_section(
                section, "wallbox",
            )?)))),
            "SimulatedWallboxWithRelay" => Ok(Arc::new(Mutex::new(
                SimulatedWallboxWithRelay::new(parse_section(section, "wallbox")?, relay),
            ))),
            "GoeWallbox" => Ok(Arc::new(Mutex::new(GoeWallbox::new(
                parse_section(section, "wallbox")?,
                relay,
            )?))),
            _ => Err(PvControlError::config(format!(
                "Bad wallbox type: {}",
                type_tag
            ))),
        }
    }
}
