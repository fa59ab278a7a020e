//! Charge controller
//!
//! The cyclic policy engine. Each tick reads wallbox and meter, accounts the
//! charged energy by source, applies charge-mode transitions, converges the
//! phase count through the relay and finally computes the current setpoint
//! with hysteresis, rounding and the allow-charging debounce. At most one
//! electrically relevant change is issued per tick: either a phase action
//! (relay switch or wallbox reset) or the current/allow writes.

use crate::config::parse_section;
use crate::error::Result;
use crate::logging::get_logger;
use crate::meter::{Meter, MeterData, SharedMeter};
use crate::metrics::METRICS;
use crate::relay::{PhaseRelay, SharedPhaseRelay};
use crate::service::{ServiceData, ServiceState, ServiceView};
use crate::wallbox::{CarStatus, SharedWallbox, Wallbox, WallboxData, WbError};
use serde::{Deserialize, Serialize};

/// [s] unplugged car debounce until the controller switches itself off
const PV_TO_OFF_DELAY: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargeMode {
    /// Controller disables charging once, then goes passive
    Off,
    PvOnly,
    PvAll,
    /// Full power charge, then the controller goes passive
    Max,
    Manual,
}

impl ChargeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChargeMode::Off => "OFF",
            ChargeMode::PvOnly => "PV_ONLY",
            ChargeMode::PvAll => "PV_ALL",
            ChargeMode::Max => "MAX",
            ChargeMode::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseMode {
    /// No phase relay installed
    #[serde(rename = "DISABLED")]
    Disabled,
    #[serde(rename = "AUTO")]
    Auto,
    #[serde(rename = "CHARGE_1P")]
    Charge1P,
    #[serde(rename = "CHARGE_3P")]
    Charge3P,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Home battery first while its SoC is below the configured threshold
    Auto,
    HomeBattery,
    Car,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeControllerData {
    pub error: u32,
    pub mode: ChargeMode,
    pub desired_mode: ChargeMode,
    pub phase_mode: PhaseMode,
    pub priority: Priority,
    pub desired_priority: Priority,
}

impl Default for ChargeControllerData {
    fn default() -> Self {
        Self {
            error: 0,
            mode: ChargeMode::Off,
            desired_mode: ChargeMode::Off,
            phase_mode: PhaseMode::Auto,
            priority: Priority::Auto,
            desired_priority: Priority::Auto,
        }
    }
}

impl ServiceData for ChargeControllerData {
    fn set_error(&mut self, error: u32) {
        self.error = error;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChargeControllerConfig {
    /// [s] control loop cycle time
    pub cycle_time: u32,
    pub enable_auto_phase_switching: bool,
    /// Mode to enable when a car is plugged in while the controller is off
    pub enable_charging_when_connecting_car: ChargeMode,
    /// [V]
    pub line_voltage: f64,
    /// [A] offset for max_current rounding
    pub current_rounding_offset: f64,
    /// [W] hysteresis for switching on/off and between 1 and 3 phases
    pub power_hysteresis: f64,
    /// [W] min available power for charging in mode PV_ALL
    pub pv_all_min_power: f64,
    /// [s] min delay between allow_charging switches in PV modes
    pub pv_allow_charging_delay: u32,
    /// [%] home battery SoC below which priority AUTO resolves to HOME_BATTERY
    pub prio_auto_soc_threshold: f64,
}

impl Default for ChargeControllerConfig {
    fn default() -> Self {
        Self {
            cycle_time: 30,
            enable_auto_phase_switching: true,
            enable_charging_when_connecting_car: ChargeMode::Off,
            line_voltage: 230.0,
            current_rounding_offset: 0.1,
            power_hysteresis: 200.0,
            pv_all_min_power: 500.0,
            pv_allow_charging_delay: 120,
            prio_auto_soc_threshold: 50.0,
        }
    }
}

pub struct ChargeController {
    service: ServiceState<ChargeControllerConfig, ChargeControllerData>,
    meter: SharedMeter,
    wallbox: SharedWallbox,
    logger: crate::logging::StructuredLogger,

    min_supported_current: u8,
    max_supported_current: u8,
    phase_switching_disabled: bool,

    // derived thresholds [W]
    pv_only_on: f64,
    pv_only_off: f64,
    pv_only_1_3_phase_threshold: f64,
    pv_only_3_1_phase_threshold: f64,
    pv_all_on: f64,
    pv_all_off: f64,
    pv_all_1_3_phase_threshold: f64,
    pv_all_3_1_phase_threshold: f64,

    // charged-energy accounting snapshots [Wh]
    last_charged_energy: f64,
    last_charged_energy_5m: f64,
    last_energy_consumption: f64,
    last_energy_consumption_grid: f64,
    total_charged_energy: f64,
    charged_energy_grid: f64,
    charged_energy_pv: f64,

    // debounce state [s]
    pv_to_off_delay: f64,
    allow_charging_delay: f64,
    last_allow_request: Option<bool>,
}

impl ChargeController {
    pub async fn new(
        config: ChargeControllerConfig,
        meter: SharedMeter,
        wallbox: SharedWallbox,
        relay: SharedPhaseRelay,
    ) -> Self {
        let wb_config = wallbox.lock().await.get_config();
        let relay_enabled = relay.lock().await.is_enabled();

        let min = f64::from(wb_config.min_supported_current);
        let max = f64::from(wb_config.max_supported_current);
        let min_power_1phase = min * config.line_voltage;
        let max_power_1phase = max * config.line_voltage;
        let min_power_3phases = 3.0 * min * config.line_voltage;

        let mut data = ChargeControllerData::default();
        if !relay_enabled {
            data.phase_mode = PhaseMode::Disabled;
        }
        let mut service = ServiceState::new("ChargeController", config, data);
        service.set_data(data);

        Self {
            min_supported_current: wb_config.min_supported_current,
            max_supported_current: wb_config.max_supported_current,
            phase_switching_disabled: !relay_enabled,
            pv_only_on: min_power_1phase + config.power_hysteresis,
            pv_only_off: min_power_1phase,
            pv_only_1_3_phase_threshold: min_power_3phases + config.power_hysteresis,
            pv_only_3_1_phase_threshold: min_power_3phases,
            pv_all_on: config.pv_all_min_power,
            pv_all_off: (config.pv_all_min_power - config.power_hysteresis).max(100.0),
            pv_all_1_3_phase_threshold: max_power_1phase,
            pv_all_3_1_phase_threshold: max_power_1phase - config.power_hysteresis,
            service,
            meter,
            wallbox,
            logger: get_logger("controller"),
            last_charged_energy: 0.0,
            last_charged_energy_5m: 0.0,
            last_energy_consumption: 0.0,
            last_energy_consumption_grid: 0.0,
            total_charged_energy: 0.0,
            charged_energy_grid: 0.0,
            charged_energy_pv: 0.0,
            pv_to_off_delay: PV_TO_OFF_DELAY,
            allow_charging_delay: 0.0,
            last_allow_request: None,
        }
    }

    pub fn get_config(&self) -> ChargeControllerConfig {
        *self.service.config()
    }

    pub fn get_data(&self) -> ChargeControllerData {
        self.service.data()
    }

    pub fn view(&self) -> ServiceView {
        self.service.view()
    }

    pub fn set_desired_mode(&mut self, mode: ChargeMode) {
        self.service.data_mut().desired_mode = mode;
    }

    pub fn set_phase_mode(&mut self, mode: PhaseMode) {
        if self.phase_switching_disabled {
            self.logger
                .warn(&format!("Ignoring phase_mode={:?}: no phase relay", mode));
            return;
        }
        self.service.data_mut().phase_mode = mode;
    }

    pub fn set_desired_priority(&mut self, priority: Priority) {
        self.service.data_mut().desired_priority = priority;
    }

    /// [Wh] charged energy since process start
    pub fn total_charged_energy(&self) -> f64 {
        self.total_charged_energy
    }

    /// [Wh] charged energy attributed to grid import
    pub fn charged_energy_grid(&self) -> f64 {
        self.charged_energy_grid
    }

    /// [Wh] charged energy attributed to PV surplus
    pub fn charged_energy_pv(&self) -> f64 {
        self.charged_energy_pv
    }

    /// One control loop cycle.
    pub async fn run(&mut self) -> Result<()> {
        let timer = METRICS.controller_processing.start_timer();

        // read order matters: simulated meters derive household consumption
        // from the wallbox's cached power draw
        let wb = self.wallbox.lock().await.read_data().await;
        let m = self.meter.lock().await.read_data().await;

        self.meter_charged_energy(&m, &wb);
        self.check_charge_mode_transitions(&wb);
        self.resolve_priority(&m);

        // at most one electrically relevant change per tick
        let phase_action = self.converge_phases(&m, &wb).await;
        if !phase_action {
            self.control_charging(&m, &wb).await;
        }

        METRICS.set_controller_mode(self.service.data_ref().mode.as_str());
        timer.observe_duration();
        Ok(())
    }

    /// Account charged energy, split into grid and PV by the meter's energy
    /// counters. The meter counters update roughly every 5 minutes; the
    /// cadence is inferred from the consumption counter moving, not from the
    /// clock.
    fn meter_charged_energy(&mut self, m: &MeterData, wb: &WallboxData) {
        let mut delta_charged = wb.charged_energy - self.last_charged_energy;
        if delta_charged < -1.0 {
            // session counter was reset at charge end
            delta_charged = wb.charged_energy;
        }
        let delta_charged = delta_charged.max(0.0);
        if delta_charged > 0.0 {
            self.total_charged_energy += delta_charged;
            METRICS.controller_total_charged_energy.inc_by(delta_charged);
        }

        if wb.allow_charging {
            if m.energy_consumption - self.last_energy_consumption > 1.0 {
                let delta_grid =
                    (m.energy_consumption_grid - self.last_energy_consumption_grid).max(0.0);
                let mut window = wb.charged_energy - self.last_charged_energy_5m;
                if window < -1.0 {
                    window = wb.charged_energy;
                }
                let window = window.max(0.0);
                let charged_from_grid = delta_grid.min(window);
                let charged_from_pv = window - charged_from_grid;
                self.charged_energy_grid += charged_from_grid;
                self.charged_energy_pv += charged_from_pv;
                METRICS
                    .controller_charged_energy
                    .with_label_values(&["grid"])
                    .inc_by(charged_from_grid);
                METRICS
                    .controller_charged_energy
                    .with_label_values(&["pv"])
                    .inc_by(charged_from_pv);
                self.last_charged_energy_5m = wb.charged_energy;
            }
        } else {
            // next charge window measures from a fresh baseline
            self.last_charged_energy_5m = wb.charged_energy;
        }

        self.last_charged_energy = wb.charged_energy;
        self.last_energy_consumption = m.energy_consumption;
        self.last_energy_consumption_grid = m.energy_consumption_grid;
    }

    fn check_charge_mode_transitions(&mut self, wb: &WallboxData) {
        let cycle_time = f64::from(self.service.config().cycle_time);
        let mode = self.service.data_ref().mode;

        // unplugging the car drives the controller to OFF, debounced
        if matches!(mode, ChargeMode::PvOnly | ChargeMode::PvAll)
            && wb.error == 0
            && wb.car_status == CarStatus::NoVehicle
        {
            self.pv_to_off_delay -= cycle_time;
            if self.pv_to_off_delay <= 0.0 {
                self.logger.info("No vehicle, switching off");
                self.service.data_mut().desired_mode = ChargeMode::Off;
                self.pv_to_off_delay = PV_TO_OFF_DELAY;
            }
        } else {
            self.pv_to_off_delay = PV_TO_OFF_DELAY;
        }

        // plugging in a car while off enables the configured mode
        let connect_mode = self.service.config().enable_charging_when_connecting_car;
        if self.service.data_ref().mode == ChargeMode::Off
            && wb.error == 0
            && wb.car_status == CarStatus::WaitingForVehicle
            && connect_mode != ChargeMode::Off
        {
            self.logger
                .info(&format!("Car connected, enabling {}", connect_mode.as_str()));
            self.service.data_mut().desired_mode = connect_mode;
        }
    }

    fn resolve_priority(&mut self, m: &MeterData) {
        let resolved = match self.service.data_ref().desired_priority {
            Priority::Auto => {
                if m.soc_battery < self.service.config().prio_auto_soc_threshold {
                    Priority::HomeBattery
                } else {
                    Priority::Car
                }
            }
            p => p,
        };
        self.service.data_mut().priority = resolved;
    }

    /// Converge `phases_in` to the desired phase count. Returns true when a
    /// phase action (reset, relay switch or charging stop) was issued; the
    /// caller then skips the current setpoint for this tick.
    async fn converge_phases(&mut self, m: &MeterData, wb: &WallboxData) -> bool {
        // self-heal phase errors with a wallbox reset, once per tick
        if wb.error == 0 && matches!(wb.wb_error, WbError::Phase | WbError::PhaseRelayErr) {
            self.logger.warn(&format!(
                "Wallbox error {:?}, triggering reset",
                wb.wb_error
            ));
            self.wallbox.lock().await.trigger_reset().await;
            return true;
        }

        // the wallbox is a controllable load already included in consumption
        let available_power = -m.power_grid + wb.power;
        let desired_phases = self.desired_phases(available_power, wb.phases_in);
        if desired_phases != wb.phases_in && wb.error == 0 {
            if wb.phases_out == 0 {
                self.wallbox.lock().await.set_phases_in(desired_phases).await;
            } else {
                // charging off and wait one cycle
                self.allow_charging(false, true).await;
            }
            return true;
        }
        false
    }

    fn desired_phases(&self, available_power: f64, current_phases: u8) -> u8 {
        let data = self.service.data_ref();
        match data.phase_mode {
            PhaseMode::Charge1P => 1,
            PhaseMode::Charge3P => 3,
            PhaseMode::Disabled => current_phases,
            PhaseMode::Auto => match data.desired_mode {
                ChargeMode::PvOnly => {
                    if !self.service.config().enable_auto_phase_switching {
                        1
                    } else if current_phases == 1 {
                        if available_power >= self.pv_only_1_3_phase_threshold { 3 } else { 1 }
                    } else if available_power < self.pv_only_3_1_phase_threshold {
                        1
                    } else {
                        3
                    }
                }
                ChargeMode::PvAll => {
                    if !self.service.config().enable_auto_phase_switching {
                        1
                    } else if current_phases == 1 {
                        if available_power >= self.pv_all_1_3_phase_threshold { 3 } else { 1 }
                    } else if available_power < self.pv_all_3_1_phase_threshold {
                        1
                    } else {
                        3
                    }
                }
                ChargeMode::Max => 3,
                ChargeMode::Off | ChargeMode::Manual => current_phases,
            },
        }
    }

    async fn control_charging(&mut self, m: &MeterData, wb: &WallboxData) {
        let config = *self.service.config();
        let desired_mode = self.service.data_ref().desired_mode;
        match desired_mode {
            ChargeMode::Off => {
                self.allow_charging(false, true).await;
                let data = self.service.data_mut();
                data.desired_mode = ChargeMode::Manual;
                data.mode = ChargeMode::Off;
            }
            ChargeMode::Max => {
                let max = self.max_supported_current;
                self.set_max_current(max).await;
                self.allow_charging(true, true).await;
                let data = self.service.data_mut();
                data.desired_mode = ChargeMode::Manual;
                data.mode = ChargeMode::Max;
            }
            ChargeMode::Manual => {
                // report the effective mode the wallbox is left in
                let mode = if !wb.allow_charging {
                    ChargeMode::Off
                } else if wb.max_current == self.max_supported_current {
                    ChargeMode::Max
                } else {
                    ChargeMode::Manual
                };
                self.service.data_mut().mode = mode;
                self.allow_charging_delay = 0.0;
            }
            ChargeMode::PvOnly | ChargeMode::PvAll => {
                let phases = if wb.phases_out != 0 { wb.phases_out } else { wb.phases_in };
                let mut available_power = -m.power_grid + wb.power;
                match self.service.data_ref().priority {
                    Priority::HomeBattery => {
                        // do not drain the home battery into the car
                        if m.power_battery > 0.0 {
                            available_power -= m.power_battery;
                        }
                    }
                    // CAR: neither charge nor discharge the home battery
                    _ => available_power -= m.power_battery,
                }

                let volts = config.line_voltage;
                let offset = config.current_rounding_offset;
                let min = i32::from(self.min_supported_current);
                let mut max_current: i32 = match desired_mode {
                    ChargeMode::PvOnly => {
                        if !wb.allow_charging && available_power < self.pv_only_on {
                            0
                        } else {
                            let a = (available_power / volts / f64::from(phases) + offset).floor()
                                as i32;
                            if a < min { 0 } else { a }
                        }
                    }
                    _ => {
                        if (!wb.allow_charging && available_power < self.pv_all_on)
                            || available_power < self.pv_all_off
                        {
                            0
                        } else {
                            let a = (available_power / volts / f64::from(phases) - offset).ceil()
                                as i32;
                            if a < min { min } else { a }
                        }
                    }
                };
                if max_current > i32::from(self.max_supported_current) {
                    max_current = i32::from(self.max_supported_current);
                }
                let desired_allow = max_current > 0;
                if !desired_allow {
                    // the wallbox always gets a valid current, even while denied
                    max_current = min;
                }
                self.set_max_current(max_current as u8).await;

                if wb.allow_charging != desired_allow {
                    self.allow_charging_delay -= f64::from(config.cycle_time);
                    if self.allow_charging_delay <= 0.0 {
                        self.allow_charging(desired_allow, false).await;
                    }
                } else {
                    self.allow_charging_delay = f64::from(config.pv_allow_charging_delay);
                }
                self.service.data_mut().mode = desired_mode;
            }
        }
    }

    async fn set_max_current(&mut self, max_current: u8) {
        self.wallbox.lock().await.set_max_current(max_current).await;
    }

    /// Forward to the wallbox, remembering the request and re-arming the
    /// debounce timer (cleared entirely with `skip_delay`).
    async fn allow_charging(&mut self, flag: bool, skip_delay: bool) {
        if self.last_allow_request != Some(flag) {
            self.logger.info(&format!("allow_charging={}", flag));
            self.last_allow_request = Some(flag);
        }
        self.allow_charging_delay = if skip_delay {
            0.0
        } else {
            f64::from(self.service.config().pv_allow_charging_delay)
        };
        self.wallbox.lock().await.allow_charging(flag).await;
    }
}

pub struct ChargeControllerFactory;

impl ChargeControllerFactory {
    pub async fn new_controller(
        meter: SharedMeter,
        wallbox: SharedWallbox,
        relay: SharedPhaseRelay,
        section: &serde_json::Value,
    ) -> Result<ChargeController> {
        let config: ChargeControllerConfig = parse_section(section, "controller")?;
        Ok(ChargeController::new(config, meter, wallbox, relay).await)
    }
}
