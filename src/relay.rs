//! Phase relay abstraction
//!
//! The external contactor switches the wallbox input between one-phase and
//! three-phase mains. Two variants exist behind one trait: `Disabled` (no
//! physical relay installed, phases always 0) and a simulated active relay.
//! The GPIO-driven hardware relay is wired in by the deployment and follows
//! the same trait. Whether the relay position means 1 or 3 phases depends on
//! how the contactor is wired (normally-open vs normally-closed).

use crate::config::parse_section;
use crate::error::{PvControlError, Result};
use crate::logging::get_logger;
use crate::metrics::METRICS;
use crate::service::{ServiceData, ServiceState, ServiceView};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Relay wiring dialect: which relay position selects 3 phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseRelayType {
    /// Normally open: relay on = 3 phases
    NO,
    /// Normally closed: relay on = 1 phase
    NC,
}

impl PhaseRelayType {
    pub fn phases_to_relay(self, phases: u8) -> bool {
        match self {
            PhaseRelayType::NO => phases == 3,
            PhaseRelayType::NC => phases == 1,
        }
    }

    pub fn relay_to_phases(self, relay: bool) -> u8 {
        match self {
            PhaseRelayType::NO => {
                if relay { 3 } else { 1 }
            }
            PhaseRelayType::NC => {
                if relay { 1 } else { 3 }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseRelayConfig {
    pub enable_phase_switching: bool,
    /// Hostname that owns the relay; empty = every host
    pub installed_on_host: String,
    pub phase_relay_type: PhaseRelayType,
}

impl Default for PhaseRelayConfig {
    fn default() -> Self {
        Self {
            enable_phase_switching: true,
            installed_on_host: String::new(),
            phase_relay_type: PhaseRelayType::NO,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseRelayData {
    pub error: u32,
    pub enabled: bool,
    pub phase_relay: bool,
    /// 0 = disabled, otherwise 1 or 3
    pub phases: u8,
}

impl ServiceData for PhaseRelayData {
    fn set_error(&mut self, error: u32) {
        self.error = error;
    }
}

/// Two-position switch mapping relay state to 1 or 3 phases.
pub trait PhaseRelay: Send {
    fn is_enabled(&self) -> bool;
    fn get_phases(&mut self) -> u8;
    /// Idempotent; values outside {1, 3} are ignored.
    fn set_phases(&mut self, phases: u8);
    fn get_data(&self) -> PhaseRelayData;
    fn view(&self) -> ServiceView;
}

pub type SharedPhaseRelay = Arc<Mutex<dyn PhaseRelay + Send>>;

/// No relay installed: phases report 0 and sets are no-ops.
pub struct DisabledPhaseRelay {
    service: ServiceState<PhaseRelayConfig, PhaseRelayData>,
}

impl DisabledPhaseRelay {
    pub fn new(config: PhaseRelayConfig) -> Self {
        let mut service = ServiceState::new("DisabledPhaseRelay", config, PhaseRelayData::default());
        service.set_data(PhaseRelayData {
            error: 0,
            enabled: false,
            phase_relay: false,
            phases: 0,
        });
        METRICS.phase_relay.set(0);
        METRICS.phase_relay_phases.set(0);
        Self { service }
    }
}

impl PhaseRelay for DisabledPhaseRelay {
    fn is_enabled(&self) -> bool {
        false
    }

    fn get_phases(&mut self) -> u8 {
        0
    }

    fn set_phases(&mut self, _phases: u8) {}

    fn get_data(&self) -> PhaseRelayData {
        self.service.data()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }
}

/// In-memory active relay used by simulation setups and tests.
pub struct SimulatedPhaseRelay {
    service: ServiceState<PhaseRelayConfig, PhaseRelayData>,
    channel: bool,
    logger: crate::logging::StructuredLogger,
}

impl SimulatedPhaseRelay {
    pub fn new(config: PhaseRelayConfig) -> Self {
        let mut relay = Self {
            service: ServiceState::new("SimulatedPhaseRelay", config, PhaseRelayData::default()),
            channel: false,
            logger: get_logger("relay"),
        };
        relay.update_relay_state(relay.channel);
        relay
    }

    fn update_relay_state(&mut self, channel: bool) {
        let phases = self.service.config().phase_relay_type.relay_to_phases(channel);
        self.channel = channel;
        self.service.set_data(PhaseRelayData {
            error: 0,
            enabled: true,
            phase_relay: channel,
            phases,
        });
        METRICS.phase_relay.set(i64::from(channel));
        METRICS.phase_relay_phases.set(i64::from(phases));
    }
}

impl PhaseRelay for SimulatedPhaseRelay {
    fn is_enabled(&self) -> bool {
        true
    }

    fn get_phases(&mut self) -> u8 {
        let channel = self.channel;
        self.update_relay_state(channel);
        self.service.data_ref().phases
    }

    fn set_phases(&mut self, phases: u8) {
        if phases != 1 && phases != 3 {
            return;
        }
        let channel = self.service.config().phase_relay_type.phases_to_relay(phases);
        if channel != self.channel {
            self.logger
                .info(&format!("Switching phase relay: phases={}", phases));
        }
        self.update_relay_state(channel);
    }

    fn get_data(&self) -> PhaseRelayData {
        self.service.data()
    }

    fn view(&self) -> ServiceView {
        self.service.view()
    }
}

pub struct PhaseRelayFactory;

impl PhaseRelayFactory {
    /// The relay is active only when phase switching is enabled and this
    /// process runs on the host the relay is attached to. The same binary is
    /// deployed on several hosts; only one of them owns the contactor.
    pub fn new_phase_relay(
        type_tag: &str,
        hostname: &str,
        section: &serde_json::Value,
    ) -> Result<SharedPhaseRelay> {
        let config: PhaseRelayConfig = parse_section(section, "relay")?;
        let active = config.enable_phase_switching
            && (config.installed_on_host.is_empty() || config.installed_on_host == hostname);
        match type_tag {
            "Disabled" => Ok(Arc::new(Mutex::new(DisabledPhaseRelay::new(config)))),
            "Simulated" if active => Ok(Arc::new(Mutex::new(SimulatedPhaseRelay::new(config)))),
            "Simulated" => Ok(Arc::new(Mutex::new(DisabledPhaseRelay::new(config)))),
            _ => Err(PvControlError::config(format!(
                "Bad relay type: {}",
                type_tag
            ))),
        }
    }
}
