//! Prometheus collectors for pvcontrol
//!
//! All metric names are consumed by dashboards and must stay stable. The
//! collectors live in one process-wide registry; services update them from
//! their `read_data` paths and the controller from its tick.

use once_cell::sync::Lazy;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Process-wide metrics handle
pub static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

pub struct Metrics {
    pub registry: Registry,

    /// Error counter per service. 0 = ok.
    pub error: IntGaugeVec,

    pub meter_power: GaugeVec,
    pub meter_power_consumption_total: Gauge,

    pub wallbox_power: Gauge,
    pub wallbox_phases_in: IntGauge,
    pub wallbox_phases_out: IntGauge,
    pub wallbox_max_current: IntGauge,
    pub wallbox_allow_charging: IntGauge,
    pub wallbox_car_status: IntGauge,
    pub wallbox_temperature: Gauge,

    pub phase_relay: IntGauge,
    pub phase_relay_phases: IntGauge,

    pub controller_mode: IntGaugeVec,
    pub controller_total_charged_energy: Counter,
    pub controller_charged_energy: CounterVec,
    pub controller_processing: Histogram,

    pub car_soc: Gauge,
    pub car_cruising_range: Gauge,
    pub car_mileage: Gauge,
    pub car_energy_consumption: Counter,
}

#[allow(clippy::unwrap_used)] // collector construction with literal names cannot fail
impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let error = IntGaugeVec::new(
            Opts::new("pvcontrol_error", "Error counter per service. 0 = ok."),
            &["service"],
        )
        .unwrap();

        let meter_power = GaugeVec::new(
            Opts::new("pvcontrol_meter_power_watts", "Power from pv or grid"),
            &["source"],
        )
        .unwrap();
        let meter_power_consumption_total = Gauge::new(
            "pvcontrol_meter_power_consumption_total_watts",
            "Total home power consumption",
        )
        .unwrap();

        let wallbox_power =
            Gauge::new("pvcontrol_wallbox_power_watts", "Wallbox total power").unwrap();
        let wallbox_phases_in = IntGauge::new(
            "pvcontrol_wallbox_phases_in",
            "Number of phases before wallbox (0..3)",
        )
        .unwrap();
        let wallbox_phases_out = IntGauge::new(
            "pvcontrol_wallbox_phases_out",
            "Number of phases for charging after wallbox (0..3)",
        )
        .unwrap();
        let wallbox_max_current = IntGauge::new(
            "pvcontrol_wallbox_max_current_amperes",
            "Max current per phase",
        )
        .unwrap();
        let wallbox_allow_charging = IntGauge::new(
            "pvcontrol_wallbox_allow_charging",
            "Wallbox allows charging",
        )
        .unwrap();
        let wallbox_car_status =
            IntGauge::new("pvcontrol_wallbox_car_status", "Wallbox car status").unwrap();
        let wallbox_temperature = Gauge::new(
            "pvcontrol_wallbox_temperature_celsius",
            "Wallbox temperature",
        )
        .unwrap();

        let phase_relay = IntGauge::new(
            "pvcontrol_phase_relay",
            "Phase switch relay status (off/on)",
        )
        .unwrap();
        let phase_relay_phases = IntGauge::new(
            "pvcontrol_phase_relay_phases",
            "Number of phases switched by relay (1 or 3), 0 = disabled",
        )
        .unwrap();

        let controller_mode = IntGaugeVec::new(
            Opts::new("pvcontrol_controller_mode", "Charge controller mode"),
            &["mode"],
        )
        .unwrap();
        let controller_total_charged_energy = Counter::new(
            "pvcontrol_controller_total_charged_energy_wh_total",
            "Total charged energy",
        )
        .unwrap();
        let controller_charged_energy = CounterVec::new(
            Opts::new(
                "pvcontrol_controller_charged_energy_wh_total",
                "Charged energy by source",
            ),
            &["source"],
        )
        .unwrap();
        let controller_processing = Histogram::with_opts(HistogramOpts::new(
            "pvcontrol_controller_processing_seconds",
            "Time spent processing control loop",
        ))
        .unwrap();

        let car_soc = Gauge::new("pvcontrol_car_soc_ratio", "State of Charge").unwrap();
        let car_cruising_range = Gauge::new(
            "pvcontrol_car_cruising_range_meters",
            "Remaining cruising range",
        )
        .unwrap();
        let car_mileage = Gauge::new("pvcontrol_car_mileage_meters", "Mileage").unwrap();
        let car_energy_consumption =
            Counter::new("pvcontrol_car_energy_consumption_wh", "Energy Consumption").unwrap();

        for c in [
            Box::new(error.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(meter_power.clone()),
            Box::new(meter_power_consumption_total.clone()),
            Box::new(wallbox_power.clone()),
            Box::new(wallbox_phases_in.clone()),
            Box::new(wallbox_phases_out.clone()),
            Box::new(wallbox_max_current.clone()),
            Box::new(wallbox_allow_charging.clone()),
            Box::new(wallbox_car_status.clone()),
            Box::new(wallbox_temperature.clone()),
            Box::new(phase_relay.clone()),
            Box::new(phase_relay_phases.clone()),
            Box::new(controller_mode.clone()),
            Box::new(controller_total_charged_energy.clone()),
            Box::new(controller_charged_energy.clone()),
            Box::new(controller_processing.clone()),
            Box::new(car_soc.clone()),
            Box::new(car_cruising_range.clone()),
            Box::new(car_mileage.clone()),
            Box::new(car_energy_consumption.clone()),
        ] {
            registry.register(c).unwrap();
        }

        Self {
            registry,
            error,
            meter_power,
            meter_power_consumption_total,
            wallbox_power,
            wallbox_phases_in,
            wallbox_phases_out,
            wallbox_max_current,
            wallbox_allow_charging,
            wallbox_car_status,
            wallbox_temperature,
            phase_relay,
            phase_relay_phases,
            controller_mode,
            controller_total_charged_energy,
            controller_charged_energy,
            controller_processing,
            car_soc,
            car_cruising_range,
            car_mileage,
            car_energy_consumption,
        }
    }

    /// Publish the active controller mode as a one-hot gauge family.
    pub fn set_controller_mode(&self, active: &str) {
        for mode in ["OFF", "PV_ONLY", "PV_ALL", "MAX", "MANUAL"] {
            self.controller_mode
                .with_label_values(&[mode])
                .set(i64::from(mode == active));
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode_text(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_mode_has_a_series_per_mode() {
        // other tests drive the controller concurrently, so only check that
        // setting a mode materializes every labelled series
        METRICS.set_controller_mode("PV_ONLY");
        let text = METRICS.encode_text();
        for mode in ["OFF", "PV_ONLY", "PV_ALL", "MAX", "MANUAL"] {
            assert!(
                text.contains(&format!("pvcontrol_controller_mode{{mode=\"{}\"}}", mode)),
                "missing series for {}",
                mode
            );
        }
    }

    #[test]
    fn text_exposition_contains_contractual_names() {
        METRICS.error.with_label_values(&["TestService"]).set(0);
        METRICS.meter_power.with_label_values(&["pv"]).set(0.0);
        let text = METRICS.encode_text();
        assert!(text.contains("pvcontrol_error"));
        assert!(text.contains("pvcontrol_meter_power_watts"));
    }
}
