//! Table-driven PV charge-control scenarios over the simulated wallbox and
//! the deterministic test meter. Every step runs one full controller tick,
//! then re-reads wallbox and meter so the expectations describe the settled
//! state of that tick (the extra simulated energy increment is rewound).

use pvcontrol::controller::{
    ChargeController, ChargeControllerConfig, ChargeMode, PhaseMode, Priority,
};
use pvcontrol::meter::{Meter as _, SharedMeter, TestMeter, TestMeterConfig};
use pvcontrol::relay::{PhaseRelayConfig, SharedPhaseRelay, SimulatedPhaseRelay};
use pvcontrol::wallbox::{
    CarStatus, SharedWallbox, SimulatedWallbox, Wallbox as _, WallboxConfig,
};
use std::sync::Arc;
use tokio::sync::Mutex;

struct Setup {
    wallbox: Arc<Mutex<SimulatedWallbox>>,
    meter: Arc<Mutex<TestMeter>>,
    controller: ChargeController,
}

async fn setup_with(config: ChargeControllerConfig, battery_max: f64) -> Setup {
    let wallbox = Arc::new(Mutex::new(SimulatedWallbox::new(WallboxConfig::default())));
    let shared_wallbox: SharedWallbox = wallbox.clone();
    let meter = Arc::new(Mutex::new(TestMeter::new(
        TestMeterConfig {
            battery_max,
            soc_battery: 0.0,
        },
        wallbox.clone(),
    )));
    let shared_meter: SharedMeter = meter.clone();
    let relay: SharedPhaseRelay = Arc::new(Mutex::new(SimulatedPhaseRelay::new(
        PhaseRelayConfig::default(),
    )));
    let mut controller =
        ChargeController::new(config, shared_meter, shared_wallbox, relay).await;
    controller.run().await.unwrap(); // init tick: OFF -> passive
    Setup {
        wallbox,
        meter,
        controller,
    }
}

async fn setup() -> Setup {
    setup_with(
        ChargeControllerConfig {
            pv_allow_charging_delay: 0,
            ..ChargeControllerConfig::default()
        },
        0.0,
    )
    .await
}

struct Step {
    test: &'static str,
    pv: f64,
    home: f64,
    car: Option<CarStatus>,
    phases_in: u8,
    phases_out: u8,
    allow_charging: bool,
    max_current: u8,
}

impl Step {
    fn new(
        test: &'static str,
        pv: f64,
        phases_in: u8,
        phases_out: u8,
        allow_charging: bool,
        max_current: u8,
    ) -> Self {
        Self {
            test,
            pv,
            home: 0.0,
            car: None,
            phases_in,
            phases_out,
            allow_charging,
            max_current,
        }
    }

    fn car(mut self, car: CarStatus) -> Self {
        self.car = Some(car);
        self
    }
}

async fn run_steps(s: &mut Setup, steps: &[Step]) {
    for step in steps {
        s.meter.lock().await.set_data(step.pv, step.home);
        if let Some(car) = step.car {
            s.wallbox.lock().await.set_car_status(car).unwrap();
        }
        s.controller.run().await.unwrap();

        // re-read to avoid a one-cycle delay in the expectations; order
        // matters because the test meter uses the wallbox's cached power
        let wb = s.wallbox.lock().await.read_data().await;
        s.wallbox.lock().await.decrement_charge_energy_for_tests();
        let m = s.meter.lock().await.read_data().await;

        let expected_power =
            f64::from(step.phases_out) * f64::from(step.max_current) * 230.0;
        let expected_consumption = step.home + expected_power;
        let expected_grid = expected_consumption - step.pv;

        assert_eq!(wb.phases_in, step.phases_in, "{}: phases_in", step.test);
        assert_eq!(wb.phases_out, step.phases_out, "{}: phases_out", step.test);
        assert_eq!(
            wb.allow_charging, step.allow_charging,
            "{}: allow_charging",
            step.test
        );
        assert_eq!(wb.max_current, step.max_current, "{}: max_current", step.test);
        assert!(
            (wb.power - expected_power).abs() < 1e-6,
            "{}: power {} != {}",
            step.test,
            wb.power,
            expected_power
        );
        assert!(
            (m.power_grid - expected_grid).abs() < 1e-6,
            "{}: grid {} != {}",
            step.test,
            m.power_grid,
            expected_grid
        );
        // meter invariant holds on every snapshot
        assert!(
            (m.power_consumption - (m.power_pv + m.power_grid + m.power_battery)).abs() < 1e-6,
            "{}: meter power balance",
            step.test
        );
    }
}

#[tokio::test]
async fn charge_control_pv_only_auto_phases() {
    let mut s = setup().await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.controller.set_phase_mode(PhaseMode::Auto);
    let steps = [
        Step::new("enable mode, no PV", 0.0, 1, 0, false, 16),
        Step::new("1.4kW PV, off", 1400.0, 1, 0, false, 6),
        Step::new("3kW PV, 1x13A", 3000.0, 1, 1, true, 13).car(CarStatus::Charging),
        Step::new("3kW PV, 1x13A again", 3000.0, 1, 1, true, 13),
        Step::new("4kW PV, 1x16A", 4000.0, 1, 1, true, 16),
        Step::new("4.3kW PV, 1x16A", 4300.0, 1, 1, true, 16),
        Step::new("4.5kW PV, charging off for switch", 4500.0, 1, 0, false, 16),
        Step::new("4.5kW PV, relay to 3 phases", 4500.0, 3, 0, false, 16),
        Step::new("4.5kW PV, 3x6A", 4500.0, 3, 3, true, 6),
        Step::new("6kW PV, 3x8A", 6000.0, 3, 3, true, 8),
        Step::new("4.3kW PV, 3x6A", 4300.0, 3, 3, true, 6),
        Step::new("4kW PV, charging off for switch", 4000.0, 3, 0, false, 6),
        Step::new("4kW PV, relay to 1 phase", 4000.0, 1, 0, false, 6),
        Step::new("4kW PV, 1x16A again", 4000.0, 1, 1, true, 16),
        Step::new("1.4kW PV, 1x6A", 1400.0, 1, 1, true, 6),
        Step::new("1kW PV, off", 1000.0, 1, 0, false, 6).car(CarStatus::ChargingFinished),
    ];
    run_steps(&mut s, &steps).await;
}

#[tokio::test]
async fn charge_control_pv_only_fixed_1p() {
    let mut s = setup().await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.controller.set_phase_mode(PhaseMode::Charge1P);
    let steps = [
        Step::new("enable mode, no PV", 0.0, 1, 0, false, 16),
        Step::new("1.4kW PV, off", 1400.0, 1, 0, false, 6),
        Step::new("3kW PV, 1x13A", 3000.0, 1, 1, true, 13).car(CarStatus::Charging),
        Step::new("4kW PV, 1x16A", 4000.0, 1, 1, true, 16),
        Step::new("5kW PV, still 1x16A", 5000.0, 1, 1, true, 16),
        Step::new("10kW PV, still 1x16A", 10000.0, 1, 1, true, 16),
        Step::new("1.4kW PV, 1x6A", 1400.0, 1, 1, true, 6),
        Step::new("1kW PV, off", 1000.0, 1, 0, false, 6),
    ];
    run_steps(&mut s, &steps).await;
}

#[tokio::test]
async fn charge_control_pv_only_fixed_3p() {
    let mut s = setup().await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.controller.set_phase_mode(PhaseMode::Charge3P);
    let steps = [
        Step::new("enable mode, no PV", 0.0, 3, 0, false, 6),
        Step::new("1.4kW PV, off", 1400.0, 3, 0, false, 6),
        Step::new("4.3kW PV, 3x6A", 4300.0, 3, 3, true, 6).car(CarStatus::Charging),
        Step::new("6kW PV, 3x8A", 6000.0, 3, 3, true, 8),
        Step::new("4.3kW PV, 3x6A", 4300.0, 3, 3, true, 6),
        Step::new("4kW PV, off below 3x6A", 4000.0, 3, 0, false, 6),
        Step::new("1.4kW PV, off", 1400.0, 3, 0, false, 6),
        Step::new("1kW PV, off", 1000.0, 3, 0, false, 6),
    ];
    run_steps(&mut s, &steps).await;
}

#[tokio::test]
async fn charge_control_pv_all_auto_phases() {
    let mut s = setup().await;
    s.controller.set_desired_mode(ChargeMode::PvAll);
    let steps = [
        Step::new("enable mode, no PV", 0.0, 1, 0, false, 16),
        Step::new("0.3kW PV, off", 300.0, 1, 0, false, 6),
        Step::new("3kW PV, 1x13A", 3000.0, 1, 1, true, 13).car(CarStatus::Charging),
        Step::new("3.5kW PV, 1x16A", 3500.0, 1, 1, true, 16),
        Step::new("4.3kW PV, charging off for switch", 4300.0, 1, 0, false, 16),
        Step::new("4.3kW PV, relay to 3 phases", 4300.0, 3, 0, false, 16),
        Step::new("4.3kW PV, 3x7A", 4300.0, 3, 3, true, 7),
        // 4890/(3*230) = 7.087 -> ceil(7.087 - 0.1) = 7
        Step::new("4.89kW PV, 3x7A (rounding offset)", 4890.0, 3, 3, true, 7),
        Step::new("6kW PV, 3x9A", 6000.0, 3, 3, true, 9),
        Step::new("3.5kW PV, 3x6A", 3500.0, 3, 3, true, 6),
        Step::new("3kW PV, charging off for switch", 3000.0, 3, 0, false, 6),
        Step::new("3kW PV, relay to 1 phase", 3000.0, 1, 0, false, 6),
        Step::new("3kW PV, 1x13A again", 3000.0, 1, 1, true, 13),
        Step::new("0.4kW PV, 1x6A grid assisted", 400.0, 1, 1, true, 6),
        Step::new("0.2kW PV, off", 200.0, 1, 0, false, 6),
    ];
    run_steps(&mut s, &steps).await;
}

#[tokio::test]
async fn charge_control_pv_all_allow_charging_delay() {
    let mut s = setup_with(
        ChargeControllerConfig {
            pv_allow_charging_delay: 60,
            ..ChargeControllerConfig::default()
        },
        0.0,
    )
    .await;
    s.controller.set_desired_mode(ChargeMode::PvAll);
    s.controller.set_phase_mode(PhaseMode::Charge3P);
    let steps = [
        // the very first transition after init is not debounced
        Step::new("enable mode, 6kW PV, 3x9A", 6000.0, 3, 3, true, 9).car(CarStatus::Charging),
        Step::new("6kW PV, 3x9A", 6000.0, 3, 3, true, 9),
        Step::new("0.2kW PV, still on (debounce)", 200.0, 3, 3, true, 6),
        Step::new("0.2kW PV, off after delay", 200.0, 3, 0, false, 6),
        Step::new("6kW PV, still off (debounce)", 6000.0, 3, 0, false, 9),
        Step::new("6kW PV, on after delay", 6000.0, 3, 3, true, 9),
        Step::new("0.2kW PV, still on (debounce)", 200.0, 3, 3, true, 6),
        Step::new("6kW PV, 3x9A stable resets debounce", 6000.0, 3, 3, true, 9),
    ];
    run_steps(&mut s, &steps).await;
}

#[tokio::test]
async fn unplugged_car_switches_off_after_five_minutes() {
    let mut s = setup().await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.controller.set_phase_mode(PhaseMode::Charge3P);
    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::Charging)
        .unwrap();
    s.meter.lock().await.set_data(6000.0, 0.0);
    s.controller.run().await.unwrap();
    assert_eq!(s.controller.get_data().mode, ChargeMode::PvOnly);

    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::NoVehicle)
        .unwrap();
    // 9 ticks of 30s: still in PV mode, wallbox stays enabled
    for tick in 1..=9 {
        s.controller.run().await.unwrap();
        assert_eq!(
            s.controller.get_data().mode,
            ChargeMode::PvOnly,
            "tick {}",
            tick
        );
        assert!(s.wallbox.lock().await.get_data().allow_charging);
    }
    // 10th tick completes the 5 minute debounce
    s.controller.run().await.unwrap();
    let data = s.controller.get_data();
    assert_eq!(data.mode, ChargeMode::Off);
    assert_eq!(data.desired_mode, ChargeMode::Manual);
    assert!(!s.wallbox.lock().await.get_data().allow_charging);

    // a brief unplug does not switch off
    let mut s = setup().await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.meter.lock().await.set_data(6000.0, 0.0);
    s.controller.run().await.unwrap();
    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::NoVehicle)
        .unwrap();
    for _ in 0..9 {
        s.controller.run().await.unwrap();
    }
    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::Charging)
        .unwrap();
    s.controller.run().await.unwrap(); // resets the debounce
    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::NoVehicle)
        .unwrap();
    s.controller.run().await.unwrap();
    assert_eq!(s.controller.get_data().mode, ChargeMode::PvOnly);
}

#[tokio::test]
async fn plugging_in_enables_configured_mode() {
    let mut s = setup_with(
        ChargeControllerConfig {
            pv_allow_charging_delay: 0,
            enable_charging_when_connecting_car: ChargeMode::PvAll,
            ..ChargeControllerConfig::default()
        },
        0.0,
    )
    .await;
    assert_eq!(s.controller.get_data().mode, ChargeMode::Off);

    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::WaitingForVehicle)
        .unwrap();
    // first tick arms the mode and converges phases, second tick publishes it
    s.controller.run().await.unwrap();
    assert_eq!(s.controller.get_data().desired_mode, ChargeMode::PvAll);
    s.controller.run().await.unwrap();
    assert_eq!(s.controller.get_data().mode, ChargeMode::PvAll);
}

#[tokio::test]
async fn home_battery_priority_limits_charge_current() {
    let mut s = setup_with(
        ChargeControllerConfig {
            pv_allow_charging_delay: 0,
            ..ChargeControllerConfig::default()
        },
        1000.0,
    )
    .await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.controller.set_phase_mode(PhaseMode::Charge1P);
    s.controller.set_desired_priority(Priority::HomeBattery);
    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::Charging)
        .unwrap();
    s.meter.lock().await.set_data(3000.0, 0.0);

    s.controller.run().await.unwrap(); // relay to 1 phase
    s.controller.run().await.unwrap();
    s.controller.run().await.unwrap();
    let wb = s.wallbox.lock().await.read_data().await;
    s.wallbox.lock().await.decrement_charge_energy_for_tests();
    let m = s.meter.lock().await.read_data().await;
    // 1000 W diverted into the home battery: 8 A instead of 13 A
    assert_eq!(wb.max_current, 8);
    assert!((wb.power - 1840.0).abs() < 1e-6);
    assert!((m.power_grid - -160.0).abs() < 1e-6);
    assert!((m.power_battery - -1000.0).abs() < 1e-6);

    // full home battery stops absorbing, the car gets everything
    s.meter.lock().await.set_soc(100.0);
    s.controller.run().await.unwrap();
    s.controller.run().await.unwrap();
    let wb = s.wallbox.lock().await.read_data().await;
    s.wallbox.lock().await.decrement_charge_energy_for_tests();
    let m = s.meter.lock().await.read_data().await;
    assert_eq!(wb.max_current, 13);
    assert!((wb.power - 2990.0).abs() < 1e-6);
    assert!((m.power_grid - -10.0).abs() < 1e-6);
}

#[tokio::test]
async fn car_priority_ignores_home_battery_charging() {
    let mut s = setup_with(
        ChargeControllerConfig {
            pv_allow_charging_delay: 0,
            ..ChargeControllerConfig::default()
        },
        1000.0,
    )
    .await;
    s.controller.set_desired_mode(ChargeMode::PvOnly);
    s.controller.set_phase_mode(PhaseMode::Charge1P);
    s.controller.set_desired_priority(Priority::Car);
    s.wallbox
        .lock()
        .await
        .set_car_status(CarStatus::Charging)
        .unwrap();
    s.meter.lock().await.set_data(3000.0, 0.0);

    s.controller.run().await.unwrap(); // relay to 1 phase
    s.controller.run().await.unwrap();
    s.controller.run().await.unwrap();
    let wb = s.wallbox.lock().await.read_data().await;
    // the power the battery would absorb is allocated to the car
    assert_eq!(wb.max_current, 13);
    assert!((wb.power - 2990.0).abs() < 1e-6);
}
