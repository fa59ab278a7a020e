use anyhow::Result;
use clap::Parser;
use pvcontrol::car::{Car as _, CarFactory};
use pvcontrol::config::Config;
use pvcontrol::controller::ChargeControllerFactory;
use pvcontrol::meter::{Meter as _, MeterFactory};
use pvcontrol::relay::PhaseRelayFactory;
use pvcontrol::scheduler::AsyncScheduler;
use pvcontrol::wallbox::{Wallbox as _, WallboxFactory};
use pvcontrol::web::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Parser)]
#[command(name = "pvcontrol", version = env!("APP_VERSION"), about = "PV surplus charge controller for an EV wallbox")]
struct Args {
    /// Meter adapter type
    #[arg(long, default_value = "SimulatedMeter")]
    meter: String,

    /// Wallbox adapter type
    #[arg(long, default_value = "SimulatedWallbox")]
    wallbox: String,

    /// Phase relay adapter type
    #[arg(long, default_value = "Disabled")]
    relay: String,

    /// Car adapter type
    #[arg(long, default_value = "NoCar")]
    car: String,

    /// Host identifier matched against relay.installed_on_host
    #[arg(long, default_value = "")]
    hostname: String,

    /// JSON configuration object with per-component sub-objects
    #[arg(long, default_value = "{}")]
    config: String,

    /// HTTP bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// HTTP port
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// URL prefix for deployments under a path
    #[arg(long, default_value = "")]
    basehref: String,

    /// Directory with the static UI bundle
    #[arg(long, default_value = "ui/dist/ui")]
    ui_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_json_str(&args.config)?;
    pvcontrol::logging::init_logging(&config.logging)?;

    info!("Starting pvcontrol {}", env!("APP_VERSION"));

    // leaves first: relay -> wallbox -> meter/car -> controller
    let relay = PhaseRelayFactory::new_phase_relay(&args.relay, &args.hostname, &config.relay)?;
    let wallbox = WallboxFactory::new_wallbox(&args.wallbox, relay.clone(), &config.wallbox)?;
    let meter = MeterFactory::new_meter(&args.meter, wallbox.clone(), &config.meter)?;
    let car = CarFactory::new_car(&args.car, &config.car)?;
    let controller = Arc::new(Mutex::new(
        ChargeControllerFactory::new_controller(
            meter.clone(),
            wallbox.clone(),
            relay.clone(),
            &config.controller,
        )
        .await?,
    ));

    let cycle_time = u64::from(controller.lock().await.get_config().cycle_time);
    let car_cycle_time = u64::from(car.lock().await.get_config().cycle_time);

    let mut controller_scheduler = AsyncScheduler::new("controller", Duration::from_secs(cycle_time), {
        let controller = controller.clone();
        move || {
            let controller = controller.clone();
            Box::pin(async move { controller.lock().await.run().await })
        }
    });
    let mut car_scheduler = AsyncScheduler::new("car", Duration::from_secs(car_cycle_time), {
        let car = car.clone();
        move || {
            let car = car.clone();
            Box::pin(async move {
                car.lock().await.read_data().await;
                Ok(())
            })
        }
    });
    controller_scheduler.start();
    car_scheduler.start();

    let state = AppState {
        version: env!("APP_VERSION").to_string(),
        controller,
        meter: meter.clone(),
        wallbox: wallbox.clone(),
        relay,
        car,
    };
    web::serve(state, &args.host, args.port, &args.basehref, &args.ui_dir).await?;

    // shutdown: stop the loops, then leave the wallbox in a safe state
    controller_scheduler.stop().await;
    car_scheduler.stop().await;
    info!("Set wallbox.allow_charging=false on shutdown");
    wallbox.lock().await.allow_charging(false).await;
    wallbox.lock().await.close().await;
    meter.lock().await.close().await;

    info!("Stopped pvcontrol");
    Ok(())
}
