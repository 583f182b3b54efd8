pub mod config;
pub mod sim;
pub mod web;

use anyhow::{Context, Result};
use clap::Parser;
use espresso_controller::sensor::spi::SoftSpi;
use espresso_controller::sensor::{Max31865, Max6675};
use espresso_controller::{
    Clock, Gpio, HeatingElement, Monitor, PidController, PowerManager, PowerPins, Pull,
    SimulatedGpio, SysfsGpio, SystemClock,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

use crate::config::{Config, PinConfig, SensorConfig, SensorKind};
use crate::web::{AppState, BoxedSampler};

/// Espresso machine controller: boiler PID, power schedule and HTTP API.
#[derive(Parser, Debug)]
#[command(name = "espresso-server", version)]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,

    /// Run against simulated pins and a boiler model instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Log every PID step
    #[arg(short, long)]
    verbose: bool,

    /// Directory with the web UI
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

/// The running control loops.
struct Controller {
    monitor: Arc<Monitor<BoxedSampler>>,
    heating: Arc<HeatingElement>,
    power: Arc<PowerManager>,
    pid: Arc<PidController<BoxedSampler>>,
    simulation: Option<JoinHandle<()>>,
}

impl Controller {
    fn start(
        config: &Config,
        gpio: &dyn Gpio,
        sensor: BoxedSampler,
        simulation: Option<JoinHandle<()>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let relay = gpio
            .output(config.pins.heating_element_relay)
            .context("acquiring heating element relay")?;
        let heating = HeatingElement::new(relay);
        let power = PowerManager::new(
            power_pins(gpio, &config.pins)?,
            config.power.schedule.clone(),
            config.power.auto_off(),
            Arc::clone(&clock),
        );
        let monitor = Monitor::new(sensor, Arc::clone(&clock));
        let pid = PidController::new(
            Arc::clone(&monitor),
            Arc::clone(&heating),
            Arc::clone(&power),
            config.pid.gains(),
            config.pid.target,
            clock,
        );

        monitor.run();
        heating.run();
        power.run();
        pid.run();
        info!(
            target = config.pid.target,
            auto_off_minutes = config.power.auto_off_minutes,
            "control loops started"
        );

        Ok(Self {
            monitor,
            heating,
            power,
            pid,
            simulation,
        })
    }

    fn state(&self) -> AppState {
        AppState {
            monitor: Arc::clone(&self.monitor),
            heating: Arc::clone(&self.heating),
            power: Arc::clone(&self.power),
            pid: Arc::clone(&self.pid),
        }
    }

    /// Actuators end up off; the monitor goes last so open streams close.
    fn shutdown(&self) {
        self.pid.shutdown();
        self.heating.shutdown();
        self.power.shutdown();
        self.monitor.shutdown();
        if let Some(simulation) = &self.simulation {
            simulation.abort();
        }
    }
}

fn power_pins(gpio: &dyn Gpio, pins: &PinConfig) -> Result<PowerPins> {
    Ok(PowerPins {
        relay: gpio
            .output(pins.power_button_relay)
            .context("acquiring power relay")?,
        button: gpio
            .input(pins.power_button, Pull::Down)
            .context("acquiring power button")?,
        led: gpio.output(pins.power_led).context("acquiring power led")?,
    })
}

fn hardware_sensor(gpio: &dyn Gpio, sensor: &SensorConfig) -> Result<BoxedSampler> {
    let cs = gpio.output(sensor.cs).context("acquiring sensor chip select")?;
    let clk = gpio.output(sensor.clk).context("acquiring sensor clock")?;
    let miso = gpio
        .input(sensor.miso, Pull::None)
        .context("acquiring sensor data in")?;

    let sampler: BoxedSampler = match sensor.kind {
        SensorKind::Max31865 => {
            let mosi = gpio
                .output(sensor.mosi)
                .context("acquiring sensor data out")?;
            let bus = SoftSpi::new(clk, Some(mosi), miso);
            Box::new(Max31865::new(
                cs,
                bus,
                sensor.rtd_nominal,
                sensor.reference_resistor,
            ))
        }
        SensorKind::Max6675 => Box::new(Max6675::new(cs, SoftSpi::read_only(clk, miso))),
    };
    info!(kind = ?sensor.kind, "temperature sensor ready");
    Ok(sampler)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.simulate {
        config.simulate = true;
    }
    if let Some(static_dir) = cli.static_dir {
        config.static_dir = static_dir;
    }
    config.validate().context("validating configuration")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let controller = if config.simulate {
        info!("simulation mode, no hardware is touched");
        let gpio = SimulatedGpio::new();
        let (probe, boiler) = sim::spawn(gpio.pin(config.pins.heating_element_relay));
        Controller::start(&config, &gpio, Box::new(probe), Some(boiler), clock)?
    } else {
        let gpio = SysfsGpio::default();
        let sensor = hardware_sensor(&gpio, &config.sensor)?;
        Controller::start(&config, &gpio, sensor, None, clock)?
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            controller.shutdown();
            return Err(e).with_context(|| format!("binding {addr}"));
        }
    };
    info!(%addr, static_dir = %config.static_dir.display(), "web server listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let app = web::router(controller.state(), &config.static_dir);
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .into_future(),
    );

    tokio::select! {
        served = &mut server => {
            controller.shutdown();
            served.context("web server task")?.context("web server")?;
            return Ok(());
        }
        () = shutdown_signal() => {}
    }

    // Stop accepting first, then turn everything off; closing the monitor
    // ends open temperature streams so the server can drain.
    let _ = stop_tx.send(());
    controller.shutdown();
    server
        .await
        .context("web server task")?
        .context("web server")?;
    info!("stopped");
    Ok(())
}
