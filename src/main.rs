//! # Photo Frame Entry Point
//!
//! Runs one wake cycle and exits, or with `--loop` keeps waking, sleeping for
//! the interval each cycle chose. On a host build every peripheral is
//! simulated: the OS network stands in for the radio, a directory for the
//! staging volume and a PBM file for the panel.

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use photo_frame_lib::bus::{BusArbiter, BusLines};
use photo_frame_lib::config::{ClockModel, Config};
use photo_frame_lib::cycle::{CycleOptions, WakeCycle};
use photo_frame_lib::network::{NetworkLink, SntpService, SystemRadio};
use photo_frame_lib::renderer::FrameRenderer;
use photo_frame_lib::stager::FileStager;
use photo_frame_lib::staging::DirStagingFs;
use photo_frame_lib::storage::PrimaryStorage;
use photo_frame_lib::time_authority::{AbsentRtc, RtcDevice, SystemRtc, TimeAuthority};
use photo_frame_lib::timing::{SystemClock, ThreadYield};
use photo_frame_lib::weather::OpenMeteoClient;
use photo_frame_lib::BatteryInfo;
use std::thread;
use std::time::Duration;

/// Per-server SNTP reply timeout.
const SNTP_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "photo-frame", about = "E-paper photo frame wake cycle")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "photo-frame.toml")]
    config: String,

    /// Battery voltage in millivolts (omit for external power)
    #[arg(long, value_name = "MV")]
    battery_mv: Option<u32>,

    /// Treat this start as a power-on reset and discard retained state
    #[arg(long)]
    cold_boot: bool,

    /// Take the network time even if the clock is running
    #[arg(long)]
    force_time_sync: bool,

    /// Keep running, sleeping between cycles
    #[arg(long = "loop")]
    run_loop: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,
}

#[cfg(feature = "hardware")]
fn bus_lines(config: &Config) -> anyhow::Result<Box<dyn BusLines>> {
    let lines = photo_frame_lib::linux_hw::board_bus_lines(&config.board)
        .context("failed to set up bus chip selects")?;
    Ok(Box::new(lines))
}

#[cfg(not(feature = "hardware"))]
fn bus_lines(_config: &Config) -> anyhow::Result<Box<dyn BusLines>> {
    Ok(Box::new(photo_frame_lib::bus::SimulatedBusLines))
}

fn clock_device(config: &Config) -> anyhow::Result<Box<dyn RtcDevice>> {
    let rtc: Box<dyn RtcDevice> = match config.board.clock {
        ClockModel::System => Box::new(SystemRtc::default()),
        ClockModel::Absent => Box::new(AbsentRtc),
        #[cfg(feature = "hardware")]
        ClockModel::Ds3231 => Box::new(
            photo_frame_lib::linux_hw::Ds3231::open(&config.board.i2c_device)
                .context("failed to open DS3231")?,
        ),
        #[cfg(not(feature = "hardware"))]
        ClockModel::Ds3231 => {
            warn!(
                "DS3231 support not enabled. Rebuild with --features hardware; \
                 running without a clock"
            );
            Box::new(AbsentRtc)
        }
    };
    Ok(rtc)
}

/// Build every component fresh, as the device does after deep sleep.
fn build_cycle(config: &Config) -> anyhow::Result<WakeCycle> {
    let arbiter = BusArbiter::new(
        bus_lines(config)?,
        Box::new(DirStagingFs::new(&config.staging.root)),
        Box::new(ThreadYield),
    );
    let network = NetworkLink::new(
        Box::new(SystemRadio::default()),
        Box::new(SntpService::new(SNTP_QUERY_TIMEOUT)),
        Box::new(SystemClock::new()),
        &config.network,
    );
    let time = TimeAuthority::new(clock_device(config)?, &config.board);
    let renderer = FrameRenderer::new(
        config.display.width,
        config.display.height,
        config.storage.image_width,
        config.storage.image_height,
        &config.display.output,
    );
    let weather = OpenMeteoClient::new().context("failed to create weather client")?;

    Ok(WakeCycle::new(
        config.clone(),
        arbiter,
        network,
        time,
        FileStager::new(Box::new(ThreadYield)).with_cleanup(&config.staging.cleanup_suffix),
        PrimaryStorage::new(&config.storage.root),
        Box::new(renderer),
        Box::new(weather),
    ))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);
    if args.write_config {
        return config.save(&args.config);
    }

    let battery = match args.battery_mv {
        Some(mv) => BatteryInfo::from_mv(mv),
        None => BatteryInfo::external_power(),
    };
    let mut options = CycleOptions {
        battery,
        cold_boot: args.cold_boot,
        force_time_sync: args.force_time_sync,
    };

    loop {
        let mut cycle = build_cycle(&config)?;
        let report = cycle.run(options);

        match (&report.error, &report.staged) {
            (Some(e), _) => error!("Cycle showed an error screen: {}", e),
            (None, Some(staged)) => info!("Showing {} ({} bytes)", staged.name, staged.size),
            (None, None) if report.skipped => warn!("Cycle skipped on low battery"),
            (None, None) => {}
        }

        if !args.run_loop {
            info!("Next wake in {} s", report.sleep_for.as_secs());
            return Ok(());
        }

        info!("Sleeping {} s", report.sleep_for.as_secs());
        thread::sleep(report.sleep_for);
        // Later wakes are timer wakes
        options.cold_boot = false;
        options.force_time_sync = false;
    }
}
