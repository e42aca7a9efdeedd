use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Local;
use log::{error, info, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use doorbell::{
    AppConfig, Camera, GpioBackend, GpioManager, Pin, PinDirection, Pushbullet, ResistorMode,
    SysfsBackend, play_sound,
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGTERM, &action)?;
        signal::sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DOORBELL_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot_dir = PathBuf::from(&config.snapshot_dir);
    fs::create_dir_all(&snapshot_dir)?;

    install_signal_handlers()?;

    let backend = Arc::new(SysfsBackend::new());
    let manager = GpioManager::new(backend, config.gpio);

    let pushbullet = Arc::new(Pushbullet::new(config.pushbullet.access_token.clone()));
    let camera = Arc::new(Camera::new(&config.camera));
    let sound_file = config.sound_file.clone().map(PathBuf::from);

    let pin = manager.export(config.doorbell.pin, PinDirection::Input)?;
    if config.doorbell.resistor != ResistorMode::Off {
        manager.set_resistor(&pin, config.doorbell.resistor)?;
    }

    info!(
        "Watching {} ({:?} edge, {:?} resistor)...",
        pin, config.doorbell.edge, config.doorbell.resistor
    );

    {
        let pushbullet = Arc::clone(&pushbullet);
        let camera = Arc::clone(&camera);
        let snapshot_dir = snapshot_dir.clone();
        pin.monitor(
            move |pin, _state| {
                doorbell_pressed(
                    pin,
                    &camera,
                    &pushbullet,
                    &snapshot_dir,
                    sound_file.as_deref(),
                );
            },
            config.doorbell.edge,
        )?;
    }

    let outcome = loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            info!("Shutting down...");
            break Ok(());
        }
        if let Some(fault) = pin.take_monitor_fault() {
            break Err(fault.into());
        }
        thread::sleep(Duration::from_millis(250));
    };

    manager.cleanup();
    outcome
}

fn doorbell_pressed<B: GpioBackend>(
    pin: &Pin<B>,
    camera: &Camera,
    pushbullet: &Pushbullet,
    snapshot_dir: &Path,
    sound_file: Option<&Path>,
) {
    info!("{pin} was pressed");

    if let Some(sound) = sound_file {
        play_sound(sound);
    }

    let now = Local::now();
    let body = now.format("Doorbell was rung (%d-%m-%Y %H:%M:%S)").to_string();
    let image_path = snapshot_dir.join(format!("Doorbell-{}.jpg", now.timestamp()));

    if let Err(e) = camera.capture(&image_path) {
        warn!("snapshot failed: {e}");
        // Still worth ringing the phone, just without the picture.
        if let Err(e) = pushbullet.push_note("Doorbell", &body) {
            warn!("push failed: {e}");
        }
        return;
    }

    if let Err(e) = pushbullet.push_file(&image_path, &body) {
        warn!("push failed: {e}");
    }
}
