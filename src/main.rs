use sensor_link::app::{ConsoleCommand, Dispatcher, SensorApp};
use sensor_link::domain::models::BluetoothCommand;
use sensor_link::domain::settings::{Settings, SettingsService};
use sensor_link::infrastructure::logging::init_logger;
use std::io::BufRead;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting SensorLink");

    // Write defaults back so the file is there to edit
    if let Err(e) = settings_service.save() {
        warn!("Failed to save settings: {:#}", e);
    }

    let mut app = start_app(&settings)?;
    let dispatcher = app.dispatcher();
    dispatcher.send(BluetoothCommand::StartScan);
    spawn_console_reader(dispatcher);

    println!("Commands: scan, stopscan, start, stop, read, disconnect, reset, quit");
    while let Some(event) = app.next_event_blocking() {
        app.handle_event(event);
    }

    app.shutdown();
    Ok(())
}

#[cfg(windows)]
fn start_app(settings: &Settings) -> anyhow::Result<SensorApp> {
    use sensor_link::infrastructure::bluetooth::winrt::WinRtTransport;
    SensorApp::start(settings, WinRtTransport::new)
}

#[cfg(not(windows))]
fn start_app(_settings: &Settings) -> anyhow::Result<SensorApp> {
    anyhow::bail!("No Bluetooth backend is available on this platform")
}

fn spawn_console_reader(dispatcher: Dispatcher) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match ConsoleCommand::parse(&line) {
                Some(ConsoleCommand::Quit) => break,
                Some(command) => {
                    if !dispatcher.dispatch(command) {
                        return;
                    }
                }
                None => println!("Unknown command: {}", line.trim()),
            }
        }
        // End of input behaves like quit
        dispatcher.dispatch(ConsoleCommand::Quit);
    });
}
