use color_eyre::Result;
use fleetwatch::{
    api::FlightProvider,
    app::App,
    config::{Config, CONFIG_PATH},
    events::{Event, EventHandler},
    fleet::FlightStore,
    logging,
    region::{RefreshSettings, RegionCatalog},
    ui,
    weather::MetarProvider,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{io, path::Path, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, origin) = Config::load(CONFIG_PATH);

    // Instrumentation and safety
    let _log_guard = logging::initialize_logging(&config.logging);
    origin.log(Path::new(CONFIG_PATH));
    install_panic_hook();
    color_eyre::install()?;

    // Data sources and shared state
    let store = Arc::new(FlightStore::new());
    let feed = Arc::new(FlightProvider::new(&config.feed)?);
    let weather = Arc::new(MetarProvider::new(&config.weather)?);
    let catalog = RegionCatalog::open(
        &config.regions.definitions_path,
        weather,
        RefreshSettings::from(&config.weather),
        config.heatmap.into(),
    )?;

    // Ready terminal and state
    let mut terminal = setup_terminal()?;
    let mut app = App::new(config.clone());
    app.refresh_rows(&catalog);
    let mut events = EventHandler::new(config.ui.tick_rate_ms);

    // Background fleet poller. Every tick gets its own task so a slow cycle
    // never delays the next one; the store drops overlapping cycles itself.
    let poll_tx = events.tx.clone();
    let poll_store = Arc::clone(&store);
    let poll_every = Duration::from_secs(config.feed.poll_interval_seconds.max(1));
    let staleness = config.feed.staleness_threshold_seconds;
    let poller = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let tx = poll_tx.clone();
            let store = Arc::clone(&poll_store);
            let feed = Arc::clone(&feed);
            tokio::spawn(async move {
                let disposal = store.update_fleet(feed.as_ref(), staleness).await;
                let is_success = disposal.is_some();
                let _ = tx.send(Event::FleetUpdate {
                    disposal,
                    timestamp: std::time::Instant::now(),
                    is_success,
                });
            });
        }
    });

    // Main loop
    let result = run(&mut terminal, &mut app, &mut events, &store, &catalog).await;

    poller.abort();
    catalog.shutdown();
    catalog.join_refresh().await;
    restore_terminal(terminal)?;
    info!("Shut down cleanly.");
    result
}

async fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    events: &mut EventHandler,
    store: &FlightStore,
    catalog: &RegionCatalog<MetarProvider>,
) -> Result<()> {
    while !app.should_quit {
        app.sync_heatmap(catalog);
        terminal.draw(|f| ui::render(f, app))?;

        match events.next().await {
            Some(Event::Tick) => app.on_tick(),
            Some(Event::Input(key)) => app.handle_key(key),
            Some(Event::FleetUpdate {
                disposal,
                timestamp,
                is_success,
            }) => app.on_fleet_update(disposal, timestamp, is_success, store, catalog),
            None => {
                error!("Event channel closed, exiting.");
                break;
            }
        }
    }
    Ok(())
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    crossterm::execute!(
        stdout,
        crossterm::terminal::EnterAlternateScreen,
        crossterm::cursor::Hide
    )?;
    Ok(Terminal::new(CrosstermBackend::new(stdout))?)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen,
        crossterm::cursor::Show
    )?;
    Ok(())
}

fn install_panic_hook() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        // Force terminal cleanup!
        crossterm::terminal::disable_raw_mode().ok();
        crossterm::execute!(
            std::io::stdout(),
            crossterm::terminal::LeaveAlternateScreen,
            crossterm::cursor::Show
        )
        .ok();
        original_hook(panic_info);
    }));
}
