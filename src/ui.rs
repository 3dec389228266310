//! TUI rendering for fleetwatch.
//!
//! Draws the region dashboard, the wind heatmap of the selected region and a
//! read-only view of the loaded configuration.

use crate::app::{App, ViewMode};
use crate::heatmap::HeatmapGrid;
use ratatui::{
    prelude::*,
    widgets::{canvas::*, *},
};

/// Points drawn per axis at most, whatever the grid resolution.
const HEATMAP_SAMPLES: usize = 120;

/// Renders one frame based on the current application state.
pub fn render(f: &mut Frame, app: &App) {
    match app.view_mode {
        ViewMode::Dashboard => render_dashboard_view(f, app),
        ViewMode::Heatmap => render_heatmap_view(f, app),
        ViewMode::Settings => render_settings_view(f, app),
    }
}

/// Dashboard view: region list (45%) next to fleet telemetry and the
/// selected region's weather.
fn render_dashboard_view(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(f.size());

    draw_region_sidebar(f, app, chunks[0]);

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(7), Constraint::Min(0)])
        .split(chunks[1]);

    let seconds_ago = app
        .last_update
        .map(|inst| inst.elapsed().as_secs())
        .unwrap_or(0);
    let (status, status_color) = match (app.last_update, app.last_update_success) {
        (None, _) => ("WAITING", Color::DarkGray),
        (Some(_), true) => ("ONLINE", Color::Green),
        (Some(_), false) => ("DEGRADED", Color::Red),
    };
    let bold = Style::default().add_modifier(Modifier::BOLD);

    let stats_content = vec![
        Line::from(vec![
            Span::styled("  FEED: ", bold),
            Span::styled(status, Style::default().fg(status_color)),
            Span::raw("  │  "),
            Span::styled("LAST UPDATE: ", bold),
            Span::raw(format!("{}s ago", seconds_ago)),
        ]),
        Line::from(""),
        Line::from(vec![
            Span::styled("  TRACKED: ", bold),
            Span::styled(app.tracked.to_string(), Style::default().fg(Color::Cyan)),
            Span::raw("  │  "),
            Span::styled("ACTIVE: ", bold),
            Span::styled(app.active.to_string(), Style::default().fg(Color::Cyan)),
            Span::raw("  │  "),
            Span::styled("EVICTED: ", bold),
            Span::raw(app.evicted_total.to_string()),
        ]),
        Line::from(vec![
            Span::styled("  MARKERS: ", bold),
            Span::raw(app.markers.len().to_string()),
            Span::raw("  │  "),
            Span::styled("TRAILS: ", bold),
            Span::raw(app.trail_lines.len().to_string()),
        ]),
    ];
    let stats_block = Paragraph::new(stats_content).block(
        Block::default()
            .title(" Fleet ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    f.render_widget(stats_block, main_chunks[0]);

    let details = match app.selected_region() {
        Some(row) => vec![
            Line::from(vec![
                Span::styled("Region:   ", bold),
                Span::styled(row.name.as_str(), Style::default().fg(Color::Yellow)),
            ]),
            Line::from(""),
            Line::from(vec![
                Span::styled("Aircraft: ", bold),
                Span::raw(row.count.to_string()),
            ]),
            Line::from(vec![
                Span::styled("Stations: ", bold),
                Span::raw(row.stations.to_string()),
            ]),
            Line::from(vec![
                Span::styled("Windiest: ", bold),
                Span::styled(
                    row.windiest.as_deref().unwrap_or("no gust reports"),
                    Style::default().fg(Color::Magenta),
                ),
            ]),
        ],
        None => vec![Line::from("No regions loaded")],
    };
    let p = Paragraph::new(details).block(
        Block::default()
            .title(" Region ")
            .borders(Borders::ALL)
            .padding(Padding::new(2, 2, 1, 1)),
    );
    f.render_widget(p, main_chunks[1]);
}

fn draw_region_sidebar(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .regions
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let style = if i == app.selected_index {
                Style::default()
                    .fg(Color::Cyan)
                    .bg(Color::Rgb(30, 30, 60))
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            let marker = if row.changed { "*" } else { " " };

            ListItem::new(Line::from(vec![
                Span::styled(format!(" {:<20}", row.name), style),
                Span::styled(format!(" {:>4}{}", row.count, marker), style),
                Span::styled(
                    format!(" │ {}", row.windiest.as_deref().unwrap_or("-")),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .title(" Regions ")
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded),
    );
    f.render_widget(list, area);
}

fn render_heatmap_view(f: &mut Frame, app: &App) {
    let area = f.size();
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(25), Constraint::Percentage(75)])
        .split(area);

    draw_region_sidebar(f, app, chunks[0]);

    let Some((_, handle)) = &app.heatmap else {
        let p = Paragraph::new("No heatmap for this region")
            .alignment(Alignment::Center)
            .block(Block::bordered().title(" Wind "));
        f.render_widget(p, chunks[1]);
        return;
    };

    let grid = handle.read();
    let layers = intensity_layers(&grid);
    let (min_x, min_y) = grid.origin();
    let (extent_x, extent_y) = grid.extent();
    let title = format!(
        " Wind · generation {} · peak {:.0} kt ",
        handle.generation(),
        grid.max_intensity()
    );

    let canvas = Canvas::default()
        .block(Block::bordered().title(title))
        .marker(symbols::Marker::Braille)
        .x_bounds([min_x, min_x + extent_x])
        .y_bounds([min_y, min_y + extent_y])
        .paint(|ctx| {
            for (color, coords) in &layers {
                ctx.draw(&Points { coords, color: *color });
            }
        });
    f.render_widget(canvas, chunks[1]);
}

/// Buckets sampled cells into four colour bands, weakest first.
fn intensity_layers(grid: &HeatmapGrid) -> Vec<(Color, Vec<(f64, f64)>)> {
    let palette = [Color::Blue, Color::Green, Color::Yellow, Color::Red];
    let mut layers: Vec<(Color, Vec<(f64, f64)>)> =
        palette.iter().map(|c| (*c, Vec::new())).collect();

    let peak = grid.max_intensity();
    if peak <= 0.0 {
        return layers;
    }

    let (width, height) = grid.dimensions();
    let step_x = (width / HEATMAP_SAMPLES).max(1);
    let step_y = (height / HEATMAP_SAMPLES).max(1);
    for row in (0..height).step_by(step_y) {
        for col in (0..width).step_by(step_x) {
            let value = grid.value_at(col, row);
            if value <= 0.0 {
                continue;
            }
            let band = (((value / peak) * palette.len() as f32) as usize).min(palette.len() - 1);
            layers[band].1.push(grid.cell_center(col, row));
        }
    }
    layers
}

/// Settings view: the loaded config, read only.
fn render_settings_view(f: &mut Frame, app: &App) {
    let area = f.size();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(10), Constraint::Length(1)])
        .split(area);

    let title = Paragraph::new(" Settings ")
        .style(Style::default().add_modifier(Modifier::BOLD))
        .alignment(Alignment::Center);
    f.render_widget(title, chunks[0]);

    let c = &app.config;
    let rows: Vec<(&str, String)> = vec![
        ("Flight feed             ", c.feed.flights_url.clone()),
        ("Poll interval (s)       ", c.feed.poll_interval_seconds.to_string()),
        ("Stale after (s)         ", c.feed.staleness_threshold_seconds.to_string()),
        ("METAR endpoint          ", c.weather.metar_url.clone()),
        ("Weather refresh (min)   ", c.weather.min_refresh_interval_minutes.to_string()),
        (
            "Retry delay (s)         ",
            format!("{} .. {}", c.weather.retry_delay_seconds, c.weather.max_retry_delay_seconds),
        ),
        (
            "Attempts per region     ",
            c.weather
                .max_attempts_per_region
                .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
        ),
        ("Region file             ", c.regions.definitions_path.clone()),
        (
            "Heatmap                 ",
            format!("{} cells, radius {}", c.heatmap.resolution, c.heatmap.radius),
        ),
    ];
    let items: Vec<Line> = rows
        .into_iter()
        .map(|(label, value)| {
            Line::from(vec![
                Span::styled(format!("  {} ", label), Style::default().fg(Color::DarkGray)),
                Span::raw(value),
            ])
        })
        .collect();

    let block = Block::default()
        .title(" config.toml ")
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded);
    let inner = block.inner(chunks[1]);
    f.render_widget(block, chunks[1]);
    f.render_widget(Paragraph::new(items), inner);

    let help = Paragraph::new(
        " ↑/↓ select region   1 dashboard   2 heatmap   3 settings   q back/quit",
    )
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center);
    f.render_widget(help, chunks[2]);
}
