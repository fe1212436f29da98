//! beacon-server: CLI + web server for BLE signal heatmaps.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use beacon_core::config::{self, Config};
use beacon_core::{
    decode, decode_manufacturer_data, detect_proximity_tag, write_csv, CaptureClock, CaptureLine,
    CompanyTable, Pipeline, SignalStore, Simulation, SimulationConfig,
};

mod db;
mod notification;
mod web;

#[derive(Parser)]
#[command(name = "beacon", version, about = "BLE advertisement decoder and signal heatmap")]
struct Cli {
    /// Config file (default: ~/.beacon-heatmap/config.yaml)
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode raw advertisement records and print a device table
    Decode {
        /// Capture file, or `-` for stdin. Lines are raw records or `x,y,z;record`
        file: PathBuf,

        /// Print every decoded record instead of the summary table
        #[arg(short, long)]
        raw: bool,

        /// Company id CSV
        #[arg(long)]
        companies: Option<PathBuf>,
    },

    /// Replay a capture through the signal store and print the heatmap
    Replay {
        /// Capture file of `x,y,z[,lat,lon[,t]];record` lines, or `-` for stdin
        file: PathBuf,

        /// Also archive the replay into this SQLite database
        #[arg(long)]
        db: Option<String>,

        /// Also write the observations as CSV
        #[arg(long)]
        export: Option<PathBuf>,

        /// Readings per cell in the windowed average
        #[arg(long)]
        sample_size: Option<usize>,

        /// Restrict display readings to one address
        #[arg(long)]
        address: Option<String>,
    },

    /// Generate a synthetic capture from simulated beacons
    Simulate {
        #[arg(long, default_value = "5")]
        emitters: usize,

        #[arg(long, default_value = "200")]
        steps: usize,

        #[arg(long, default_value = "1")]
        seed: u64,

        /// Half-width of the area in meters
        #[arg(long, default_value = "10.0")]
        area: f32,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the HTTP API with live ingest
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// SQLite archive path
        #[arg(long)]
        db: Option<String>,

        /// Run without an archive
        #[arg(long)]
        no_db: bool,

        /// Company id CSV
        #[arg(long)]
        companies: Option<PathBuf>,

        /// Bearer token required by mutating endpoints
        #[arg(long, env = "BEACON_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// POST proximity-tag sightings to this URL
        #[arg(long, env = "BEACON_WEBHOOK_URL")]
        webhook: Option<String>,
    },

    /// Show archive statistics
    Stats {
        /// SQLite database path
        #[arg(long)]
        db: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config_path.unwrap_or_else(config::config_file);
    let config = config::load_config_from(&config_path);
    if let Err(e) = config.validate() {
        fail(&format!("Invalid config {}: {e}", config_path.display()));
    }

    match cli.command {
        Commands::Decode {
            file,
            raw,
            companies,
        } => cmd_decode(&config, &file, raw, companies.as_deref()),
        Commands::Replay {
            file,
            db,
            export,
            sample_size,
            address,
        } => cmd_replay(&config, &file, db.as_deref(), export.as_deref(), sample_size, address),
        Commands::Simulate {
            emitters,
            steps,
            seed,
            area,
            output,
        } => cmd_simulate(emitters, steps, seed, area, output.as_deref()),
        Commands::Serve {
            host,
            port,
            db,
            no_db,
            companies,
            auth_token,
            webhook,
        } => {
            let mut config = config;
            if let Some(h) = host {
                config.dashboard.host = h;
            }
            if let Some(p) = port {
                config.dashboard.port = p;
            }
            if let Some(d) = db {
                config.database.path = d;
            }
            if let Some(c) = companies {
                config.resources.company_table = c.display().to_string();
            }
            if auth_token.is_some() {
                config.dashboard.auth_token = auth_token;
            }
            if webhook.is_some() {
                config.webhook = webhook;
            }
            cmd_serve(config, no_db)
        }
        Commands::Stats { db } => cmd_stats(db.as_deref().unwrap_or(&config.database.path)),
        Commands::Config { init } => cmd_config(&config, &config_path, init),
    }
}

fn fail(msg: &str) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn open_input(file: &Path) -> Box<dyn BufRead> {
    if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(file).unwrap_or_else(|e| {
            fail(&format!("Error opening {}: {e}", file.display()));
        });
        Box::new(io::BufReader::new(f))
    }
}

fn load_companies(config: &Config, path: Option<&Path>) -> CompanyTable {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&config.resources.company_table));
    CompanyTable::load_or_empty(&path)
}

/// Non-empty, non-comment lines with their 1-based line numbers.
fn capture_lines(reader: Box<dyn BufRead>) -> impl Iterator<Item = (usize, String)> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(i, line)| line.ok().map(|l| (i + 1, l)))
        .filter(|(_, l)| {
            let t = l.trim();
            !t.is_empty() && !t.starts_with('#')
        })
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

/// Per-address tally for the decode table.
struct DeviceTally {
    name: String,
    company: String,
    proximity_tag: bool,
    adverts: u32,
    rssi_sum: i64,
    last_tx_power: i32,
}

fn cmd_decode(config: &Config, file: &Path, raw: bool, companies: Option<&Path>) {
    let companies = load_companies(config, companies);
    let mut devices: BTreeMap<String, DeviceTally> = BTreeMap::new();
    let mut total = 0u64;
    let mut rejected = 0u64;

    for (line_no, line) in capture_lines(open_input(file)) {
        total += 1;
        // Bare records may themselves contain ';' in the name field
        let record_text = CaptureLine::parse(&line, line_no)
            .map(|c| c.record)
            .unwrap_or(line);

        let record = match decode(&record_text) {
            Ok(r) => r,
            Err(e) => {
                rejected += 1;
                if raw {
                    println!("line {line_no}: {e}");
                }
                continue;
            }
        };

        let descriptor = record
            .manufacturer_data()
            .map(decode_manufacturer_data)
            .unwrap_or_default();
        let is_tag = detect_proximity_tag(&descriptor);

        if raw {
            println!("{record:?}");
            if !descriptor.is_empty() {
                println!(
                    "  company {} ({}) payload {}{}",
                    descriptor.company_id,
                    companies.lookup_company_name(&descriptor),
                    beacon_core::hex_encode(&descriptor.payload),
                    if is_tag { " [proximity tag]" } else { "" },
                );
            }
        }

        let tally = devices
            .entry(record.address.clone())
            .or_insert_with(|| DeviceTally {
                name: String::new(),
                company: String::new(),
                proximity_tag: false,
                adverts: 0,
                rssi_sum: 0,
                last_tx_power: 0,
            });
        tally.adverts += 1;
        tally.rssi_sum += record.rssi as i64;
        tally.last_tx_power = record.tx_power;
        if !record.name.is_empty() {
            tally.name = record.name.clone();
        }
        if !descriptor.is_empty() {
            tally.company = companies.lookup_company_name(&descriptor).to_string();
        }
        tally.proximity_tag |= is_tag;
    }

    if raw {
        return;
    }

    println!();
    println!(
        "Records: {total} read, {rejected} rejected, {} devices",
        devices.len()
    );
    println!();
    if devices.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Address", "Name", "Company", "Tag", "Adverts", "Avg RSSI", "Tx",
    ]);
    for (address, d) in &devices {
        table.add_row(vec![
            Cell::new(address),
            Cell::new(if d.name.is_empty() { "-" } else { &d.name }),
            Cell::new(if d.company.is_empty() { "-" } else { &d.company }),
            Cell::new(if d.proximity_tag { "yes" } else { "" }),
            Cell::new(d.adverts),
            Cell::new((d.rssi_sum as f64 / d.adverts as f64) as i32),
            Cell::new(d.last_tx_power),
        ]);
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// replay
// ---------------------------------------------------------------------------

fn cmd_replay(
    config: &Config,
    file: &Path,
    db_path: Option<&str>,
    export: Option<&Path>,
    sample_size: Option<usize>,
    address: Option<String>,
) {
    let sample_size = sample_size.unwrap_or(config.signal.sample_size);
    let pipeline = Pipeline::new(config.store_config());
    let mut clock = CaptureClock::default();
    let mut accepted = 0u64;
    let mut rejected = 0u64;

    for (line_no, line) in capture_lines(open_input(file)) {
        let capture = match CaptureLine::parse(&line, line_no) {
            Ok(c) => c,
            Err(e) => {
                warn!("{e}");
                rejected += 1;
                continue;
            }
        };
        let ts = clock.stamp(&capture);
        match pipeline.handle_raw_advertisement(&capture.record, capture.position, capture.geo, ts) {
            Ok(_) => accepted += 1,
            Err(_) => rejected += 1,
        }
    }
    let (_, known) = pipeline.set_active_filter(address);
    if !known {
        warn!("filter address never heard in this capture; filtered readings show the floor");
    }

    let store = pipeline.read();
    println!();
    println!("Replay complete: {}", file.display());
    println!(
        "  Records: {accepted} logged, {rejected} rejected",
    );
    println!(
        "  Cells: {}  Devices: {}",
        store.cells().len(),
        store.registry().len()
    );
    if let Some(addr) = store.active_filter() {
        println!("  Filter: {addr}");
    }

    if let Some(path) = export {
        let records = store.export_records(None);
        let written = std::fs::File::create(path)
            .map_err(beacon_core::BeaconError::from)
            .and_then(|mut f| write_csv(&mut f, records.iter().map(|r| &r.row)));
        match written {
            Ok(n) => println!("  Exported {n} rows to {}", path.display()),
            Err(e) => fail(&format!("Error writing {}: {e}", path.display())),
        }
    }

    if let Some(db_path) = db_path {
        let mut database = db::Database::open(db_path).unwrap_or_else(|e| {
            fail(&format!("Error opening database {db_path}: {e}"));
        });
        let source = file.display().to_string();
        let saved = database.start_session(&source).and_then(|session| {
            let n = database.save_records(session, &store.export_records(None))?;
            database.end_session(session)?;
            Ok(n)
        });
        match saved {
            Ok(n) => println!("  Archived {n} observations to {db_path}"),
            Err(e) => fail(&format!("Error archiving to {db_path}: {e}")),
        }
    }

    print_heatmap(&store, sample_size);
}

fn print_heatmap(store: &SignalStore, sample_size: usize) {
    let cells = store.cell_summaries(sample_size);
    if cells.is_empty() {
        return;
    }

    println!();
    let mut table = Table::new();
    table.set_header(vec![
        "Cell", "Center (m)", "Obs", "Avg", "Windowed", "Display", "%",
    ]);
    for c in &cells {
        table.add_row(vec![
            Cell::new(c.cell),
            Cell::new(format!("{:.2}, {:.2}, {:.2}", c.center.x, c.center.y, c.center.z)),
            Cell::new(c.count),
            Cell::new(c.average),
            Cell::new(c.windowed),
            Cell::new(store.display_average(c.cell, sample_size)),
            Cell::new(format!("{:.0}", store.display_percent(c.cell, sample_size) * 100.0)),
        ]);
    }
    println!("{table}");

    println!();
    let mut table = Table::new();
    table.set_header(vec!["Address", "Name", "Obs", "Avg RSSI", "Cells", "Last seen"]);
    for d in store.device_summaries() {
        table.add_row(vec![
            Cell::new(&d.address),
            Cell::new(if d.name.is_empty() { "-" } else { &d.name }),
            Cell::new(d.observations),
            Cell::new(d.average_rssi),
            Cell::new(d.cells),
            Cell::new(format!("{:.1}", d.last_seen)),
        ]);
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// simulate
// ---------------------------------------------------------------------------

fn cmd_simulate(emitters: usize, steps: usize, seed: u64, area: f32, output: Option<&Path>) {
    let mut sim = Simulation::new(SimulationConfig {
        emitters,
        seed,
        area,
        ..SimulationConfig::default()
    });

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(io::BufWriter::new(
            std::fs::File::create(path).unwrap_or_else(|e| {
                fail(&format!("Error creating {}: {e}", path.display()));
            }),
        )),
        None => Box::new(io::stdout().lock()),
    };

    let mut written = 0usize;
    for _ in 0..steps {
        for line in sim.step() {
            if let Err(e) = writeln!(out, "{line}") {
                fail(&format!("Error writing capture: {e}"));
            }
            written += 1;
        }
    }
    if let Err(e) = out.flush() {
        fail(&format!("Error writing capture: {e}"));
    }
    if let Some(path) = output {
        info!(lines = written, "wrote {}", path.display());
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

fn cmd_serve(config: Config, no_db: bool) {
    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        fail(&format!("Error starting runtime: {e}"));
    });

    runtime.block_on(async move {
        let pipeline = Pipeline::new(config.store_config());
        let companies = load_companies(&config, None);
        info!(companies = companies.len(), "company table loaded");

        let archive: Option<Arc<dyn db::SignalArchive>> = if no_db {
            None
        } else {
            match db::SqliteArchive::open(&config.database.path, "serve") {
                Ok(a) => {
                    info!(
                        path = %config.database.path,
                        session = db::SignalArchive::session_id(&a),
                        "archiving observations"
                    );
                    Some(Arc::new(a))
                }
                Err(e) => fail(&format!(
                    "Error opening database {}: {e}",
                    config.database.path
                )),
            }
        };

        if let Some(url) = &config.webhook {
            info!(url = %url, "webhook notifications enabled");
            notification::spawn_webhook_task(
                &pipeline,
                notification::WebhookDispatcher::new(url),
            );
        }

        let state = Arc::new(web::AppState::new(
            pipeline,
            companies,
            archive,
            config.dashboard.auth_token.clone(),
            config.signal.sample_size,
        ));

        if let Err(e) = web::serve(state, &config.dashboard.host, config.dashboard.port).await {
            fail(&format!("Server error: {e}"));
        }
    });
}

// ---------------------------------------------------------------------------
// stats / config
// ---------------------------------------------------------------------------

fn cmd_stats(db_path: &str) {
    let database = db::Database::open(db_path).unwrap_or_else(|e| {
        fail(&format!("Error opening database {db_path}: {e}"));
    });

    let stats = database.stats();

    println!();
    println!("Database: {db_path}");
    println!();
    println!("  Sessions:      {}", stats.sessions);
    println!("  Devices:       {}", stats.devices);
    println!("  Observations:  {}", stats.observations);
    println!();

    match database.sessions() {
        Ok(sessions) if !sessions.is_empty() => {
            let mut table = Table::new();
            table.set_header(vec!["Session", "Source", "Started", "Ended", "Obs"]);
            for s in &sessions {
                table.add_row(vec![
                    Cell::new(s.id),
                    Cell::new(s.source.as_deref().unwrap_or("-")),
                    Cell::new(format!("{:.0}", s.started_at)),
                    Cell::new(
                        s.ended_at
                            .map(|t| format!("{t:.0}"))
                            .unwrap_or("-".into()),
                    ),
                    Cell::new(s.observation_count),
                ]);
            }
            println!("{table}");
        }
        Ok(_) => {}
        Err(e) => warn!("listing sessions failed: {e}"),
    }

    match database.device_totals() {
        Ok(devices) if !devices.is_empty() => {
            println!();
            let mut table = Table::new();
            table.set_header(vec!["Address", "Name", "Obs", "Avg RSSI"]);
            for d in &devices {
                table.add_row(vec![
                    Cell::new(&d.address),
                    Cell::new(d.name.as_deref().unwrap_or("-")),
                    Cell::new(d.observations),
                    Cell::new(
                        d.average_rssi
                            .map(|r| format!("{r:.1}"))
                            .unwrap_or("-".into()),
                    ),
                ]);
            }
            println!("{table}");
        }
        Ok(_) => {}
        Err(e) => warn!("listing devices failed: {e}"),
    }
}

fn cmd_config(config: &Config, path: &Path, init: bool) {
    if init {
        if let Err(e) = config::save_config_to(&Config::default(), path) {
            fail(&format!("Error writing {}: {e}", path.display()));
        }
        println!("Wrote defaults to {}", path.display());
        return;
    }

    println!("# {}", path.display());
    print!("{}", config::serialize_config(config));
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from(["beacon", "serve", "--port", "9000", "--no-db"]);
        match cli.command {
            Commands::Serve { port, no_db, .. } => {
                assert_eq!(port, Some(9000));
                assert!(no_db);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_simulated_capture_replays() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("sim.txt");
        cmd_simulate(3, 10, 7, 5.0, Some(&capture));

        let lines: Vec<(usize, String)> = capture_lines(open_input(&capture)).collect();
        assert_eq!(lines.len(), 30);

        let pipeline = Pipeline::default();
        let mut clock = CaptureClock::default();
        for (n, line) in &lines {
            let c = CaptureLine::parse(line, *n).unwrap();
            let ts = clock.stamp(&c);
            pipeline
                .handle_raw_advertisement(&c.record, c.position, c.geo, ts)
                .unwrap();
        }
        assert_eq!(pipeline.read().registry().len(), 3);
    }

    #[test]
    fn test_capture_lines_skip_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        std::fs::write(&path, "# header\n\n0,0,0;AA|n|-60|0|true\n").unwrap();
        let lines: Vec<(usize, String)> = capture_lines(open_input(&path)).collect();
        assert_eq!(lines, vec![(3, "0,0,0;AA|n|-60|0|true".to_string())]);
    }
}
