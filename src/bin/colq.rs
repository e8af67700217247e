//! colq: query the columnar bridge from the command line
//!
//! Runs statements through the bridge against a scripted engine fixture.
//!
//! # Usage
//!
//! ```bash
//! # Open and close a connection
//! colq --fixture fixture.json ping
//!
//! # Stream a query
//! colq --fixture fixture.json query "SELECT * FROM airlines" --metadata
//!
//! # Deliver rows through a callback and stop after two
//! colq --fixture fixture.json query "SELECT * FROM airlines" --callback --cancel-after 2
//! ```

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use columnar_bridge::config::{CliConfig, Fixture};
use columnar_bridge::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "colq")]
#[command(version)]
#[command(about = "Query a columnar engine through the completion bridge", long_about = None)]
#[command(after_help = "EXAMPLES:
    colq --fixture fixture.json ping
    colq --fixture fixture.json query 'SELECT * FROM airlines' --format json
    colq parse 'couchbases://a.example.com,b.example.com:18095?query_timeout=2000'")]
struct Cli {
    /// Config file (defaults to ./colq.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Connection string
    #[arg(long, env = "COLQ_CONNECTION_STRING", global = true)]
    connstr: Option<String>,

    #[arg(short, long, env = "COLQ_USERNAME", global = true)]
    username: Option<String>,

    #[arg(short, long, env = "COLQ_PASSWORD", global = true, hide_env_values = true)]
    password: Option<String>,

    /// JSON fixture describing the engine's datasets
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,

    /// Number of I/O worker threads
    #[arg(long, global = true)]
    io_threads: Option<usize>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open and close a connection
    Ping,
    /// Run a statement and stream its rows
    Query(QueryArgs),
    /// Parse and explain a connection string
    Parse {
        /// The connection string to parse
        connstr: String,
    },
}

#[derive(clap::Args)]
struct QueryArgs {
    /// The statement to run
    statement: String,

    /// Positional parameter as JSON (repeatable)
    #[arg(long = "param")]
    params: Vec<String>,

    /// Named parameter as NAME=JSON (repeatable)
    #[arg(long = "named")]
    named: Vec<String>,

    /// Run in DATABASE.SCOPE
    #[arg(long)]
    scope: Option<String>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    read_only: bool,

    #[arg(long, value_enum)]
    consistency: Option<Consistency>,

    /// Cancel the stream after this many rows
    #[arg(long)]
    cancel_after: Option<usize>,

    /// Deliver rows through a callback instead of blocking pulls
    #[arg(long)]
    callback: bool,

    /// Print query metadata after the stream ends
    #[arg(short, long)]
    metadata: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "raw")]
    format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Raw,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Consistency {
    NotBounded,
    RequestPlus,
}

impl From<Consistency> for ScanConsistency {
    fn from(c: Consistency) -> Self {
        match c {
            Consistency::NotBounded => ScanConsistency::NotBounded,
            Consistency::RequestPlus => ScanConsistency::RequestPlus,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match &cli.command {
        Commands::Ping => ping(&cli),
        Commands::Query(args) => run_query(&cli, args),
        Commands::Parse { connstr } => {
            explain_connstr(connstr);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "columnar_bridge=debug" } else { "columnar_bridge=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Merge the config file with command line flags and open a connection.
fn connect(cli: &Cli) -> Result<Connection> {
    let config = CliConfig::load(cli.config.as_deref())?;

    let connstr = cli
        .connstr
        .clone()
        .or_else(|| config.connection_string.clone())
        .unwrap_or_else(|| "couchbases://localhost".to_string());

    let mut credential = config.credential();
    if let Some(u) = &cli.username {
        credential.username = u.clone();
    }
    if let Some(p) = &cli.password {
        credential.password = p.clone();
    }

    let engine = match cli.fixture.clone().or(config.fixture.clone()) {
        Some(path) => Fixture::load(&path)
            .with_context(|| format!("loading fixture {}", path.display()))?
            .into_engine(),
        None => {
            eprintln!(
                "{}",
                "⚠ No fixture given. Use --fixture or set `fixture` in colq.toml".yellow()
            );
            MemoryEngine::new()
        }
    };

    let mut options = config.options.clone();
    if options.user_agent_extra.is_none() {
        options.user_agent_extra = Some("colq".to_string());
    }

    let mut connector = Connector::new(Arc::new(engine))
        .credential(credential)
        .options(options);
    if let Some(n) = cli.io_threads {
        connector = connector.io_threads(n);
    }

    if cli.verbose {
        eprintln!("{} {}", "Connecting to:".dimmed(), connstr);
    }
    Ok(connector.open(&connstr)?)
}

fn ping(cli: &Cli) -> Result<()> {
    let started = Instant::now();
    let conn = connect(cli)?;
    let opened = started.elapsed();
    let info = conn.info().clone();

    conn.close()?;
    let total = started.elapsed();

    println!("{} {}", "✓".green(), info.connection_string.cyan());
    println!("  {} {}", "User agent:".dimmed(), info.user_agent);
    println!("  {} {}", "I/O threads:".dimmed(), info.io_threads);
    println!("  {} {}", "Open:".dimmed(), format_duration(opened));
    println!("  {} {}", "Open + close:".dimmed(), format_duration(total));
    Ok(())
}

fn build_options(args: &QueryArgs) -> Result<QueryOptions> {
    let mut opts = QueryOptions::new(&args.statement);

    if let Some(scope) = &args.scope {
        let (db, sc) = scope
            .split_once('.')
            .context("--scope must look like DATABASE.SCOPE")?;
        opts = opts.scope(db, sc);
    }
    for p in &args.params {
        opts = opts.positional_json(p.clone());
    }
    for n in &args.named {
        let (name, value) = n
            .split_once('=')
            .with_context(|| format!("--named expects NAME=JSON, got '{}'", n))?;
        opts.named_parameters.insert(name.to_string(), value.to_string());
    }
    if let Some(ms) = args.timeout_ms {
        opts = opts.timeout(Duration::from_millis(ms));
    }
    if args.read_only {
        opts = opts.read_only(true);
    }
    if let Some(c) = args.consistency {
        opts = opts.scan_consistency(c.into());
    }
    Ok(opts)
}

fn run_query(cli: &Cli, args: &QueryArgs) -> Result<()> {
    let opts = build_options(args)?;
    let conn = connect(cli)?;
    let started = Instant::now();

    let (count, cursor) = if args.callback {
        stream_with_callback(&conn, opts, args)?
    } else {
        stream_blocking(&conn, opts, args)?
    };

    let elapsed = started.elapsed();
    println!();
    println!(
        "{} row(s) in {}{}",
        count.to_string().cyan(),
        format_duration(elapsed),
        if cursor.is_cancelled() { " (cancelled)".yellow().to_string() } else { String::new() }
    );

    if args.metadata {
        match cursor.metadata() {
            Some(meta) => {
                println!("{}", "Metadata:".green().bold());
                println!("{}", serde_json::to_string_pretty(&meta)?);
            }
            None => println!("{}", "(metadata unavailable)".dimmed()),
        }
    }

    drop(cursor);
    conn.close()?;
    Ok(())
}

fn stream_blocking(conn: &Connection, opts: QueryOptions, args: &QueryArgs) -> Result<(usize, Cursor)> {
    let mut cursor = conn.query(opts)?;
    let mut count = 0;
    while let Pull::Row(row) = cursor.next_row()? {
        print_row(&row, args.format);
        count += 1;
        if args.cancel_after == Some(count) {
            cursor.cancel();
        }
    }
    Ok((count, cursor))
}

fn stream_with_callback(
    conn: &Connection,
    opts: QueryOptions,
    args: &QueryArgs,
) -> Result<(usize, Cursor)> {
    let (tx, rx) = mpsc::channel();
    let on_row = move |event: columnar_bridge::error::Result<RowEvent>| -> Result<()> {
        tx.send(event).context("row receiver went away")?;
        Ok(())
    };
    let mut cursor = conn.query_with_rows(opts, on_row)?;

    let mut count = 0;
    loop {
        if cursor.next_row()? != Pull::Pending {
            break;
        }
        match rx.recv().context("row callback never ran")? {
            Ok(RowEvent::Row(row)) => {
                print_row(&row, args.format);
                count += 1;
                if args.cancel_after == Some(count) {
                    cursor.cancel();
                }
            }
            Ok(RowEvent::End) => break,
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(e) = cursor.take_callback_error() {
        return Err(e.into());
    }
    Ok((count, cursor))
}

fn print_row(row: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Raw => println!("{}", String::from_utf8_lossy(row)),
        OutputFormat::Json => match serde_json::from_slice::<serde_json::Value>(row) {
            Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_default()),
            Err(_) => println!("{}", String::from_utf8_lossy(row).yellow()),
        },
    }
}

fn explain_connstr(input: &str) {
    println!("{} {}", "Input:".dimmed(), input.yellow());
    println!();

    match columnar_bridge::parse_connection_string(input) {
        Ok(cs) => {
            println!("{}", "Parsed Structure:".green().bold());
            println!("  {} {}", "Scheme:".dimmed(), cs.scheme.cyan());
            println!("  {}", "Hosts:".dimmed());
            for host in &cs.hosts {
                let port = host.port.map(|p| p.to_string()).unwrap_or_else(|| "default".into());
                println!("    • {} {}", host.host.white(), format!("port {}", port).dimmed());
            }
            if !cs.params.is_empty() {
                println!("  {}", "Params:".dimmed());
                for (key, value) in &cs.params {
                    println!("    {} = {}", key.white(), value.to_string().yellow());
                }
            }

            let mut options = ClusterOptions::default();
            let mut remaining = cs.clone();
            match options.apply_params(&mut remaining) {
                Ok(()) => {
                    println!();
                    println!("{}", "Effective options:".green().bold());
                    println!("  {} {}", "I/O threads:".dimmed(), options.num_io_threads);
                    println!("  {} {}", "DNS SRV:".dimmed(), options.enable_dns_srv);
                    println!(
                        "  {} {}",
                        "Query timeout:".dimmed(),
                        format_duration(options.timeouts.query)
                    );
                }
                Err(e) => eprintln!("{} {}", "Option Error:".red().bold(), e),
            }
        }
        Err(e) => {
            eprintln!("{} {}", "Parse Error:".red().bold(), e);
        }
    }
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() >= 1 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        format!("{:.1}ms", d.as_secs_f64() * 1000.0)
    }
}
