use std::{env, process};

use hugenvme::bench::latency_sweep;
use hugenvme::{Config, Result};
use tracing_subscriber::EnvFilter;

const DEFAULT_IOS: usize = 8192;

fn run(config: &Config, ios: usize) -> Result<()> {
    let mut driver = hugenvme::initialize(config)?;
    let samples = latency_sweep(&driver, ios)?;

    println!("{:>9} {:>14} {:>11}", "size (B)", "avg lat (us)", "elapsed (s)");
    for sample in &samples {
        println!("{sample}");
    }
    let stats = driver.stats();
    println!(
        "{} submissions, {} completions",
        stats.submissions, stats.completions
    );
    driver.finalize()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => Config::load(path),
        _ => Ok(Config::simulated()),
    };
    let ios = match args.next().map(|n| n.parse::<usize>()) {
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            eprintln!("Usage: latency [config.toml|-] [ios per size]");
            process::exit(1);
        }
        None => DEFAULT_IOS,
    };

    if let Err(e) = config.and_then(|config| run(&config, ios)) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
