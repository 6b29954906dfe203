use std::{env, process};

use hugenvme::{Config, Result};
use rand::RngCore;
use tracing_subscriber::EnvFilter;

const OFFSET: u64 = 4096;
const SIZE: usize = 4096;

fn run(config: &Config) -> Result<bool> {
    let mut driver = hugenvme::initialize(config)?;
    let info = driver.controller();
    println!(
        "controller {} ({}), {} bytes, max transfer {} bytes",
        info.name,
        info.model,
        info.namespace_bytes(),
        info.max_transfer_bytes
    );

    let mut source = driver.allocate(SIZE)?;
    rand::thread_rng().fill_bytes(&mut source);
    driver.write(&source, OFFSET, SIZE)?;

    let mut dest = driver.allocate(SIZE)?;
    driver.read(&mut dest, OFFSET, SIZE)?;
    let equal = source[..] == dest[..];

    driver.free(source)?;
    driver.free(dest)?;
    driver.finalize()?;
    Ok(equal)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match env::args().nth(1) {
        Some(path) => Config::load(path),
        None => Ok(Config::simulated()),
    };

    match config.and_then(|config| run(&config)) {
        Ok(true) => println!("read back {SIZE} bytes at offset {OFFSET}: data matches"),
        Ok(false) => {
            eprintln!("read back {SIZE} bytes at offset {OFFSET}: data differs");
            process::exit(1);
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
