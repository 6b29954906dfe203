use std::time::Instant;
use std::{env, process};

use futures::future::join_all;
use hugenvme::{Config, Result};
use tracing_subscriber::EnvFilter;

const READS: usize = 64;
const IO_SIZE: usize = 512 * 8;

async fn run(config: &Config) -> Result<()> {
    let mut driver = hugenvme::initialize(config)?;

    let mut buffers = (0..READS)
        .map(|_| driver.allocate(IO_SIZE))
        .collect::<Result<Vec<_>>>()?;

    let start = Instant::now();
    let reads = buffers
        .iter_mut()
        .enumerate()
        .map(|(i, buffer)| driver.read_async(buffer, (i * IO_SIZE) as u64, IO_SIZE));
    let results = join_all(reads).await;
    let elapsed = start.elapsed();

    let failed = results.iter().filter(|r| r.is_err()).count();
    println!("{READS} reads of {IO_SIZE} bytes in {elapsed:?}, {failed} failed");
    if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
        return Err(e);
    }

    for buffer in buffers {
        driver.free(buffer)?;
    }
    driver.finalize()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match env::args().nth(1) {
        Some(path) => Config::load(path),
        None => Ok(Config::simulated()),
    };
    let result = match config {
        Ok(config) => run(&config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
