use std::sync::Arc;

use futures::future::join_all;
use hugenvme::config::CompletionOrder;
use hugenvme::{Config, Driver, Error, SimulatedController};
use rand::{rngs::StdRng, RngCore, SeedableRng};

fn attach(name: &str, order: CompletionOrder) -> (Arc<SimulatedController>, Driver) {
    let mut config = Config::simulated();
    config.queues.io_queues = 2;
    config.io.timeout_ms = 1000;
    config.simulator.completion_order = order;
    let sim = Arc::new(SimulatedController::new(name, config.simulator.clone()));
    let driver = Driver::with_transport(&config, sim.clone()).unwrap();
    (sim, driver)
}

#[tokio::test]
async fn async_write_then_read() {
    let (_sim, mut driver) = attach("async-roundtrip", CompletionOrder::InOrder);
    let mut rng = StdRng::seed_from_u64(3);

    let mut source = driver.allocate(8192).unwrap();
    rng.fill_bytes(&mut source);
    driver.write_async(&source, 8192, 8192).await.unwrap();

    let mut dest = driver.allocate(8192).unwrap();
    driver.read_async(&mut dest, 8192, 8192).await.unwrap();
    assert_eq!(&source[..], &dest[..]);

    driver.free(source).unwrap();
    driver.free(dest).unwrap();
    driver.finalize().unwrap();
}

#[tokio::test]
async fn concurrent_reads_complete_out_of_order() {
    let (sim, driver) = attach("async-concurrent", CompletionOrder::Reversed);
    let mut rng = StdRng::seed_from_u64(11);

    let mut source = driver.allocate(32 * 512).unwrap();
    rng.fill_bytes(&mut source);
    driver.write(&source, 0, 32 * 512).unwrap();

    let mut buffers: Vec<_> = (0..32).map(|_| driver.allocate(512).unwrap()).collect();
    sim.hold_completions(true);
    let tickets: Vec<_> = buffers
        .iter_mut()
        .enumerate()
        .map(|(i, buffer)| driver.submit_read(buffer, i as u64 * 512, 512).unwrap())
        .collect();
    sim.hold_completions(false);

    let results = join_all(tickets.into_iter().map(|t| driver.complete_async(t))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    for (i, buffer) in buffers.iter().enumerate() {
        assert_eq!(&buffer[..], &source[i * 512..(i + 1) * 512]);
    }
    assert_eq!(driver.outstanding(), 0);
}

#[tokio::test]
async fn async_errors_match_blocking_path() {
    let (sim, driver) = attach("async-errors", CompletionOrder::InOrder);
    let mut buffer = driver.allocate(512).unwrap();

    assert!(matches!(
        driver.read_async(&mut buffer, 0, 100).await,
        Err(Error::Misaligned { .. })
    ));

    sim.inject_media_error(0);
    let err = driver.read_async(&mut buffer, 0, 512).await.unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
    assert_eq!(err.status().map(|s| s.sct()), Some(2));
}
