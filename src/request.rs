use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::driver::{Driver, Ticket};
use crate::error::{Error, Result};
use crate::memory::DmaBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Submitted,
    Pending,
    Completed,
    Error,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "Submitted"),
            Self::Pending => write!(f, "Waiting"),
            Self::Completed => write!(f, "Completed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Future resolving when a submitted command completes.
///
/// Completions are observed by polling the ring as in the blocking path: one
/// pending request per queue pair keeps polling, the rest stay parked until
/// a poll consumes their completion.
/// Dropping an unfinished request abandons the command: its late completion
/// is drained instead of being matched to another caller.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Request<'a> {
    driver: &'a Driver,
    ticket: Option<Ticket>,
    state: State,
}

impl<'a> Request<'a> {
    pub fn new(driver: &'a Driver, ticket: Ticket) -> Self {
        Self {
            driver,
            ticket: Some(ticket),
            state: State::Submitted,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }
}

impl Future for Request<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(ticket) = this.ticket.as_ref() else {
            return Poll::Ready(Err(Error::NotInitialized));
        };

        match this.driver.poll_ticket(ticket, cx.waker()) {
            Poll::Ready(result) => {
                this.ticket = None;
                this.state = if result.is_ok() {
                    State::Completed
                } else {
                    State::Error
                };
                Poll::Ready(result)
            }
            Poll::Pending => {
                this.state = State::Pending;
                Poll::Pending
            }
        }
    }
}

impl Drop for Request<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            tracing::debug!(
                queue = ticket.queue(),
                c_id = ticket.command_id().0,
                state = %self.state,
                "request dropped before completion"
            );
            self.driver.abandon(ticket);
        }
    }
}

impl Driver {
    /// Read into `buffer`, yielding to the runtime until the completion arrives.
    pub async fn read_async(&self, buffer: &mut DmaBuffer, offset: u64, size: usize) -> Result<()> {
        let ticket = self.submit_read(buffer, offset, size)?;
        self.complete_async(ticket).await
    }

    /// Write `buffer`, yielding to the runtime until the completion arrives.
    pub async fn write_async(&self, buffer: &DmaBuffer, offset: u64, size: usize) -> Result<()> {
        let ticket = self.submit_write(buffer, offset, size)?;
        self.complete_async(ticket).await
    }

    /// Await `ticket` under the driver's I/O timeout.
    pub async fn complete_async(&self, ticket: Ticket) -> Result<()> {
        let timeout = self.timeout();
        match tokio::time::timeout(timeout, Request::new(self, ticket)).await {
            Ok(result) => result,
            Err(_) => Err(Error::IoTimeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sim::SimulatedController;
    use std::sync::Arc;

    fn driver(name: &str, timeout_ms: u64) -> (Arc<SimulatedController>, Driver) {
        let mut config = Config::simulated();
        config.io.timeout_ms = timeout_ms;
        let sim = Arc::new(SimulatedController::new(name, config.simulator.clone()));
        let driver = Driver::with_transport(&config, sim.clone()).unwrap();
        (sim, driver)
    }

    #[tokio::test]
    async fn request_resolves_on_completion() {
        let (_sim, driver) = driver("request-unit-resolve", 1000);
        let buffer = driver.allocate(512).unwrap();
        let ticket = driver.submit_write(&buffer, 0, 512).unwrap();

        let mut request = Request::new(&driver, ticket);
        assert_eq!(request.state(), State::Submitted);
        assert!((&mut request).await.is_ok());
        assert_eq!(request.state(), State::Completed);
    }

    #[tokio::test]
    async fn dropped_request_abandons_command() {
        let (sim, driver) = driver("request-unit-drop", 1000);
        sim.hold_completions(true);
        let buffer = driver.allocate(512).unwrap();
        let ticket = driver.submit_write(&buffer, 0, 512).unwrap();
        drop(Request::new(&driver, ticket));

        // abandoned commands stay outstanding until drained
        assert_eq!(driver.outstanding(), 1);
        sim.hold_completions(false);
        assert_eq!(driver.poll_completions(), 1);
        assert_eq!(driver.outstanding(), 0);
    }

    #[tokio::test]
    async fn held_completion_times_out() {
        let (sim, driver) = driver("request-unit-timeout", 20);
        sim.hold_completions(true);
        let mut buffer = driver.allocate(512).unwrap();
        assert!(matches!(
            driver.read_async(&mut buffer, 0, 512).await,
            Err(Error::IoTimeout(_))
        ));
        assert!(matches!(
            driver.write_async(&buffer, 0, 512).await,
            Err(Error::BufferBusy(_))
        ));
    }
}
