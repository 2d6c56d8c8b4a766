use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Handle to a self-rescheduling loop started with [`spawn_periodic`]. Dropping it stops the loop.
#[derive(Debug)]
pub(crate) struct PeriodicTask {
    token: CancellationToken,
}

impl PeriodicTask {
    /// Prevents the next cycle from being scheduled.
    ///
    /// A cycle already in flight runs to completion; outstanding requests are not aborted.
    pub(crate) fn stop(self) {
        self.token.cancel();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Runs `cycle` every `period`, drift-compensated.
///
/// At most one cycle is in flight: the next delay, `max(0, period - elapsed)`, is armed only after
/// the current cycle's future completes.
pub(crate) fn spawn_periodic<F, Fut>(period: Duration, mut cycle: F) -> PeriodicTask
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        loop {
            let started = Instant::now();
            cycle().await;

            let delay = period.saturating_sub(started.elapsed());
            tokio::select! {
                () = cancelled.cancelled() => break,
                () = sleep(delay) => {}
            }
        }
    });

    PeriodicTask { token }
}
