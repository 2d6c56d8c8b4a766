use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Interval between evaluations in [`wait_until`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Waits until `condition` holds, polling every [`POLL_INTERVAL`].
///
/// Returns `false` if `timeout` elapses first. Works with a paused clock: each poll advances
/// virtual time.
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Asserts that a condition becomes true within a timeout (default 5 seconds).
///
/// # Examples
///
/// ```ignore
/// ledger_scanner::assert_eventually!(coordinator.confirmed_watermark() >= 10);
/// ledger_scanner::assert_eventually!(coordinator.confirmed_watermark() >= 20, timeout_ms = 500);
/// ```
///
/// # Panics
///
/// * **Timeout**: the condition is still false when the timeout elapses.
#[macro_export]
macro_rules! assert_eventually {
    ($cond: expr) => {
        $crate::assert_eventually!($cond, timeout_ms = 5000)
    };
    ($cond: expr, timeout_ms = $ms: expr) => {
        assert!(
            $crate::test_utils::macros::wait_until(
                || $cond,
                std::time::Duration::from_millis($ms),
            )
            .await,
            "condition `{}` not met within {}ms",
            stringify!($cond),
            $ms
        )
    };
}

/// Asserts the exact sequence of block heights a [`RecordingBroadcaster`] has received.
///
/// [`RecordingBroadcaster`]: crate::test_utils::RecordingBroadcaster
#[macro_export]
macro_rules! assert_delivered_heights {
    ($broadcaster: expr, [$($height: expr),* $(,)?]) => {{
        let heights: Vec<u64> = $broadcaster.deliveries().iter().map(|(h, _)| *h).collect();
        let expected: Vec<u64> = vec![$($height),*];
        assert_eq!(heights, expected, "unexpected delivered heights");
    }};
}
