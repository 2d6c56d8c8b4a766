//! Token-bucket-with-decay admission control for upstream ledger requests.
//!
//! Tickets are issued on admission and drain continuously at `decay_per_second`. A fully drained
//! bucket always admits a request, even one larger than `max_tickets`; a partially full bucket
//! refuses once the request would overflow it. Rate limiting is cooperative: callers reserve
//! before issuing a request.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::time::{Instant, sleep};

/// Interval between admission attempts in [`RateLimiter::wait_for_tickets`].
pub const TICKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Returned when [`RateLimiter::wait_for_tickets`] exceeds its timeout.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Timed out after {waited:?} waiting for {count} rate limiter tickets")]
pub struct TicketTimeout {
    pub count: u32,
    pub waited: Duration,
}

type Observer = Arc<dyn Fn(u32) + Send + Sync>;

#[derive(Debug)]
struct Bucket {
    issued: f64,
    max_tickets: f64,
    decay_per_second: f64,
    last_decay: Instant,
}

impl Bucket {
    fn decay(&mut self, now: Instant) {
        if now > self.last_decay {
            let elapsed = now.duration_since(self.last_decay).as_secs_f64();
            self.issued = (self.issued - elapsed * self.decay_per_second).max(0.0);
            self.last_decay = now;
        }
    }
}

/// Shared ticket bucket. Clones share the same bucket.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    on_reserved: Option<Observer>,
}

impl RateLimiter {
    /// Creates a limiter admitting roughly `decay_per_second` tickets per second with bursts up to
    /// `max_tickets`.
    #[must_use]
    pub fn new(max_tickets: f64, decay_per_second: f64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                issued: 0.0,
                max_tickets,
                decay_per_second,
                last_decay: Instant::now(),
            })),
            on_reserved: None,
        }
    }

    /// Sets a callback invoked with the ticket count on every admission.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_reserved = Some(Arc::new(observer));
        self
    }

    #[must_use]
    pub fn max_tickets(&self) -> f64 {
        self.bucket().max_tickets
    }

    #[must_use]
    pub fn decay_per_second(&self) -> f64 {
        self.bucket().decay_per_second
    }

    pub fn set_max_tickets(&self, max_tickets: f64) {
        self.bucket().max_tickets = max_tickets;
    }

    pub fn set_decay_per_second(&self, decay_per_second: f64) {
        self.bucket().decay_per_second = decay_per_second;
    }

    /// Tickets currently outstanding after decay.
    #[must_use]
    pub fn issued_tickets(&self) -> f64 {
        let mut bucket = self.bucket();
        bucket.decay(Instant::now());
        bucket.issued
    }

    /// Attempts to reserve `count` tickets without waiting.
    ///
    /// `force` admits regardless of the bucket level.
    pub fn reserve_tickets(&self, count: u32, force: bool) -> bool {
        {
            let mut bucket = self.bucket();
            bucket.decay(Instant::now());

            let requested = f64::from(count);
            if !force && bucket.issued > 0.0 && bucket.issued + requested > bucket.max_tickets {
                return false;
            }
            bucket.issued += requested;
        }

        if let Some(observer) = &self.on_reserved {
            observer(count);
        }
        true
    }

    /// Waits until `count` tickets are admitted, polling every [`TICKET_POLL_INTERVAL`].
    ///
    /// # Errors
    ///
    /// * [`TicketTimeout`] - if `timeout` is set and elapses before admission.
    pub async fn wait_for_tickets(
        &self,
        count: u32,
        timeout: Option<Duration>,
    ) -> Result<(), TicketTimeout> {
        let started = Instant::now();
        loop {
            if self.reserve_tickets(count, false) {
                return Ok(());
            }
            let waited = started.elapsed();
            if let Some(timeout) = timeout
                && waited > timeout
            {
                return Err(TicketTimeout { count, waited });
            }
            sleep(TICKET_POLL_INTERVAL).await;
        }
    }

    /// Returns `count` tickets to the bucket ahead of decay.
    pub fn free_tickets(&self, count: u32) {
        let mut bucket = self.bucket();
        bucket.issued = (bucket.issued - f64::from(count)).max(0.0);
    }

    fn bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("bucket", &*self.bucket())
            .field("observed", &self.on_reserved.is_some())
            .finish()
    }
}
