//! A small exponential-backoff retry stream, in the style the teacher's
//! `mz_ore::retry` module is used in `RehydratingStorageClient` (a
//! `Retry::default().clamp_backoff(..).into_retry_stream()` call sleeps
//! between reconnection attempts).

use std::time::Duration;

use futures::stream::{self, Stream};

/// Builder for a backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    initial_backoff: Duration,
    multiplier: u32,
    max_backoff: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Retry { initial_backoff: Duration::from_millis(125), multiplier: 2, max_backoff: Duration::from_secs(60) }
    }
}

impl Retry {
    pub fn initial_backoff(mut self, d: Duration) -> Self {
        self.initial_backoff = d;
        self
    }

    pub fn clamp_backoff(mut self, d: Duration) -> Self {
        self.max_backoff = d;
        self
    }

    /// Returns an infinite stream that, when polled, sleeps for the next
    /// backoff duration before yielding. The caller drives retries by
    /// `.next().await`-ing this stream between attempts.
    pub fn into_retry_stream(self) -> impl Stream<Item = Duration> + Unpin {
        let mut backoff = self.initial_backoff;
        let max = self.max_backoff;
        let multiplier = self.multiplier;

        Box::pin(stream::unfold((), move |()| {
            let delay = backoff;
            backoff = std::cmp::min(backoff * multiplier, max);
            async move {
                tokio::time::sleep(delay).await;
                Some((delay, ()))
            }
        }))
    }
}

/// Sleeps for `delay`, clamped below by `floor` — used for the
/// server-suggested discovery retry delay, which spec §7 bounds below by 5s.
pub async fn sleep_at_least(delay: Duration, floor: Duration) {
    tokio::time::sleep(std::cmp::max(delay, floor)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn backoff_is_monotonic_and_clamped() {
        let mut stream = Retry::default().initial_backoff(Duration::from_millis(10)).clamp_backoff(Duration::from_millis(40)).into_retry_stream();
        let mut last = Duration::ZERO;
        for _ in 0..6 {
            let d = stream.next().await.unwrap();
            assert!(d >= last || d == Duration::from_millis(40));
            last = d;
        }
        assert!(last <= Duration::from_millis(40));
    }
}
