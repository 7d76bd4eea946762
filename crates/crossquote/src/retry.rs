use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Number of full rounds. Each round tries every endpoint once; with a single endpoint this is
    /// the total attempt count.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter (`0..=jitter_max_ms`) added to each backoff sleep.
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
            jitter_max_ms: 250,
        }
    }
}

impl BackoffConfig {
    /// No sleeping between rounds. Used by tests and for latency-sensitive single requests.
    pub const fn immediate(rounds: usize) -> Self {
        Self {
            rounds,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        }
    }
}

/// Returned when an endpoint list is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoEndpoints;

fn compute_backoff_delay(cfg: &BackoffConfig, round: usize) -> Duration {
    let shift = u32::try_from(round.min(16)).unwrap_or(16_u32);
    let pow2 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(pow2).min(max_ms);
    let jitter = if cfg!(test) || cfg.jitter_max_ms == 0 {
        0
    } else {
        // Avoid holding a non-Send RNG across await points.
        let range = cfg.jitter_max_ms.saturating_add(1);
        rand::random::<u64>() % range
    };
    Duration::from_millis(ms.saturating_add(jitter))
}

/// Try `op(item)` across all items, in order, for `cfg.rounds` rounds. Between rounds, sleep with
/// exponential backoff + jitter, but only after every item has failed.
///
/// A failure that `is_retryable` rejects is returned immediately without trying further items.
pub async fn try_all_with_backoff<I, T, E, Fut>(
    items: &[I],
    cfg: &BackoffConfig,
    mut op: impl FnMut(&I) -> Fut + Send,
    is_retryable: impl Fn(&E) -> bool + Send,
) -> Result<T, E>
where
    I: Sync,
    E: From<NoEndpoints>,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
{
    let rounds = cfg.rounds.max(1);
    let mut last_err: Option<E> = None;

    for round in 0..rounds {
        for item in items {
            match op(item).await {
                Ok(v) => return Ok(v),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => last_err = Some(e),
            }
        }
        if last_err.is_none() {
            break;
        }

        if round + 1 < rounds {
            let d = compute_backoff_delay(cfg, round);
            tracing::debug!(round, delay_ms = d.as_millis(), "backing off before retry");
            tokio::time::sleep(d).await;
        }
    }

    Err(last_err.unwrap_or_else(|| E::from(NoEndpoints)))
}

/// Single-endpoint form of [`try_all_with_backoff`]: `cfg.rounds` attempts in total.
pub async fn retry_with_backoff<T, E, Fut>(
    cfg: &BackoffConfig,
    mut op: impl FnMut() -> Fut + Send,
    is_retryable: impl Fn(&E) -> bool + Send,
) -> Result<T, E>
where
    E: From<NoEndpoints>,
    Fut: std::future::Future<Output = Result<T, E>> + Send,
{
    try_all_with_backoff(&[()], cfg, |_: &()| op(), is_retryable).await
}
