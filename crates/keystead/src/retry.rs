use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Each round tries every endpoint once.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter (`0..=jitter_max_ms`) added to each backoff sleep.
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffConfig {
    fn from(c: &RetryConfig) -> Self {
        Self {
            rounds: usize::try_from(c.rounds.max(1)).unwrap_or(1),
            base_delay: Duration::from_millis(c.base_delay_ms),
            max_delay: Duration::from_millis(c.max_delay_ms),
            jitter_max_ms: c.base_delay_ms / 2,
        }
    }
}

fn backoff_delay(cfg: &BackoffConfig, round: usize) -> Duration {
    let shift = u32::try_from(round.min(16)).unwrap_or(16_u32);
    let factor = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(factor).min(max_ms);
    let jitter = if cfg!(test) || cfg.jitter_max_ms == 0 {
        0
    } else {
        // No RNG handle is held across the sleep.
        rand::random::<u64>() % cfg.jitter_max_ms.saturating_add(1).max(1)
    };
    Duration::from_millis(ms.saturating_add(jitter))
}

/// Primary URL first, then fallbacks; blanks and repeats dropped.
pub fn endpoint_list(primary: &str, fallbacks: &[String]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::with_capacity(1 + fallbacks.len());
    for u in std::iter::once(primary).chain(fallbacks.iter().map(String::as_str)) {
        let t = u.trim();
        if !t.is_empty() && !urls.iter().any(|x| x == t) {
            urls.push(t.to_owned());
        }
    }
    urls
}

/// Run `op` against every endpoint in order, for `rounds` rounds, sleeping with
/// exponential backoff only after a whole round has failed.
pub async fn try_all_with_backoff<I, T, Fut>(
    items: &[I],
    cfg: &BackoffConfig,
    mut op: impl FnMut(&I) -> Fut + Send,
    context_label: &'static str,
) -> eyre::Result<T>
where
    I: Sync,
    Fut: std::future::Future<Output = eyre::Result<T>> + Send,
{
    if items.is_empty() {
        eyre::bail!("no endpoints configured");
    }
    if cfg.rounds == 0 {
        eyre::bail!("invalid backoff config: rounds=0");
    }

    let mut last_err: Option<eyre::Report> = None;
    for round in 0..cfg.rounds {
        for item in items {
            match op(item).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::debug!(round, error = %e, label = context_label, "endpoint attempt failed");
                    last_err = Some(e);
                }
            }
        }
        if round + 1 < cfg.rounds {
            tokio::time::sleep(backoff_delay(cfg, round)).await;
        }
    }

    Err(last_err
        .unwrap_or_else(|| eyre::eyre!("no attempt made"))
        .wrap_err(context_label))
}
