use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kcart_agent::AgentRuntime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Periodically evicts idle sessions and drained rate-limit keys until
/// `shutdown` fires.
pub fn spawn(
    runtime: Arc<AgentRuntime>,
    every: Duration,
    max_idle: chrono::Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let (sessions, rate_keys) = runtime.sweep(max_idle, Utc::now());
                    if sessions > 0 || rate_keys > 0 {
                        info!(
                            event_name = "system.sweeper.swept",
                            correlation_id = "sweeper",
                            sessions_removed = sessions,
                            rate_keys_removed = rate_keys,
                            active_sessions = runtime.sessions().len(),
                            "idle state evicted"
                        );
                    } else {
                        debug!(event_name = "system.sweeper.idle", correlation_id = "sweeper", "nothing to evict");
                    }
                }
            }
        }
        debug!(event_name = "system.sweeper.stopped", correlation_id = "sweeper", "sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use kcart_core::domain::session::SessionId;
    use kcart_core::rate_limit::RateLimitPolicy;
    use tokio_util::sync::CancellationToken;

    use crate::test_support::{runtime, OracleMode};

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_idle_sessions_and_stops_on_shutdown() {
        let runtime = runtime(OracleMode::Scripted, RateLimitPolicy::default(), Duration::from_secs(5));
        let stale = Utc::now() - chrono::Duration::hours(2);
        runtime.sessions().get_or_create(&SessionId("old".to_string()), stale).await;
        runtime.sessions().get_or_create(&SessionId("fresh".to_string()), Utc::now()).await;

        let shutdown = CancellationToken::new();
        let handle = super::spawn(
            runtime.clone(),
            Duration::from_secs(60),
            chrono::Duration::hours(1),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!runtime.sessions().contains(&SessionId("old".to_string())));
        assert!(runtime.sessions().contains(&SessionId("fresh".to_string())));

        shutdown.cancel();
        handle.await.expect("sweeper task exits cleanly");
    }
}
