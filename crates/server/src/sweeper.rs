use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use concierge_agent::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Runs `Router::sweep_idle` every `every` until `shutdown` flips to true.
pub fn spawn(
    router: Arc<Router>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = router.sweep_idle(Utc::now()).await {
                        warn!(
                            event_name = "system.sweeper.failed",
                            correlation_id = "sweeper",
                            error = %error,
                            "idle sweep failed, retrying next tick"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            event_name = "system.sweeper.stopped",
            correlation_id = "shutdown",
            "sweeper stopped"
        );
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use concierge_agent::{
        AgentPool, EscalationPolicy, KeywordClassifier, Router, RouterComponents, RouterSettings,
    };
    use concierge_core::{
        Channel, ConversationState, NewConversation, NoopAuditSink, RateLimiter, Tier,
    };
    use concierge_db::{ConversationStore, InMemoryConversationStore, InMemoryHumanQueue};
    use tokio::sync::watch;

    fn router(store: Arc<InMemoryConversationStore>, inactivity: Duration) -> Arc<Router> {
        let settings =
            RouterSettings { inactivity_timeout: inactivity, ..RouterSettings::default() };
        Arc::new(Router::new(
            RouterComponents {
                store,
                queue: Arc::new(InMemoryHumanQueue::new()),
                limiter: Arc::new(RateLimiter::disabled()),
                classifier: Arc::new(KeywordClassifier::new()),
                pool: Arc::new(AgentPool::empty()),
                audit: Arc::new(NoopAuditSink),
            },
            EscalationPolicy::default(),
            settings,
        ))
    }

    #[tokio::test]
    async fn sweeper_closes_idle_conversations_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryConversationStore::new());
        let idle = store
            .create(NewConversation {
                caller_id: "caller-idle".to_string(),
                tier: Tier::Free,
                channel: Channel::Chat,
            })
            .await
            .expect("create");

        let (stop, stopped) = watch::channel(false);
        let router = router(store.clone(), Duration::from_millis(5));
        let handle = super::spawn(router, Duration::from_millis(10), stopped);

        let mut closed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.load(&idle.id).await.expect("load").state == ConversationState::Closed {
                closed = true;
                break;
            }
        }
        assert!(closed, "idle conversation should be closed by the sweeper");

        stop.send(true).expect("sweeper should still be listening");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .expect("sweeper task should not panic");
    }
}
