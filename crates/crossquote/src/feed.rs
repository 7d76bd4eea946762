use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::{
    errors::CoreError,
    types::{Account, NativeBalance},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Balance of an account's intrinsic currency.
#[async_trait]
pub trait NativeBalanceSource: Send + Sync {
    async fn native_balance(&self, account: &Account) -> Result<NativeBalance, CoreError>;
}

/// Live native balance for one account.
///
/// Polls the source on an interval and publishes only when the value moves. `on_change` fires for
/// every change after the first observation. The feed stops on `close` or when dropped.
pub struct NativeBalanceFeed {
    account: Account,
    rx: watch::Receiver<Option<NativeBalance>>,
    task: Option<JoinHandle<()>>,
}

impl NativeBalanceFeed {
    pub fn spawn<F>(
        source: Arc<dyn NativeBalanceSource>,
        account: Account,
        interval: Duration,
        on_change: F,
    ) -> Self
    where
        F: Fn(&NativeBalance) + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let polled = account.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let balance = match source.native_balance(&polled).await {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(
                            kind = polled.kind.as_str(),
                            code = e.code(),
                            error = %e,
                            "native balance poll failed"
                        );
                        continue;
                    }
                };
                let mut first = false;
                let changed = tx.send_if_modified(|cur| {
                    if cur.as_ref() == Some(&balance) {
                        return false;
                    }
                    first = cur.is_none();
                    *cur = Some(balance);
                    true
                });
                if changed && !first {
                    tracing::debug!(kind = polled.kind.as_str(), "native balance changed");
                    on_change(&balance);
                }
            }
        });
        tracing::debug!(kind = account.kind.as_str(), "native feed opened");

        Self {
            account,
            rx,
            task: Some(task),
        }
    }

    pub const fn account(&self) -> &Account {
        &self.account
    }

    /// Most recent value; `None` until the first successful poll.
    pub fn latest(&self) -> Option<NativeBalance> {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<NativeBalance>> {
        self.rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop polling. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(kind = self.account.kind.as_str(), "native feed closed");
        }
    }
}

impl Drop for NativeBalanceFeed {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    };

    /// Replays a script of lamport values, repeating the last one.
    struct Scripted {
        values: Vec<u64>,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl NativeBalanceSource for Scripted {
        async fn native_balance(&self, _account: &Account) -> Result<NativeBalance, CoreError> {
            let i = self.polls.fetch_add(1, Ordering::SeqCst);
            let v = self
                .values
                .get(i)
                .or_else(|| self.values.last())
                .copied()
                .unwrap_or(0);
            Ok(NativeBalance::lamports(v))
        }
    }

    fn scripted(values: Vec<u64>) -> Arc<Scripted> {
        Arc::new(Scripted {
            values,
            polls: AtomicUsize::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_changes_and_notifies_after_first_value() -> eyre::Result<()> {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&seen);
        let feed = NativeBalanceFeed::spawn(
            scripted(vec![5, 5, 7, 7]),
            Account::solana("11111111111111111111111111111111"),
            Duration::from_secs(1),
            move |b| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(b.amount);
            },
        );
        let mut rx = feed.subscribe();
        rx.changed().await?;
        assert_eq!(feed.latest(), Some(NativeBalance::lamports(5)));

        rx.changed().await?;
        assert_eq!(feed.latest(), Some(NativeBalance::lamports(7)));

        let seen = seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(seen, vec![NativeBalance::lamports(7).amount]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent_and_stops_polling() -> eyre::Result<()> {
        let src = scripted(vec![1, 2, 3, 4]);
        let mut feed = NativeBalanceFeed::spawn(
            Arc::clone(&src) as Arc<dyn NativeBalanceSource>,
            Account::bitcoin("bc1q"),
            Duration::from_secs(1),
            |_| {},
        );
        let mut rx = feed.subscribe();
        rx.changed().await?;

        feed.close();
        feed.close();
        assert!(feed.is_closed());
        tokio::task::yield_now().await;

        let polls = src.polls.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(src.polls.load(Ordering::SeqCst), polls);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn drop_closes_the_feed() -> eyre::Result<()> {
        let src = scripted(vec![1]);
        let feed = NativeBalanceFeed::spawn(
            Arc::clone(&src) as Arc<dyn NativeBalanceSource>,
            Account::bitcoin("bc1q"),
            Duration::from_secs(1),
            |_| {},
        );
        let mut rx = feed.subscribe();
        rx.changed().await?;
        drop(feed);
        assert!(rx.changed().await.is_err(), "sender is gone once the task is aborted");
        Ok(())
    }
}
