//! Caller-driven cancellation.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::error::{StorageError, StorageResult};

/// Run `fut` until it completes or `token` is cancelled, whichever comes first.
///
/// Cancellation drops the in-flight future, which aborts the driver call; sqlx rolls back
/// any transaction the future held. The caller sees [`StorageError::Cancelled`].
pub async fn run_cancellable<F, T>(token: &CancellationToken, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let result = run_cancellable(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancellation_wins_over_slow_future() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let result: StorageResult<()> = run_cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }
}
