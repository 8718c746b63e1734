use std::future::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Runs `fut` until it finishes, `deadline` passes or `token` is cancelled.
///
/// Cancellation is checked first, so a cancelled call never reports a result.
pub(crate) async fn bounded<T, F>(
    token: &CancellationToken,
    deadline: Instant,
    op: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        res = tokio::time::timeout_at(deadline, fut) => match res {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                message: op.to_string(),
            }),
        },
    }
}
