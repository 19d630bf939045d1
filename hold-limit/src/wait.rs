use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;
use tokio::time::sleep_until;

use crate::LimitError;

/// Sleep until `wake`, or until `deadline` if that comes first, unless `cancel`
/// resolves before either.
///
/// No lock may be held across this call. Callers re-evaluate limiter state
/// from scratch after it returns `Ok`.
pub(crate) async fn pause<C>(
    wake: Instant,
    deadline: Option<Instant>,
    cancel: &mut Pin<&mut C>,
) -> Result<(), LimitError>
where
    C: Future<Output = ()>,
{
    let until = match deadline {
        Some(deadline) if deadline < wake => deadline,
        _ => wake,
    };

    tokio::select! {
        biased;
        _ = cancel.as_mut() => Err(LimitError::Canceled),
        _ = sleep_until(until) => {
            // Reaching the wake instant on the deadline itself still earns a re-check.
            if deadline.is_some_and(|deadline| deadline < wake && Instant::now() >= deadline) {
                Err(LimitError::Timeout)
            } else {
                Ok(())
            }
        }
    }
}

/// The absolute deadline for a wait of `timeout` starting now.
pub(crate) fn deadline_after(timeout: std::time::Duration) -> Instant {
    Instant::now() + timeout
}
