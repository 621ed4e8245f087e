//! Create-or-update and poll-until-state helpers

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Result of an idempotent write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upserted<T> {
    Created(T),
    Updated(T),
}

impl<T> Upserted<T> {
    pub fn into_inner(self) -> T {
        match self {
            Upserted::Created(v) | Upserted::Updated(v) => v,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Upserted::Created(_))
    }
}

/// Inspect before create: `update` receives the existing value when `get`
/// finds one, otherwise `create` runs.
pub async fn create_or_update<T, E, G, GF, C, CF, U, UF>(
    get: G,
    create: C,
    update: U,
) -> Result<Upserted<T>, E>
where
    G: FnOnce() -> GF,
    GF: Future<Output = Result<Option<T>, E>>,
    C: FnOnce() -> CF,
    CF: Future<Output = Result<T, E>>,
    U: FnOnce(T) -> UF,
    UF: Future<Output = Result<T, E>>,
{
    match get().await? {
        Some(existing) => Ok(Upserted::Updated(update(existing).await?)),
        None => Ok(Upserted::Created(create().await?)),
    }
}

/// Outcome of polling a remote resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The predicate matched
    Reached(T),
    /// The deadline passed; carries the last observed value
    TimedOut(Option<T>),
}

/// Fetch repeatedly until `done` holds or `timeout` elapses. Fetch errors are
/// returned immediately; callers wrap `fetch` in a retry when needed.
pub async fn poll_until<T, E, F, Fut, P>(
    interval: Duration,
    timeout: Duration,
    mut fetch: F,
    done: P,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut polls = 0u32;

    loop {
        let value = fetch().await?;
        polls += 1;
        if done(&value) {
            debug!(polls, "Poll reached desired state");
            return Ok(PollOutcome::Reached(value));
        }
        if Instant::now() + interval > deadline {
            return Ok(PollOutcome::TimedOut(Some(value)));
        }
        tokio::time::sleep(interval).await;
    }
}
