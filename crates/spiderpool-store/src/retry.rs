use crate::{Repository, StoreError};
use spiderpool_core::Resource;
use std::time::Duration;
use tracing::debug;

/// Budget and pacing for optimistic-write retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_unit: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: spiderpool_core::constants::DEFAULT_MAX_CONFLICT_RETRIES,
            retry_unit: Duration::from_millis(
                spiderpool_core::constants::DEFAULT_CONFLICT_RETRY_UNIT_MS,
            ),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff: `unit * 2^(attempt-1)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_unit * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// What the mutator decided for the freshly-read resource
pub enum Mutation {
    /// Persist the mutated resource
    Apply,
    /// Nothing to change; return the resource as read
    Noop,
}

/// Read-modify-write with conflict retry against the full resource.
///
/// On every attempt the resource is re-read, so the mutator always sees the
/// winner's state. `on_conflict` is invoked once per lost write with the
/// attempt number (for the conflict counters).
pub async fn update_with_retry<T, E, F>(
    repo: &Repository<T>,
    namespace: Option<&str>,
    name: &str,
    cfg: &RetryConfig,
    on_conflict: &mut (dyn FnMut(u32) + Send),
    mut mutate: F,
) -> Result<T, E>
where
    T: Resource,
    E: From<StoreError>,
    F: FnMut(&mut T) -> Result<Mutation, E>,
{
    write_with_retry(repo, namespace, name, cfg, on_conflict, &mut mutate, false).await
}

/// Like [`update_with_retry`], but only the status subresource is written
pub async fn update_status_with_retry<T, E, F>(
    repo: &Repository<T>,
    namespace: Option<&str>,
    name: &str,
    cfg: &RetryConfig,
    on_conflict: &mut (dyn FnMut(u32) + Send),
    mut mutate: F,
) -> Result<T, E>
where
    T: Resource,
    E: From<StoreError>,
    F: FnMut(&mut T) -> Result<Mutation, E>,
{
    write_with_retry(repo, namespace, name, cfg, on_conflict, &mut mutate, true).await
}

async fn write_with_retry<T, E, F>(
    repo: &Repository<T>,
    namespace: Option<&str>,
    name: &str,
    cfg: &RetryConfig,
    on_conflict: &mut (dyn FnMut(u32) + Send),
    mutate: &mut F,
    status_only: bool,
) -> Result<T, E>
where
    T: Resource,
    E: From<StoreError>,
    F: FnMut(&mut T) -> Result<Mutation, E>,
{
    let mut attempt = 0;
    loop {
        let mut resource = repo.get(namespace, name).map_err(E::from)?;
        match mutate(&mut resource)? {
            Mutation::Noop => return Ok(resource),
            Mutation::Apply => {}
        }

        let written = if status_only {
            repo.update_status(&resource)
        } else {
            repo.update(&resource)
        };

        match written {
            Ok(updated) => return Ok(updated),
            Err(err) if err.is_conflict() && attempt < cfg.max_retries => {
                attempt += 1;
                on_conflict(attempt);
                let backoff = cfg.backoff(attempt);
                debug!(
                    "Conflict updating {} '{}' (attempt {}), backing off {:?}",
                    T::KIND,
                    name,
                    attempt,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
