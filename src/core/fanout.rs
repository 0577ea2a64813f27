//! Concurrent per-provider calls and outcome classification.

use std::future::Future;
use tokio::task::JoinSet;
use tracing::warn;

use super::models::Provider;
use crate::gateway::ProviderError;

/// Aggregate of one call per provider, ordered by provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanOut<T> {
    AllSucceeded(Vec<(Provider, T)>),
    AllFailed(Vec<ProviderError>),
    Mixed {
        successes: Vec<(Provider, T)>,
        failures: Vec<ProviderError>,
    },
}

/// Run `call` once per provider concurrently and wait for all of them.
///
/// A failing call never cancels its siblings.
pub async fn fan_out<T, F, Fut>(providers: &[Provider], call: F) -> FanOut<T>
where
    T: Send + 'static,
    F: Fn(Provider) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for &provider in providers {
        let fut = call(provider);
        set.spawn(async move { (provider, fut.await) });
    }

    let mut results = Vec::with_capacity(providers.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "Provider task aborted"),
        }
    }

    classify(results, providers)
}

/// Split settled results into the three outcome classes.
///
/// A provider whose task vanished (panicked) counts as failed. No providers
/// at all is vacuously `AllSucceeded`.
pub fn classify<T>(
    mut results: Vec<(Provider, Result<T, ProviderError>)>,
    expected: &[Provider],
) -> FanOut<T> {
    for &provider in expected {
        if !results.iter().any(|(p, _)| *p == provider) {
            results.push((provider, Err(ProviderError::new(provider, "provider task aborted"))));
        }
    }
    results.sort_by_key(|(p, _)| *p);

    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (provider, result) in results {
        match result {
            Ok(value) => successes.push((provider, value)),
            Err(e) => failures.push(e),
        }
    }

    match (successes.is_empty(), failures.is_empty()) {
        (_, true) => FanOut::AllSucceeded(successes),
        (true, false) => FanOut::AllFailed(failures),
        (false, false) => FanOut::Mixed { successes, failures },
    }
}

/// `"aws: reason; gcp: reason"`
pub fn join_failures(failures: &[ProviderError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
