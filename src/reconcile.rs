//! Destination table reconciliation.
//!
//! A destination table is created at most once, from the first sanitized row of
//! the first non-empty extraction. Warehouses may not show a new table to
//! existence checks immediately, so creation is followed by a bounded
//! readiness poll.

use crate::config::ReadinessConfig;
use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::sanitize::SanitizedRow;
use crate::schema::DestinationSchema;
use backoff::backoff::{Backoff, Constant};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Source of delays between readiness probes.
pub trait Clock {
    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How long to wait for a created table to become visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Maximum number of existence probes after creation
    pub attempts: u32,
    /// Delay between consecutive probes
    pub delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            attempts: config.attempts,
            delay: config.delay(),
        }
    }
}

/// Result of [`SchemaReconciler::ensure_table`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The table already existed and was left untouched.
    Existing,
    /// The table was created with this schema and confirmed visible.
    Created(DestinationSchema),
}

impl Reconciled {
    /// Whether the table was created by this call.
    pub fn created(&self) -> bool {
        matches!(self, Reconciled::Created(_))
    }
}

/// Ensures destination tables exist before rows are loaded into them.
pub struct SchemaReconciler<'a, D, C> {
    destination: &'a D,
    clock: &'a C,
    policy: ReadinessPolicy,
}

impl<'a, D: Destination, C: Clock> SchemaReconciler<'a, D, C> {
    /// Create a reconciler.
    pub fn new(destination: &'a D, clock: &'a C, policy: ReadinessPolicy) -> Self {
        Self {
            destination,
            clock,
            policy,
        }
    }

    /// Make sure `table` exists, creating it from `sample` when absent.
    ///
    /// An existing table is never altered, even if `sample` has keys it lacks.
    #[instrument(skip(self, sample), fields(columns = sample.len()))]
    pub async fn ensure_table(&self, table: &str, sample: &SanitizedRow) -> Result<Reconciled> {
        if self.destination.table_exists(table).await? {
            debug!("Destination table {} already exists", table);
            return Ok(Reconciled::Existing);
        }

        let schema = DestinationSchema::infer(table, sample);
        info!(
            "Creating destination table {} with {} columns",
            table,
            schema.columns.len()
        );
        self.destination.create_table(&schema).await?;

        self.wait_until_visible(table).await?;
        Ok(Reconciled::Created(schema))
    }

    /// Poll until `table` is visible or the attempt budget is spent.
    async fn wait_until_visible(&self, table: &str) -> Result<()> {
        let mut delays = Constant::new(self.policy.delay);

        for attempt in 1..=self.policy.attempts {
            match self.destination.table_exists(table).await {
                Ok(true) => {
                    debug!("Table {} visible after {} checks", table, attempt);
                    return Ok(());
                }
                Ok(false) => debug!("Table {} not visible yet (check {})", table, attempt),
                Err(e) => warn!(
                    "Existence check {} for table {} failed: {}",
                    attempt, table, e
                ),
            }

            if attempt < self.policy.attempts {
                if let Some(delay) = delays.next_backoff() {
                    self.clock.sleep(delay).await;
                }
            }
        }

        Err(Error::TableNotReady {
            table: table.to_string(),
            attempts: self.policy.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InstantClock, MemoryDestination};

    fn sample() -> SanitizedRow {
        vec![("a", Some("1".to_string())), ("b", None)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_existing_table_untouched() {
        let dest = MemoryDestination::new();
        dest.create_existing("t", &["a"]).await;
        let clock = InstantClock::new();

        let reconciler = SchemaReconciler::new(&dest, &clock, ReadinessPolicy::default());
        let outcome = reconciler.ensure_table("t", &sample()).await.unwrap();

        assert_eq!(outcome, Reconciled::Existing);
        assert_eq!(dest.columns("t").await.unwrap(), vec!["a"]);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_created_table_visible_immediately() {
        let dest = MemoryDestination::new();
        let clock = InstantClock::new();

        let reconciler = SchemaReconciler::new(&dest, &clock, ReadinessPolicy::default());
        let outcome = reconciler.ensure_table("t", &sample()).await.unwrap();

        assert!(outcome.created());
        assert_eq!(dest.columns("t").await.unwrap(), vec!["a", "b"]);
        assert!(clock.sleeps().is_empty());
        assert_eq!(dest.exists_calls("t").await, 2);
    }

    #[tokio::test]
    async fn test_initial_check_error_is_fatal() {
        let dest = MemoryDestination::new();
        dest.create_existing("t", &["a"]).await;
        dest.fail_probes("t", 1).await;
        let clock = InstantClock::new();

        let reconciler = SchemaReconciler::new(&dest, &clock, ReadinessPolicy::default());
        assert!(reconciler.ensure_table("t", &sample()).await.is_err());
        assert_eq!(dest.columns("t").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_probe_errors_count_as_not_ready() {
        let dest = MemoryDestination::new();
        dest.fail_probes("t", 2).await;
        let clock = InstantClock::new();

        let reconciler = SchemaReconciler::new(&dest, &clock, ReadinessPolicy::default());
        let outcome = reconciler.ensure_table("t", &sample()).await.unwrap();

        assert!(outcome.created());
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2); 2]);
    }

    #[tokio::test]
    async fn test_readiness_budget_exhausted() {
        let dest = MemoryDestination::new();
        dest.hide_table("t").await;
        let clock = InstantClock::new();

        let reconciler = SchemaReconciler::new(&dest, &clock, ReadinessPolicy::default());
        let err = reconciler.ensure_table("t", &sample()).await.unwrap_err();

        assert!(matches!(err, Error::TableNotReady { attempts: 5, .. }));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2); 4]);
        // One initial check plus five readiness probes
        assert_eq!(dest.exists_calls("t").await, 6);
    }

    #[tokio::test]
    async fn test_slow_visibility_within_budget() {
        let dest = MemoryDestination::new();
        dest.delay_visibility("t", 3).await;
        let clock = InstantClock::new();

        let policy = ReadinessPolicy {
            attempts: 5,
            delay: Duration::from_millis(10),
        };
        let reconciler = SchemaReconciler::new(&dest, &clock, policy);
        let outcome = reconciler.ensure_table("t", &sample()).await.unwrap();

        assert!(outcome.created());
        assert_eq!(clock.sleeps().len(), 3);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReadinessPolicy::from(&ReadinessConfig::default());
        assert_eq!(policy, ReadinessPolicy::default());
    }
}
