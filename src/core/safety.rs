//! Preconditions for restoring into production.

use chrono::{DateTime, Duration, Utc};

use super::models::{Job, RestoreOptions};
use crate::error::{OrchestratorError, Result};

/// Backups older than this need an explicit override before a production restore.
pub const MAX_BACKUP_AGE_DAYS: i64 = 7;

/// Check a production restore against the freshness and DR-verification rules.
///
/// Freshness is evaluated first, so a stale, unverified backup reports its age.
pub fn validate(
    now: DateTime<Utc>,
    backup: &Job,
    has_successful_dr_test: bool,
    options: &RestoreOptions,
) -> Result<()> {
    let taken_at = backup.completed_at.unwrap_or(backup.created_at);
    let age = now - taken_at;

    if age > Duration::days(MAX_BACKUP_AGE_DAYS) && !options.force_trust_old_backup {
        return Err(OrchestratorError::validation(format!(
            "Backup is {} days old. Set forceTrustOldBackup to restore it to production",
            age.num_days()
        )));
    }

    if !has_successful_dr_test && !options.skip_validation_check {
        return Err(OrchestratorError::validation(
            "Backup has not passed a DR test. Set skipValidationCheck to restore it to production",
        ));
    }

    Ok(())
}
