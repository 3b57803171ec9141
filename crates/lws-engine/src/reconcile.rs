//! Reconcile: bring the server's copy of the workspace in line with the
//! local tables.
//!
//! The server is reached through [`ReconcileService`]. Most calls end early:
//! when nothing is pending locally and the pending-change signatures agree
//! there is nothing to send.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use lws_baseline::Uuid;
use lws_config::{log_reconcile_debug, log_reconcile_info, log_reconcile_warn};
use lws_tables::{
    LocalVersionEntry, LocalVersionTable, LocalVersionUpdate, PendingChange, PendingChangesTable,
};

use crate::context::fold_key;
use crate::failure::Failure;
use crate::{EngineError, Result};

/// Local version rows replayed per call after the server lost its copy.
const REPLAY_BATCH: usize = 1000;

/// What the server is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub client_signature: Uuid,
    pub pending_changes: Vec<PendingChange>,
    pub local_version_updates: Vec<LocalVersionUpdate>,
    /// The server should drop its local version rows first
    pub clear_local_version_table: bool,
}

/// What the server answers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub failures: Vec<Failure>,
    pub new_signature: Uuid,
    pub new_pending_changes: Vec<PendingChange>,
    /// The server lost our local version rows and needs all of them
    pub replay_local_versions_required: bool,
    pub pending_changes_updated: bool,
}

/// The server side of reconcile.
pub trait ReconcileService {
    fn query_pending_change_signature(&self) -> Result<Uuid>;

    fn reconcile(&self, request: ReconcileRequest) -> Result<ReconcileResult>;

    /// Receive a batch of replayed local version rows.
    fn update_local_version(&self, updates: Vec<LocalVersionUpdate>) -> Result<()>;
}

/// Last server signature seen for a workspace and when.
#[derive(Debug, Clone, Default)]
pub struct ReconcileCache {
    pub last_server_signature: Option<Uuid>,
    pub last_reconcile: Option<Instant>,
}

impl ReconcileCache {
    fn record(&mut self, signature: Uuid) {
        self.last_server_signature = Some(signature);
        self.last_reconcile = Some(Instant::now());
    }

    fn is_fresh(&self, client_signature: Uuid, window: Duration) -> bool {
        self.last_server_signature
            .is_some_and(|s| !s.is_nil() && s == client_signature)
            && self.last_reconcile.is_some_and(|at| at.elapsed() < window)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Whether the server was actually reconciled
    pub reconciled: bool,
    pub pending_changes_updated: bool,
}

/// Reconcile the tables of one open transaction. Returns the rows dropped
/// because they were missing on disk, so their baselines can be deleted.
#[tracing::instrument(skip_all, level = "debug")]
pub(crate) fn reconcile_tables(
    lv: &mut LocalVersionTable,
    pc: &mut PendingChangesTable,
    service: &dyn ReconcileService,
    cache: &mut ReconcileCache,
    window: Duration,
    reconcile_missing: bool,
) -> Result<(ReconcileOutcome, Vec<LocalVersionEntry>)> {
    let client_signature = pc.client_signature();
    if lv.pending_reconcile_count() == 0 && !reconcile_missing {
        if cache.is_fresh(client_signature, window) {
            log_reconcile_debug!("Reconcile skipped, cached signature is fresh");
            return Ok((ReconcileOutcome::default(), Vec::new()));
        }
        let server_signature = service.query_pending_change_signature()?;
        if !server_signature.is_nil() && server_signature == client_signature {
            log_reconcile_debug!("Reconcile skipped, signatures match");
            cache.record(server_signature);
            return Ok((ReconcileOutcome::default(), Vec::new()));
        }
    }

    let pending_changes: Vec<PendingChange> = pc.iter().map(|(_, p)| p.clone()).collect();
    let (updates, clear) = lv.updates_for_reconcile(pc, reconcile_missing);
    log_reconcile_info!(
        "Reconciling workspace",
        pending_changes = pending_changes.len(),
        updates = updates.len(),
        clear = clear
    );

    let request = ReconcileRequest {
        client_signature,
        pending_changes,
        local_version_updates: updates,
        clear_local_version_table: clear,
    };
    let mut result = call(service, request.clone())?;

    if result.replay_local_versions_required {
        if !clear {
            result = call(
                service,
                ReconcileRequest {
                    clear_local_version_table: true,
                    ..request
                },
            )?;
        }
        replay(lv, service, reconcile_missing)?;
    }

    if result.pending_changes_updated {
        drop_destroyed_deletes(lv, pc, &result.new_pending_changes);
        pc.replace_pending_changes(result.new_pending_changes);
    }

    let dropped = lv.mark_as_reconciled(reconcile_missing);
    pc.set_client_signature(result.new_signature);
    cache.record(result.new_signature);

    Ok((
        ReconcileOutcome {
            reconciled: true,
            pending_changes_updated: result.pending_changes_updated,
        },
        dropped,
    ))
}

fn call(service: &dyn ReconcileService, request: ReconcileRequest) -> Result<ReconcileResult> {
    let result = service.reconcile(request)?;
    if !result.failures.is_empty() {
        log_reconcile_warn!("Reconcile failed", failures = result.failures.len());
        return Err(EngineError::ReconcileFailed(result.failures));
    }
    Ok(result)
}

/// Send every row, in batches.
fn replay(lv: &LocalVersionTable, service: &dyn ReconcileService, reconcile_missing: bool) -> Result<()> {
    let rows = lv.replay_updates(reconcile_missing);
    log_reconcile_info!("Replaying local versions", rows = rows.len());
    for chunk in rows.chunks(REPLAY_BATCH) {
        service.update_local_version(chunk.to_vec())?;
    }
    Ok(())
}

/// Deletes the server dropped were destroyed: their deleted rows go too.
fn drop_destroyed_deletes(lv: &mut LocalVersionTable, pc: &PendingChangesTable, new_pcs: &[PendingChange]) {
    let kept: HashSet<String> = new_pcs
        .iter()
        .filter(|p| p.is_delete())
        .map(|p| fold_key(p.server_item()))
        .collect();
    let destroyed: Vec<String> = pc
        .iter_by_committed()
        .filter(|(_, p)| p.is_delete())
        .filter_map(|(_, p)| p.committed_server_item.clone())
        .filter(|committed| !kept.contains(&fold_key(committed)))
        .collect();
    for committed in destroyed {
        let removed = lv.remove_deleted_under(&committed);
        log_reconcile_debug!(
            "Dropped rows of destroyed item",
            item = committed.as_str(),
            rows = removed.len()
        );
    }
}
