//! The per-VM analysis pipeline.
//!
//! Drives one sample through one VM:
//!
//! ```text
//! Queued → Acquired → Restoring → Starting → WaitingGuest →
//! Uploading → Detonating → Dwelling → Collecting → Cleanup → Released
//!                     ↑                                          ↑
//!                     └────── any failure short-circuits ────────┘
//! ```
//!
//! Phase order is total. Cancellation and the per-VM deadline interrupt the
//! cancellable phases; the tail — best-effort collection of what the agent
//! already observed, then cleanup, then lease release — is **not**
//! cancellable. Whatever happens, the VM ends powered off or flagged
//! needs-attention, and the lease is released so the pool cannot deadlock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collect::{CollectionWindow, CollectorRegistry, SampleHints};
use crate::config::{AnalysisSettings, VmSpec};
use crate::error::ErrorKind;
use crate::model::{Phase, Sample, VmResult};
use crate::vm::{GuestOps, StartMode, VmController, VmPool};

/// Everything a pipeline needs, wired once at startup.
#[derive(Clone)]
pub struct PipelineDeps {
    pub controller: Arc<dyn VmController>,
    pub pool: Arc<VmPool>,
    pub collectors: Arc<CollectorRegistry>,
    pub analysis: AnalysisSettings,
}

impl PipelineDeps {
    fn start_mode(&self) -> StartMode {
        StartMode::from_gui_flag(self.analysis.gui_mode)
    }
}

/// How the cancellable section ended.
enum Interrupt {
    /// Phases ran to their own conclusion (success or recorded failure).
    None,
    /// External cancel (task cancel or shutdown).
    Cancelled,
    /// The per-VM deadline elapsed.
    DeadlineExceeded,
}

/// Run one sample on one VM. Never panics outward; every outcome — success,
/// failure, cancellation — is recorded on the returned [`VmResult`].
pub async fn run_pipeline(
    deps: &PipelineDeps,
    sample: &Sample,
    spec: &VmSpec,
    cancel: CancellationToken,
    deadline: Duration,
) -> VmResult {
    let pipeline_id = Uuid::new_v4();
    let started = tokio::time::Instant::now();
    let mut result = VmResult::new(&spec.name, spec.agent);

    info!(
        vm = %spec.name,
        %pipeline_id,
        sample = %sample.name,
        "pipeline starting"
    );

    // ------------------------------------------------------------------
    // Queued → Acquired. No resources held yet, so a cancel or timeout
    // here ends the pipeline outright.
    // ------------------------------------------------------------------
    let lease = tokio::select! {
        _ = cancel.cancelled() => {
            result.record_error(ErrorKind::Cancelled, "cancelled while queued for VM");
            result.ended_at = Some(Local::now());
            return result;
        }
        acquired = deps.pool.acquire(&spec.name, pipeline_id, deadline) => {
            match acquired {
                Ok(lease) => lease,
                Err(e) => {
                    result.record_error(e.kind, e.detail);
                    result.ended_at = Some(Local::now());
                    return result;
                }
            }
        }
    };
    result.phase = Phase::Acquired;

    let guest = GuestOps::new(deps.controller.clone(), spec.clone());

    // ------------------------------------------------------------------
    // Cancellable phases.
    // ------------------------------------------------------------------
    let remaining = deadline.saturating_sub(started.elapsed());
    let interrupt = {
        let phases = run_phases(deps, sample, spec, &guest, &mut result);
        tokio::pin!(phases);
        tokio::select! {
            _ = &mut phases => Interrupt::None,
            _ = cancel.cancelled() => Interrupt::Cancelled,
            _ = tokio::time::sleep(remaining) => Interrupt::DeadlineExceeded,
        }
    };

    match interrupt {
        Interrupt::None => {}
        Interrupt::Cancelled => {
            warn!(vm = %spec.name, phase = ?result.phase, "pipeline cancelled");
            result.record_error(ErrorKind::Cancelled, "task cancelled");
        }
        Interrupt::DeadlineExceeded => {
            warn!(vm = %spec.name, phase = ?result.phase, "per-VM deadline exceeded");
            result.record_error(
                ErrorKind::Cancelled,
                format!("per-VM deadline of {deadline:?} exceeded"),
            );
        }
    }

    // An interrupted pipeline that already detonated still owes the caller
    // whatever the agent observed up to the interrupt.
    if !matches!(interrupt, Interrupt::None)
        && matches!(result.phase, Phase::Dwelling | Phase::Collecting)
        && result.alerts.is_empty()
        && result.events.is_empty()
    {
        collect_into(deps, sample, spec, &guest, &mut result, false).await;
    }

    // ------------------------------------------------------------------
    // Cleanup. Not cancellable; bounded by its own deadline.
    // ------------------------------------------------------------------
    let phase_before_cleanup = result.phase;
    result.phase = Phase::Cleanup;
    let cleanup = tokio::time::timeout(
        deps.analysis.cleanup_deadline(),
        deps.controller.cleanup_resources(&spec.name),
    )
    .await;

    match cleanup {
        Ok(Ok(())) => {
            deps.pool.clear_needs_attention(&spec.name);
        }
        Ok(Err(e)) => {
            // Cleanup failure poisons the VM; it takes precedence over any
            // earlier outcome, success included.
            warn!(vm = %spec.name, error = %e, "cleanup failed, VM flagged");
            deps.pool.mark_needs_attention(&spec.name);
            result.record_error(ErrorKind::CleanupFailed, e.detail);
        }
        Err(_) => {
            warn!(vm = %spec.name, "cleanup exceeded its deadline, VM flagged");
            deps.pool.mark_needs_attention(&spec.name);
            result.record_error(
                ErrorKind::CleanupFailed,
                format!(
                    "cleanup did not finish within {:?}",
                    deps.analysis.cleanup_deadline()
                ),
            );
        }
    }

    // ------------------------------------------------------------------
    // Released. The lease goes back even when cleanup failed — the pool
    // must not deadlock on a poisoned VM.
    // ------------------------------------------------------------------
    deps.pool.release(lease);
    match result.error_kind {
        // Cleanup failure keeps the terminal phase at Cleanup.
        Some(ErrorKind::CleanupFailed) => {}
        // Other failures report the phase they actually reached.
        Some(_) => result.phase = phase_before_cleanup,
        None => result.phase = Phase::Released,
    }
    result.ended_at = Some(Local::now());

    info!(
        vm = %spec.name,
        phase = ?result.phase,
        alerts = result.alerts.len(),
        events = result.events.len(),
        deleted_by_agent = result.sample_deleted_by_agent,
        error = ?result.error_kind,
        "pipeline finished"
    );
    result
}

/// The strictly sequential phase body. Failure policy:
///
/// * Restoring / Starting / WaitingGuest failure ⇒ `EnvironmentFailed`,
///   straight to cleanup — there is no guest to talk to.
/// * Uploading / Detonating failure ⇒ error recorded, but Collecting still
///   runs: the agent may have detected the upload itself.
/// * Collecting failure ⇒ `CollectionFailed`, partial data kept.
async fn run_phases(
    deps: &PipelineDeps,
    sample: &Sample,
    spec: &VmSpec,
    guest: &GuestOps,
    result: &mut VmResult,
) {
    // ------------------------------------------------------------------
    // Restoring: unconditional cleanup first — the VM may have been left
    // running by a prior crash — then baseline restore.
    // ------------------------------------------------------------------
    result.phase = Phase::Restoring;
    if let Err(e) = deps.controller.cleanup_resources(&spec.name).await {
        result.record_error(
            ErrorKind::EnvironmentFailed,
            format!("pre-run cleanup failed: {}", e.detail),
        );
        return;
    }
    deps.pool.clear_needs_attention(&spec.name);

    if let Err(e) = deps
        .controller
        .restore_snapshot(&spec.name, &spec.baseline_snapshot)
        .await
    {
        result.record_error(ErrorKind::EnvironmentFailed, e.detail);
        return;
    }

    // ------------------------------------------------------------------
    // Starting
    // ------------------------------------------------------------------
    result.phase = Phase::Starting;
    if let Err(e) = deps
        .controller
        .power_on(&spec.name, deps.start_mode())
        .await
    {
        result.record_error(ErrorKind::EnvironmentFailed, e.detail);
        return;
    }

    // ------------------------------------------------------------------
    // WaitingGuest
    // ------------------------------------------------------------------
    result.phase = Phase::WaitingGuest;
    if let Err(e) = deps
        .controller
        .wait_guest_ready(
            &spec.name,
            &spec.user,
            &spec.password,
            deps.analysis.startup_deadline(spec),
        )
        .await
    {
        result.record_error(ErrorKind::EnvironmentFailed, e.detail);
        return;
    }

    // ------------------------------------------------------------------
    // Uploading
    // ------------------------------------------------------------------
    result.phase = Phase::Uploading;
    let guest_path = format!("{}\\{}", spec.desktop(), sample.guest_file_name());
    let uploaded = deps
        .controller
        .copy_to_guest(
            &spec.name,
            &sample.path,
            &guest_path,
            &spec.user,
            &spec.password,
            Duration::from_secs(120),
        )
        .await;

    match uploaded {
        Err(e) => {
            // TransferFailed or AuthFailed; collection still runs.
            result.record_error(e.kind, e.detail);
        }
        Ok(()) => {
            // ----------------------------------------------------------
            // Detonating: give the agent its reaction window, then check
            // whether the sample survived it.
            // ----------------------------------------------------------
            result.phase = Phase::Detonating;
            tokio::time::sleep(deps.analysis.detonation_dwell_duration()).await;

            match guest.path_exists(&guest_path).await {
                Ok(false) => {
                    // The agent already acted — a first-class outcome.
                    info!(vm = %spec.name, "sample deleted by agent before execution");
                    result.sample_deleted_by_agent = true;
                }
                Ok(true) => {
                    debug!(vm = %spec.name, path = %guest_path, "sample present, detonating");
                    guest.run_executable_detached(&guest_path, &[]);

                    // --------------------------------------------------
                    // Dwelling: let the agent and monitor accumulate.
                    // --------------------------------------------------
                    result.phase = Phase::Dwelling;
                    tokio::time::sleep(deps.analysis.monitoring_window_duration()).await;
                }
                Err(e) => {
                    result.record_error(
                        ErrorKind::DetonationFailed,
                        format!("existence probe failed: {}", e.detail),
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Collecting — runs even after an upload or detonation failure.
    // ------------------------------------------------------------------
    result.phase = Phase::Collecting;
    collect_into(deps, sample, spec, guest, result, true).await;
}

/// Invoke the VM's collector and merge its output into the result.
///
/// `record_failure` is false on the post-interrupt best-effort pass, where a
/// collection error must not mask the `Cancelled` already recorded.
async fn collect_into(
    deps: &PipelineDeps,
    sample: &Sample,
    spec: &VmSpec,
    guest: &GuestOps,
    result: &mut VmResult,
    record_failure: bool,
) {
    let window = CollectionWindow::new(result.started_at, Local::now(), deps.analysis.grace());
    let hints = SampleHints {
        file_name: sample.guest_file_name(),
        hash_hex: sample.hash_hex.clone(),
    };

    let Some(collector) = deps.collectors.for_agent(spec.agent) else {
        if record_failure && !result.is_errored() {
            result.record_error(
                ErrorKind::CollectionFailed,
                format!("no collector registered for {}", spec.agent.as_str()),
            );
        }
        return;
    };

    match collector.collect(guest, &window, &hints).await {
        Ok(collection) => {
            result.alerts = collection.alerts;
            result.events = collection.events;
        }
        Err(e) => {
            warn!(vm = %spec.name, error = %e, "collection failed");
            if record_failure && !result.is_errored() {
                result.record_error(e.kind, e.detail);
            }
        }
    }
}
