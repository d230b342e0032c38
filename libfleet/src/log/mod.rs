//! Re-export of logging-related macros, plus the audit trail helpers used by
//! the orchestrator.
pub use color_eyre::eyre::eyre;
pub use tracing::{debug, error, info, span, trace, warn};

use crate::job::{FleetJob, TargetResult};

/// Tracing target for the structured audit trail. Subscribers can route it
/// separately, e.g. `RUST_LOG=fleet::audit=info`.
pub const AUDIT_TARGET: &str = "fleet::audit";

/// Install color_eyre as the global error handler.
#[tracing::instrument]
pub fn install_color_eyre() -> color_eyre::eyre::Result<()> {
    color_eyre::config::HookBuilder::default()
        .add_default_filters()
        .add_frame_filter(Box::new(|frames| {
            let filters = &[
                "tokio::",
                "tracing::",
                "color_eyre::",
                "futures_util::",
                "<core::",
            ];

            frames.retain(|frame| {
                !filters.iter().any(|f| {
                    let name = if let Some(name) = frame.name.as_ref() {
                        name.as_str()
                    } else {
                        return true;
                    };

                    name.starts_with(f)
                })
            });
        }))
        .install()?;

    Ok(())
}

pub(crate) fn audit_job_started(job: &FleetJob) {
    info!(
        target: AUDIT_TARGET,
        job_id = %job.id(),
        title = %job.title(),
        targets = job.targets().len(),
        "job started"
    );
}

pub(crate) fn audit_target_finished(job: &FleetJob, result: &TargetResult) {
    info!(
        target: AUDIT_TARGET,
        job_id = %job.id(),
        index = result.target_index(),
        target = %result.name(),
        host = %result.host(),
        state = %result.state(),
        duration_ms = result.duration().as_millis() as u64,
        error = result.error().as_deref().unwrap_or(""),
        "target finished"
    );
}

pub(crate) fn audit_job_finished(job: &FleetJob) {
    let summary = job.summary();
    info!(
        target: AUDIT_TARGET,
        job_id = %job.id(),
        ok = summary.ok,
        failed = summary.failed,
        canceled = summary.canceled,
        "job finished"
    );
}
