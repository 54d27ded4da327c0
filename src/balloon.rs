//! Per-VM balloon resize, used as a memory reservation discipline around function
//! invocations: deflate before invoking, inflate on return.

use crate::error::ControllerError;
use crate::machine::Machine;

/// `BalloonDriver::resize` (§4.2): resize the balloon by `delta_mib` (signed; negative
/// deflates), polling balloon statistics until `actual_mib == target_mib == target`.
///
/// Must be called with the VM's per-VM lock already held, since it is one step of a
/// larger serialized exchange (the caller holds the lock across deflate-invoke-inflate).
pub async fn resize(machine: &Machine, current_balloon_mib: &mut u64, delta_mib: i64) -> Result<(), ControllerError> {
    let target_signed = *current_balloon_mib as i64 + delta_mib;
    if target_signed < 0 {
        return Err(ControllerError::PreconditionViolated(format!(
            "balloon target would go negative: {current_balloon_mib} + {delta_mib}"
        )));
    }
    let target = target_signed as u64;

    machine.http_client.set_balloon(target).await?;

    let schedule = machine.http_client.retry_schedule();
    let converged = schedule
        .run(|| async {
            match machine.http_client.get_balloon_stats().await {
                Ok(stats) if stats.actual_mib == target && stats.target_mib == target => Some(()),
                _ => None,
            }
        })
        .await;

    match converged {
        Some(()) => {
            log::info!(target: "vmctl_core::balloon", "vm_id={} balloon converged at {target} MiB", machine.vm_id);
            *current_balloon_mib = target;
            Ok(())
        }
        None => {
            log::warn!(target: "vmctl_core::balloon", "vm_id={} balloon resize to {target} MiB did not converge", machine.vm_id);
            Err(ControllerError::BalloonNotConverged {
                vm_id: machine.vm_id.clone(),
                target_mib: target,
                actual_mib: *current_balloon_mib,
            })
        }
    }
}
