use crate::config::TimeoutConfig;
use crate::engine::{Step, StepContext, StepOutcome, Workflow};
use crate::hypervisor::{
    wait_for_power_state, wait_for_task, wait_for_tools, HypervisorClient, PowerState, ToolsStatus,
};
use crate::status::StatusWriter;
use crate::{MigrateError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// State threaded through the preparation steps.
pub struct PrepareContext {
    client: Arc<dyn HypervisorClient>,
    clone_name: String,
    status: StatusWriter,
    timeouts: TimeoutConfig,
}

#[async_trait]
impl StepContext for PrepareContext {
    // The hypervisor client is connectionless per call; nothing to close.
}

/// Build the preparation workflow for a clone: make sure it is powered off,
/// detach its network adapters from power-on, then boot it once so the guest
/// settles and shut it back down. Keyed by the clone name.
pub fn build(
    client: Arc<dyn HypervisorClient>,
    clone_name: String,
    writer: StatusWriter,
    timeouts: TimeoutConfig,
) -> (Workflow<PrepareContext>, PrepareContext) {
    let cx = PrepareContext {
        client,
        clone_name,
        status: writer.clone(),
        timeouts,
    };

    let workflow = Workflow::new("preparation", writer)
        .step(Step::new("locate clone", 10, |cx: &mut PrepareContext| {
            Box::pin(locate_clone(cx))
        }))
        .step(Step::new("initial shutdown", 25, |cx: &mut PrepareContext| {
            Box::pin(initial_shutdown(cx))
        }))
        .step(Step::new(
            "disable NIC auto-connect",
            40,
            |cx: &mut PrepareContext| Box::pin(disable_nics(cx)),
        ))
        .step(Step::new(
            "power on and wait for tools",
            70,
            |cx: &mut PrepareContext| Box::pin(power_on_and_wait(cx)),
        ))
        .step(Step::new("final shutdown", 90, |cx: &mut PrepareContext| {
            Box::pin(final_shutdown(cx))
        }));

    (workflow, cx)
}

async fn locate_clone(cx: &mut PrepareContext) -> Result<StepOutcome> {
    cx.status
        .running(5, &format!("Searching for VM clone '{}'...", cx.clone_name));
    let vm = cx
        .client
        .find_vm(&cx.clone_name)
        .await?
        .ok_or_else(|| MigrateError::Precondition(format!("VM clone '{}' not found", cx.clone_name)))?;

    cx.status.running(
        10,
        &format!("VM found. Current power state: {:?}", vm.power_state),
    );
    Ok(StepOutcome::Continue)
}

async fn initial_shutdown(cx: &mut PrepareContext) -> Result<StepOutcome> {
    let vm = current_vm(cx).await?;
    if vm.power_state == PowerState::PoweredOff {
        cx.status
            .running(25, "Clone is already powered off, skipping shutdown");
        return Ok(StepOutcome::Continue);
    }

    if vm.tools != ToolsStatus::Running {
        return Ok(StepOutcome::Fatal(format!(
            "Guest tools not running on '{}'; cannot shut down gracefully",
            cx.clone_name
        )));
    }

    cx.status.running(
        15,
        &format!("Initiating graceful shutdown of '{}'...", cx.clone_name),
    );
    cx.client.shutdown_guest(&cx.clone_name).await?;
    wait_for_power_state(
        cx.client.as_ref(),
        &cx.clone_name,
        PowerState::PoweredOff,
        cx.timeouts.shutdown_secs,
    )
    .await?;
    cx.status
        .running(25, &format!("'{}' has been gracefully shut down", cx.clone_name));
    Ok(StepOutcome::Continue)
}

async fn disable_nics(cx: &mut PrepareContext) -> Result<StepOutcome> {
    let adapters = cx
        .client
        .disable_nic_start_connected(&cx.clone_name)
        .await?;
    if adapters.is_empty() {
        // Not an error: a clone with no NICs just has nothing to detach.
        cx.status
            .running(40, &format!("No network adapters found to modify on '{}'", cx.clone_name));
    } else {
        cx.status.running(
            40,
            &format!(
                "Disabled 'connect at power on' for {} adapter(s): {}",
                adapters.len(),
                adapters.join(", ")
            ),
        );
    }
    Ok(StepOutcome::Continue)
}

async fn power_on_and_wait(cx: &mut PrepareContext) -> Result<StepOutcome> {
    cx.status
        .running(45, &format!("Powering on '{}'...", cx.clone_name));
    let task_id = cx.client.power_on(&cx.clone_name).await?;
    wait_for_task(
        cx.client.as_ref(),
        &task_id,
        &format!("power-on of '{}'", cx.clone_name),
        cx.timeouts.task_secs,
        Some(&cx.status),
    )
    .await?;

    cx.status.running(
        55,
        &format!("Waiting for guest tools on '{}'...", cx.clone_name),
    );
    wait_for_tools(cx.client.as_ref(), &cx.clone_name, cx.timeouts.tools_secs).await?;
    cx.status.running(
        70,
        &format!("'{}' is powered on and guest tools are running", cx.clone_name),
    );
    Ok(StepOutcome::Continue)
}

async fn final_shutdown(cx: &mut PrepareContext) -> Result<StepOutcome> {
    let vm = current_vm(cx).await?;
    if vm.tools != ToolsStatus::Running {
        return Ok(StepOutcome::Fatal(format!(
            "Guest tools stopped on '{}' before final shutdown",
            cx.clone_name
        )));
    }

    cx.status.running(
        80,
        &format!("Initiating final graceful shutdown of '{}'...", cx.clone_name),
    );
    cx.client.shutdown_guest(&cx.clone_name).await?;
    wait_for_power_state(
        cx.client.as_ref(),
        &cx.clone_name,
        PowerState::PoweredOff,
        cx.timeouts.shutdown_secs,
    )
    .await?;
    cx.status
        .running(90, "VM preparation sequence complete");
    Ok(StepOutcome::Continue)
}

async fn current_vm(cx: &PrepareContext) -> Result<crate::hypervisor::VmSummary> {
    cx.client
        .find_vm(&cx.clone_name)
        .await?
        .ok_or_else(|| MigrateError::Precondition(format!("VM clone '{}' not found", cx.clone_name)))
}
