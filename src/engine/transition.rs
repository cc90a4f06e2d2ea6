//! Lifecycle transitions: terminate, interrupt and force-terminate.
//!
//! Transitions never rewrite history. Each closed branch gets a new step
//! record chained to its previous latest record. Only force-terminate
//! overwrites in place. Store failures are logged per branch and the loop
//! moves on, so a failed transition can simply be retried: branches that are
//! already terminal are no longer eligible.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::WorkflowMonitor;
use super::classifier::ClassifyMode;
use super::types::*;
use crate::lock::{acquire_exclusive, terminate_key};
use crate::notify::{EventKind, EventSnapshot};

/// Service name stamped on records appended by terminate and interrupt.
pub const MARK_SERVICE: &str = "BUSINESS_PROCESS_MARK";
/// Service name stamped on records appended when an instance is restarted.
pub const RESTART_SERVICE: &str = "BUSINESS_PROCESS_TERMINATE";
/// Reason recorded when an instance is administratively stopped.
pub const STOP_REASON: &str = "instance-stopped";

pub fn terminate_allowed(state: LifecycleState) -> bool {
    !matches!(
        state,
        LifecycleState::Unknown
            | LifecycleState::Active
            | LifecycleState::Terminated
            | LifecycleState::Halting
            | LifecycleState::Complete
    )
}

pub fn interrupt_allowed(state: LifecycleState) -> bool {
    !matches!(
        state,
        LifecycleState::Unknown
            | LifecycleState::Terminated
            | LifecycleState::Complete
            | LifecycleState::InterruptedAuto
            | LifecycleState::InterruptedMan
    )
}

/// Branch states that terminate closes.
pub fn terminate_eligible(branch: LifecycleState) -> bool {
    matches!(
        branch,
        LifecycleState::Waiting
            | LifecycleState::WaitingOnIo
            | LifecycleState::Halted
            | LifecycleState::InterruptedAuto
            | LifecycleState::InterruptedMan
    )
}

/// Branch states that interrupt marks.
pub fn interrupt_eligible(branch: LifecycleState) -> bool {
    matches!(
        branch,
        LifecycleState::Active | LifecycleState::Halting | LifecycleState::WaitingOnIo
    )
}

/// Whether a service consumes messages, judged by its definition name (or
/// the service name when no definition is known).
pub fn is_consumer_service(service_name: &str, definition: Option<&str>) -> bool {
    if service_name == MARK_SERVICE
        || service_name.contains("INITIATING_CONTEXT")
        || service_name == "System_Service"
    {
        return false;
    }
    let name = match definition {
        Some(def) if !def.is_empty() => def,
        _ => service_name,
    };
    name.to_uppercase().contains("CONSUME")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForceTerminateRow {
    pub branch_id: String,
    pub record_id: Option<Uuid>,
    pub success: bool,
}

/// Per-row outcome of a force terminate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForceTerminateReport {
    pub workflow_id: WorkflowId,
    pub rows: Vec<ForceTerminateRow>,
}

impl ForceTerminateReport {
    pub fn succeeded(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|r| r.success)
    }
}

/// How branches are picked for closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    /// Branch state is terminate-eligible.
    EligibleState,
    /// Branch latest record is waiting or waiting-on-io. Used when the
    /// instance turned halting after being stopped.
    WaitingRecord,
}

impl WorkflowMonitor {
    /// Record an administrative stop for the instance. The executor and the
    /// classifier both observe it.
    pub async fn stop(&self, workflow_id: WorkflowId) -> bool {
        match self.store.mark_inactive(workflow_id, STOP_REASON).await {
            Ok(()) => {
                info!(workflow_id = %workflow_id, "Instance marked inactive");
                true
            }
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Failed to mark instance inactive");
                false
            }
        }
    }

    pub async fn terminate(&self, workflow_id: WorkflowId) -> bool {
        self.terminate_as(workflow_id, &Requester::default()).await
    }

    /// Terminate an instance on behalf of `requester`.
    pub async fn terminate_as(&self, workflow_id: WorkflowId, requester: &Requester) -> bool {
        let state = self.instance_state(workflow_id).await;
        if !terminate_allowed(state) {
            info!(workflow_id = %workflow_id, state = %state, "Terminate refused for current state");
            return false;
        }

        let mut guard = None;
        let mut current = state;
        if matches!(state, LifecycleState::Waiting | LifecycleState::WaitingOnIo) {
            if !self.stop(workflow_id).await {
                return false;
            }
            if self.config.locking_enabled {
                let key = terminate_key(workflow_id);
                match acquire_exclusive(self.locks.clone(), &key, &self.config.lock_policy()).await {
                    Ok(g) => guard = Some(g),
                    Err(e) => {
                        error!(workflow_id = %workflow_id, error = %e, "Could not lock instance for terminate");
                        return false;
                    }
                }
            }
            current = self.instance_state(workflow_id).await;
        }

        let report = match &requester.origin {
            Some((origin, service)) => format!(
                "Process terminated by workflow {} from service {}",
                origin, service
            ),
            None => "Process terminated".to_string(),
        };

        let outcome = match current {
            LifecycleState::Waiting
            | LifecycleState::WaitingOnIo
            | LifecycleState::Halted
            | LifecycleState::InterruptedAuto
            | LifecycleState::InterruptedMan => {
                self.close_branches(workflow_id, Selection::EligibleState, MARK_SERVICE, &report)
                    .await
            }
            LifecycleState::Halting => {
                self.close_branches(workflow_id, Selection::WaitingRecord, MARK_SERVICE, &report)
                    .await
            }
            other => {
                info!(workflow_id = %workflow_id, state = %other, "State changed before terminate, not terminating");
                false
            }
        };

        if let Some(guard) = guard {
            let key = guard.key().to_string();
            match guard.release().await {
                Ok(true) => debug!(key = %key, "Lock released"),
                Ok(false) => warn!(key = %key, "Lock had already expired"),
                Err(e) => error!(key = %key, error = %e, "Failed to release lock"),
            }
        }

        self.invalidate_hints(workflow_id).await;
        info!(workflow_id = %workflow_id, success = outcome, requested_by = ?requester.user, "Terminate finished");
        outcome
    }

    /// Close the terminate-eligible branches of `workflow_id` because it is
    /// being restarted as `new_workflow_id`. No lock and no legality check.
    pub async fn terminate_for_restart(&self, workflow_id: WorkflowId, new_workflow_id: WorkflowId) -> bool {
        let report = format!(
            "Process terminated, restarted with new workflow id {}",
            new_workflow_id
        );
        let outcome = self
            .close_branches(workflow_id, Selection::EligibleState, RESTART_SERVICE, &report)
            .await;
        self.invalidate_hints(workflow_id).await;
        outcome
    }

    async fn close_branches(
        &self,
        workflow_id: WorkflowId,
        selection: Selection,
        service: &str,
        report: &str,
    ) -> bool {
        let branch_ids = match self.store.branch_ids(workflow_id).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Failed to list branches");
                return false;
            }
        };

        let mut inactive = None;
        let mut closed = 0usize;
        let mut failed = 0usize;

        for branch_id in branch_ids {
            let record = match self.store.latest_step(workflow_id, &branch_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to read branch");
                    failed += 1;
                    continue;
                }
            };

            let eligible = match selection {
                Selection::EligibleState => {
                    match self
                        .classify_record(&record, ClassifyMode::Branch, &mut inactive)
                        .await
                    {
                        Ok(state) => terminate_eligible(state),
                        Err(e) => {
                            error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to classify branch");
                            failed += 1;
                            continue;
                        }
                    }
                }
                Selection::WaitingRecord => matches!(
                    record.basic_status,
                    BasicStatus::Waiting | BasicStatus::WaitingOnIo
                ),
            };
            if !eligible {
                continue;
            }

            let mut next = record.successor();
            next.next_activity = NextActivity::Noop;
            next.basic_status = BasicStatus::Terminated;
            next.engine_status = if selection == Selection::WaitingRecord
                && record.engine_status == EngineStatus::WaitingOnIo
            {
                EngineStatus::WaitingOnIo
            } else {
                EngineStatus::InstanceTerminated
            };
            next.adv_status = None;
            next.service_name = service.to_string();
            next.status_report = Some(report.to_string());
            next.end_time = Some(next.start_time);

            match self.store.insert_step(&next).await {
                Ok(_) => {
                    closed += 1;
                    debug!(workflow_id = %workflow_id, branch_id = %branch_id, step = next.step, "Branch terminated");
                    self.publish(EventKind::Terminated, &next).await;
                    self.expire_consumer(&record, &next).await;
                }
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to append terminate record");
                    failed += 1;
                }
            }
        }

        if closed == 0 && failed == 0 {
            info!(workflow_id = %workflow_id, "No branch eligible for termination");
        }
        closed > 0 && failed == 0
    }

    /// Drop the consumer registration of a closed step, if it was waiting on
    /// a message.
    async fn expire_consumer(&self, closed: &StepRecord, appended: &StepRecord) {
        if closed.step == 0 {
            return;
        }
        let definition = match self.consumers.service_definition(&closed.service_name).await {
            Ok(def) => def,
            Err(e) => {
                warn!(service = %closed.service_name, error = %e, "Failed to look up service definition");
                None
            }
        };
        if !is_consumer_service(&closed.service_name, definition.as_deref()) {
            return;
        }
        if let Err(e) = self.consumers.unregister(closed.id).await {
            warn!(workflow_id = %closed.workflow_id, record_id = %closed.id, error = %e, "Failed to unregister consumer");
            return;
        }
        self.publish(EventKind::ConsumerExpired, appended).await;
    }

    /// Mark the active parts of an instance as interrupted. Takes no lock.
    pub async fn interrupt(&self, workflow_id: WorkflowId, kind: InterruptKind) -> bool {
        let state = self.instance_state(workflow_id).await;
        if !interrupt_allowed(state) {
            info!(workflow_id = %workflow_id, state = %state, "Interrupt refused for current state");
            return false;
        }

        let branch_ids = match self.store.branch_ids(workflow_id).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Failed to list branches");
                return false;
            }
        };

        let report = format!("Workflow {} is marked as interrupted", workflow_id);
        let mut inactive = None;
        let mut marked = 0usize;
        let mut failed = 0usize;

        for branch_id in branch_ids {
            let record = match self.store.latest_step(workflow_id, &branch_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to read branch");
                    failed += 1;
                    continue;
                }
            };
            let eligible = match self
                .classify_record(&record, ClassifyMode::Branch, &mut inactive)
                .await
            {
                Ok(state) => interrupt_eligible(state),
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to classify branch");
                    failed += 1;
                    continue;
                }
            };
            if !eligible {
                continue;
            }

            let mut next = record.successor();
            next.next_activity = NextActivity::Noop;
            next.basic_status = kind.basic_status();
            next.engine_status = if record.engine_status == EngineStatus::WaitingOnIo {
                EngineStatus::WaitingOnIo
            } else {
                EngineStatus::ServiceInterrupted
            };
            next.adv_status = Some("Service Interrupted".to_string());
            next.service_name = MARK_SERVICE.to_string();
            next.status_report = Some(report.clone());
            next.end_time = Some(next.start_time);

            match self.store.insert_step(&next).await {
                Ok(_) => {
                    marked += 1;
                    debug!(workflow_id = %workflow_id, branch_id = %branch_id, kind = %kind, "Branch interrupted");
                    self.publish(EventKind::Interrupted, &next).await;
                }
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to append interrupt record");
                    failed += 1;
                }
            }
        }

        if marked == 0 && failed == 0 {
            info!(workflow_id = %workflow_id, "No branch eligible for interrupt");
        }
        self.invalidate_hints(workflow_id).await;
        marked > 0 && failed == 0
    }

    pub async fn force_terminate(&self, workflow_id: WorkflowId) -> bool {
        self.force_terminate_report(workflow_id).await.succeeded()
    }

    /// Overwrite every branch's latest record as terminated, whatever the
    /// current state.
    pub async fn force_terminate_report(&self, workflow_id: WorkflowId) -> ForceTerminateReport {
        let mut report = ForceTerminateReport {
            workflow_id,
            rows: Vec::new(),
        };

        let branch_ids = match self.store.branch_ids(workflow_id).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(workflow_id = %workflow_id, error = %e, "Failed to list branches");
                return report;
            }
        };

        let note = format!("Force terminated at {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        for branch_id in branch_ids {
            let record = match self.store.latest_step(workflow_id, &branch_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Failed to read branch");
                    report.rows.push(ForceTerminateRow {
                        branch_id,
                        record_id: None,
                        success: false,
                    });
                    continue;
                }
            };

            let success = match self
                .store
                .overwrite_latest_status(record.id, BasicStatus::Terminated, &note)
                .await
            {
                Ok(1) => true,
                Ok(rows) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, rows, "Force terminate updated an unexpected number of rows");
                    false
                }
                Err(e) => {
                    error!(workflow_id = %workflow_id, branch_id = %branch_id, error = %e, "Force terminate failed");
                    false
                }
            };
            report.rows.push(ForceTerminateRow {
                branch_id,
                record_id: Some(record.id),
                success,
            });
        }

        self.invalidate_hints(workflow_id).await;
        info!(workflow_id = %workflow_id, rows = report.rows.len(), success = report.succeeded(), "Force terminate finished");
        report
    }

    async fn publish(&self, kind: EventKind, record: &StepRecord) {
        let snapshot = EventSnapshot {
            workflow_id: record.workflow_id,
            branch_id: record.branch_id.clone(),
            record_id: record.id,
            step: record.step,
            service_name: record.service_name.clone(),
            basic_status: record.basic_status,
            occurred_at: Utc::now(),
        };
        if let Err(e) = self.events.publish(kind, &snapshot).await {
            warn!(event = %kind, workflow_id = %record.workflow_id, error = %e, "Failed to publish lifecycle event");
        }
    }

    async fn invalidate_hints(&self, workflow_id: WorkflowId) {
        if !self.config.hints_enabled {
            return;
        }
        if let Err(e) = self.store.invalidate_hints(workflow_id).await {
            warn!(workflow_id = %workflow_id, error = %e, "Failed to invalidate hints");
        }
    }
}
