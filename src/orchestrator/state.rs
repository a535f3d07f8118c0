//! Operation state machine
//!
//! Every orchestrator operation moves through the same lifecycle: its
//! directive plan is built (Planned), the directives run (Applying), all of
//! them complete (Applied), and the topology change is persisted
//! (Committed). A mandatory directive failure moves it to Aborted.
//!
//! Aborted is terminal and does not mean rolled back: directives applied
//! before the failure stay applied.

use state_machines::state_machine;
use tracing::debug;

state_machine! {
    name: OperationMachine,
    dynamic: true,
    initial: Planned,
    states: [Planned, Applying, Applied, Committed, Aborted],
    events {
        apply {
            transition: { from: Planned, to: Applying }
        }
        applied {
            transition: { from: Applying, to: Applied }
        }
        commit {
            transition: { from: Applied, to: Committed }
        }
        abort {
            transition: { from: [Planned, Applying], to: Aborted }
        }
    }
}

/// Simple phase enum for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planned,
    Applying,
    Applied,
    Committed,
    Aborted,
}

impl Phase {
    /// Parse phase from string representation
    pub fn from_str(s: &str) -> Self {
        match s {
            "Applying" => Phase::Applying,
            "Applied" => Phase::Applied,
            "Committed" => Phase::Committed,
            "Aborted" => Phase::Aborted,
            _ => Phase::Planned,
        }
    }
}

/// One running operation and its directive counters
pub struct Operation {
    machine: DynamicOperationMachine<()>,
    /// Human-readable label, e.g. "create-vpc app1"
    pub label: String,
    /// Directives that completed successfully
    pub applied: usize,
    /// Best-effort directives that failed and were skipped
    pub skipped: usize,
}

impl Operation {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            machine: OperationMachine::new(()).into_dynamic(),
            label: label.into(),
            applied: 0,
            skipped: 0,
        }
    }

    /// Get current phase as enum
    pub fn phase(&self) -> Phase {
        Phase::from_str(self.machine.current_state())
    }

    pub fn begin(&mut self) {
        self.fire(OperationMachineEvent::Apply);
    }

    pub fn finish(&mut self) {
        self.fire(OperationMachineEvent::Applied);
    }

    pub fn commit(&mut self) {
        self.fire(OperationMachineEvent::Commit);
    }

    pub fn abort(&mut self) {
        self.fire(OperationMachineEvent::Abort);
    }

    fn fire(&mut self, event: OperationMachineEvent) {
        let from = self.machine.current_state().to_string();
        // Invalid transitions are programming errors in the orchestrator; the phase stays put
        if self.machine.handle(event).is_ok() {
            debug!(
                operation = %self.label,
                "{} -> {}",
                from,
                self.machine.current_state()
            );
        }
    }
}
