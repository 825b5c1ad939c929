use crate::error::AppError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    Starting,
    Recording,
    Stopping,
    Error { message: String },
}

/// Tracks the recording lifecycle and fans state changes out to observers.
///
/// Transitions are validated so a double-start or a stop during teardown
/// surfaces as an error instead of corrupting the lifecycle. Clones share
/// the same underlying state.
#[derive(Clone)]
pub struct StateManager {
    state: Arc<RwLock<PipelineState>>,
    state_tx: Sender<PipelineState>,
    state_rx: Receiver<PipelineState>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (state_tx, state_rx) = crossbeam_channel::unbounded();
        Self {
            state: Arc::new(RwLock::new(PipelineState::Idle)),
            state_tx,
            state_rx,
        }
    }

    pub fn transition(&self, new_state: PipelineState) -> Result<(), AppError> {
        let mut current = self.state.write();

        // Validate state transitions
        let valid = matches!(
            (&*current, &new_state),
            (PipelineState::Idle, PipelineState::Starting)
                | (PipelineState::Starting, PipelineState::Recording)
                | (PipelineState::Starting, PipelineState::Error { .. })
                | (PipelineState::Recording, PipelineState::Stopping)
                | (PipelineState::Recording, PipelineState::Error { .. })
                | (PipelineState::Stopping, PipelineState::Idle)
                | (PipelineState::Error { .. }, PipelineState::Starting)
                | (PipelineState::Error { .. }, PipelineState::Idle)
        );

        if !valid {
            return Err(AppError::Fatal(format!(
                "Invalid state transition: {:?} -> {:?}",
                *current, new_state
            )));
        }

        tracing::info!("State transition: {:?} -> {:?}", *current, new_state);
        *current = new_state.clone();
        let _ = self.state_tx.send(new_state);
        Ok(())
    }

    pub fn current(&self) -> PipelineState {
        self.state.read().clone()
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.state.read(), PipelineState::Recording)
    }

    pub fn subscribe(&self) -> Receiver<PipelineState> {
        self.state_rx.clone()
    }
}
