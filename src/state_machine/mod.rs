//! Finite State Machine Abstractions
//!
//! Generic, reusable state machine types for modeling entity lifecycles.
//! All state machines are pure functional - transitions are deterministic
//! functions with no side effects. Side effects (store writes, job
//! scheduling) live in the orchestrator.

pub mod lifecycle;

pub use lifecycle::{
    LifecycleCommand, LifecycleState, StateTable, GUEST_DEPLOY_STATES, HOST_BUILD_STATES,
    HOST_DEPLOY_STATES, TEMPLATE_BUILD_STATES,
};

/// Result of a state transition
pub type TransitionResult<S> = Result<S, TransitionError>;

/// Errors that can occur during state transitions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// Transition from current state to target state is not allowed
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// An operation is already in flight for this entity
    #[error("Operation in flight: entity is {0}, not deployable")]
    OperationInFlight(String),

    /// State code is not defined for this entity
    #[error("Unknown state code {code:#04x} for {entity}")]
    UnknownCode { code: u8, entity: &'static str },
}

/// Trait for finite state machines
///
/// Implement this trait to define a state machine with typed states,
/// inputs, and outputs.
pub trait StateMachine: Sized + Clone {
    /// Input type that triggers transitions
    type Input;

    /// Output type produced by transitions (use () if none)
    type Output;

    /// Attempt to transition to a new state given an input
    ///
    /// # Returns
    /// - Ok((new_state, output)) if transition is valid
    /// - Err(TransitionError) if transition is invalid
    fn transition(&self, input: &Self::Input) -> TransitionResult<(Self, Self::Output)>;

    /// Check if a transition is valid without performing it
    fn can_transition(&self, input: &Self::Input) -> bool {
        self.transition(input).is_ok()
    }

    /// Get all valid inputs from current state (if enumerable)
    fn valid_inputs(&self) -> Vec<Self::Input>
    where
        Self::Input: Clone,
    {
        Vec::new()
    }
}
