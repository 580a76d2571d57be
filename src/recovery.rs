//! Ordered attempt chains shared by the modality handlers.
//!
//! A chain is a list of named steps. Steps run in order until one succeeds;
//! every failure is recorded, and when nothing succeeds a terminal closure turns
//! the recorded failures into a best-effort message. A chain never errors.

use std::fmt;

use tracing::{info, warn};

use crate::error::GenerationError;

type StepFn<'a, T> = Box<dyn FnOnce() -> Result<T, GenerationError> + 'a>;
type HaltFn<'a> = Box<dyn Fn(&GenerationError) -> bool + 'a>;

#[derive(Debug, Clone)]
pub struct StepFailure {
    pub step: &'static str,
    pub error: GenerationError,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// A state the chain passed through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    Attempting(usize, &'static str),
    Success(&'static str),
    Degraded,
}

#[derive(Debug)]
pub enum Outcome<T> {
    Success {
        step: &'static str,
        output: T,
        failures: Vec<StepFailure>,
    },
    Degraded {
        message: String,
        failures: Vec<StepFailure>,
    },
}

impl<T> Outcome<T> {
    pub fn failures(&self) -> &[StepFailure] {
        match self {
            Outcome::Success { failures, .. } | Outcome::Degraded { failures, .. } => failures,
        }
    }

    /// Every state visited, in order
    pub fn visited(&self) -> Vec<RecoveryState> {
        let mut states: Vec<RecoveryState> = self
            .failures()
            .iter()
            .enumerate()
            .map(|(i, f)| RecoveryState::Attempting(i, f.step))
            .collect();
        match self {
            Outcome::Success { step, .. } => {
                states.push(RecoveryState::Attempting(states.len(), step));
                states.push(RecoveryState::Success(step));
            }
            Outcome::Degraded { .. } => states.push(RecoveryState::Degraded),
        }
        states
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl Outcome<String> {
    /// Collapses the outcome into the handler's result string
    pub fn into_message(self) -> String {
        match self {
            Outcome::Success { output, .. } => output,
            Outcome::Degraded { message, .. } => message,
        }
    }
}

pub struct RecoveryChain<'a, T> {
    name: &'static str,
    steps: Vec<(&'static str, StepFn<'a, T>)>,
    halt: Option<HaltFn<'a>>,
}

impl<'a, T> RecoveryChain<'a, T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            steps: Vec::new(),
            halt: None,
        }
    }

    /// Skips the remaining steps once a failure matches `halt`
    pub fn halt_on<P>(mut self, halt: P) -> Self
    where
        P: Fn(&GenerationError) -> bool + 'a,
    {
        self.halt = Some(Box::new(halt));
        self
    }

    pub fn step<F>(mut self, name: &'static str, attempt: F) -> Self
    where
        F: FnOnce() -> Result<T, GenerationError> + 'a,
    {
        self.steps.push((name, Box::new(attempt)));
        self
    }

    /// Adds the step only when `enabled` holds
    pub fn step_if<F>(self, enabled: bool, name: &'static str, attempt: F) -> Self
    where
        F: FnOnce() -> Result<T, GenerationError> + 'a,
    {
        if enabled {
            self.step(name, attempt)
        } else {
            self
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run<D>(self, terminal: D) -> Outcome<T>
    where
        D: FnOnce(&[StepFailure]) -> String,
    {
        let total = self.steps.len();
        let mut failures = Vec::new();

        for (index, (step, attempt)) in self.steps.into_iter().enumerate() {
            match attempt() {
                Ok(output) => {
                    if index > 0 {
                        info!("{}: step '{step}' succeeded after {index} failed attempt(s)", self.name);
                    }
                    return Outcome::Success {
                        step,
                        output,
                        failures,
                    };
                }
                Err(error) => {
                    warn!(
                        "{}: step '{step}' ({}/{total}) failed: {error}",
                        self.name,
                        index + 1
                    );
                    let halted = self.halt.as_ref().is_some_and(|halt| halt(&error));
                    failures.push(StepFailure { step, error });
                    if halted {
                        warn!("{}: '{step}' failure is not recoverable, skipping remaining steps", self.name);
                        break;
                    }
                }
            }
        }

        let message = terminal(&failures);
        warn!(
            "{}: {} of {total} attempt(s) failed, returning degraded result",
            self.name,
            failures.len()
        );
        Outcome::Degraded { message, failures }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn first_success_stops_the_chain() {
        let calls = Cell::new(0);
        let outcome = RecoveryChain::new("test")
            .step("first", || {
                calls.set(calls.get() + 1);
                Err(GenerationError::EmptyOutput)
            })
            .step("second", || {
                calls.set(calls.get() + 1);
                Ok("done".to_string())
            })
            .step("third", || {
                calls.set(calls.get() + 1);
                Ok("never".to_string())
            })
            .run(|_| "degraded".into());

        assert_eq!(calls.get(), 2);
        assert_eq!(
            outcome.visited(),
            vec![
                RecoveryState::Attempting(0, "first"),
                RecoveryState::Attempting(1, "second"),
                RecoveryState::Success("second"),
            ]
        );
        assert_eq!(outcome.into_message(), "done");
    }

    #[test]
    fn terminal_sees_every_failure() {
        let outcome: Outcome<String> = RecoveryChain::new("test")
            .step("a", || Err(GenerationError::OutOfMemory("gpu".into())))
            .step_if(false, "skipped", || Ok("unreachable".into()))
            .step("b", || Err(GenerationError::Runtime("boom".into())))
            .run(|failures| {
                failures
                    .iter()
                    .map(|f| f.step)
                    .collect::<Vec<_>>()
                    .join(",")
            });

        assert!(!outcome.is_success());
        assert_eq!(outcome.failures().len(), 2);
        assert_eq!(outcome.visited().last(), Some(&RecoveryState::Degraded));
        assert_eq!(outcome.into_message(), "a,b");
    }

    #[test]
    fn halting_failure_skips_the_rest() {
        let calls = Cell::new(0);
        let outcome = RecoveryChain::new("test")
            .halt_on(|e| !matches!(e, GenerationError::EmptyOutput))
            .step("first", || {
                calls.set(calls.get() + 1);
                Err(GenerationError::Runtime("boom".into()))
            })
            .step("second", || {
                calls.set(calls.get() + 1);
                Ok("never".to_string())
            })
            .run(|failures| failures[0].step.to_string());

        assert_eq!(calls.get(), 1);
        assert_eq!(outcome.into_message(), "first");
    }

    #[test]
    fn empty_chain_degrades() {
        let outcome: Outcome<String> = RecoveryChain::new("empty").run(|f| format!("{} failures", f.len()));
        assert_eq!(outcome.into_message(), "0 failures");
    }
}
