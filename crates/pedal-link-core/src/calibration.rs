//! Guided calibration session.
//!
//! The device drives the actual sequence and only talks back in free text
//! until it finishes with a `cal` snapshot. Prompt updates are therefore a
//! best-effort match on the device's instructional phrases: if the firmware
//! rewords them, prompts stop advancing but the session still completes on
//! the snapshot.

use model::TelemetryRecord;
use serde::Serialize;

use crate::command::CalibrationTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStep {
    /// Shown until the device prints its first instruction.
    Instructions,
    ReleasePedal,
    PressFully,
    Sampling,
}

impl PromptStep {
    pub fn text(self) -> &'static str {
        match self {
            PromptStep::Instructions => "Follow the instructions on the device display.",
            PromptStep::ReleasePedal => "RELEASE THE PEDAL and do not touch it",
            PromptStep::PressFully => "PRESS ALL THE WAY DOWN and hold",
            PromptStep::Sampling => "TAKING SAMPLES... do not release yet",
        }
    }
}

struct PromptRule {
    needles: &'static [&'static str],
    step: PromptStep,
}

// Evaluated in order; the first rule with a matching needle wins.
const PROMPT_RULES: &[PromptRule] = &[
    PromptRule { needles: &["No presiones", "SUELTA"], step: PromptStep::ReleasePedal },
    PromptRule { needles: &["completamente", "PISA"], step: PromptStep::PressFully },
    PromptRule { needles: &["muestras"], step: PromptStep::Sampling },
];

pub fn match_prompt(line: &str) -> Option<PromptStep> {
    PROMPT_RULES
        .iter()
        .find(|rule| rule.needles.iter().any(|n| line.contains(n)))
        .map(|rule| rule.step)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CalibrationPrompt {
    pub target: CalibrationTarget,
    pub title: &'static str,
    pub step: PromptStep,
    pub text: &'static str,
}

impl CalibrationPrompt {
    fn new(target: CalibrationTarget, step: PromptStep) -> Self {
        Self { target, title: target.title(), step, text: step.text() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CalibrationState {
    #[default]
    Idle,
    AwaitingStep {
        target: CalibrationTarget,
        step: PromptStep,
        last_instruction: Option<String>,
    },
    /// Behaves like `Idle` for every input; kept so callers can tell which
    /// routine finished last.
    Completed { target: CalibrationTarget },
}

#[derive(Debug, Default)]
pub struct CalibrationSession {
    state: CalibrationState,
}

impl CalibrationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, CalibrationState::AwaitingStep { .. })
    }

    pub fn prompt(&self) -> Option<CalibrationPrompt> {
        match &self.state {
            CalibrationState::AwaitingStep { target, step, .. } => {
                Some(CalibrationPrompt::new(*target, *step))
            }
            _ => None,
        }
    }

    /// A calibration command went out. Restarts the prompt even if another
    /// routine was still waiting.
    pub fn begin(&mut self, target: CalibrationTarget) -> CalibrationPrompt {
        self.state = CalibrationState::AwaitingStep {
            target,
            step: PromptStep::Instructions,
            last_instruction: None,
        };
        CalibrationPrompt::new(target, PromptStep::Instructions)
    }

    /// Returns the new prompt when a device line moves it to another step.
    pub fn on_log(&mut self, line: &str) -> Option<CalibrationPrompt> {
        let CalibrationState::AwaitingStep { target, step, last_instruction } = &mut self.state
        else {
            return None;
        };
        let next = match_prompt(line)?;
        *last_instruction = Some(line.to_string());
        if next == *step {
            return None;
        }
        *step = next;
        Some(CalibrationPrompt::new(*target, next))
    }

    /// Returns true when the record finished a waiting session, i.e. the
    /// prompt must close. Snapshots outside a session change nothing here.
    pub fn on_record(&mut self, rec: &TelemetryRecord) -> bool {
        if !rec.is_calibration() {
            return false;
        }
        match self.state {
            CalibrationState::AwaitingStep { target, .. } => {
                tracing::debug!(routine = %target, "calibration finished");
                self.state = CalibrationState::Completed { target };
                true
            }
            _ => false,
        }
    }

    /// Forces `Idle`. Returns true if a prompt was open.
    pub fn reset(&mut self) -> bool {
        let was_open = self.is_awaiting();
        self.state = CalibrationState::Idle;
        was_open
    }

    pub fn last_instruction(&self) -> Option<&str> {
        match &self.state {
            CalibrationState::AwaitingStep { last_instruction, .. } => last_instruction.as_deref(),
            _ => None,
        }
    }
}
