//! Weighted per-state progress
//!
//! Each installer state owns a 0..1 fraction and a weight. The overall
//! progress is the weighted mean, and the current state is the first one
//! that has not completed.

use super::control::Controllable;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

/// Installer states, in the order a run moves through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BuildPatchState {
    Queued,
    Initializing,
    Resuming,
    Downloading,
    Installing,
    MovingToInstall,
    SettingAttributes,
    BuildVerification,
    CleanUp,
    PrerequisitesInstall,
    Completed,
    Paused,
}

impl BuildPatchState {
    /// Every state that carries progress, in run order
    pub const SEQUENCE: [BuildPatchState; 11] = [
        BuildPatchState::Queued,
        BuildPatchState::Initializing,
        BuildPatchState::Resuming,
        BuildPatchState::Downloading,
        BuildPatchState::Installing,
        BuildPatchState::MovingToInstall,
        BuildPatchState::SettingAttributes,
        BuildPatchState::BuildVerification,
        BuildPatchState::CleanUp,
        BuildPatchState::PrerequisitesInstall,
        BuildPatchState::Completed,
    ];

    fn index(self) -> usize {
        match self {
            BuildPatchState::Queued => 0,
            BuildPatchState::Initializing => 1,
            BuildPatchState::Resuming => 2,
            BuildPatchState::Downloading => 3,
            BuildPatchState::Installing => 4,
            BuildPatchState::MovingToInstall => 5,
            BuildPatchState::SettingAttributes => 6,
            BuildPatchState::BuildVerification => 7,
            BuildPatchState::CleanUp => 8,
            BuildPatchState::PrerequisitesInstall => 9,
            BuildPatchState::Completed => 10,
            BuildPatchState::Paused => 11,
        }
    }

    /// States without a meaningful fraction show an indeterminate bar
    pub fn is_marquee(self) -> bool {
        matches!(
            self,
            BuildPatchState::Queued
                | BuildPatchState::Initializing
                | BuildPatchState::CleanUp
                | BuildPatchState::PrerequisitesInstall
                | BuildPatchState::Paused
        )
    }
}

impl fmt::Display for BuildPatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BuildPatchState::Queued => "Queued",
            BuildPatchState::Initializing => "Initializing",
            BuildPatchState::Resuming => "Resuming",
            BuildPatchState::Downloading => "Downloading",
            BuildPatchState::Installing => "Installing",
            BuildPatchState::MovingToInstall => "Moving to install",
            BuildPatchState::SettingAttributes => "Setting attributes",
            BuildPatchState::BuildVerification => "Verifying",
            BuildPatchState::CleanUp => "Cleaning up",
            BuildPatchState::PrerequisitesInstall => "Installing prerequisites",
            BuildPatchState::Completed => "Complete",
            BuildPatchState::Paused => "Paused",
        };
        f.write_str(text)
    }
}

const NUM_STATES: usize = 12;

fn default_weights() -> [f32; NUM_STATES] {
    let mut weights = [0.0; NUM_STATES];
    weights[BuildPatchState::Downloading.index()] = 1.0;
    weights[BuildPatchState::Installing.index()] = 1.0;
    weights[BuildPatchState::MovingToInstall.index()] = 0.05;
    weights[BuildPatchState::SettingAttributes.index()] = 0.05;
    weights[BuildPatchState::BuildVerification.index()] = 0.1;
    weights
}

#[derive(Debug)]
struct ProgressState {
    progress: [f32; NUM_STATES],
    weights: [f32; NUM_STATES],
    paused: bool,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self {
            progress: [0.0; NUM_STATES],
            weights: default_weights(),
            paused: false,
        }
    }
}

/// Thread-safe progress shared between the installer and its components
#[derive(Debug, Default)]
pub struct BuildPatchProgress {
    state: Mutex<ProgressState>,
}

impl BuildPatchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all progress and restore default weights
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        let paused = state.paused;
        *state = ProgressState::default();
        state.paused = paused;
    }

    pub fn set_state_progress(&self, s: BuildPatchState, value: f32) {
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        self.state.lock().unwrap().progress[s.index()] = value;
    }

    pub fn set_state_weight(&self, s: BuildPatchState, weight: f32) {
        self.state.lock().unwrap().weights[s.index()] = weight.max(0.0);
    }

    pub fn state_progress(&self, s: BuildPatchState) -> f32 {
        self.state.lock().unwrap().progress[s.index()]
    }

    pub fn state_weight(&self, s: BuildPatchState) -> f32 {
        self.state.lock().unwrap().weights[s.index()]
    }

    /// The first incomplete state, or Paused while paused
    pub fn state(&self) -> BuildPatchState {
        let state = self.state.lock().unwrap();
        if state.paused {
            return BuildPatchState::Paused;
        }
        BuildPatchState::SEQUENCE
            .iter()
            .copied()
            .find(|s| state.progress[s.index()] < 1.0)
            .unwrap_or(BuildPatchState::Completed)
    }

    /// Overall progress, or -1 while the current state is indeterminate
    pub fn progress(&self) -> f32 {
        if self.state().is_marquee() {
            return -1.0;
        }
        self.progress_no_marquee()
    }

    /// Weighted overall progress regardless of the current state
    pub fn progress_no_marquee(&self) -> f32 {
        let state = self.state.lock().unwrap();
        let mut total_weight = 0.0f32;
        let mut done = 0.0f32;
        for s in BuildPatchState::SEQUENCE {
            let weight = state.weights[s.index()];
            total_weight += weight;
            done += weight * state.progress[s.index()];
        }
        if total_weight <= 0.0 {
            return 0.0;
        }
        (done / total_weight).clamp(0.0, 1.0)
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    /// Flip the pause flag, returning the new value
    pub fn toggle_pause(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.paused = !state.paused;
        state.paused
    }
}

impl Controllable for BuildPatchProgress {
    fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap().paused = paused;
    }

    fn abort(&self) {}
}
