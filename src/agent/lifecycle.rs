use color_eyre::{eyre::eyre, Result};
use std::sync::Mutex;

/// Lifecycle phases of an agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Created, nothing run yet
  Parsed,
  /// Shell assets being fetched and stored
  Installing,
  /// Shell stored, waiting to activate
  Installed,
  /// Purging stale buckets
  Activating,
  /// In control; intercepts fetches
  Activated,
  /// Install failed
  Redundant,
}

impl Phase {
  /// Whether fetches may be intercepted in this phase.
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, Phase::Activated)
  }
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Phase::Parsed => write!(f, "parsed"),
      Phase::Installing => write!(f, "installing"),
      Phase::Installed => write!(f, "installed"),
      Phase::Activating => write!(f, "activating"),
      Phase::Activated => write!(f, "activated"),
      Phase::Redundant => write!(f, "redundant"),
    }
  }
}

#[derive(Debug)]
struct State {
  phase: Phase,
  clients_claimed: bool,
  /// An install attempt is running. Tracked apart from `phase` so an
  /// active agent keeps serving while it reinstalls.
  installing: bool,
}

/// Shared phase tracking for all clones of an agent.
#[derive(Debug)]
pub(crate) struct Lifecycle {
  state: Mutex<State>,
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State {
        phase: Phase::Parsed,
        clients_claimed: false,
        installing: false,
      }),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn phase(&self) -> Result<Phase> {
    Ok(self.lock()?.phase)
  }

  pub fn clients_claimed(&self) -> Result<bool> {
    Ok(self.lock()?.clients_claimed)
  }

  /// Move to `next` if `allowed` accepts the current phase.
  ///
  /// Check and update happen under one lock, so two concurrent installs
  /// can't both start.
  pub fn begin(&self, action: &str, allowed: impl Fn(Phase) -> bool, next: Phase) -> Result<()> {
    let mut state = self.lock()?;
    if !allowed(state.phase) {
      return Err(eyre!("Cannot {} while {}", action, state.phase));
    }
    state.phase = next;
    Ok(())
  }

  /// Start an install attempt.
  ///
  /// An activated agent stays activated for the whole attempt; any other
  /// phase moves to `Installing`.
  pub fn begin_install(&self) -> Result<()> {
    let mut state = self.lock()?;
    if state.installing {
      return Err(eyre!("Cannot install while {}", Phase::Installing));
    }
    if state.phase == Phase::Activating {
      return Err(eyre!("Cannot install while {}", state.phase));
    }
    state.installing = true;
    if state.phase != Phase::Activated {
      state.phase = Phase::Installing;
    }
    Ok(())
  }

  /// End an install attempt and return the resulting phase.
  ///
  /// An activated agent is never demoted, whatever the outcome.
  pub fn finish_install(&self, succeeded: bool) -> Result<Phase> {
    let mut state = self.lock()?;
    state.installing = false;
    if state.phase != Phase::Activated {
      state.phase = if succeeded {
        Phase::Installed
      } else {
        Phase::Redundant
      };
    }
    Ok(state.phase)
  }

  /// Fail unless the current phase satisfies `allowed`.
  pub fn require(&self, action: &str, allowed: impl Fn(Phase) -> bool) -> Result<()> {
    let state = self.lock()?;
    if !allowed(state.phase) {
      return Err(eyre!("Cannot {} while {}", action, state.phase));
    }
    Ok(())
  }

  pub fn set(&self, phase: Phase) -> Result<()> {
    self.lock()?.phase = phase;
    Ok(())
  }

  pub fn claim_clients(&self) -> Result<()> {
    self.lock()?.clients_claimed = true;
    Ok(())
  }
}
