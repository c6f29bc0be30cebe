//! Review step between reconciliation and sync.
//!
//! Detected changes start out unstaged. The caller promotes the ones it
//! wants to act on, then commits. Committing only resets bookkeeping; the
//! caller applies the returned changes (see [`crate::sync::apply_changes`]).
//!
//! Not synchronized: one session owns a `StagingArea`.

use crate::models::StagedChange;

#[derive(Debug, Default, Clone)]
pub struct StagingArea {
    staged: Vec<StagedChange>,
    unstaged: Vec<StagedChange>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session with every change unstaged.
    pub fn from_changes(changes: Vec<StagedChange>) -> Self {
        Self {
            staged: Vec::new(),
            unstaged: changes,
        }
    }

    pub fn add_change(&mut self, change: StagedChange) {
        self.unstaged.push(change);
    }

    pub fn staged(&self) -> &[StagedChange] {
        &self.staged
    }

    pub fn unstaged(&self) -> &[StagedChange] {
        &self.unstaged
    }

    /// Move `change` from unstaged to staged. No-op if it is not unstaged.
    pub fn stage_change(&mut self, change: &StagedChange) -> bool {
        move_between(&mut self.unstaged, &mut self.staged, change)
    }

    /// Move `change` from staged back to unstaged. No-op if it is not staged.
    pub fn unstage_change(&mut self, change: &StagedChange) -> bool {
        move_between(&mut self.staged, &mut self.unstaged, change)
    }

    pub fn stage_all(&mut self) {
        self.staged.append(&mut self.unstaged);
    }

    /// Clear the staged collection, handing its changes to the caller.
    pub fn commit_changes(&mut self) -> Vec<StagedChange> {
        std::mem::take(&mut self.staged)
    }
}

fn move_between(from: &mut Vec<StagedChange>, to: &mut Vec<StagedChange>, change: &StagedChange) -> bool {
    match from.iter().position(|c| c == change) {
        Some(index) => {
            to.push(from.remove(index));
            true
        }
        None => false,
    }
}
