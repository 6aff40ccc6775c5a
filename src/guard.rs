//! Scoped rollback for multi-step negotiations.
//!
//! Each acquired sub-resource registers its release as a [`Rollback`]. If the
//! sequence bails out early, the guards drop in reverse order of creation and
//! undo what was acquired; once every step has succeeded the caller commits
//! them and nothing runs.

/// Runs `undo` on drop unless [`commit`](Rollback::commit) was called.
#[must_use = "a rollback guard that is dropped immediately undoes its step at once"]
pub struct Rollback<F: FnOnce()> {
    undo: Option<F>,
}

impl<F: FnOnce()> Rollback<F> {
    pub fn new(undo: F) -> Self {
        Rollback { undo: Some(undo) }
    }

    /// Keeps the acquired resource.
    pub fn commit(mut self) {
        self.undo = None;
    }
}

impl<F: FnOnce()> Drop for Rollback<F> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            undo();
        }
    }
}
