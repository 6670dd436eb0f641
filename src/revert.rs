//! Compensating-action stack for multi-step operations against external tools.
//!
//! Every public driver operation that performs more than one externally visible
//! side effect pushes an undo closure for each completed effect before
//! attempting the next. On any non-success exit from the scope the stack fires
//! in reverse order; `success()` disarms it.

/// Ordered stack of undo actions, fired on drop unless disarmed.
///
/// Undo actions are best effort: a failing undo must log and swallow its own
/// error inside the closure so the original failure is the one surfaced.
#[derive(Default)]
pub struct Reverter<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Reverter<'a> {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Register an undo action for a side effect that just completed.
    pub fn add<F>(&mut self, action: F)
    where
        F: FnOnce() + 'a,
    {
        self.actions.push(Box::new(action));
    }

    /// Disarm the stack; the registered actions are discarded unexecuted.
    pub fn success(mut self) {
        self.actions.clear();
    }
}

impl Drop for Reverter<'_> {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn fires_in_reverse_order_on_drop() {
        let fired = RefCell::new(Vec::new());
        {
            let mut revert = Reverter::new();
            revert.add(|| fired.borrow_mut().push(1));
            revert.add(|| fired.borrow_mut().push(2));
            revert.add(|| fired.borrow_mut().push(3));
        }
        assert_eq!(*fired.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn success_discards_actions() {
        let fired = RefCell::new(Vec::new());
        {
            let mut revert = Reverter::new();
            revert.add(|| fired.borrow_mut().push(1));
            revert.success();
        }
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn empty_reverter_is_harmless() {
        let revert = Reverter::new();
        drop(revert);
    }
}
