//! Reset-needed one-shot semantics: restoring a reusable sandbox in place
//! rather than evolving it forward.
//!
//! A worker that has been explicitly marked dirty via `set_needs_state_reset`
//! must discard all working memory on its next reset, regardless of
//! `ephemeral_keep_working_memory`, and the flag must clear itself afterward
//! so it does not force a discard forever.

use crate::hypervisor::machine::ResetOptions;

/// A sandbox that can be restored to its master snapshot.
pub trait RestoreSandbox {
    fn needs_state_reset(&self) -> bool;
    fn set_needs_state_reset(&mut self, value: bool);

    /// Build the `ResetOptions` for the next reset, honoring the one-shot
    /// `reset_needed` override, then clear the flag (check-then-clear).
    fn next_reset_options(&mut self, base: ResetOptions, ephemeral_keep_working_memory: bool) -> ResetOptions {
        let forced_discard = self.needs_state_reset();
        let options = ResetOptions {
            reset_keep_all_work_memory: !forced_discard && ephemeral_keep_working_memory,
            ..base
        };
        self.set_needs_state_reset(false);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(bool);
    impl RestoreSandbox for Dummy {
        fn needs_state_reset(&self) -> bool {
            self.0
        }
        fn set_needs_state_reset(&mut self, value: bool) {
            self.0 = value;
        }
    }

    fn base_opts() -> ResetOptions {
        ResetOptions {
            max_mem: 0,
            max_cow_mem: 0,
            reset_free_work_mem: 0,
            reset_copy_all_registers: true,
            reset_keep_all_work_memory: false,
        }
    }

    #[test]
    fn reset_needed_forces_discard_once_then_clears() {
        let mut d = Dummy(true);
        let opts = d.next_reset_options(base_opts(), true);
        assert!(!opts.reset_keep_all_work_memory);
        assert!(!d.needs_state_reset());

        let opts2 = d.next_reset_options(base_opts(), true);
        assert!(opts2.reset_keep_all_work_memory);
    }

    #[test]
    fn without_reset_needed_keep_flag_follows_ephemeral_setting() {
        let mut d = Dummy(false);
        let opts = d.next_reset_options(base_opts(), false);
        assert!(!opts.reset_keep_all_work_memory);
    }
}
