// Copyright © 2025 Cyberus Technology GmbH
// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
pub mod tests {
    use std::cmp::Ordering;

    use clap::{Arg, Command};

    pub fn assert_args_sorted<'a, F: Fn() -> R, R: Iterator<Item = &'a Arg>>(get_base_iter: F) {
        let iter = get_base_iter().zip(get_base_iter().skip(1));
        for (arg, next) in iter {
            assert_ne!(
                arg.get_id().cmp(next.get_id()),
                Ordering::Greater,
                "args not alphabetically sorted: arg={}, next={}",
                arg.get_id(),
                next.get_id()
            );
        }
    }

    /// Checks the arguments of `cmd` and of every nested subcommand.
    pub fn assert_command_args_sorted(cmd: &Command) {
        assert_args_sorted(|| cmd.get_arguments());
        for sub in cmd.get_subcommands() {
            assert_command_args_sorted(sub);
        }
    }
}
