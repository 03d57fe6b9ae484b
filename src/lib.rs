// Copyright © 2025 Cyberus Technology GmbH
// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;

/// Flattens an error and its sources into one message per level, outermost
/// first.
pub fn error_chain(top_error: &dyn Error) -> Vec<String> {
    std::iter::successors(Some(top_error), |sub_error| {
        // Dereference necessary to mitigate rustc compiler bug.
        // See <https://github.com/rust-lang/rust/issues/141673>
        (*sub_error).source()
    })
    .map(|error| error.to_string())
    .collect()
}

/// Prints a chain of errors to the user in a consistent manner.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    let chain = error_chain(top_error);
    if chain.len() == 1 {
        eprintln!("Error: {component} failed: {}", chain[0]);
    } else {
        eprintln!("Error: {component} failed with the following chain of errors:");
        for (level, error) in chain.iter().enumerate() {
            eprintln!("  {level}: {error}");
        }
    }

    log::debug!("{top_error:?}");
}
