//! Terminal output for the runner: banners, test listings, command echoes.
//!
//! These go to stdout alongside xctool's own pretty reporter output, so
//! every write is flushed immediately to keep the two interleaved correctly.

use crate::supervisor::Script;
use runner_core::TestIdentifier;
use std::collections::HashSet;
use std::io::Write;

const BANNER_PREFIX: &str = "xctool-runner: ";

/// A message framed by `=` rules as wide as the message.
pub fn banner(message: &str) -> String {
    let line = format!("{BANNER_PREFIX}{message}");
    let rule = "=".repeat(line.chars().count());
    format!("{rule}\n{line}\n{rule}")
}

pub fn print_banner(message: &str) {
    println!("{}", banner(message));
    flush();
}

/// Full inventory, with `>` marking the tests this runner instance owns.
pub fn inventory(tests: &[TestIdentifier], selected: &[TestIdentifier]) -> String {
    let selected: HashSet<&TestIdentifier> = selected.iter().collect();
    tests
        .iter()
        .map(|test| {
            let marker = if selected.contains(test) { '>' } else { ' ' };
            format!("\t{marker} {}", test.dotted())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn print_inventory(tests: &[TestIdentifier], selected: &[TestIdentifier]) {
    if !tests.is_empty() {
        println!("{}", inventory(tests, selected));
    }
    flush();
}

/// Tests requested for one round.
pub fn print_requested(tests: &[TestIdentifier]) {
    print_inventory(tests, tests);
}

pub fn print_command(script: &Script) {
    println!("{}", script.command_line());
    flush();
}

/// Captured tool output, passed through as-is.
pub fn print_output(output: &str) {
    print!("{output}");
    if !output.is_empty() && !output.ends_with('\n') {
        println!();
    }
    flush();
}

fn flush() {
    // Nothing useful to do if stdout is gone.
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_rules_match_message_width() {
        assert_eq!(
            banner("Listing tests"),
            "============================\n\
             xctool-runner: Listing tests\n\
             ============================"
        );
    }

    #[test]
    fn inventory_marks_selected_tests() {
        let tests = vec![
            TestIdentifier::new("A", "one"),
            TestIdentifier::new("A", "two"),
            TestIdentifier::new("B", "three"),
        ];
        let listing = inventory(&tests, &tests[..2]);
        assert_eq!(listing, "\t> A.one\n\t> A.two\n\t  B.three");
    }

    #[test]
    fn inventory_of_nothing_is_empty() {
        assert_eq!(inventory(&[], &[]), "");
    }
}
