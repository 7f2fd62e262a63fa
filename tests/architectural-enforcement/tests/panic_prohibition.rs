//! Integration Test: Unwrap Prohibition
//!
//! **Policy**: Production code propagates errors with `?`. Contract
//! violations (double close, unbalanced direct access) use `panic!` or
//! `assert!` with a message; `unwrap()` and `expect()` are not used.
//! **Exceptions**: test code

use architectural_enforcement::find_violations;

/// Test that production code does not unwrap
#[test]
fn test_no_unwrap_in_production_code() {
    let violations = find_violations(|code| code.contains(".unwrap()") || code.contains(".expect("));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: unwrap()/expect() found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        panic!(
            "\nFound {} unwrap/expect violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
