//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Blocking waits
//! go through a condition variable (registry lookup, rendezvous slot, RDMA
//! credits); busy-polling spins or yields.
//! **Exceptions**: test code

use architectural_enforcement::find_violations;

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations =
        find_violations(|code| code.contains("::sleep(") || code.contains(".sleep("));

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }
        eprintln!("\n✅ Use instead:");
        eprintln!("  - Condvar::wait / wait_until for events");
        eprintln!("  - std::hint::spin_loop or thread::yield_now for low-latency polling");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
