//! Integration Test Harness
//!
//! Runs every integration test target once, then reports the outcome per
//! reliability property: each property is backed by one or more named tests,
//! possibly spread over several targets, and holds only if all of them pass.
//!
//! # Usage
//!
//! Run all tests and print the property report:
//! ```text
//! cargo run -p integration-tests
//! ```
//!
//! Run one target directly:
//! ```text
//! cargo test -p integration-tests --test retry_tests
//! cargo test -p integration-tests --test timeout_tests
//! cargo test -p integration-tests --test adapter_tests
//! cargo test -p integration-tests --test ordering_tests
//! ```
//!
//! Run with increased logging:
//! ```text
//! RUST_LOG=rpcgate=debug cargo run -p integration-tests
//! ```

use std::collections::HashMap;
use std::process::Command;
use std::time::{Duration, Instant};

const TARGETS: &[&str] = &["retry_tests", "timeout_tests", "adapter_tests", "ordering_tests"];

/// A reliability property and the tests that demonstrate it
struct Property {
    name: &'static str,
    /// `(target, test function)`
    tests: &'static [(&'static str, &'static str)],
}

const PROPERTIES: &[Property] = &[
    Property {
        name: "Idempotent calls retried up to the schedule",
        tests: &[
            ("retry_tests", "test_idempotent_retried_after_connection_loss"),
            ("retry_tests", "test_retries_exhausted_surface_last_failure"),
            ("retry_tests", "test_retry_delays_are_applied"),
        ],
    },
    Property {
        name: "Non-idempotent calls never retried after send",
        tests: &[("retry_tests", "test_non_idempotent_not_retried_after_send")],
    },
    Property {
        name: "Pre-send failures retried for every call",
        tests: &[
            ("retry_tests", "test_connect_failures_retried_before_send"),
            ("retry_tests", "test_connect_failures_exhaust_schedule"),
            ("timeout_tests", "test_connect_timeout_retried_by_schedule"),
        ],
    },
    Property {
        name: "Retry sentinel disables retries",
        tests: &[("retry_tests", "test_disabled_retries_fail_on_first_failure")],
    },
    Property {
        name: "Servant failures reach the caller once",
        tests: &[
            ("retry_tests", "test_application_error_not_retried"),
            ("retry_tests", "test_oversized_reply_fails_only_its_call"),
        ],
    },
    Property {
        name: "Held requests wait for activate",
        tests: &[
            ("adapter_tests", "test_held_request_completes_after_activate"),
            ("adapter_tests", "test_hold_for_reactivates"),
            ("ordering_tests", "test_order_preserved_across_hold"),
        ],
    },
    Property {
        name: "Deactivate fails unstarted requests",
        tests: &[
            ("adapter_tests", "test_hold_then_deactivate_fails_parked_request"),
            ("adapter_tests", "test_deactivate_fails_queued_requests"),
            ("adapter_tests", "test_requests_after_deactivate"),
        ],
    },
    Property {
        name: "wait_for_hold observes a drained hold",
        tests: &[
            ("adapter_tests", "test_wait_for_hold_waits_for_drain"),
            ("adapter_tests", "test_wait_for_hold_released_by_deactivate"),
        ],
    },
    Property {
        name: "Connect timeout bounds establishment",
        tests: &[("timeout_tests", "test_connect_timeout_against_holding_adapter")],
    },
    Property {
        name: "Invocation timeout without misdelivery",
        tests: &[
            ("timeout_tests", "test_invocation_timeout"),
            ("timeout_tests", "test_late_reply_is_discarded"),
            ("timeout_tests", "test_override_takes_precedence"),
        ],
    },
    Property {
        name: "Close timeout bounds graceful close",
        tests: &[
            ("timeout_tests", "test_graceful_close_drains_pending"),
            ("timeout_tests", "test_close_timeout_forces_close"),
        ],
    },
    Property {
        name: "Serialized dispatch is strict FIFO",
        tests: &[
            ("ordering_tests", "test_sequential_sets_observe_previous_value"),
            ("ordering_tests", "test_pipelined_requests_dispatch_in_order"),
            ("ordering_tests", "test_serialized_adapter_never_overlaps"),
        ],
    },
    Property {
        name: "Concurrent dispatch overlaps",
        tests: &[("adapter_tests", "test_concurrent_adapter_overlaps_dispatch")],
    },
    Property {
        name: "Adapter counters",
        tests: &[("adapter_tests", "test_adapter_stats")],
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Passed,
    Failed,
    Ignored,
}

/// Result of running one test target
struct TargetRun {
    target: &'static str,
    duration: Duration,
    exit_ok: bool,
    tests: HashMap<String, Outcome>,
}

/// Pick `test <name> ... <outcome>` lines out of libtest output
fn parse_outcomes(stdout: &str) -> HashMap<String, Outcome> {
    stdout
        .lines()
        .filter_map(|line| {
            let rest = line.strip_prefix("test ")?;
            let (name, outcome) = rest.split_once(" ... ")?;
            let outcome = match outcome.trim() {
                "ok" => Outcome::Passed,
                "FAILED" => Outcome::Failed,
                s if s.starts_with("ignored") => Outcome::Ignored,
                _ => return None,
            };
            Some((name.trim().to_string(), outcome))
        })
        .collect()
}

fn run_target(target: &'static str) -> TargetRun {
    println!("Running {} ...", target);
    let start = Instant::now();

    let output = Command::new("cargo")
        .args(["test", "-p", "integration-tests", "--test", target])
        .output();

    let duration = start.elapsed();
    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !output.status.success() {
                println!("{}", stdout);
                eprintln!("{}", String::from_utf8_lossy(&output.stderr));
            }
            TargetRun {
                target,
                duration,
                exit_ok: output.status.success(),
                tests: parse_outcomes(&stdout),
            }
        }
        Err(e) => {
            eprintln!("Failed to execute cargo for {}: {}", target, e);
            TargetRun {
                target,
                duration,
                exit_ok: false,
                tests: HashMap::new(),
            }
        }
    }
}

/// Status of one property: all backing tests passed, some failed, or some
/// never reported
fn property_status(property: &Property, runs: &[TargetRun]) -> &'static str {
    let mut missing = false;
    for (target, test) in property.tests {
        let outcome = runs
            .iter()
            .find(|run| run.target == *target)
            .and_then(|run| run.tests.get(*test));
        match outcome {
            Some(Outcome::Passed) => {}
            Some(Outcome::Failed) => return "FAIL",
            Some(Outcome::Ignored) | None => missing = true,
        }
    }
    if missing {
        "MISSING"
    } else {
        "PASS"
    }
}

fn main() {
    println!("{}", "=".repeat(80));
    println!("  rpcgate integration test suite");
    println!("{}", "=".repeat(80));
    println!();

    let total_start = Instant::now();
    let runs: Vec<TargetRun> = TARGETS.iter().copied().map(run_target).collect();

    println!("\n{:<20} {:<8} {:>7} {:>7} {:>12}", "Target", "Exit", "Passed", "Failed", "Duration");
    println!("{}", "-".repeat(80));
    for run in &runs {
        let count = |o: Outcome| run.tests.values().filter(|v| **v == o).count();
        println!(
            "{:<20} {:<8} {:>7} {:>7} {:>12.2?}",
            run.target,
            if run.exit_ok { "ok" } else { "error" },
            count(Outcome::Passed),
            count(Outcome::Failed),
            run.duration
        );
    }

    println!("\n{:<50} {}", "Property", "Status");
    println!("{}", "-".repeat(80));
    let mut holds = 0;
    for property in PROPERTIES {
        let status = property_status(property, &runs);
        if status == "PASS" {
            holds += 1;
        }
        println!("{:<50} {}", property.name, status);
        if status != "PASS" {
            for (target, test) in property.tests {
                println!("    {}::{}", target, test);
            }
        }
    }

    println!("{}", "=".repeat(80));
    println!(
        "{} of {} properties hold; total {:.2?}",
        holds,
        PROPERTIES.len(),
        total_start.elapsed()
    );

    let all_ok = holds == PROPERTIES.len() && runs.iter().all(|run| run.exit_ok);
    std::process::exit(if all_ok { 0 } else { 1 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_outcomes() {
        let stdout = "\nrunning 3 tests\n\
                      test test_a ... ok\n\
                      test test_b ... FAILED\n\
                      test test_c ... ignored, slow\n\
                      test result: FAILED. 1 passed; 1 failed; 1 ignored\n";
        let outcomes = parse_outcomes(stdout);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes["test_a"], Outcome::Passed);
        assert_eq!(outcomes["test_b"], Outcome::Failed);
        assert_eq!(outcomes["test_c"], Outcome::Ignored);
    }

    #[test]
    fn test_every_property_names_known_targets() {
        for property in PROPERTIES {
            assert!(!property.tests.is_empty(), "{} has no tests", property.name);
            for (target, _) in property.tests {
                assert!(TARGETS.contains(target), "unknown target {}", target);
            }
        }
    }
}
