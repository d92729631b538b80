//! Common test utilities and macros

use snapheap::{HeapError, MemoryManager};

#[derive(Debug)]
pub enum TestResult {
    Success,
    Error(String),
    ErrorRegex(String),
}

impl PartialEq for TestResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TestResult::Success, TestResult::Success) => true,
            (TestResult::Error(a), TestResult::Error(b)) => a == b,
            (TestResult::ErrorRegex(pattern), TestResult::Error(msg)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            (TestResult::Error(msg), TestResult::ErrorRegex(pattern)) => {
                regex::Regex::new(pattern).unwrap().is_match(msg)
            }
            _ => false,
        }
    }
}

/// Runs `scenario` against a fresh memory manager and reports how it ended.
pub fn run_scenario<F>(scenario: F) -> TestResult
where
    F: FnOnce(&mut MemoryManager) -> Result<(), HeapError>,
{
    let mut memory = MemoryManager::new();
    match scenario(&mut memory) {
        Ok(()) => TestResult::Success,
        Err(e) => TestResult::Error(e.to_string()),
    }
}

#[macro_export]
macro_rules! check_scenario {
    ($test_name:ident, scenario=$scenario:expr, result=$expected:expr) => {
        #[test]
        fn $test_name() {
            let result = crate::common::run_scenario($scenario);
            assert_eq!(result, $expected);
        }
    };
}
