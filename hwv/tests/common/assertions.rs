use hwv::ResultCollector;
use hwv::results::StepStatus;
use std::path::Path;

pub fn assert_contains(haystack: &str, needle: &str) {
    assert!(
        haystack.contains(needle),
        "Expected to find '{needle}' in output, got: {haystack}"
    );
}

pub fn assert_path_exists(path: &Path) {
    assert!(path.exists(), "Expected path to exist: {}", path.display());
}

pub fn assert_step_status(results: &ResultCollector, scenario_id: &str, step_id: &str, expected: StepStatus) {
    let result = results
        .step_result(scenario_id, step_id)
        .unwrap_or_else(|| panic!("No result recorded for {scenario_id}/{step_id}"));
    assert_eq!(
        result.status, expected,
        "Step {scenario_id}/{step_id}: {}",
        result.message
    );
}
