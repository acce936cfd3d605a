//! BDD scenarios for the build workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BuildContext, build_context};

#[scenario(
    path = "tests/features/build.feature",
    name = "Provision, build, and tear down a host"
)]
fn scenario_successful_build(build_context: BuildContext) {
    drop(build_context);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Dry run renders the script without provisioning"
)]
fn scenario_dry_run(build_context: BuildContext) {
    drop(build_context);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Launch failure still revokes the credential"
)]
fn scenario_launch_failure(build_context: BuildContext) {
    drop(build_context);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Missing readiness signal times out and still tears down"
)]
fn scenario_readiness_timeout(build_context: BuildContext) {
    drop(build_context);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Unreachable host exhausts its connection attempts"
)]
fn scenario_unreachable_host(build_context: BuildContext) {
    drop(build_context);
}

#[scenario(
    path = "tests/features/build.feature",
    name = "Failed termination surfaces as a cleanup failure"
)]
fn scenario_terminate_failure(build_context: BuildContext) {
    drop(build_context);
}
