//! Child-process side of the worker protocol.
//!
//! A minion connects back to the engine, receives exactly one assignment,
//! streams its findings and exits. All of its IO is blocking; it is the only
//! thing running in its process.

use std::net::TcpStream;

use tracing::{debug, error};

use super::harness::{TestHarness, TestSpec};
use super::protocol::{
    CoverageAssignment, ExitCode, MinionMessage, MutantAssignment, ParentMessage, ProtocolError,
    UnitAssignment, read_frame, write_frame,
};
use crate::coverage::{ProbeRegistry, measure_tests};
use crate::mutation::{DetectionStatus, StatusTestPair};

/// Serve one assignment from the engine listening on `port`.
pub fn run_minion(port: u16, harness: &dyn TestHarness) -> ExitCode {
    match serve(port, harness) {
        Ok(exit) => exit,
        Err(err) => {
            error!(%err, "minion lost its connection to the engine");
            ExitCode::UnknownError
        }
    }
}

fn serve(port: u16, harness: &dyn TestHarness) -> Result<ExitCode, ProtocolError> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))?;
    stream.set_nodelay(true)?;

    let Some(message) = read_frame::<_, ParentMessage>(&mut stream)? else {
        return Ok(ExitCode::UnknownError);
    };
    let exit = match message {
        ParentMessage::Assign(assignment) => analyse_unit(&mut stream, &assignment, harness)?,
        ParentMessage::CoverageAssign(assignment) => {
            measure_assignment(&mut stream, &assignment, harness)?
        }
    };
    write_frame(&mut stream, &MinionMessage::Done { exit })?;
    Ok(exit)
}

fn analyse_unit(
    stream: &mut TcpStream,
    assignment: &UnitAssignment,
    harness: &dyn TestHarness,
) -> Result<ExitCode, ProtocolError> {
    debug!(
        unit = assignment.unit_id,
        mutants = assignment.mutants.len(),
        "minion analysing unit"
    );
    for mutant in &assignment.mutants {
        write_frame(
            stream,
            &MinionMessage::Describe {
                id: mutant.id.clone(),
            },
        )?;
        let pair = analyse_mutant(harness, mutant, assignment.full_matrix);
        write_frame(
            stream,
            &MinionMessage::Report {
                id: mutant.id.clone(),
                pair,
            },
        )?;
    }
    if let Err(reason) = harness.activate(None) {
        error!(%reason, "could not restore unmutated code");
        return Ok(ExitCode::TestPluginIssue);
    }
    Ok(ExitCode::Ok)
}

/// Run the assigned tests against one mutant.
///
/// Without the full matrix the first failing test ends the run. With it every
/// test runs and the verdicts are accumulated.
pub fn analyse_mutant(
    harness: &dyn TestHarness,
    mutant: &MutantAssignment,
    full_matrix: bool,
) -> StatusTestPair {
    if let Err(reason) = harness.activate(Some(&mutant.id)) {
        debug!(mutant = %mutant.id, %reason, "mutant is not viable");
        return StatusTestPair::not_analysed(0, DetectionStatus::NonViable);
    }

    if full_matrix {
        let mut pair = StatusTestPair::not_analysed(0, DetectionStatus::Survived);
        for test in &mutant.tests {
            pair.accumulate(&single_verdict(harness, test), &test.name);
        }
        return pair;
    }

    let mut tests_run = 0;
    for test in &mutant.tests {
        tests_run += 1;
        if !harness.execute(test, None).passed() {
            return StatusTestPair::killed_by(tests_run, test.name.clone());
        }
    }
    StatusTestPair::not_analysed(tests_run, DetectionStatus::Survived)
}

fn single_verdict(harness: &dyn TestHarness, test: &TestSpec) -> StatusTestPair {
    if harness.execute(test, None).passed() {
        StatusTestPair::not_analysed(1, DetectionStatus::Survived)
    } else {
        StatusTestPair::killed_by(1, test.name.clone())
    }
}

fn measure_assignment(
    stream: &mut TcpStream,
    assignment: &CoverageAssignment,
    harness: &dyn TestHarness,
) -> Result<ExitCode, ProtocolError> {
    let mut registry = ProbeRegistry::new();
    for unit in &assignment.units {
        registry.register(unit.name.clone(), unit.lines.iter().copied());
    }
    measure_tests(harness, &mut registry, &assignment.tests, |result| {
        write_frame(&mut *stream, &MinionMessage::CoverageResult(result))
    })?;
    if registry.dropped() > 0 {
        debug!(dropped = registry.dropped(), "discarded probe hits outside instrumented code");
    }
    Ok(ExitCode::Ok)
}
