//! Listeners notified as results arrive.

use std::error::Error;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use super::StatisticsAggregator;
use crate::history::HistoryStore;
use crate::mutation::{ClassMutationResults, DetectionStatus};

/// Outcome of a listener callback.
pub type ListenerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Receives run events from the single result-draining task.
pub trait MutationResultListener: Send {
    /// Short name used when logging failures.
    fn name(&self) -> &str;

    fn run_start(&mut self) -> ListenerResult {
        Ok(())
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) -> ListenerResult;

    fn run_end(&mut self) -> ListenerResult {
        Ok(())
    }
}

/// Broadcasts to every listener. A listener that errors or panics is
/// logged and skipped; the others still see the event.
#[derive(Default)]
pub struct CompoundListener {
    listeners: Vec<Box<dyn MutationResultListener>>,
}

impl CompoundListener {
    pub fn new(listeners: Vec<Box<dyn MutationResultListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Box<dyn MutationResultListener>) {
        self.listeners.push(listener);
    }

    pub fn run_start(&mut self) {
        self.each("run_start", |l| l.run_start());
    }

    pub fn handle_mutation_result(&mut self, results: &ClassMutationResults) {
        self.each("handle_mutation_result", |l| l.handle_mutation_result(results));
    }

    pub fn run_end(&mut self) {
        self.each("run_end", |l| l.run_end());
    }

    fn each(
        &mut self,
        event: &str,
        mut call: impl FnMut(&mut dyn MutationResultListener) -> ListenerResult,
    ) {
        for listener in &mut self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(listener.as_mut())));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(listener = listener.name(), event, %err, "listener failed");
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(listener = listener.name(), event, %message, "listener panicked");
                }
            }
        }
    }
}

/// Feeds a shared [`StatisticsAggregator`].
pub struct StatisticsListener {
    aggregator: Arc<Mutex<StatisticsAggregator>>,
}

impl StatisticsListener {
    pub fn new(aggregator: Arc<Mutex<StatisticsAggregator>>) -> Self {
        Self { aggregator }
    }
}

impl MutationResultListener for StatisticsListener {
    fn name(&self) -> &str {
        "statistics"
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) -> ListenerResult {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register_results(results);
        Ok(())
    }
}

/// Prints one character per finished mutant, then a count.
pub struct ProgressListener {
    out: Box<dyn Write + Send>,
    seen: usize,
}

impl ProgressListener {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self { out, seen: 0 }
    }

    pub fn stderr() -> Self {
        Self::new(Box::new(std::io::stderr()))
    }
}

fn progress_mark(status: DetectionStatus) -> char {
    match status {
        DetectionStatus::Killed => '.',
        DetectionStatus::Survived => 'S',
        DetectionStatus::TimedOut => 'T',
        DetectionStatus::NoCoverage => '-',
        DetectionStatus::NonViable => 'N',
        DetectionStatus::MemoryError => 'M',
        _ => 'E',
    }
}

impl MutationResultListener for ProgressListener {
    fn name(&self) -> &str {
        "progress"
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) -> ListenerResult {
        let marks: String = results
            .results
            .iter()
            .map(|r| progress_mark(r.status()))
            .collect();
        self.seen += results.results.len();
        self.out.write_all(marks.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn run_end(&mut self) -> ListenerResult {
        writeln!(self.out)?;
        writeln!(self.out, "mutascope: analysed {} mutations", self.seen)?;
        Ok(())
    }
}

/// Records verdicts into a history store and writes it at run end.
pub struct HistoryListener<S: HistoryStore + ?Sized> {
    store: Arc<Mutex<S>>,
}

impl<S: HistoryStore + ?Sized> HistoryListener<S> {
    pub fn new(store: Arc<Mutex<S>>) -> Self {
        Self { store }
    }
}

impl<S: HistoryStore + ?Sized> MutationResultListener for HistoryListener<S> {
    fn name(&self) -> &str {
        "history"
    }

    fn handle_mutation_result(&mut self, results: &ClassMutationResults) -> ListenerResult {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        for result in &results.results {
            store.record_result(result);
        }
        Ok(())
    }

    fn run_end(&mut self) -> ListenerResult {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close()?;
        Ok(())
    }
}
