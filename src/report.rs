//! Build progress reporting.
//!
//! The engine emits build events through a [`Reporter`] so that front-ends
//! can display progress without the core depending on any particular
//! output. Reporters are dispatched like `tracing` subscribers: a
//! process-wide default that can be set once, shadowed by a thread-local
//! scoped reporter for the duration of a closure. With no reporter
//! installed a [`NullReporter`] swallows every event.

use crate::{source::SourceObject, state::DependencyRow};
use once_cell::sync::OnceCell;
use std::{
    cell::RefCell,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use yansi::Paint;

/// Observer of build events.
///
/// All methods default to no-ops so implementations only pick the events
/// they care about.
pub trait Reporter: fmt::Debug {
    fn on_build_started(&self) {}
    fn on_build_finished(&self, _duration: Duration) {}
    /// An artifact is considered for building; `is_current` tells whether
    /// it will be skipped.
    fn on_artifact_build_started(&self, _artifact_name: &str, _is_current: bool) {}
    fn on_artifact_build_finished(&self, _artifact_name: &str, _duration: Duration) {}
    /// The dirty flag of some sources changed.
    fn on_dirty_flag(&self, _value: bool) {}
    /// A sub-artifact was requested.
    fn on_sub_artifact(&self, _artifact_name: &str) {}
    /// Dependency rows were memorized for an artifact.
    fn on_dependencies_recorded(&self, _artifact_name: &str, _rows: &[DependencyRow]) {}
    /// An orphaned artifact was removed by the prune pass.
    fn on_pruned_artifact(&self, _artifact_name: &str) {}
    fn on_source_entered(&self, _source: &SourceObject) {}
    fn on_source_left(&self, _source: &SourceObject, _duration: Duration) {}
    /// Free-form debug information.
    fn on_debug(&self, _key: &str, _value: &str) {}
}

/// A shareable handle to a [`Reporter`].
#[derive(Clone, Debug)]
pub struct Report(Arc<dyn Reporter + Send + Sync>);

impl Report {
    pub fn new(reporter: impl Reporter + Send + Sync + 'static) -> Self {
        Self(Arc::new(reporter))
    }

    fn reporter(&self) -> &(dyn Reporter + Send + Sync) {
        &*self.0
    }
}

/// A reporter that ignores every event.
#[derive(Debug, Default)]
pub struct NullReporter {
    _priv: (),
}

impl Reporter for NullReporter {}

static GLOBAL_REPORTER: OnceCell<Report> = OnceCell::new();

thread_local! {
    static SCOPED_REPORTER: RefCell<Vec<Report>> = const { RefCell::new(Vec::new()) };
}

/// Sets the process-wide default reporter. Returns `false` if a default
/// was already installed.
pub fn set_global_reporter(report: Report) -> bool {
    GLOBAL_REPORTER.set(report).is_ok()
}

/// Runs `f` with `report` installed as this thread's reporter, shadowing
/// the global default.
pub fn with_scoped<T>(report: &Report, f: impl FnOnce() -> T) -> T {
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            SCOPED_REPORTER.with(|stack| {
                stack.borrow_mut().pop();
            });
        }
    }

    SCOPED_REPORTER.with(|stack| stack.borrow_mut().push(report.clone()));
    let _guard = Guard;
    f()
}

fn get_default<T>(f: impl FnOnce(&Report) -> T) -> T {
    let scoped = SCOPED_REPORTER.with(|stack| stack.borrow().last().cloned());
    match scoped {
        Some(report) => f(&report),
        None => f(GLOBAL_REPORTER.get_or_init(|| Report::new(NullReporter::default()))),
    }
}

pub fn build_started() {
    get_default(|r| r.reporter().on_build_started());
}

pub fn build_finished(duration: Duration) {
    get_default(|r| r.reporter().on_build_finished(duration));
}

pub fn artifact_build_started(artifact_name: &str, is_current: bool) {
    get_default(|r| r.reporter().on_artifact_build_started(artifact_name, is_current));
}

pub fn artifact_build_finished(artifact_name: &str, duration: Duration) {
    get_default(|r| r.reporter().on_artifact_build_finished(artifact_name, duration));
}

pub fn dirty_flag(value: bool) {
    get_default(|r| r.reporter().on_dirty_flag(value));
}

pub fn sub_artifact(artifact_name: &str) {
    get_default(|r| r.reporter().on_sub_artifact(artifact_name));
}

pub fn dependencies_recorded(artifact_name: &str, rows: &[DependencyRow]) {
    get_default(|r| r.reporter().on_dependencies_recorded(artifact_name, rows));
}

pub fn pruned_artifact(artifact_name: &str) {
    get_default(|r| r.reporter().on_pruned_artifact(artifact_name));
}

pub fn source_entered(source: &SourceObject) {
    get_default(|r| r.reporter().on_source_entered(source));
}

pub fn source_left(source: &SourceObject, duration: Duration) {
    get_default(|r| r.reporter().on_source_left(source, duration));
}

pub fn debug(key: &str, value: &str) {
    get_default(|r| r.reporter().on_debug(key, value));
}

/// A reporter that prints build progress to stdout.
///
/// Verbosity levels: `0` prints the build frame and updated artifacts,
/// `2` adds current (skipped) artifacts, `3` adds artifact internals and
/// sources, `4` adds recorded dependencies and debug output.
#[derive(Debug)]
pub struct ConsoleReporter {
    verbosity: u8,
    indentation: AtomicUsize,
}

impl ConsoleReporter {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity, indentation: AtomicUsize::new(0) }
    }

    fn indent(&self) {
        self.indentation.fetch_add(1, Ordering::Relaxed);
    }

    fn outdent(&self) {
        let _ = self.indentation.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    fn write_line(&self, text: impl fmt::Display) {
        let level = self.indentation.load(Ordering::Relaxed);
        println!("{:indent$}{text}", "", indent = level * 2);
    }

    fn write_kv(&self, key: &str, value: impl fmt::Display) {
        self.write_line(format!("{key}: {}", Paint::yellow(value)));
    }
}

impl Reporter for ConsoleReporter {
    fn on_build_started(&self) {
        self.write_line(Paint::blue("Build started"));
    }

    fn on_build_finished(&self, duration: Duration) {
        self.write_line(Paint::blue(format!(
            "Build finished in {:.2} sec",
            duration.as_secs_f64()
        )));
    }

    fn on_artifact_build_started(&self, artifact_name: &str, is_current: bool) {
        if is_current && self.verbosity < 2 {
            return;
        }
        let sign =
            if is_current { Paint::cyan("X").to_string() } else { Paint::green("U").to_string() };
        self.write_line(format!("{sign} {artifact_name}"));
        self.indent();
    }

    fn on_artifact_build_finished(&self, _artifact_name: &str, _duration: Duration) {
        self.outdent();
    }

    fn on_dirty_flag(&self, value: bool) {
        if self.verbosity >= 3 && (value || self.verbosity >= 4) {
            self.write_kv("forcing sources dirty", value);
        }
    }

    fn on_sub_artifact(&self, artifact_name: &str) {
        if self.verbosity >= 3 {
            self.write_kv("sub artifact", artifact_name);
        }
    }

    fn on_dependencies_recorded(&self, _artifact_name: &str, rows: &[DependencyRow]) {
        if self.verbosity >= 4 {
            for row in rows {
                self.write_kv("dependency", &row.source);
            }
        }
    }

    fn on_pruned_artifact(&self, artifact_name: &str) {
        self.write_line(format!("{} {artifact_name}", Paint::red("D")));
    }

    fn on_source_entered(&self, source: &SourceObject) {
        if self.verbosity >= 3 {
            self.write_line(format!("Source {}", Paint::magenta(source.path())));
            self.indent();
        }
    }

    fn on_source_left(&self, _source: &SourceObject, _duration: Duration) {
        if self.verbosity >= 3 {
            self.outdent();
        }
    }

    fn on_debug(&self, key: &str, value: &str) {
        if self.verbosity >= 4 {
            self.write_kv(key, value);
        }
    }
}
