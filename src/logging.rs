use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Parse a level name (`"debug"`, `"WARN"`, ...). Python's `"warning"` and
/// `"critical"` are accepted too.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(LevelFilter::Warn),
        "critical" | "fatal" => Some(LevelFilter::Error),
        other => other.parse().ok(),
    }
}

fn env_level() -> LevelFilter {
    std::env::var("BIOX_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize logging for Rust binaries (stderr formatter) based on `BIOX_LOG`/`RUST_LOG`.
pub fn init_rust_logging() {
    init_rust_logging_with(None);
}

/// Same as [`init_rust_logging`], with an explicit level taking precedence over the env.
pub fn init_rust_logging_with(level: Option<LevelFilter>) {
    let level = level.unwrap_or_else(env_level);
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use bridge::{init_python_logging, set_python_log_level};

/// Forwards `log` records into Python's `logging`, one Python logger per target.
#[cfg(feature = "python")]
mod bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct PyLogger {
        top_filter: Mutex<LevelFilter>,
        logging_mod: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn py_level(level: log::Level) -> usize {
        match level {
            log::Level::Error => 40,
            log::Level::Warn => 30,
            log::Level::Info => 20,
            log::Level::Debug => 10,
            log::Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn logger_for(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self.loggers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging_mod
                .bind(py)
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            let top = *self.top_filter.lock().unwrap_or_else(|e| e.into_inner());
            metadata.level().to_level_filter() <= top
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            Python::attach(|py| {
                let result = self.logger_for(py, &target).and_then(|logger| {
                    logger
                        .bind(py)
                        .call_method1("log", (py_level(record.level()), message))
                        .map(|_| ())
                });
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Install the bridge. Safe to call more than once; only the first call installs.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = super::env_level();
        PY_LOGGER.get_or_try_init(|| -> PyResult<&'static PyLogger> {
            let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                top_filter: Mutex::new(level),
                logging_mod: py.import("logging")?.unbind(),
                loggers: Mutex::new(HashMap::new()),
            }));
            if log::set_logger(logger).is_ok() {
                log::set_max_level(level);
            }
            Ok(logger)
        })?;
        Ok(())
    }

    /// Change the minimum level forwarded to Python.
    pub fn set_python_log_level(py: Python<'_>, level: LevelFilter) -> PyResult<()> {
        init_python_logging(py)?;
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut top) = logger.top_filter.lock() {
                *top = level;
            }
        }
        log::set_max_level(level);
        Ok(())
    }
}
