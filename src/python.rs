//! Python bindings used by the web front end.
//!
//! All calls block the caller but release the GIL while talking to hardware.

use std::collections::BTreeMap;
use std::sync::Arc;

use pyo3::create_exception;
use pyo3::exceptions::{PyLookupError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::acquisition::{AcquisitionScheduler, Sample};
use crate::calibration::{calibrate_device, CalibrationResult, Calibrator};
use crate::config::{AcquisitionSettings, Registry};
use crate::discovery::{discover, enumerate_candidate_ports};
use crate::errors::{
    AcquisitionError, ConfigError, DiscoveryError, DriverError, ErrorClass,
};
use crate::session::SerialOpener;

create_exception!(
    biox_daq,
    DeviceNotFoundError,
    PyLookupError,
    "An armband is not connected or does not answer."
);
create_exception!(
    biox_daq,
    DeviceFailureError,
    PyRuntimeError,
    "An armband failed in the middle of an operation."
);

enum BindingError {
    Config(ConfigError),
    Discovery(DiscoveryError),
    Driver(DriverError),
    Acquisition(AcquisitionError),
}

impl From<ConfigError> for BindingError {
    fn from(e: ConfigError) -> Self {
        BindingError::Config(e)
    }
}

impl From<DiscoveryError> for BindingError {
    fn from(e: DiscoveryError) -> Self {
        BindingError::Discovery(e)
    }
}

impl From<DriverError> for BindingError {
    fn from(e: DriverError) -> Self {
        BindingError::Driver(e)
    }
}

impl From<AcquisitionError> for BindingError {
    fn from(e: AcquisitionError) -> Self {
        BindingError::Acquisition(e)
    }
}

fn classified(class: ErrorClass, message: String) -> PyErr {
    match class {
        ErrorClass::NotFound => DeviceNotFoundError::new_err(message),
        ErrorClass::Failed => DeviceFailureError::new_err(message),
    }
}

impl From<BindingError> for PyErr {
    fn from(e: BindingError) -> Self {
        match e {
            BindingError::Config(e) => PyValueError::new_err(e.to_string()),
            BindingError::Discovery(e) => classified(e.class(), e.to_string()),
            BindingError::Driver(e) => classified(e.class(), e.to_string()),
            BindingError::Acquisition(e) => classified(e.class(), e.to_string()),
        }
    }
}

// Frames are handed out as lists of ints rather than `bytes`.
fn channels(frame: &crate::protocol::Frame) -> Vec<u16> {
    frame.as_slice().iter().map(|&v| u16::from(v)).collect()
}

#[pyclass(name = "Calibration", frozen)]
pub struct PyCalibration {
    #[pyo3(get)]
    device: String,
    #[pyo3(get)]
    iterations: u32,
    #[pyo3(get)]
    raw_frame: Vec<u16>,
}

impl PyCalibration {
    fn new(device: &str, result: &CalibrationResult) -> Self {
        Self {
            device: device.to_string(),
            iterations: result.iterations,
            raw_frame: channels(&result.raw_frame),
        }
    }
}

#[pymethods]
impl PyCalibration {
    fn __repr__(&self) -> String {
        format!(
            "Calibration(device={:?}, iterations={}, raw_frame={:?})",
            self.device, self.iterations, self.raw_frame
        )
    }
}

#[pyclass(name = "Sample", frozen)]
pub struct PySample {
    /// Microseconds since the acquisition started.
    #[pyo3(get)]
    timestamp_us: u64,
    /// Microseconds since the Unix epoch.
    #[pyo3(get)]
    unix_time_us: u64,
    /// Device name -> channel values.
    #[pyo3(get)]
    readings: BTreeMap<String, Vec<u16>>,
}

impl From<Sample> for PySample {
    fn from(sample: Sample) -> Self {
        Self {
            timestamp_us: sample.timestamp_us,
            unix_time_us: sample.unix_time_us,
            readings: sample
                .readings
                .iter()
                .map(|(name, frame)| (name.clone(), channels(frame)))
                .collect(),
        }
    }
}

#[pymethods]
impl PySample {
    fn __repr__(&self) -> String {
        format!(
            "Sample(timestamp_us={}, devices={})",
            self.timestamp_us,
            self.readings.len()
        )
    }
}

/// List serial ports as `(port_name, usb_serial_number)` pairs.
#[pyfunction]
fn list_ports(py: Python<'_>) -> PyResult<Vec<(String, Option<String>)>> {
    let ports = py
        .detach(enumerate_candidate_ports)
        .map_err(BindingError::from)?;
    Ok(ports
        .into_iter()
        .map(|p| (p.port_name, p.serial_number))
        .collect())
}

/// Calibrate one configured armband.
///
/// Raises:
///     DeviceNotFoundError: the device is unknown, unplugged or silent
///     DeviceFailureError: the device failed while calibrating
#[pyfunction]
fn calibrate(py: Python<'_>, registry_path: &str, device: &str) -> PyResult<PyCalibration> {
    let result = py.detach(|| -> Result<CalibrationResult, BindingError> {
        let registry = Registry::load(registry_path)?;
        let opener = SerialOpener;
        let (config, port) = discover(&opener, &registry)?.select(device)?;
        let calibrator = Calibrator::from(registry.calibration);
        Ok(calibrate_device(
            &opener,
            &config,
            &port,
            &registry.serial,
            &calibrator,
        )?)
    })?;
    Ok(PyCalibration::new(device, &result))
}

/// Acquire from every configured armband and return the samples in order.
///
/// Raises:
///     DeviceNotFoundError: a configured device is missing
///     DeviceFailureError: a device failed during the session
#[pyfunction]
#[pyo3(signature = (registry_path, duration_ms=None))]
fn acquire(
    py: Python<'_>,
    registry_path: &str,
    duration_ms: Option<u64>,
) -> PyResult<Vec<PySample>> {
    let samples = py.detach(|| -> Result<Vec<Sample>, BindingError> {
        let registry = Registry::load(registry_path)?;
        let devices = discover(&SerialOpener, &registry)?.require_all()?;
        let settings = AcquisitionSettings {
            duration_ms: duration_ms.unwrap_or(registry.acquisition.duration_ms),
            ..registry.acquisition
        };
        let scheduler = AcquisitionScheduler::new(Arc::new(SerialOpener), registry.serial, settings);
        Ok(scheduler.collect(&devices)?)
    })?;
    Ok(samples.into_iter().map(PySample::from).collect())
}

/// Set the minimum level forwarded to Python's `logging` ("debug", "info", "warning", ...).
///
/// Raises:
///     ValueError: unknown level name
#[pyfunction]
fn set_log_level(py: Python<'_>, level: &str) -> PyResult<()> {
    let filter = crate::logging::parse_level(level)
        .ok_or_else(|| PyValueError::new_err(format!("unknown log level {level:?}")))?;
    crate::logging::set_python_log_level(py, filter)
}

#[pymodule]
fn biox_daq(m: &Bound<'_, PyModule>) -> PyResult<()> {
    crate::logging::init_python_logging(m.py())?;

    m.add_class::<PyCalibration>()?;
    m.add_class::<PySample>()?;
    m.add_function(wrap_pyfunction!(list_ports, m)?)?;
    m.add_function(wrap_pyfunction!(calibrate, m)?)?;
    m.add_function(wrap_pyfunction!(acquire, m)?)?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;
    m.add("DeviceNotFoundError", m.py().get_type::<DeviceNotFoundError>())?;
    m.add("DeviceFailureError", m.py().get_type::<DeviceFailureError>())?;
    Ok(())
}
