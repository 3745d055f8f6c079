//! Hand-off points for acquisition output.
//!
//! Persistence lives outside this crate; anything that can take a [`Sample`] and a
//! [`CalibrationResult`] can sit behind the scheduler.

use std::io::{self, Write};

use serde::Serialize;

use crate::acquisition::Sample;
use crate::calibration::CalibrationResult;

pub trait SampleSink {
    fn accept_sample(&mut self, sample: Sample) -> io::Result<()>;
    fn accept_calibration(&mut self, device: &str, result: CalibrationResult) -> io::Result<()>;
}

/// Keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub samples: Vec<Sample>,
    pub calibrations: Vec<(String, CalibrationResult)>,
}

impl SampleSink for MemorySink {
    fn accept_sample(&mut self, sample: Sample) -> io::Result<()> {
        self.samples.push(sample);
        Ok(())
    }

    fn accept_calibration(&mut self, device: &str, result: CalibrationResult) -> io::Result<()> {
        self.calibrations.push((device.to_string(), result));
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Sample(&'a Sample),
    Calibration {
        device: &'a str,
        #[serde(flatten)]
        result: &'a CalibrationResult,
    },
}

/// Writes one JSON object per line, e.g. to stdout for a downstream loader.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record(&mut self, record: &Record<'_>) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write> SampleSink for JsonLinesSink<W> {
    fn accept_sample(&mut self, sample: Sample) -> io::Result<()> {
        self.write_record(&Record::Sample(&sample))
    }

    fn accept_calibration(&mut self, device: &str, result: CalibrationResult) -> io::Result<()> {
        self.write_record(&Record::Calibration {
            device,
            result: &result,
        })
    }
}
