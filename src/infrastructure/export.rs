//! CSV export of captured samples.
//!
//! One accelerometer file and one gyroscope file per capture session, both
//! append-only.

use crate::domain::models::{Sample, SampleSink};
use anyhow::Context;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const ACCEL_HEADER: &str = "Time,Accel_X,Accel_Y,Accel_Z";
pub const GYRO_HEADER: &str = "Time,Gyro_X,Gyro_Y,Gyro_Z";

pub struct CsvExporter {
    accel_path: PathBuf,
    gyro_path: PathBuf,
    accel: BufWriter<File>,
    gyro: BufWriter<File>,
}

impl CsvExporter {
    /// Open the files for a capture session stamped with the current local time
    pub fn create(directory: &Path) -> anyhow::Result<Self> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        Self::open(directory, &stamp)
    }

    /// Open (or reopen) `<stamp>_acc.csv` and `<stamp>_gyro.csv`; existing
    /// content is kept and the header is only written to new files
    pub fn open(directory: &Path, stamp: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(directory)
            .with_context(|| format!("creating export directory {}", directory.display()))?;

        let accel_path = directory.join(format!("{}_acc.csv", stamp));
        let gyro_path = directory.join(format!("{}_gyro.csv", stamp));
        let accel = open_series(&accel_path, ACCEL_HEADER)?;
        let gyro = open_series(&gyro_path, GYRO_HEADER)?;

        info!(
            "Exporting samples to {} and {}",
            accel_path.display(),
            gyro_path.display()
        );
        Ok(Self {
            accel_path,
            gyro_path,
            accel,
            gyro,
        })
    }

    pub fn accel_path(&self) -> &Path {
        &self.accel_path
    }

    pub fn gyro_path(&self) -> &Path {
        &self.gyro_path
    }

    pub fn append_accel(&mut self, time: i64, x: f32, y: f32, z: f32) -> anyhow::Result<()> {
        writeln!(self.accel, "{},{},{},{}", time, x, y, z)?;
        self.accel.flush()?;
        Ok(())
    }

    pub fn append_gyro(&mut self, time: i64, x: f32, y: f32, z: f32) -> anyhow::Result<()> {
        writeln!(self.gyro, "{},{},{},{}", time, x, y, z)?;
        self.gyro.flush()?;
        Ok(())
    }
}

impl SampleSink for CsvExporter {
    fn on_sample(&mut self, sample: Sample) -> anyhow::Result<()> {
        self.append_accel(
            sample.elapsed_time_millis,
            sample.accel_x,
            sample.accel_y,
            sample.accel_z,
        )?;
        self.append_gyro(
            sample.elapsed_time_millis,
            sample.gyro_x,
            sample.gyro_y,
            sample.gyro_z,
        )
    }
}

fn open_series(path: &Path, header: &str) -> anyhow::Result<BufWriter<File>> {
    let is_new = !path.exists();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    if is_new {
        writeln!(writer, "{}", header)?;
        writer.flush()?;
    }
    Ok(writer)
}
