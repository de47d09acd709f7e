use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::warn;

use crate::model::PriceObservation;

const HEADER: [&str; 6] = ["商品名", "版本", "磨损度", "售价", "租价(天)", "租售比(%)"];
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Destination for a flushed batch. Returns where the batch ended up.
pub trait ReportSink {
    fn write_batch(&mut self, records: &[PriceObservation]) -> Result<PathBuf>;
}

/// One dated CSV per batch under `output_dir`.
pub struct CsvReport {
    output_dir: PathBuf,
}

impl CsvReport {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        CsvReport {
            output_dir: output_dir.into(),
        }
    }
}

impl ReportSink for CsvReport {
    fn write_batch(&mut self, records: &[PriceObservation]) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create output dir {:?}", self.output_dir))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let (file, path) = create_unique(&self.output_dir, &stamp)?;
        write_or_discard(&path, BufWriter::new(file), records)?;
        Ok(path)
    }
}

/// Opens `result_<stamp>.csv`, or `result_<stamp>_N.csv` for the first free N.
/// Never truncates an existing file.
fn create_unique(dir: &Path, stamp: &str) -> Result<(File, PathBuf)> {
    let mut n = 0u32;
    loop {
        let path = if n == 0 {
            dir.join(format!("result_{}.csv", stamp))
        } else {
            dir.join(format!("result_{}_{}.csv", stamp, n))
        };
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e).with_context(|| format!("Failed to create {:?}", path)),
        }
    }
}

/// A batch that fails halfway is removed so a retry does not leave a truncated twin.
fn write_or_discard<W: Write>(path: &Path, out: W, records: &[PriceObservation]) -> Result<()> {
    if let Err(e) = write_csv(out, records) {
        if let Err(rm) = fs::remove_file(path) {
            warn!("Failed to remove partial report {:?}: {}", path, rm);
        }
        return Err(e).with_context(|| format!("Failed to write {:?}", path));
    }
    Ok(())
}

fn write_csv<W: Write>(mut out: W, records: &[PriceObservation]) -> Result<()> {
    out.write_all(UTF8_BOM)?;
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(HEADER)?;
    for r in records {
        wtr.write_record(to_row(r))?;
    }
    wtr.flush()?;
    Ok(())
}

fn to_row(r: &PriceObservation) -> [String; 6] {
    [
        r.item_name.clone(),
        r.variant.label().to_string(),
        r.wear.label().to_string(),
        fmt_price(r.sell),
        fmt_price(r.rent),
        r.rent_ratio().map(|x| format!("{:.4}", x)).unwrap_or_default(),
    ]
}

fn fmt_price(p: Option<f64>) -> String {
    p.map(|p| p.to_string()).unwrap_or_default()
}
