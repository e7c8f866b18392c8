use std::fs::File;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{error, info};

use crate::data_handling::rdata::{first_data_frame, read_rdata};
use crate::helper_functions::read_csv;
use crate::models::{polars_err, Dataset};

/// Serialized table formats a validation dataset can come in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// R `save()` containers and `saveRDS()` streams
    RData,
    Csv,
    Parquet,
    Ipc,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "rdata" | "rda" | "rds" => Some(TableFormat::RData),
            "csv" => Some(TableFormat::Csv),
            "parquet" => Some(TableFormat::Parquet),
            "ipc" | "arrow" | "feather" => Some(TableFormat::Ipc),
            _ => None,
        }
    }
}

/// A predicted/observed table for one pollutant.
pub struct ValidationDataset {
    pub path: PathBuf,
}

impl ValidationDataset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load_rdata(&self) -> PolarsResult<DataFrame> {
        let objects = read_rdata(&self.path).map_err(|e| polars_err(Box::new(e)))?;
        let (name, df) = first_data_frame(&objects).map_err(|e| polars_err(Box::new(e)))?;
        match name {
            Some(name) => info!("Using data frame '{}' from {}", name, self.path.display()),
            None => info!("Using the data frame stored in {}", self.path.display()),
        }
        Ok(df)
    }
}

impl Dataset for ValidationDataset {
    fn load(&self) -> PolarsResult<DataFrame> {
        info!("Reading data from {}", self.path.display());

        if !self.path.exists() {
            error!("Input file {} does not exist", self.path.display());
            return Err(PolarsError::ComputeError(
                format!("input file {} does not exist", self.path.display()).into(),
            ));
        }

        let format = TableFormat::from_path(&self.path).ok_or_else(|| {
            error!("Unrecognised table format for {}", self.path.display());
            PolarsError::ComputeError(
                format!("unrecognised table format: {}", self.path.display()).into(),
            )
        })?;

        let df = match format {
            TableFormat::RData => self.load_rdata(),
            TableFormat::Csv => read_csv(&self.path),
            TableFormat::Parquet => {
                let file = File::open(&self.path).map_err(|e| polars_err(Box::new(e)))?;
                ParquetReader::new(file).finish()
            }
            TableFormat::Ipc => {
                let file = File::open(&self.path).map_err(|e| polars_err(Box::new(e)))?;
                IpcReader::new(file).finish()
            }
        }
        .map_err(|e| {
            error!("Failed to read {}: {}", self.path.display(), e);
            e
        })?;

        info!("Loaded {} rows x {} columns", df.height(), df.width());
        Ok(df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_handling::rdata::tests::{gzip, XdrWriter};

    #[test]
    fn format_follows_extension() {
        assert_eq!(TableFormat::from_path(Path::new("no2_validation.Rdata")), Some(TableFormat::RData));
        assert_eq!(TableFormat::from_path(Path::new("x.RDS")), Some(TableFormat::RData));
        assert_eq!(TableFormat::from_path(Path::new("x.csv")), Some(TableFormat::Csv));
        assert_eq!(TableFormat::from_path(Path::new("x.feather")), Some(TableFormat::Ipc));
        assert_eq!(TableFormat::from_path(Path::new("x.xlsx")), None);
        assert_eq!(TableFormat::from_path(Path::new("noext")), None);
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = ValidationDataset::new(dir.path().join("pm25validation.Rdata"));
        assert!(dataset.load().is_err());
    }

    #[test]
    fn loads_rdata_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("o3_8h_validation.Rdata");
        let obs = [Some(50.0), Some(60.0), Some(70.0)];
        let pred = [Some(55.0), None, Some(65.0)];
        std::fs::write(&path, gzip(&XdrWriter::rdata_container("o3", "o3_8h", &obs, &pred))).unwrap();

        let df = ValidationDataset::new(&path).load().unwrap();
        assert_eq!(df.height(), 3);
        assert_eq!(df.column("spatpred").unwrap().null_count(), 1);
    }

    #[test]
    fn loads_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm10.csv");
        std::fs::write(&path, "pm10,spatpred\n10.5,11\n,12\n30,29.5\n").unwrap();

        let df = ValidationDataset::new(&path).load().unwrap();
        assert_eq!(df.shape(), (3, 2));
        assert_eq!(df.column("pm10").unwrap().null_count(), 1);
    }

    #[test]
    fn unknown_extension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.xlsx");
        std::fs::write(&path, b"not a table").unwrap();
        assert!(ValidationDataset::new(&path).load().is_err());
    }
}
