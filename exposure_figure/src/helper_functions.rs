use std::env;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use tracing::{debug, error};

pub fn project_root() -> PathBuf {
    match env::var_os("PROJECT_ROOT") {
        Some(val) => PathBuf::from(val),
        None => {
            // Fall back to current directory if PROJECT_ROOT not set
            env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        }
    }
}

/// Relative paths are taken from `base`, absolute ones are kept.
pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn read_csv(file_path: &Path) -> PolarsResult<DataFrame> {
    CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(file_path.to_path_buf()))?
        .finish()
}

/// Pull a numeric column out as `f64`, with nulls (and unparsable values)
/// turned into `NaN`.
pub fn column_as_f64(df: &DataFrame, name: &str) -> PolarsResult<Vec<f64>> {
    let column = df.column(name).map_err(|e| {
        error!("Column '{}' not found (available: {:?})", name, df.get_column_names());
        e
    })?;

    let casted = column.cast(&DataType::Float64)?;
    let values: Vec<f64> = casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();

    debug!(
        "Column '{}': {} values, {} missing",
        name,
        values.len(),
        values.iter().filter(|v| v.is_nan()).count()
    );
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_become_nan() {
        let df = polars::df!(
            "no2" => [Some(1.0), None, Some(3.0)],
            "spatpred" => [Some(2), Some(4), None]
        )
        .unwrap();

        let obs = column_as_f64(&df, "no2").unwrap();
        assert_eq!(obs[0], 1.0);
        assert!(obs[1].is_nan());
        assert_eq!(obs[2], 3.0);

        let pred = column_as_f64(&df, "spatpred").unwrap();
        assert_eq!(pred[..2], [2.0, 4.0]);
        assert!(pred[2].is_nan());
    }

    #[test]
    fn missing_column_is_an_error() {
        let df = polars::df!("no2" => [1.0, 2.0]).unwrap();
        assert!(column_as_f64(&df, "spatpred").is_err());
    }

    #[test]
    fn absolute_paths_are_kept() {
        let base = Path::new("/data");
        assert_eq!(resolve_path(base, Path::new("x.csv")), PathBuf::from("/data/x.csv"));
        assert_eq!(resolve_path(base, Path::new("/tmp/x.csv")), PathBuf::from("/tmp/x.csv"));
    }
}
