use polars::prelude::*;
use serde::Serialize;

/// Anything the pipeline can turn into a validation table.
pub trait Dataset {
    fn load(&self) -> PolarsResult<DataFrame>;
}

/// Fold a foreign error into the polars error the pipeline propagates.
pub fn polars_err(e: Box<dyn std::error::Error + Send + Sync>) -> PolarsError {
    PolarsError::ComputeError(e.to_string().into())
}

/// Same as [`polars_err`] for errors that only implement `Display`
/// (plotters drawing errors are generic over the backend).
pub fn plot_err<E: std::fmt::Display>(e: E) -> PolarsError {
    PolarsError::ComputeError(format!("drawing failed: {e}").into())
}

/// Correlation, NMB (%) and NRMSE (%) of one predicted/observed pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsTriple {
    pub correlation: f64,
    pub nmb: f64,
    pub nrmse: f64,
    /// Rows in the table
    pub n: usize,
    /// Rows where both values are present (the correlation sample)
    pub valid_pairs: usize,
}

/// One line of the statistics table written next to the figure.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub variable: String,
    pub n: usize,
    pub valid_pairs: usize,
    pub max_lim: f64,
    pub correlation: f64,
    pub nmb: f64,
    pub nrmse: f64,
}
