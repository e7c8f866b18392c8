//! Lays the density panels out in a grid and writes the figure.

use std::fs::{self, create_dir_all};
use std::path::{Path, PathBuf};

use plotters::coord::Shift;
use plotters::prelude::*;
use polars::prelude::*;
use tracing::{error, info, warn};

use crate::analysis::density_panel::{render_panel, DensityPanel};
use crate::analysis::statistics::{compute_stats, format_stat};
use crate::config::{FigureConfig, RenderStyle};
use crate::data_handling::validation_dataset::ValidationDataset;
use crate::helper_functions::{column_as_f64, resolve_path};
use crate::models::{plot_err, polars_err, Dataset, StatsRow};

/// Panels arranged row-major, `columns` per row.
pub struct Figure {
    pub panels: Vec<DensityPanel>,
    columns: usize,
    panel_size: (u32, u32),
}

/// Give every panel its title and the shared axis labels.
pub fn compose_figure(
    mut panels: Vec<DensityPanel>,
    titles: &[&str],
    sup_xlabel: &str,
    sup_ylabel: &str,
    style: &RenderStyle,
) -> PolarsResult<Figure> {
    if panels.len() != titles.len() {
        return Err(PolarsError::ShapeMismatch(
            format!("{} panels but {} titles", panels.len(), titles.len()).into(),
        ));
    }
    if style.columns == 0 {
        return Err(PolarsError::ComputeError("figure needs at least one column".into()));
    }

    for (panel, title) in panels.iter_mut().zip(titles) {
        panel.set_title(title);
        panel.set_sup_labels(sup_xlabel, sup_ylabel);
    }

    Ok(Figure {
        panels,
        columns: style.columns,
        panel_size: style.panel_size,
    })
}

impl Figure {
    pub fn rows(&self) -> usize {
        self.panels.len().div_ceil(self.columns)
    }

    pub fn columns(&self) -> usize {
        self.columns.min(self.panels.len()).max(1)
    }

    /// Pixel size of the whole figure.
    pub fn size(&self) -> (u32, u32) {
        (
            self.panel_size.0 * self.columns() as u32,
            self.panel_size.1 * self.rows() as u32,
        )
    }

    pub fn stats_rows(&self) -> Vec<StatsRow> {
        self.panels.iter().map(DensityPanel::stats_row).collect()
    }

    fn draw<DB: DrawingBackend>(&self, root: &DrawingArea<DB, Shift>) -> PolarsResult<()> {
        root.fill(&WHITE).map_err(plot_err)?;
        let cells = root.split_evenly((self.rows(), self.columns()));
        for (panel, cell) in self.panels.iter().zip(cells.iter()) {
            info!("Drawing panel {}", panel.name);
            panel.draw(cell)?;
        }
        Ok(())
    }

    pub fn render_svg(&self) -> PolarsResult<String> {
        let mut svg = String::new();
        {
            let root = SVGBackend::with_string(&mut svg, self.size()).into_drawing_area();
            self.draw(&root)?;
            root.present().map_err(plot_err)?;
        }
        Ok(svg)
    }

    /// Write the figure; the format follows the extension (`pdf`, `svg`, `png`).
    /// Missing parent directories are created.
    pub fn save(&self, path: &Path) -> PolarsResult<()> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !matches!(ext.as_str(), "pdf" | "svg" | "png") {
            error!("Unsupported figure format '{}' for {}", ext, path.display());
            return Err(PolarsError::ComputeError(
                format!("unsupported figure format '{ext}', use pdf, svg or png").into(),
            ));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                info!("Creating output directory {}", parent.display());
            }
            create_dir_all(parent).map_err(|e| polars_err(Box::new(e)))?;
        }

        match ext.as_str() {
            "pdf" => {
                let pdf = svg_to_pdf(&self.render_svg()?)?;
                fs::write(path, pdf).map_err(|e| polars_err(Box::new(e)))?;
            }
            "svg" => {
                let root = SVGBackend::new(path, self.size()).into_drawing_area();
                self.draw(&root)?;
                root.present().map_err(plot_err)?;
            }
            // png
            _ => {
                let root = BitMapBackend::new(path, self.size()).into_drawing_area();
                self.draw(&root)?;
                root.present().map_err(plot_err)?;
            }
        }

        info!("Figure saved to: {}", path.display());
        Ok(())
    }
}

fn svg_to_pdf(svg: &str) -> PolarsResult<Vec<u8>> {
    let mut options = svg2pdf::usvg::Options::default();
    options.fontdb_mut().load_system_fonts();
    if options.fontdb.faces().next().is_none() {
        warn!("No system fonts found, text will be missing from the PDF");
    }

    let tree = svg2pdf::usvg::Tree::from_str(svg, &options)
        .map_err(|e| PolarsError::ComputeError(format!("invalid SVG: {e}").into()))?;
    svg2pdf::to_pdf(
        &tree,
        svg2pdf::ConversionOptions::default(),
        svg2pdf::PageOptions::default(),
    )
    .map_err(|e| PolarsError::ComputeError(format!("PDF conversion failed: {e:?}").into()))
}

/// `<dir>/Figure1.pdf` → `<dir>/Figure1_stats.csv`
pub fn stats_table_path(figure_path: &Path) -> PathBuf {
    let stem = figure_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("figure");
    figure_path.with_file_name(format!("{stem}_stats.csv"))
}

/// Save the per-panel statistics to a CSV file
pub fn save_stats_table(rows: &[StatsRow], path: &Path) -> PolarsResult<()> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| polars_err(Box::new(e)))?;
    for row in rows {
        writer.serialize(row).map_err(|e| polars_err(Box::new(e)))?;
    }
    writer.flush().map_err(|e| polars_err(Box::new(e)))?;

    info!("Statistics saved to: {}", path.display());
    Ok(())
}

/// Load every configured table, compute its statistics, render its panel and
/// write the composed figure plus the statistics table. Relative paths are
/// taken from `root`. Returns the figure path.
pub fn build_figure(config: &FigureConfig, root: &Path) -> PolarsResult<PathBuf> {
    config.validate()?;
    let input_dir = resolve_path(root, &config.input_dir);

    let mut panels = Vec::with_capacity(config.panels.len());
    for entry in &config.panels {
        info!("Processing {}", entry.key);
        let df = ValidationDataset::new(resolve_path(&input_dir, &entry.input)).load()?;

        let observed = column_as_f64(&df, &entry.observed_column)?;
        let predicted = column_as_f64(&df, &entry.predicted_column)?;
        let stats = compute_stats(&observed, &predicted)?;
        info!(
            "{}: Cor {}, NMB {}, NRMSE {} (n = {}, complete pairs = {})",
            entry.key,
            format_stat(stats.correlation),
            format_stat(stats.nmb),
            format_stat(stats.nrmse),
            stats.n,
            stats.valid_pairs
        );
        if stats.valid_pairs < stats.n {
            warn!(
                "{}: {} rows with missing values left out of the statistics",
                entry.key,
                stats.n - stats.valid_pairs
            );
        }

        panels.push(render_panel(&entry.key, predicted, observed, stats, &config.style)?);
    }

    let titles: Vec<&str> = config.panels.iter().map(|p| p.title.as_str()).collect();
    let figure = compose_figure(
        panels,
        &titles,
        &config.sup_xlabel,
        &config.sup_ylabel,
        &config.style,
    )?;

    let output = resolve_path(root, &config.output);
    figure.save(&output)?;
    save_stats_table(&figure.stats_rows(), &stats_table_path(&output))?;

    Ok(output)
}
