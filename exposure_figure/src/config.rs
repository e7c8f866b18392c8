//! Figure description: which tables feed which panel, and how panels look.
//!
//! Defaults reproduce Figure 1 of the exposure paper. A JSON file with any
//! subset of the fields can be supplied through `FIGURE_CONFIG`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::models::polars_err;

/// One panel: a pollutant, the file it comes from and its column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSpec {
    pub key: String,
    pub input: PathBuf,
    pub observed_column: String,
    pub predicted_column: String,
    pub title: String,
}

impl PanelSpec {
    /// Validation tables name the observed column after the pollutant and
    /// store the model output in `spatpred`.
    pub fn pollutant(key: &str, file_name: &str, title: &str) -> Self {
        Self {
            key: key.to_string(),
            input: PathBuf::from(file_name),
            observed_column: key.to_string(),
            predicted_column: "spatpred".to_string(),
            title: title.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    Jet,
    Viridis,
    Mako,
}

// (position, r, g, b) anchors, linearly interpolated
type Anchors = &'static [(f64, u8, u8, u8)];

const VIRIDIS: Anchors = &[
    (0.000, 68, 1, 84),
    (0.125, 71, 44, 122),
    (0.250, 59, 81, 139),
    (0.375, 44, 113, 142),
    (0.500, 33, 144, 141),
    (0.625, 39, 173, 129),
    (0.750, 92, 200, 99),
    (0.875, 170, 220, 50),
    (1.000, 253, 231, 37),
];

const MAKO: Anchors = &[
    (0.000, 11, 4, 5),
    (0.125, 46, 30, 60),
    (0.250, 62, 53, 107),
    (0.375, 53, 87, 145),
    (0.500, 52, 122, 158),
    (0.625, 54, 157, 170),
    (0.750, 73, 193, 173),
    (0.875, 159, 223, 184),
    (1.000, 222, 245, 229),
];

// jet is defined per channel, with breakpoints that differ between channels
const JET_RED: &[(f64, f64)] = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: &[(f64, f64)] = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_BLUE: &[(f64, f64)] = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

fn interpolate_channel(segments: &[(f64, f64)], t: f64) -> f64 {
    for pair in segments.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if t <= x1 {
            return y0 + (y1 - y0) * (t - x0) / (x1 - x0);
        }
    }
    segments.last().map(|&(_, y)| y).unwrap_or(0.0)
}

fn interpolate_anchors(anchors: Anchors, t: f64) -> (u8, u8, u8) {
    for pair in anchors.windows(2) {
        let (x0, r0, g0, b0) = pair[0];
        let (x1, r1, g1, b1) = pair[1];
        if t <= x1 {
            let f = (t - x0) / (x1 - x0);
            let lerp = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * f).round() as u8;
            return (lerp(r0, r1), lerp(g0, g1), lerp(b0, b1));
        }
    }
    anchors.last().map(|&(_, r, g, b)| (r, g, b)).unwrap_or((0, 0, 0))
}

impl Colormap {
    /// RGB for a normalised value; input is clamped to `[0, 1]`.
    pub fn rgb(self, t: f64) -> (u8, u8, u8) {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        match self {
            Colormap::Jet => {
                let to_u8 = |v: f64| (v * 255.0).round() as u8;
                (
                    to_u8(interpolate_channel(JET_RED, t)),
                    to_u8(interpolate_channel(JET_GREEN, t)),
                    to_u8(interpolate_channel(JET_BLUE, t)),
                )
            }
            Colormap::Viridis => interpolate_anchors(VIRIDIS, t),
            Colormap::Mako => interpolate_anchors(MAKO, t),
        }
    }
}

/// Everything that controls the look of a panel and of the composed figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderStyle {
    /// Bins per axis of the joint 2D histogram
    pub bins: usize,
    /// Bins of each marginal histogram
    pub marginal_bins: usize,
    /// Joint bins with fewer observations than this are left empty
    pub min_count: u32,
    pub colormap: Colormap,
    /// Pixel size of one panel cell
    pub panel_size: (u32, u32),
    /// Panels per row
    pub columns: usize,
    pub font_family: String,
    pub title_font_size: u32,
    pub label_font_size: u32,
    pub annotation_font_size: u32,
    pub tick_font_size: u32,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            bins: 75,
            marginal_bins: 100,
            min_count: 75,
            colormap: Colormap::Jet,
            panel_size: (500, 500),
            columns: 2,
            font_family: "sans-serif".to_string(),
            title_font_size: 18,
            label_font_size: 16,
            annotation_font_size: 14,
            tick_font_size: 11,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FigureConfig {
    pub input_dir: PathBuf,
    pub output: PathBuf,
    pub sup_xlabel: String,
    pub sup_ylabel: String,
    pub panels: Vec<PanelSpec>,
    pub style: RenderStyle,
}

impl Default for FigureConfig {
    fn default() -> Self {
        // File names follow the delivered validation tables as-is
        Self {
            input_dir: PathBuf::from("inputdata"),
            output: PathBuf::from("docs/scriptforplot/figure/Figure1.pdf"),
            sup_xlabel: "Pred".to_string(),
            sup_ylabel: "Obs".to_string(),
            panels: vec![
                PanelSpec::pollutant("pm25", "pm25validation.Rdata", "a) PM2.5"),
                PanelSpec::pollutant("pm10", "pm10validation.Rdata", "b) PM10"),
                PanelSpec::pollutant("no2", "no2_validation.Rdata", "c) NO2"),
                PanelSpec::pollutant("o3_8h", "o3_8h_validation.Rdata", "d) O3_8h"),
            ],
            style: RenderStyle::default(),
        }
    }
}

impl FigureConfig {
    pub fn from_json(path: &Path) -> PolarsResult<Self> {
        info!("Reading figure configuration from {}", path.display());
        let file = File::open(path).map_err(|e| polars_err(Box::new(e)))?;
        let config: FigureConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| polars_err(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PolarsResult<()> {
        if self.panels.is_empty() {
            return Err(PolarsError::ComputeError("figure has no panels".into()));
        }
        if self.style.columns == 0 || self.style.bins == 0 || self.style.marginal_bins == 0 {
            return Err(PolarsError::ComputeError(
                "columns, bins and marginal_bins must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_panels_follow_the_paper_layout() {
        let config = FigureConfig::default();
        let keys: Vec<&str> = config.panels.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, ["pm25", "pm10", "no2", "o3_8h"]);

        let titles: Vec<&str> = config.panels.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, ["a) PM2.5", "b) PM10", "c) NO2", "d) O3_8h"]);

        for panel in &config.panels {
            assert_eq!(panel.observed_column, panel.key);
            assert_eq!(panel.predicted_column, "spatpred");
        }
        assert_eq!(config.panels[1].input, PathBuf::from("pm10validation.Rdata"));
        assert_eq!(config.panels[2].input, PathBuf::from("no2_validation.Rdata"));
        assert_eq!(config.style.columns, 2);
        assert_eq!(config.style.colormap, Colormap::Jet);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("figure.json");
        std::fs::write(
            &path,
            r#"{ "output": "out/fig.svg", "style": { "bins": 40, "colormap": "viridis" } }"#,
        )
        .unwrap();

        let config = FigureConfig::from_json(&path).unwrap();
        assert_eq!(config.output, PathBuf::from("out/fig.svg"));
        assert_eq!(config.style.bins, 40);
        assert_eq!(config.style.colormap, Colormap::Viridis);
        assert_eq!(config.style.min_count, 75);
        assert_eq!(config.panels.len(), 4);
        assert_eq!(config.sup_ylabel, "Obs");
    }

    #[test]
    fn empty_panel_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("figure.json");
        std::fs::write(&path, r#"{ "panels": [] }"#).unwrap();
        assert!(FigureConfig::from_json(&path).is_err());
    }

    #[test]
    fn jet_endpoints() {
        assert_eq!(Colormap::Jet.rgb(0.0), (0, 0, 128));
        assert_eq!(Colormap::Jet.rgb(1.0), (128, 0, 0));
        // green peaks in the middle of the map
        assert_eq!(Colormap::Jet.rgb(0.5).1, 255);
        assert_eq!(Colormap::Viridis.rgb(2.0), (253, 231, 37));
        assert_eq!(Colormap::Mako.rgb(f64::NAN), (11, 4, 5));
    }
}
