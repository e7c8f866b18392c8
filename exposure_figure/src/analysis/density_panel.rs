//! One density panel: a binned 2D histogram of predicted (x) against observed
//! (y) with marginal histograms, a dashed 1:1 line and the agreement
//! statistics written in the upper-left corner.

use ndarray::Array2;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::FontTransform;
use polars::prelude::*;
use tracing::{debug, error};

use crate::analysis::statistics::{format_stat, max_lim};
use crate::config::RenderStyle;
use crate::models::{plot_err, StatsRow, StatsTriple};

const MARGIN: u32 = 5;
const X_LABEL_AREA: u32 = 30;
const Y_LABEL_AREA: u32 = 45;
/// Joint axes take this many parts of the panel, the marginals one
const JOINT_RATIO: u32 = 5;
const MARGINAL_FILL: RGBColor = RGBColor(31, 119, 180);

/// Bin of `v` among `bins` equal bins over `[0, max_lim]`. The last bin is
/// closed on the right.
fn bin_index(v: f64, bins: usize, max_lim: f64) -> Option<usize> {
    if v.is_nan() || v < 0.0 || v > max_lim {
        return None;
    }
    let i = (v / max_lim * bins as f64).floor() as usize;
    Some(i.min(bins - 1))
}

/// Counts of a 2D histogram over `[0, max_lim]²`, indexed `[x_bin, y_bin]`.
#[derive(Debug, Clone)]
pub struct Histogram2d {
    pub counts: Array2<u32>,
    pub max_lim: f64,
}

impl Histogram2d {
    pub fn compute(x: &[f64], y: &[f64], bins: usize, max_lim: f64) -> Self {
        let mut counts = Array2::<u32>::zeros((bins, bins));
        for (&xv, &yv) in x.iter().zip(y) {
            if let (Some(ix), Some(iy)) = (bin_index(xv, bins, max_lim), bin_index(yv, bins, max_lim)) {
                counts[[ix, iy]] += 1;
            }
        }
        Self { counts, max_lim }
    }

    pub fn bins(&self) -> usize {
        self.counts.nrows()
    }

    pub fn bin_width(&self) -> f64 {
        self.max_lim / self.bins() as f64
    }

    /// Bins holding at least `min_count` observations, as `(x_bin, y_bin, count)`.
    pub fn visible_cells(&self, min_count: u32) -> Vec<(usize, usize, u32)> {
        self.counts
            .indexed_iter()
            .filter(|(_, &c)| c > 0 && c >= min_count)
            .map(|((ix, iy), &c)| (ix, iy, c))
            .collect()
    }
}

/// Histogram of one axis over the finite extent of its own data. Bars past
/// the panel limit are clipped when drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginalHistogram {
    pub counts: Vec<u32>,
    pub start: f64,
    pub width: f64,
}

impl MarginalHistogram {
    pub fn compute(values: &[f64], bins: usize) -> Self {
        let (lo, hi) = values
            .iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if lo > hi {
            return Self { counts: vec![0; bins], start: 0.0, width: 1.0 };
        }
        // a single distinct value gets a unit-wide range around it
        let (lo, hi) = if lo == hi { (lo - 0.5, hi + 0.5) } else { (lo, hi) };

        let mut counts = vec![0u32; bins];
        for &v in values.iter().filter(|v| v.is_finite()) {
            if let Some(i) = bin_index(v - lo, bins, hi - lo) {
                counts[i] += 1;
            }
        }
        Self { counts, start: lo, width: (hi - lo) / bins as f64 }
    }

    pub fn peak(&self) -> u32 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// Non-empty bars as `(from, to, count)`, cut to `[0, limit]`.
    pub fn bars(&self, limit: f64) -> Vec<(f64, f64, u32)> {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .filter_map(|(i, &c)| {
                let from = (self.start + i as f64 * self.width).max(0.0);
                let to = (self.start + (i + 1) as f64 * self.width).min(limit);
                (to > from).then_some((from, to, c))
            })
            .collect()
    }
}

/// A rendered-but-not-yet-drawn panel. Plotters draws straight onto a
/// backend, so the panel keeps everything needed to draw itself once the
/// figure layout hands it a drawing area.
#[derive(Debug, Clone)]
pub struct DensityPanel {
    pub name: String,
    pub predicted: Vec<f64>,
    pub observed: Vec<f64>,
    pub stats: StatsTriple,
    pub max_lim: f64,
    pub joint: Histogram2d,
    pub marginal_x: MarginalHistogram,
    pub marginal_y: MarginalHistogram,
    pub title: Option<String>,
    pub sup_xlabel: Option<String>,
    pub sup_ylabel: Option<String>,
    style: RenderStyle,
}

/// Bin both series and prepare the panel for `name`.
pub fn render_panel(
    name: &str,
    predicted: Vec<f64>,
    observed: Vec<f64>,
    stats: StatsTriple,
    style: &RenderStyle,
) -> PolarsResult<DensityPanel> {
    let limit = max_lim(&observed, &predicted);
    if !limit.is_finite() || limit <= 0.0 {
        error!("{}: cannot draw with axis limit {}", name, limit);
        return Err(PolarsError::ComputeError(
            format!("{name}: axis limit must be a positive number, got {limit}").into(),
        ));
    }

    let joint = Histogram2d::compute(&predicted, &observed, style.bins, limit);
    let shown = joint.visible_cells(style.min_count).len();
    debug!(
        "{}: max_lim {:.3}, {} of {} joint bins reach {} counts",
        name,
        limit,
        shown,
        style.bins * style.bins,
        style.min_count
    );

    Ok(DensityPanel {
        name: name.to_string(),
        marginal_x: MarginalHistogram::compute(&predicted, style.marginal_bins),
        marginal_y: MarginalHistogram::compute(&observed, style.marginal_bins),
        predicted,
        observed,
        stats,
        max_lim: limit,
        joint,
        title: None,
        sup_xlabel: None,
        sup_ylabel: None,
        style: style.clone(),
    })
}

impl DensityPanel {
    pub fn set_title(&mut self, title: &str) {
        self.title = Some(title.to_string());
    }

    pub fn set_sup_labels(&mut self, xlabel: &str, ylabel: &str) {
        self.sup_xlabel = Some(xlabel.to_string());
        self.sup_ylabel = Some(ylabel.to_string());
    }

    pub fn stats_row(&self) -> StatsRow {
        StatsRow {
            variable: self.name.clone(),
            n: self.stats.n,
            valid_pairs: self.stats.valid_pairs,
            max_lim: self.max_lim,
            correlation: self.stats.correlation,
            nmb: self.stats.nmb,
            nrmse: self.stats.nrmse,
        }
    }

    pub fn annotations(&self) -> [String; 3] {
        [
            format!("Cor: {}", format_stat(self.stats.correlation)),
            format!("NMB: {}", format_stat(self.stats.nmb)),
            format!("NRMSE: {}", format_stat(self.stats.nrmse)),
        ]
    }

    pub fn draw<DB: DrawingBackend>(&self, area: &DrawingArea<DB, Shift>) -> PolarsResult<()> {
        let style = &self.style;
        let family = style.font_family.as_str();

        let area = area
            .titled(
                self.title.as_deref().unwrap_or(""),
                (family, style.title_font_size).into_font(),
            )
            .map_err(plot_err)?;

        // shared labels: y on the left edge, x along the bottom
        let label_band = style.label_font_size * 2;
        let (_, height) = area.dim_in_pixel();
        let (ylabel_area, rest) = area.split_horizontally(label_band);
        let (body, xlabel_area) = rest.split_vertically(height.saturating_sub(label_band));

        let label_style = TextStyle::from((family, style.label_font_size).into_font())
            .pos(Pos::new(HPos::Center, VPos::Center));
        if let Some(label) = &self.sup_xlabel {
            let (w, h) = xlabel_area.dim_in_pixel();
            xlabel_area
                .draw_text(label, &label_style, (w as i32 / 2, h as i32 / 2))
                .map_err(plot_err)?;
        }
        if let Some(label) = &self.sup_ylabel {
            let (w, h) = ylabel_area.dim_in_pixel();
            ylabel_area
                .draw_text(
                    label,
                    &label_style.transform(FontTransform::Rotate270),
                    (w as i32 / 2, h as i32 / 2),
                )
                .map_err(plot_err)?;
        }

        // jointplot grid: marginal x on top, marginal y on the right
        let (bw, bh) = body.dim_in_pixel();
        let joint_w = bw * JOINT_RATIO / (JOINT_RATIO + 1);
        let (top, bottom) = body.split_vertically(bh / (JOINT_RATIO + 1));
        let (marginal_x_area, _) = top.split_horizontally(joint_w);
        let (joint_area, marginal_y_area) = bottom.split_horizontally(joint_w);

        self.draw_joint(&joint_area)?;
        self.draw_marginal_x(&marginal_x_area)?;
        self.draw_marginal_y(&marginal_y_area)?;
        Ok(())
    }

    fn draw_joint<DB: DrawingBackend>(&self, area: &DrawingArea<DB, Shift>) -> PolarsResult<()> {
        let style = &self.style;
        let family = style.font_family.as_str();
        let m = self.max_lim;

        let mut chart = ChartBuilder::on(area)
            .margin(MARGIN)
            .x_label_area_size(X_LABEL_AREA)
            .y_label_area_size(Y_LABEL_AREA)
            .build_cartesian_2d(0f64..m, 0f64..m)
            .map_err(plot_err)?;

        chart
            .configure_mesh()
            .disable_mesh()
            .x_labels(5)
            .y_labels(5)
            .label_style((family, style.tick_font_size))
            .draw()
            .map_err(plot_err)?;

        let cells = self.joint.visible_cells(style.min_count);
        let (lo, hi) = cells
            .iter()
            .fold((u32::MAX, 0u32), |(lo, hi), &(_, _, c)| (lo.min(c), hi.max(c)));
        let width = self.joint.bin_width();
        let colormap = style.colormap;

        chart
            .draw_series(cells.iter().map(|&(ix, iy, count)| {
                let t = if hi > lo {
                    (count - lo) as f64 / (hi - lo) as f64
                } else {
                    0.0
                };
                let (r, g, b) = colormap.rgb(t);
                Rectangle::new(
                    [
                        (ix as f64 * width, iy as f64 * width),
                        ((ix + 1) as f64 * width, (iy + 1) as f64 * width),
                    ],
                    RGBColor(r, g, b).filled(),
                )
            }))
            .map_err(plot_err)?;

        chart
            .draw_series(DashedLineSeries::new(
                vec![(0.0, 0.0), (m, m)],
                6,
                4,
                RED.stroke_width(2),
            ))
            .map_err(plot_err)?;

        let text_style = TextStyle::from((family, style.annotation_font_size).into_font())
            .pos(Pos::new(HPos::Left, VPos::Bottom));
        for (row, text) in self.annotations().into_iter().enumerate() {
            let y = m * (0.95 - 0.05 * row as f64);
            chart
                .draw_series(std::iter::once(Text::new(text, (0.05 * m, y), text_style.clone())))
                .map_err(plot_err)?;
        }

        Ok(())
    }

    fn draw_marginal_x<DB: DrawingBackend>(&self, area: &DrawingArea<DB, Shift>) -> PolarsResult<()> {
        let m = self.max_lim;
        let peak = self.marginal_x.peak().max(1) as f64;

        let mut chart = ChartBuilder::on(area)
            .margin_left(MARGIN)
            .margin_right(MARGIN)
            .margin_top(MARGIN)
            .y_label_area_size(Y_LABEL_AREA)
            .build_cartesian_2d(0f64..m, 0f64..peak * 1.05)
            .map_err(plot_err)?;

        chart
            .draw_series(self.marginal_x.bars(m).into_iter().map(|(from, to, c)| {
                Rectangle::new([(from, 0.0), (to, c as f64)], MARGINAL_FILL.mix(0.6).filled())
            }))
            .map_err(plot_err)?;
        Ok(())
    }

    fn draw_marginal_y<DB: DrawingBackend>(&self, area: &DrawingArea<DB, Shift>) -> PolarsResult<()> {
        let m = self.max_lim;
        let peak = self.marginal_y.peak().max(1) as f64;

        let mut chart = ChartBuilder::on(area)
            .margin_top(MARGIN)
            .margin_bottom(MARGIN)
            .margin_right(MARGIN)
            .x_label_area_size(X_LABEL_AREA)
            .build_cartesian_2d(0f64..peak * 1.05, 0f64..m)
            .map_err(plot_err)?;

        chart
            .draw_series(self.marginal_y.bars(m).into_iter().map(|(from, to, c)| {
                Rectangle::new([(0.0, from), (c as f64, to)], MARGINAL_FILL.mix(0.6).filled())
            }))
            .map_err(plot_err)?;
        Ok(())
    }
}
