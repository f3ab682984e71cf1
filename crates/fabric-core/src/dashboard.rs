//! The Dashboard/Chart Generator (spec component C11): a stateless
//! renderer that turns a panel descriptor plus a Metrics Store snapshot
//! into a self-contained HTML document, in the same hand-built
//! `format!`-driven style as the corpus's `serve_cmd::index` (no
//! templating crate).

use std::time::Duration;

use chrono::{DateTime, Utc};
use fabric_db::models::MetricKind;
use serde::{Deserialize, Serialize};

use crate::metrics::{MetricFilter, MetricsStore, Reducer};

/// The four chart kinds spec §4.10 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Line,
    Bar,
    Pie,
    MultiLine,
}

/// One panel: an aggregate query plus how to draw it.
#[derive(Debug, Clone)]
pub struct Panel {
    pub title: String,
    pub metric_kind: MetricKind,
    pub metric_name: String,
    pub filter: MetricFilter,
    pub bucket: Duration,
    pub reducer: Reducer,
    pub kind: ChartKind,
}

impl Panel {
    pub fn new(title: impl Into<String>, metric_name: impl Into<String>, kind: ChartKind) -> Self {
        Self {
            title: title.into(),
            metric_kind: MetricKind::Performance,
            metric_name: metric_name.into(),
            filter: MetricFilter::default(),
            bucket: Duration::from_secs(60),
            reducer: Reducer::Avg,
            kind,
        }
    }

    pub fn metric_kind(mut self, kind: MetricKind) -> Self {
        self.metric_kind = kind;
        self
    }

    pub fn filter(mut self, filter: MetricFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn bucket(mut self, bucket: Duration) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }
}

/// A named collection of panels plus the window they all share.
#[derive(Debug, Clone)]
pub struct DashboardDescriptor {
    pub id: String,
    pub title: String,
    pub panels: Vec<Panel>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl DashboardDescriptor {
    pub fn new(id: impl Into<String>, title: impl Into<String>, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            panels: Vec::new(),
            since,
            until,
        }
    }

    pub fn panel(mut self, panel: Panel) -> Self {
        self.panels.push(panel);
        self
    }
}

/// Stateless: given a descriptor and a metrics snapshot, always renders
/// the same HTML (spec §4.10 "Deterministic for a fixed input + metric
/// snapshot").
pub struct DashboardGenerator;

impl DashboardGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Render a full dashboard document: one `<section>` per panel.
    pub async fn generate(&self, descriptor: &DashboardDescriptor, metrics: &MetricsStore) -> anyhow::Result<String> {
        let mut sections = String::new();
        for panel in &descriptor.panels {
            let buckets = metrics
                .aggregate(
                    panel.metric_kind,
                    &panel.metric_name,
                    &panel.filter,
                    descriptor.since,
                    descriptor.until,
                    panel.bucket,
                    panel.reducer,
                )
                .await?;
            sections.push_str(&render_panel(panel, &buckets));
        }

        let body = if sections.is_empty() {
            "<p>No panels configured.</p>".to_string()
        } else {
            sections
        };

        Ok(format!(
            "<!DOCTYPE html>\
<html><head><title>{title}</title>\
<style>body{{font-family:sans-serif;margin:2rem}}section{{margin-bottom:2rem}}\
svg{{border:1px solid #ccc}}table{{border-collapse:collapse}}\
td,th{{border:1px solid #ccc;padding:2px 8px}}</style>\
</head><body>\
<h1>{title}</h1>\
<p>window: {since} &ndash; {until}</p>\
{body}\
</body></html>",
            title = html_escape(&descriptor.title),
            since = descriptor.since.to_rfc3339(),
            until = descriptor.until.to_rfc3339(),
            body = body,
        ))
    }
}

impl Default for DashboardGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn render_panel(panel: &Panel, buckets: &[(DateTime<Utc>, f64)]) -> String {
    let chart = match panel.kind {
        ChartKind::Line | ChartKind::MultiLine => render_line_svg(buckets),
        ChartKind::Bar => render_bar_svg(buckets),
        ChartKind::Pie => render_pie_svg(buckets),
    };

    format!(
        "<section><h2>{title}</h2>{chart}</section>",
        title = html_escape(&panel.title),
        chart = chart,
    )
}

const CHART_WIDTH: f64 = 400.0;
const CHART_HEIGHT: f64 = 120.0;

fn render_line_svg(buckets: &[(DateTime<Utc>, f64)]) -> String {
    if buckets.is_empty() {
        return "<p>no data</p>".to_string();
    }
    let max = buckets.iter().map(|(_, v)| *v).fold(f64::MIN, f64::max).max(1.0);
    let step = if buckets.len() > 1 {
        CHART_WIDTH / (buckets.len() - 1) as f64
    } else {
        0.0
    };
    let points: Vec<String> = buckets
        .iter()
        .enumerate()
        .map(|(i, (_, v))| {
            let x = i as f64 * step;
            let y = CHART_HEIGHT - (v / max) * CHART_HEIGHT;
            format!("{x:.1},{y:.1}")
        })
        .collect();
    format!(
        "<svg width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">\
<polyline fill=\"none\" stroke=\"#2563eb\" stroke-width=\"2\" points=\"{points}\"/>\
</svg>",
        w = CHART_WIDTH,
        h = CHART_HEIGHT,
        points = points.join(" "),
    )
}

fn render_bar_svg(buckets: &[(DateTime<Utc>, f64)]) -> String {
    if buckets.is_empty() {
        return "<p>no data</p>".to_string();
    }
    let max = buckets.iter().map(|(_, v)| *v).fold(f64::MIN, f64::max).max(1.0);
    let bar_width = CHART_WIDTH / buckets.len() as f64;
    let bars: String = buckets
        .iter()
        .enumerate()
        .map(|(i, (_, v))| {
            let height = (v / max) * CHART_HEIGHT;
            let x = i as f64 * bar_width;
            let y = CHART_HEIGHT - height;
            format!(
                "<rect x=\"{x:.1}\" y=\"{y:.1}\" width=\"{bw:.1}\" height=\"{height:.1}\" fill=\"#2563eb\"/>",
                bw = bar_width * 0.8,
            )
        })
        .collect();
    format!(
        "<svg width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">{bars}</svg>",
        w = CHART_WIDTH,
        h = CHART_HEIGHT,
    )
}

fn render_pie_svg(buckets: &[(DateTime<Utc>, f64)]) -> String {
    if buckets.is_empty() {
        return "<p>no data</p>".to_string();
    }
    let total: f64 = buckets.iter().map(|(_, v)| v.max(0.0)).sum();
    if total <= 0.0 {
        return "<p>no data</p>".to_string();
    }
    let radius = 50.0;
    let cx = 60.0;
    let cy = 60.0;
    let mut angle = 0.0_f64;
    let palette = ["#2563eb", "#16a34a", "#ea580c", "#9333ea", "#dc2626", "#0891b2"];
    let mut slices = String::new();
    for (i, (_, v)) in buckets.iter().enumerate() {
        let fraction = v.max(0.0) / total;
        let sweep = fraction * std::f64::consts::TAU;
        let x0 = cx + radius * angle.cos();
        let y0 = cy + radius * angle.sin();
        let end = angle + sweep;
        let x1 = cx + radius * end.cos();
        let y1 = cy + radius * end.sin();
        let large_arc = if sweep > std::f64::consts::PI { 1 } else { 0 };
        let color = palette[i % palette.len()];
        slices.push_str(&format!(
            "<path d=\"M{cx},{cy} L{x0:.1},{y0:.1} A{radius},{radius} 0 {large_arc} 1 {x1:.1},{y1:.1} Z\" fill=\"{color}\"/>",
        ));
        angle = end;
    }
    format!("<svg width=\"120\" height=\"120\" viewBox=\"0 0 120 120\">{slices}</svg>")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
