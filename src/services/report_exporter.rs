// src/services/report_exporter.rs
use crate::errors::ExportError;
use crate::models::AnalysisResult;
use crate::services::file_intake::ImageAsset;
use bytes::Bytes;
use chrono::Utc;
use std::fmt::Write;

#[derive(Debug, Clone)]
pub struct Report {
    pub filename: String,
    pub content_type: String,
    pub body: Bytes,
}

pub trait ReportExporter: Send + Sync {
    fn export(&self, result: &AnalysisResult, asset: &ImageAsset) -> Result<Report, ExportError>;
}

/// Plain-text report for the "Download Report" action.
#[derive(Debug, Default)]
pub struct TextReportExporter;

impl TextReportExporter {
    pub fn new() -> Self {
        Self
    }

    fn render(&self, result: &AnalysisResult, asset: &ImageAsset) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        writeln!(out, "Leaf Disease Analysis Report")?;
        writeln!(out, "Generated: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(out)?;

        writeln!(out, "Image")?;
        writeln!(out, "  File: {}", asset.filename().unwrap_or("(unnamed)"))?;
        writeln!(out, "  Type: {}", asset.content_type())?;
        writeln!(out, "  Size: {} bytes", asset.size())?;
        if let Some((width, height)) = asset.dimensions() {
            writeln!(out, "  Dimensions: {}x{}", width, height)?;
        }
        writeln!(out)?;

        writeln!(out, "Disease Detected: {}", result.display_label())?;
        writeln!(out, "Confidence: {}%", result.confidence_percent())?;
        writeln!(out)?;

        let info = result.information();
        for (heading, text) in [
            ("Description", info.description.as_str()),
            ("Symptoms", info.symptoms.as_str()),
            ("Treatment", info.treatment.as_str()),
            ("Recommendations", result.recommendations()),
        ] {
            writeln!(out, "{}", heading)?;
            writeln!(out, "  {}", if text.is_empty() { "-" } else { text })?;
            writeln!(out)?;
        }
        Ok(out)
    }
}

impl ReportExporter for TextReportExporter {
    fn export(&self, result: &AnalysisResult, asset: &ImageAsset) -> Result<Report, ExportError> {
        let text = self
            .render(result, asset)
            .map_err(|e| ExportError::Render(e.to_string()))?;

        Ok(Report {
            filename: format!("leaf-report-{}.txt", slug(result.disease())),
            content_type: "text/plain; charset=utf-8".to_string(),
            body: Bytes::from(text),
        })
    }
}

fn slug(label: &str) -> String {
    let slug: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() { "unknown".to_string() } else { slug.to_string() }
}
