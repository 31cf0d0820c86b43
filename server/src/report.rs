use printpdf::{BuiltinFont, Mm, PdfDocument};

use crate::entities::result::Prediction;
use crate::error::{ApiError, ApiResult};

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 20.0;
const LINE_HEIGHT: f32 = 9.0;

/// Everything printed on an analysis report
#[derive(Debug, Clone)]
pub struct ReportInput<'a> {
    pub user_name: &'a str,
    pub user_email: &'a str,
    pub filename: &'a str,
    pub prediction: Prediction,
    pub confidence: f64,
    pub frames: i64,
    pub processing_time: f64,
    pub lime_image: Option<&'a str>,
    pub generated_at: &'a str,
}

pub fn format_confidence(confidence: f64) -> String {
    format!("{:.2}%", confidence.clamp(0.0, 1.0) * 100.0)
}

fn verdict(prediction: Prediction) -> &'static str {
    match prediction {
        Prediction::Real => "REAL - no manipulation detected",
        Prediction::Fake => "FAKE - manipulation detected",
    }
}

/// Label/value rows in print order
pub fn rows(input: &ReportInput<'_>) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("Generated", input.generated_at.to_string()),
        ("Analyst", format!("{} <{}>", input.user_name, input.user_email)),
        ("File", input.filename.to_string()),
        ("Verdict", verdict(input.prediction).to_string()),
        ("Confidence", format_confidence(input.confidence)),
        ("Frames analysed", input.frames.to_string()),
        ("Processing time", format!("{:.2} s", input.processing_time)),
    ];
    if let Some(lime) = input.lime_image {
        rows.push(("Explanation image", lime.to_string()));
    }
    rows
}

/// Render a one-page A4 report.
pub fn render(input: &ReportInput<'_>) -> ApiResult<Vec<u8>> {
    let (doc, page, layer) = PdfDocument::new(
        "Deepfake Analysis Report",
        Mm(PAGE_WIDTH),
        Mm(PAGE_HEIGHT),
        "Report",
    );
    let regular = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| ApiError::Unexpected(format!("PDF font error: {e}")))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| ApiError::Unexpected(format!("PDF font error: {e}")))?;

    let layer = doc.get_page(page).get_layer(layer);
    let mut y = PAGE_HEIGHT - MARGIN - 7.0;
    layer.use_text("Deepfake Analysis Report", 20.0, Mm(MARGIN), Mm(y), &bold);
    y -= LINE_HEIGHT * 2.0;

    for (label, value) in rows(input) {
        layer.use_text(format!("{label}:"), 11.0, Mm(MARGIN), Mm(y), &bold);
        // Long values (data URLs, paths) are cut to keep them on the page
        let value: String = value.chars().take(80).collect();
        layer.use_text(value, 11.0, Mm(MARGIN + 45.0), Mm(y), &regular);
        y -= LINE_HEIGHT;
    }

    doc.save_to_bytes()
        .map_err(|e| ApiError::Unexpected(format!("PDF render error: {e}")))
}
