//! PDF rasterisation: render the pages of an in-memory PDF via pdfium.
//!
//! pdfium keeps thread-local state and is CPU-bound, so all work happens in
//! `spawn_blocking`. The library is bound from `PDFIUM_LIB_PATH` when set,
//! otherwise from the system library path; a missing library surfaces as
//! `engine_unavailable`, never as a panic.
//!
//! Pixels are capped on the longest edge rather than set by DPI: shuttle
//! notices range from A4 flyers to A1 posters, and the vision model only needs
//! enough resolution to read station names.

use crate::error::ExtractionError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::{debug, info, warn};

/// Longest edge of a rendered page, in pixels.
pub const MAX_RENDERED_PIXELS: u32 = 2000;

/// Pages beyond this are ignored; route notices are a handful of pages.
pub const MAX_PAGES: usize = 20;

fn bind_pdfium() -> Result<Pdfium, ExtractionError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&path))
                .or_else(|_| Pdfium::bind_to_library(&path))
        }
        _ => Pdfium::bind_to_system_library(),
    };
    bindings
        .map(Pdfium::new)
        .map_err(|e| ExtractionError::EngineUnavailable {
            engine: "pdfium".to_string(),
            detail: format!("{e:?}"),
        })
}

/// Rasterise up to [`MAX_PAGES`] pages of `bytes`.
pub async fn render_pdf(bytes: Vec<u8>, label: String) -> Result<Vec<DynamicImage>, ExtractionError> {
    tokio::task::spawn_blocking(move || render_pdf_blocking(&bytes, &label))
        .await
        .map_err(|e| ExtractionError::EngineUnavailable {
            engine: "pdfium".to_string(),
            detail: format!("render task panicked: {e}"),
        })?
}

fn render_pdf_blocking(bytes: &[u8], label: &str) -> Result<Vec<DynamicImage>, ExtractionError> {
    let pdfium = bind_pdfium()?;

    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| ExtractionError::Unreadable {
            detail: format!("PDF could not be opened: {e:?}"),
        })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("{}: PDF loaded, {} pages", label, total);
    if total > MAX_PAGES {
        warn!("{}: rendering only the first {} of {} pages", label, MAX_PAGES, total);
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(MAX_RENDERED_PIXELS as i32)
        .set_maximum_height(MAX_RENDERED_PIXELS as i32);

    let mut images = Vec::with_capacity(total.min(MAX_PAGES));
    for idx in 0..total.min(MAX_PAGES) {
        let page = pages.get(idx as u16).map_err(|e| ExtractionError::Unreadable {
            detail: format!("page {}: {e:?}", idx + 1),
        })?;
        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| ExtractionError::Unreadable {
                detail: format!("page {} could not be rendered: {e:?}", idx + 1),
            })?;
        let image = bitmap.as_image();
        debug!(
            "{}: rendered page {} → {}x{} px",
            label,
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}
