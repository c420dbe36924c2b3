//! Geometry shared between the renderer (which discovers signature zones in the DOM) and the
//! signer (which places widgets for them in PDF space).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Browser CSS pixels are 1/96 inch, PDF points are 1/72 inch.
pub const PX_TO_PT: f64 = 0.75;

/// US Letter page height in points; Chromium's default paper size.
pub const LETTER_HEIGHT_PT: f64 = 792.0;

/// ISO A4 page height in points.
pub const A4_HEIGHT_PT: f64 = 841.89;

/// Prefix of element ids treated as signature areas by the DOM scan.
pub const SIGNATURE_AREA_PREFIX: &str = "signature-area-";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("page height must be positive, got {0}")]
    InvalidPageHeight(f64),
    #[error("zone {field} must be finite and non-negative, got {value}")]
    InvalidCoordinate { field: &'static str, value: f64 },
    #[error("zone offset {0}pt is past the last addressable page")]
    PageOutOfRange(f64),
}

/// A signature area discovered in the rendered document, in browser pixel space.
///
/// Coordinates are relative to the top-left corner of the whole document (scroll offsets
/// included), so a zone far down a long page maps onto a later PDF page.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SignatureZone {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// A zone converted into PDF user space on a concrete page.
#[cfg_attr(feature = "serde-full", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PdfPlacement {
    pub x: f64,
    /// Bottom edge, measured from the bottom of the page.
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// 1-based page index.
    pub page_number: u32,
}

impl PdfPlacement {
    /// `[llx lly urx ury]` rectangle as used by `/Rect`.
    pub fn rect(&self) -> [f64; 4] {
        [self.x, self.y, self.x + self.width, self.y + self.height]
    }
}

impl SignatureZone {
    pub fn new(id: impl Into<String>, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            width,
            height,
        }
    }

    /// Convert browser pixels into PDF points on the page the zone falls on.
    ///
    /// The document is treated as a continuous strip of pages of `page_height_pt`; the page is
    /// `floor(y_pt / h) + 1` and the y axis is flipped relative to that page.
    pub fn to_pdf_placement(&self, page_height_pt: f64) -> Result<PdfPlacement, GeometryError> {
        if !(page_height_pt > 0.0) || !page_height_pt.is_finite() {
            return Err(GeometryError::InvalidPageHeight(page_height_pt));
        }
        for (field, value) in [
            ("x", self.x),
            ("y", self.y),
            ("width", self.width),
            ("height", self.height),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(GeometryError::InvalidCoordinate { field, value });
            }
        }

        let x = self.x * PX_TO_PT;
        let y_total = self.y * PX_TO_PT;
        let width = self.width * PX_TO_PT;
        let height = self.height * PX_TO_PT;

        let page_index = (y_total / page_height_pt).floor();
        let page_number = Some(page_index)
            .filter(|index| *index < f64::from(u32::MAX))
            .and_then(|index| (index as u32).checked_add(1))
            .ok_or(GeometryError::PageOutOfRange(y_total))?;
        let y_on_page = y_total.rem_euclid(page_height_pt);

        Ok(PdfPlacement {
            x,
            y: page_height_pt - y_on_page - height,
            width,
            height,
            page_number,
        })
    }
}

impl fmt::Display for SignatureZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x{} at {},{})",
            self.id, self.width, self.height, self.x, self.y
        )
    }
}

/// Group zones by the page they land on, keeping discovery order within a page.
pub fn group_by_page<'a>(
    zones: impl IntoIterator<Item = (&'a SignatureZone, PdfPlacement)>,
) -> BTreeMap<u32, Vec<(&'a SignatureZone, PdfPlacement)>> {
    let mut pages: BTreeMap<u32, Vec<_>> = BTreeMap::new();
    for (zone, placement) in zones {
        pages
            .entry(placement.page_number)
            .or_default()
            .push((zone, placement));
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_at_origin_lands_on_first_page() {
        let zone = SignatureZone::new("a", 0.0, 0.0, 100.0, 50.0);
        let placement = zone.to_pdf_placement(A4_HEIGHT_PT).unwrap();
        assert_eq!(placement.page_number, 1);
        assert_eq!(placement.width, 75.0);
        assert_eq!(placement.height, 37.5);
        assert!((placement.y - (A4_HEIGHT_PT - 37.5)).abs() < 1e-9);
    }

    #[test]
    fn zone_below_page_break_moves_to_next_page() {
        // 1200px * 0.75 = 900pt, past the 841.89pt A4 page.
        let zone = SignatureZone::new("b", 10.0, 1200.0, 100.0, 50.0);
        let placement = zone.to_pdf_placement(A4_HEIGHT_PT).unwrap();
        assert_eq!(placement.page_number, 2);
        let expected_y = A4_HEIGHT_PT - (900.0 - A4_HEIGHT_PT) - 37.5;
        assert!((placement.y - expected_y).abs() < 1e-9);
        assert_eq!(placement.x, 7.5);
    }

    #[test]
    fn zone_inside_first_a4_page_stays_there() {
        // 900px * 0.75 = 675pt, still on page one.
        let zone = SignatureZone::new("b", 0.0, 900.0, 100.0, 50.0);
        let placement = zone.to_pdf_placement(A4_HEIGHT_PT).unwrap();
        assert_eq!(placement.page_number, 1);
        assert!((placement.y - (A4_HEIGHT_PT - 675.0 - 37.5)).abs() < 1e-9);
    }

    #[test]
    fn rejects_degenerate_page_height() {
        let zone = SignatureZone::new("c", 0.0, 0.0, 1.0, 1.0);
        assert!(zone.to_pdf_placement(0.0).is_err());
        assert!(zone.to_pdf_placement(f64::NAN).is_err());
    }

    #[test]
    fn rejects_non_finite_or_negative_coordinates() {
        let cases = [
            ("x", SignatureZone::new("d", f64::NAN, 0.0, 1.0, 1.0)),
            ("y", SignatureZone::new("d", 0.0, -4.0, 1.0, 1.0)),
            ("width", SignatureZone::new("d", 0.0, 0.0, f64::INFINITY, 1.0)),
            ("height", SignatureZone::new("d", 0.0, 0.0, 1.0, -0.5)),
        ];
        for (expected, zone) in cases {
            match zone.to_pdf_placement(LETTER_HEIGHT_PT) {
                Err(GeometryError::InvalidCoordinate { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_offsets_past_the_last_page_number() {
        let zone = SignatureZone::new("e", 0.0, 1e13, 10.0, 10.0);
        assert!(matches!(
            zone.to_pdf_placement(LETTER_HEIGHT_PT),
            Err(GeometryError::PageOutOfRange(_))
        ));
    }

    #[test]
    fn rect_spans_width_and_height() {
        let placement = PdfPlacement {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
            page_number: 1,
        };
        assert_eq!(placement.rect(), [10.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn groups_zones_per_page_in_order() {
        let zones = vec![
            SignatureZone::new("a", 0.0, 0.0, 10.0, 10.0),
            SignatureZone::new("b", 0.0, 2200.0, 10.0, 10.0),
            SignatureZone::new("c", 0.0, 100.0, 10.0, 10.0),
        ];
        let placed: Vec<_> = zones
            .iter()
            .map(|z| (z, z.to_pdf_placement(LETTER_HEIGHT_PT).unwrap()))
            .collect();
        let grouped = group_by_page(placed);
        let first: Vec<_> = grouped[&1].iter().map(|(z, _)| z.id.as_str()).collect();
        assert_eq!(first, vec!["a", "c"]);
        assert_eq!(grouped[&3][0].0.id, "b");
    }
}
