//! DOM scan for signature areas.

use pdfpipe_core_types::{SignatureZone, SIGNATURE_AREA_PREFIX};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::dispatcher::Dispatcher;
use crate::error::CdpError;

/// Returns `{id, x, y, width, height}` for every `[id^="signature-area-"]` element, in document
/// coordinates.
pub const FIND_SIGNATURE_AREAS_JS: &str = include_str!("js/find_signature_areas.js");

#[derive(Deserialize)]
struct RawZone {
    id: String,
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Evaluates the zone script in `session_id` and returns zones in DOM order.
pub async fn find_signature_zones(
    dispatcher: &Dispatcher,
    session_id: &str,
) -> Result<Vec<SignatureZone>, CdpError> {
    let response = dispatcher
        .send(
            "Runtime.evaluate",
            json!({ "expression": FIND_SIGNATURE_AREAS_JS, "returnByValue": true }),
            Some(session_id),
        )
        .await?;
    let zones = parse_zones(&response)?;
    debug!(target: "cdp-pipe", session = session_id, count = zones.len(), "signature zones detected");
    Ok(zones)
}

/// Extracts zones from a `Runtime.evaluate` response.
pub fn parse_zones(response: &Value) -> Result<Vec<SignatureZone>, CdpError> {
    if let Some(details) = response.get("exceptionDetails") {
        return Err(CdpError::decode(
            "Runtime.evaluate",
            format!("zone script threw: {details}"),
        ));
    }
    let value = response
        .get("result")
        .and_then(|result| result.get("value"))
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    let raw: Vec<RawZone> = serde_json::from_value(value)
        .map_err(|err| CdpError::decode("Runtime.evaluate", err.to_string()))?;
    Ok(raw
        .into_iter()
        .filter(|zone| zone.id.starts_with(SIGNATURE_AREA_PREFIX))
        .map(|zone| SignatureZone::new(zone.id, zone.x, zone.y, zone.width, zone.height))
        .collect())
}
