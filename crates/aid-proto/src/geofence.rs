//! Wire types for the patient backend's geofence and alert routes.
//!
//! Everything coming back from the backend goes through [`parse_geofence_response`]
//! before it is handed to the monitor, so a malformed body fails here instead of
//! turning into a zone centered on garbage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected response shape: {0}")]
    Shape(&'static str),
    #[error("coordinate out of range: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
}

/// Body of `POST /geofence/set` and `POST /geofence/update-location`, and the
/// inner object of `GET /geofence/get`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn validate(&self) -> Result<(), ProtoError> {
        let ok = self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat.abs() <= 90.0
            && self.lng.abs() <= 180.0;
        if ok {
            Ok(())
        } else {
            Err(ProtoError::InvalidCoordinate { lat: self.lat, lng: self.lng })
        }
    }
}

/// Body of `POST /alerts/send-alert`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    pub patient_id: String,
    pub message: String,
}

/// Validates a `GET /geofence/get` body: `{"geofence": {"lat", "lng"} | null}`.
/// Unknown fields are ignored, a missing `geofence` counts as null.
///
/// The shape is checked on the raw JSON value first; serde's derived struct
/// visitor would otherwise accept `[lat, lng]` arrays as well.
pub fn parse_geofence_response(body: &[u8]) -> Result<Option<LatLng>, ProtoError> {
    let v: Value = serde_json::from_slice(body)?;
    let env = v.as_object().ok_or(ProtoError::Shape("response is not an object"))?;
    match env.get("geofence") {
        None | Some(Value::Null) => Ok(None),
        Some(g @ Value::Object(_)) => {
            let p: LatLng = serde_json::from_value(g.clone())?;
            p.validate()?;
            Ok(Some(p))
        }
        Some(_) => Err(ProtoError::Shape("geofence is neither an object nor null")),
    }
}
