//! Emergency location sharing: the text a patient sends to family or a doctor.

use crate::geo::Coordinate;

pub fn maps_url(at: &Coordinate) -> String {
    format!("https://maps.google.com/?q={},{}", at.lat, at.lng)
}

pub fn share_message(at: &Coordinate) -> String {
    format!("My live location: {}", maps_url(at))
}
