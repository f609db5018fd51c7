//! Legacy `ad_fetch` payload layout.
//!
//! There is no `kwargs` wrapper and the ads sit in the response. The request
//! parameters do not say which product was searched, so the trip is read
//! from each product's fields in turn (flight legs, then hotel, then car),
//! and any field that is present overrides what came before, even when its
//! value is null.

use serde_json::Value;
use sync_core::path;
use sync_core::path::{lookup, lookup_array, lookup_str, scalar_to_string, PathSegment};

use super::record::Trip;

pub(crate) struct LegacyPayload<'a> {
    pub items: &'a [Value],
    pub os: Option<String>,
    pub country: Option<String>,
    pub trip: Trip,
}

pub(crate) fn payload(data: &Value) -> LegacyPayload<'_> {
    let params = lookup(data, path!["params"]).unwrap_or(&Value::Null);
    LegacyPayload {
        items: lookup_array(data, path!["response", "inlineItems"]),
        os: lookup_str(data, path!["OS"]),
        country: lookup_str(data, path!["countryCode"]),
        trip: trip(params),
    }
}

fn trip(params: &Value) -> Trip {
    let date = lookup_str(params, path!["legs", 0, "date"]);
    let mut trip = Trip {
        start_date: date.clone(),
        end_date: date,
        origin: lookup_str(params, path!["legs", 0, "originAirport"]),
        destination: lookup_str(params, path!["legs", 0, "destinationAirport"]),
    };

    overlay(&mut trip.start_date, params, path!["checkinDate"]);
    overlay(&mut trip.end_date, params, path!["checkoutDate"]);
    overlay(&mut trip.origin, params, path!["cityId"]);
    overlay(&mut trip.destination, params, path!["cityId"]);

    overlay(&mut trip.start_date, params, path!["pickUpDate"]);
    overlay(&mut trip.end_date, params, path!["dropOffDate"]);
    overlay(&mut trip.origin, params, path!["pickUpLocation", "locationQuery"]);
    overlay(&mut trip.destination, params, path!["dropOffLocation", "locationQuery"]);

    trip
}

fn overlay(field: &mut Option<String>, params: &Value, path: &[PathSegment<'_>]) {
    if let Some(value) = lookup(params, path) {
        *field = scalar_to_string(value);
    }
}
