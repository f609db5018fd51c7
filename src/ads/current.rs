//! Current payload layout: everything under `data.kwargs`.

use serde_json::Value;
use sync_core::path;
use sync_core::path::{lookup, lookup_array, lookup_str};

use super::record::Trip;

/// Where each ad kind keeps its trip details inside `kwargs.params`.
pub(crate) fn car_trip(params: &Value) -> Trip {
    Trip {
        start_date: lookup_str(params, path!["pickUpDate"]),
        end_date: lookup_str(params, path!["dropOffDate"]),
        origin: lookup_str(params, path!["pickUpLocation", "locationQuery"]),
        destination: lookup_str(params, path!["dropOffLocation", "locationQuery"]),
    }
}

/// Only the first leg is recorded; its date is both start and end.
pub(crate) fn flight_trip(params: &Value) -> Trip {
    let date = lookup_str(params, path!["legs", 0, "date"]);
    Trip {
        start_date: date.clone(),
        end_date: date,
        origin: lookup_str(params, path!["legs", 0, "originAirport"]),
        destination: lookup_str(params, path!["legs", 0, "destinationAirport"]),
    }
}

pub(crate) fn hotel_trip(params: &Value) -> Trip {
    let city = lookup_str(params, path!["cityId"]);
    Trip {
        start_date: lookup_str(params, path!["checkinDate"]),
        end_date: lookup_str(params, path!["checkoutDate"]),
        origin: city.clone(),
        destination: city,
    }
}

pub(crate) struct Kwargs<'a> {
    pub params: &'a Value,
    pub items: &'a [Value],
    pub os: Option<String>,
    pub country: Option<String>,
}

pub(crate) fn kwargs(data: &Value) -> Kwargs<'_> {
    Kwargs {
        params: lookup(data, path!["kwargs", "params"]).unwrap_or(&Value::Null),
        items: lookup_array(data, path!["kwargs", "inlineItems"]),
        os: lookup_str(data, path!["kwargs", "os"]),
        country: lookup_str(data, path!["kwargs", "country"]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flight_uses_first_leg_for_both_dates() {
        let params = json!({"legs": [
            {"date": "2024-05-10", "originAirport": "LHR", "destinationAirport": "JFK"},
            {"date": "2024-05-20", "originAirport": "JFK", "destinationAirport": "LHR"}
        ]});
        let trip = flight_trip(&params);
        assert_eq!(trip.start_date.as_deref(), Some("2024-05-10"));
        assert_eq!(trip.end_date.as_deref(), Some("2024-05-10"));
        assert_eq!(trip.origin.as_deref(), Some("LHR"));
        assert_eq!(trip.destination.as_deref(), Some("JFK"));
    }

    #[test]
    fn test_hotel_city_is_origin_and_destination() {
        let trip = hotel_trip(&json!({"checkinDate": "2024-06-01", "cityId": 4512}));
        assert_eq!(trip.origin.as_deref(), Some("4512"));
        assert_eq!(trip.destination.as_deref(), Some("4512"));
        assert_eq!(trip.end_date, None);
    }

    #[test]
    fn test_missing_kwargs_degrade_to_empty() {
        let data = json!({"kwargs": "unexpected"});
        let kwargs = kwargs(&data);
        assert!(kwargs.params.is_null());
        assert!(kwargs.items.is_empty());
        assert_eq!(car_trip(kwargs.params), Trip::default());
    }
}
