use std::future::Future;

use serde::Deserialize;

use crate::error::EnsembleError;
use crate::models::GageId;
use crate::observations::{ObservationSeries, ObservationSource, ObservationWindow};
use crate::types::Timestamp;

/// USGS NWIS instantaneous values service.
pub const DEFAULT_SERVICE_URL: &str = "https://waterservices.usgs.gov/nwis/iv/";

/// Discharge parameter code, reported in cubic feet per second.
const DISCHARGE: &str = "00060";

/// Cubic metres per cubic foot.
pub const CFS_TO_CMS: f64 = 0.028316847;

/// USGS observation source.
///
/// Implements [ObservationSource] over the NWIS instantaneous values JSON service.
#[derive(Debug)]
pub struct UsgsSource {
    reqwest_client: reqwest::Client,
    service_url: String,
    to_cms: bool,
}

impl UsgsSource {
    /// Create a new USGS source.
    ///
    /// # Arguments
    ///
    /// * `service_url`: Service endpoint, or the public NWIS service if `None`
    /// * `to_cms`: Whether to convert discharge to cubic metres per second
    pub fn new(service_url: Option<&url::Url>, to_cms: bool) -> Self {
        Self {
            reqwest_client: reqwest::Client::new(),
            service_url: service_url
                .map(|url| url.to_string())
                .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string()),
            to_cms,
        }
    }
}

impl ObservationSource for UsgsSource {
    /// Fetch the discharge series of a gage over a window.
    fn fetch(
        &self,
        gage: &GageId,
        window: &ObservationWindow,
    ) -> impl Future<Output = Result<ObservationSeries, EnsembleError>> + Send {
        let (start, end) = (window.start.to_rfc3339(), window.end.to_rfc3339());
        let request = self.reqwest_client.get(&self.service_url).query(&[
            ("format", "json"),
            ("sites", gage.as_str()),
            ("parameterCd", DISCHARGE),
            ("startDT", start.as_str()),
            ("endDT", end.as_str()),
        ]);
        let gage = gage.clone();
        let to_cms = self.to_cms;
        async move {
            // Send the request
            let response = request
                .send()
                .await
                .map_err(|source| EnsembleError::ObservationRequest {
                    gage: gage.clone(),
                    source,
                })?;
            if !response.status().is_success() {
                return Err(EnsembleError::ObservationStatus {
                    gage,
                    status: response.status().as_u16(),
                });
            }
            let body = response
                .bytes()
                .await
                .map_err(|source| EnsembleError::ObservationRequest {
                    gage: gage.clone(),
                    source,
                })?;
            parse_iv_response(&gage, &body, to_cms)
        }
    }
}

#[derive(Deserialize)]
struct IvResponse {
    value: IvValue,
}

#[derive(Deserialize)]
struct IvValue {
    #[serde(rename = "timeSeries")]
    time_series: Vec<IvTimeSeries>,
}

#[derive(Deserialize)]
struct IvTimeSeries {
    variable: IvVariable,
    values: Vec<IvValues>,
}

#[derive(Deserialize)]
struct IvVariable {
    #[serde(rename = "noDataValue")]
    no_data_value: Option<f64>,
}

#[derive(Deserialize)]
struct IvValues {
    value: Vec<IvPoint>,
}

#[derive(Deserialize)]
struct IvPoint {
    value: String,
    #[serde(rename = "dateTime")]
    date_time: String,
}

/// Parse an NWIS instantaneous values response into a discharge series.
///
/// Points carrying the series' no-data value are dropped.
pub fn parse_iv_response(
    gage: &GageId,
    body: &[u8],
    to_cms: bool,
) -> Result<ObservationSeries, EnsembleError> {
    let format_error = |reason: String| EnsembleError::ObservationFormat {
        gage: gage.clone(),
        reason,
    };
    let response: IvResponse =
        serde_json::from_slice(body).map_err(|err| format_error(err.to_string()))?;
    let series = response
        .value
        .time_series
        .into_iter()
        .next()
        .ok_or_else(|| format_error("no time series in response".to_string()))?;
    let no_data = series.variable.no_data_value;
    let scale = if to_cms { CFS_TO_CMS } else { 1.0 };

    let mut times = Vec::new();
    let mut values = Vec::new();
    for point in series.values.into_iter().flat_map(|values| values.value) {
        let value: f64 = point
            .value
            .parse()
            .map_err(|_| format_error(format!("invalid value '{}'", point.value)))?;
        if Some(value) == no_data {
            continue;
        }
        times.push(Timestamp::parse_rfc3339(&point.date_time).map_err(format_error)?);
        values.push(value * scale);
    }
    Ok(ObservationSeries {
        gage: gage.clone(),
        times,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"{
        "name": "ns1:timeSeriesResponseType",
        "value": {
            "queryInfo": {"queryURL": "http://waterservices.usgs.gov/nwis/iv/"},
            "timeSeries": [{
                "sourceInfo": {"siteName": "POTOMAC RIVER NEAR WASH, DC LITTLE FALLS PUMP STA"},
                "variable": {
                    "variableCode": [{"value": "00060"}],
                    "noDataValue": -999999.0
                },
                "values": [{
                    "value": [
                        {"value": "1000", "qualifiers": ["P"], "dateTime": "2023-01-01T00:00:00.000-05:00"},
                        {"value": "-999999", "qualifiers": ["P", "Ice"], "dateTime": "2023-01-01T00:15:00.000-05:00"},
                        {"value": "2000", "qualifiers": ["P"], "dateTime": "2023-01-01T00:30:00.000-05:00"}
                    ]
                }]
            }]
        }
    }"#;

    #[test]
    fn parse_response() {
        let gage = GageId::from("01646500");
        let series = parse_iv_response(&gage, RESPONSE.as_bytes(), false).unwrap();
        assert_eq!(gage, series.gage);
        assert_eq!(vec![1000.0, 2000.0], series.values);
        assert_eq!(
            vec![
                Timestamp::parse_rfc3339("2023-01-01T05:00:00Z").unwrap(),
                Timestamp::parse_rfc3339("2023-01-01T05:30:00Z").unwrap()
            ],
            series.times
        );
    }

    #[test]
    fn parse_response_to_cms() {
        let gage = GageId::from("01646500");
        let series = parse_iv_response(&gage, RESPONSE.as_bytes(), true).unwrap();
        assert_eq!(vec![1000.0 * CFS_TO_CMS, 2000.0 * CFS_TO_CMS], series.values);
    }

    #[test]
    fn parse_empty_response() {
        let gage = GageId::from("01646500");
        let body = br#"{"value": {"timeSeries": []}}"#;
        let err = parse_iv_response(&gage, body, true).unwrap_err();
        assert!(matches!(err, EnsembleError::ObservationFormat { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn parse_invalid_value() {
        let gage = GageId::from("01646500");
        let body = br#"{"value": {"timeSeries": [{"variable": {}, "values": [{"value": [
            {"value": "Eqp", "dateTime": "2023-01-01T00:00:00.000-05:00"}
        ]}]}]}}"#;
        let err = parse_iv_response(&gage, body, true).unwrap_err();
        assert_eq!(
            "observation response for gage 01646500 is not valid: invalid value 'Eqp'",
            err.to_string()
        );
    }

    #[test]
    fn parse_not_json() {
        let gage = GageId::from("01646500");
        assert!(parse_iv_response(&gage, b"<html>", true).is_err());
    }

    #[test]
    fn default_service_url() {
        assert_eq!(DEFAULT_SERVICE_URL, UsgsSource::new(None, true).service_url);
        let url = url::Url::parse("http://localhost:8080/iv/").unwrap();
        assert_eq!(
            "http://localhost:8080/iv/",
            UsgsSource::new(Some(&url), true).service_url
        );
    }
}
