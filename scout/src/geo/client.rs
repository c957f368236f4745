use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;

use crate::discovery::Location;
use crate::infrastructure::config::GeoSettings;

const FIELDS: &str = "status,message,country,countryCode,city,lat,lon";

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geo request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("geo service returned HTTP {0}")]
    Status(u16),
    #[error("geo service rejected lookup: {0}")]
    Rejected(String),
    #[error("geo lookup timed out")]
    Timeout,
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Result<Location, GeoError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: String,
    #[serde(default)]
    country_code: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    lat: f64,
    #[serde(default)]
    lon: f64,
}

/// ip-api compatible lookup service.
pub struct IpApiClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl IpApiClient {
    pub fn new(settings: &GeoSettings) -> Result<Self, GeoError> {
        let client = Client::builder().timeout(settings.request_timeout()).build()?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        })
    }

    fn url_for(&self, ip: IpAddr) -> String {
        match &self.api_key {
            Some(key) => format!(
                "{}/json/{}?fields={}&key={}",
                self.base_url,
                ip,
                FIELDS,
                key.expose_secret()
            ),
            None => format!("{}/json/{}?fields={}", self.base_url, ip, FIELDS),
        }
    }
}

#[async_trait]
impl GeoLookup for IpApiClient {
    async fn locate(&self, ip: IpAddr) -> Result<Location, GeoError> {
        let response = self.client.get(self.url_for(ip)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GeoError::Status(status.as_u16()));
        }

        let body: IpApiResponse = response.json().await?;
        if body.status != "success" {
            return Err(GeoError::Rejected(
                body.message.unwrap_or_else(|| body.status.clone()),
            ));
        }

        Ok(Location {
            country: body.country,
            country_code: body.country_code,
            city: body.city,
            lat: body.lat,
            lon: body.lon,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: String) -> GeoSettings {
        GeoSettings {
            base_url,
            ..GeoSettings::default()
        }
    }

    #[tokio::test]
    async fn successful_lookup_maps_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/8.8.8.8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "country": "United States",
                "countryCode": "US",
                "city": "Mountain View",
                "lat": 37.4,
                "lon": -122.1
            })))
            .mount(&server)
            .await;

        let client = IpApiClient::new(&settings(server.uri())).unwrap();
        let loc = client.locate("8.8.8.8".parse().unwrap()).await.unwrap();
        assert_eq!(loc.country_code, "US");
        assert_eq!(loc.city, "Mountain View");
        assert_eq!(loc.lat, 37.4);
    }

    #[tokio::test]
    async fn fail_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "fail",
                "message": "reserved range"
            })))
            .mount(&server)
            .await;

        let client = IpApiClient::new(&settings(server.uri())).unwrap();
        let err = client.locate("1.2.3.4".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, GeoError::Rejected(ref m) if m == "reserved range"));
    }

    #[tokio::test]
    async fn rate_limited_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = IpApiClient::new(&settings(server.uri())).unwrap();
        let err = client.locate("1.2.3.4".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, GeoError::Status(429)));
    }

    #[tokio::test]
    async fn api_key_is_sent_as_query_parameter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("key", "s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success", "country": "Germany", "countryCode": "DE",
                "city": "Berlin", "lat": 52.5, "lon": 13.4
            })))
            .mount(&server)
            .await;

        let mut s = settings(server.uri());
        s.api_key = Some(SecretString::from(String::from("s3cret")));
        let client = IpApiClient::new(&s).unwrap();
        assert!(client.locate("1.2.3.4".parse().unwrap()).await.is_ok());
    }
}
