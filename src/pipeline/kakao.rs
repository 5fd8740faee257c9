//! Kakao Local keyword search as a [`GeocodeProvider`].
//!
//! `GET https://dapi.kakao.com/v2/local/search/keyword.json` with
//! `Authorization: KakaoAK {key}`. When the authority has a centre, the
//! search is biased with `x`, `y` and `radius`.

use crate::error::FetchError;
use crate::pipeline::fetch::classify_status;
use crate::pipeline::resolve::{normalize_key, GeocodeMatch, GeocodeProvider, GeocodeQuery, MatchType};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const KAKAO_KEYWORD_URL: &str = "https://dapi.kakao.com/v2/local/search/keyword.json";

/// Bias radius around the authority centre, in metres.
const SEARCH_RADIUS_M: u32 = 5_000;
const RESULT_SIZE: u32 = 5;

#[derive(Debug, Deserialize)]
struct KeywordResponse {
    #[serde(default)]
    documents: Vec<KeywordDocument>,
}

#[derive(Debug, Deserialize)]
struct KeywordDocument {
    place_name: String,
    #[serde(default)]
    address_name: String,
    #[serde(default)]
    road_address_name: String,
    /// Longitude, as a decimal string.
    x: String,
    /// Latitude, as a decimal string.
    y: String,
}

pub struct KakaoGeocoder {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    timeout_secs: u64,
}

impl KakaoGeocoder {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FetchError::Blocked {
                url: KAKAO_KEYWORD_URL.to_string(),
                reason: format!("HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: KAKAO_KEYWORD_URL.to_string(),
            timeout_secs,
        })
    }

    /// Build from `KAKAO_API_KEY`; `None` when the key is not set.
    pub fn from_env(timeout_secs: u64) -> Option<Self> {
        let key = std::env::var("KAKAO_API_KEY").ok().filter(|k| !k.trim().is_empty())?;
        match Self::new(key.trim(), timeout_secs) {
            Ok(g) => Some(g),
            Err(e) => {
                tracing::warn!("Kakao geocoder disabled: {}", e);
                None
            }
        }
    }

    /// Point at another endpoint (a local mock server, for instance).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Search text sent to Kakao: the area name narrows homonymous stations.
fn search_text(query: &GeocodeQuery) -> String {
    let mut text = String::new();
    if !query.area_name.is_empty() && !query.name.contains(&query.area_name) {
        text.push_str(&query.area_name);
        text.push(' ');
    }
    text.push_str(query.name.trim());
    text
}

fn to_matches(query: &GeocodeQuery, response: KeywordResponse) -> Vec<GeocodeMatch> {
    let wanted = normalize_key(&query.name);
    response
        .documents
        .into_iter()
        .filter_map(|doc| {
            let lon = doc.x.trim().parse::<f64>().ok()?;
            let lat = doc.y.trim().parse::<f64>().ok()?;
            let match_type = if normalize_key(&doc.place_name) == wanted {
                MatchType::Exact
            } else {
                MatchType::Partial
            };
            let address = if doc.address_name.is_empty() {
                doc.road_address_name
            } else {
                doc.address_name
            };
            Some(GeocodeMatch {
                lat,
                lon,
                name: doc.place_name,
                address,
                match_type,
            })
        })
        .collect()
}

#[async_trait]
impl GeocodeProvider for KakaoGeocoder {
    fn name(&self) -> &str {
        "kakao"
    }

    async fn lookup(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, FetchError> {
        let mut params = vec![
            ("query", search_text(query)),
            ("size", RESULT_SIZE.to_string()),
        ];
        if let Some((lat, lon)) = query.center {
            params.push(("x", lon.to_string()));
            params.push(("y", lat.to_string()));
            params.push(("radius", SEARCH_RADIUS_M.to_string()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .header(AUTHORIZATION, format!("KakaoAK {}", self.api_key))
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    FetchError::Timeout {
                        url: self.endpoint.clone(),
                        secs: self.timeout_secs,
                    }
                } else {
                    FetchError::Blocked {
                        url: self.endpoint.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        classify_status(&self.endpoint, response.status().as_u16())?;

        let body: KeywordResponse = response.json().await.map_err(|e| FetchError::Blocked {
            url: self.endpoint.clone(),
            reason: format!("unexpected response body: {e}"),
        })?;
        let matches = to_matches(query, body);
        debug!("kakao: '{}' → {} matches", query.name, matches.len());
        Ok(matches)
    }
}
