//! Offline geocoding for major Seoul stations, plus district centres.
//!
//! The landmark table answers the most common stop names without a network
//! call and keeps the pipeline usable with no API key. District centres bias
//! online searches when the source catalog gives no `center`.

use crate::error::FetchError;
use crate::pipeline::resolve::{normalize_key, GeocodeMatch, GeocodeProvider, GeocodeQuery, MatchType};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// `(name, district, lat, lon)`
const LANDMARKS: &[(&str, &str, f64, f64)] = &[
    ("강남역", "강남구", 37.4979, 127.0276),
    ("서울역", "용산구", 37.5547, 126.9707),
    ("용산역", "용산구", 37.5298, 126.9648),
    ("홍대입구역", "마포구", 37.5571, 126.9246),
    ("잠실역", "송파구", 37.5132, 127.1001),
    ("신촌역", "서대문구", 37.5599, 126.9422),
    ("여의도역", "영등포구", 37.5216, 126.9244),
    ("영등포역", "영등포구", 37.5156, 126.9074),
    ("사당역", "동작구", 37.4765, 126.9816),
    ("건대입구역", "광진구", 37.5403, 127.0702),
    ("왕십리역", "성동구", 37.5614, 127.0378),
    ("합정역", "마포구", 37.5495, 126.9138),
    ("신림역", "관악구", 37.4842, 126.9293),
    ("노원역", "노원구", 37.6558, 127.0617),
    ("종로3가역", "종로구", 37.5710, 126.9920),
    ("을지로입구역", "중구", 37.5660, 126.9825),
    ("시청역", "중구", 37.5659, 126.9771),
    ("교대역", "서초구", 37.4934, 127.0145),
    ("역삼역", "강남구", 37.5006, 127.0366),
    ("선릉역", "강남구", 37.5045, 127.0490),
    ("삼성역", "강남구", 37.5089, 127.0630),
    ("종합운동장역", "송파구", 37.5107, 127.0739),
    ("구로디지털단지역", "구로구", 37.4851, 126.9015),
    ("가산디지털단지역", "금천구", 37.4816, 126.8828),
    ("문래역", "영등포구", 37.5178, 126.8945),
    ("당산역", "영등포구", 37.5349, 126.9025),
];

/// The 25 autonomous districts of Seoul, `(name, lat, lon)`.
const DISTRICTS: &[(&str, f64, f64)] = &[
    ("종로구", 37.5735, 126.9790),
    ("중구", 37.5641, 126.9979),
    ("용산구", 37.5326, 126.9907),
    ("성동구", 37.5634, 127.0369),
    ("광진구", 37.5385, 127.0823),
    ("동대문구", 37.5744, 127.0396),
    ("중랑구", 37.6063, 127.0927),
    ("성북구", 37.5894, 127.0167),
    ("강북구", 37.6396, 127.0257),
    ("도봉구", 37.6688, 127.0471),
    ("노원구", 37.6543, 127.0568),
    ("은평구", 37.6027, 126.9291),
    ("서대문구", 37.5791, 126.9368),
    ("마포구", 37.5663, 126.9019),
    ("양천구", 37.5170, 126.8666),
    ("강서구", 37.5510, 126.8495),
    ("구로구", 37.4954, 126.8874),
    ("금천구", 37.4569, 126.8955),
    ("영등포구", 37.5264, 126.8963),
    ("동작구", 37.5124, 126.9393),
    ("관악구", 37.4784, 126.9516),
    ("서초구", 37.4837, 127.0324),
    ("강남구", 37.5172, 127.0473),
    ("송파구", 37.5145, 127.1059),
    ("강동구", 37.5301, 127.1238),
];

static DISTRICT_CENTERS: Lazy<HashMap<&'static str, (f64, f64)>> = Lazy::new(|| {
    DISTRICTS
        .iter()
        .map(|&(name, lat, lon)| (name, (lat, lon)))
        .collect()
});

static LANDMARK_KEYS: Lazy<Vec<(String, usize)>> = Lazy::new(|| {
    LANDMARKS
        .iter()
        .enumerate()
        .map(|(idx, (name, ..))| (normalize_key(name), idx))
        .collect()
});

/// Centre of a Seoul district, by name (`용산구`, `서울 용산구`, `서울특별시 용산구`).
pub fn district_center(name: &str) -> Option<(f64, f64)> {
    let last = name.split_whitespace().last()?;
    DISTRICT_CENTERS.get(last).copied()
}

/// The district table's name for `name`, with any city prefix dropped.
pub fn district_name(name: &str) -> Option<&'static str> {
    let last = name.split_whitespace().last()?;
    DISTRICTS.iter().map(|&(d, ..)| d).find(|d| *d == last)
}

/// Every Seoul district name, in table order.
pub fn seoul_districts() -> impl Iterator<Item = &'static str> {
    DISTRICTS.iter().map(|&(name, ..)| name)
}

/// Geocoder over the built-in landmark table.
#[derive(Debug, Default, Clone, Copy)]
pub struct LandmarkGeocoder;

impl LandmarkGeocoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GeocodeProvider for LandmarkGeocoder {
    fn name(&self) -> &str {
        "landmarks"
    }

    async fn lookup(&self, query: &GeocodeQuery) -> Result<Vec<GeocodeMatch>, FetchError> {
        let wanted = normalize_key(&query.name);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        // Exact names first, then the longest landmark named inside the query
        // ("서울역 1번 출구" → 서울역).
        let mut found: Vec<(MatchType, usize, usize)> = LANDMARK_KEYS
            .iter()
            .filter_map(|(key, idx)| {
                if *key == wanted {
                    Some((MatchType::Exact, key.chars().count(), *idx))
                } else if wanted.contains(key.as_str()) {
                    Some((MatchType::Partial, key.chars().count(), *idx))
                } else {
                    None
                }
            })
            .collect();
        found.sort_by_key(|&(mt, len, idx)| (mt != MatchType::Exact, std::cmp::Reverse(len), idx));

        Ok(found
            .into_iter()
            .map(|(match_type, _, idx)| {
                let (name, district, lat, lon) = LANDMARKS[idx];
                GeocodeMatch {
                    lat,
                    lon,
                    name: name.to_string(),
                    address: format!("서울 {district}"),
                    match_type,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::in_bounds;

    fn query(name: &str) -> GeocodeQuery {
        GeocodeQuery {
            name: name.into(),
            address_hint: None,
            area_name: "중구".into(),
            center: None,
        }
    }

    #[test]
    fn every_entry_is_inside_the_service_area() {
        assert!(LANDMARKS.iter().all(|&(_, _, lat, lon)| in_bounds(lat, lon)));
        assert!(DISTRICTS.iter().all(|&(_, lat, lon)| in_bounds(lat, lon)));
        assert_eq!(DISTRICTS.len(), 25);
    }

    #[test]
    fn district_lookup_accepts_city_prefix() {
        assert_eq!(district_center("용산구"), Some((37.5326, 126.9907)));
        assert_eq!(district_center("서울특별시 중구"), Some((37.5641, 126.9979)));
        assert_eq!(district_center("수원시"), None);
    }

    #[test]
    fn district_names() {
        assert_eq!(district_name("서울특별시 강남구"), Some("강남구"));
        assert_eq!(district_name("용산구청"), None);
        assert_eq!(seoul_districts().count(), 25);
    }

    #[tokio::test]
    async fn exact_station_name() {
        let found = LandmarkGeocoder.lookup(&query(" 시청 역 ")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].match_type, MatchType::Exact);
        assert_eq!(found[0].address, "서울 중구");
    }

    #[tokio::test]
    async fn station_named_inside_longer_stop() {
        let found = LandmarkGeocoder.lookup(&query("서울역 1번 출구")).await.unwrap();
        assert_eq!(found[0].name, "서울역");
        assert_eq!(found[0].match_type, MatchType::Partial);
    }

    #[tokio::test]
    async fn unknown_names_are_a_definitive_miss() {
        let found = LandmarkGeocoder.lookup(&query("청파동 주민센터")).await.unwrap();
        assert!(found.is_empty());
    }
}
