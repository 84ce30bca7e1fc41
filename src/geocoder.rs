use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::StructuredAddress;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const INTERSECT_PARAM: &str = "intersect_with";

/// Confidence of a resolved coordinate, ordered `House > Street > Settlement > Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Precision {
    Unknown,
    Settlement,
    Street,
    House,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeocodeResult {
    pub found: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub precision: Precision,
}

impl GeocodeResult {
    pub fn not_found() -> Self {
        Self {
            found: false,
            latitude: 0.0,
            longitude: 0.0,
            precision: Precision::Unknown,
        }
    }

    fn located(feature: &ProviderFeature, tier: Tier) -> Self {
        Self {
            found: true,
            latitude: feature.latitude,
            longitude: feature.longitude,
            precision: tier.precision(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    House,
    Street,
    Settlement,
}

impl Tier {
    pub const CASCADE: [Tier; 3] = [Tier::House, Tier::Street, Tier::Settlement];

    pub fn precision(&self) -> Precision {
        match self {
            Tier::House => Precision::House,
            Tier::Street => Precision::Street,
            Tier::Settlement => Precision::Settlement,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::House => "house",
            Tier::Street => "street",
            Tier::Settlement => "settlement",
        }
    }
}

/// Provider category filter for each tier.
#[derive(Clone, Debug)]
pub struct TierCategories {
    pub house: String,
    pub street: String,
    pub settlement: String,
}

impl Default for TierCategories {
    fn default() -> Self {
        Self {
            house: "adr_address".into(),
            street: "adr_street".into(),
            settlement: "adm_settlement".into(),
        }
    }
}

/// Immutable geocoder configuration, built once and handed to the client.
#[derive(Clone, Debug)]
pub struct GeocoderSettings {
    pub api_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
    pub region: Option<String>,
    pub intersect: Option<String>,
    pub large_settlements: Vec<String>,
    pub categories: TierCategories,
}

impl GeocoderSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            api_url: config.geocoder_api_url.clone(),
            api_key: config.geocoder_api_key.clone(),
            request_timeout: Duration::from_secs(config.geocoder_timeout_secs),
            region: config.geocoder_region.clone(),
            intersect: config.geocoder_intersect.clone(),
            large_settlements: config.large_settlements.clone(),
            categories: TierCategories::default(),
        }
    }

    pub fn category(&self, tier: Tier) -> &str {
        match tier {
            Tier::House => &self.categories.house,
            Tier::Street => &self.categories.street,
            Tier::Settlement => &self.categories.settlement,
        }
    }

    /// Case-insensitive substring test against the exclusion list.
    pub fn is_large_settlement(&self, settlement: &str) -> bool {
        let settlement = settlement.trim().to_lowercase();
        self.large_settlements
            .iter()
            .map(|name| name.trim().to_lowercase())
            .any(|name| !name.is_empty() && settlement.contains(&name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierQuery {
    pub tier: Tier,
    pub text: String,
    pub categories: String,
}

/// First feature of a provider answer, already in `(lat, lon)` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFeature {
    pub latitude: f64,
    pub longitude: f64,
    pub settlement: Option<String>,
    pub region: Option<String>,
}

#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// `Ok(None)` means the provider answered with no candidates.
    async fn query(&self, request: &TierQuery) -> AppResult<Option<ProviderFeature>>;
}

enum TierPlan {
    Run(TierQuery),
    NotApplicable,
    LargeSettlementSkip,
}

enum Mismatch {
    Settlement {
        expected: String,
        returned: Option<String>,
    },
    Region {
        expected: String,
        returned: Option<String>,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (field, expected, returned) = match self {
            Mismatch::Settlement { expected, returned } => ("settlement", expected, returned),
            Mismatch::Region { expected, returned } => ("region", expected, returned),
        };
        write!(
            f,
            "{field} mismatch: expected {expected:?}, provider returned {:?}",
            returned.as_deref().unwrap_or("<none>")
        )
    }
}

#[derive(Clone)]
pub struct GeocodingClient {
    provider: Arc<dyn GeocodeProvider>,
    settings: Arc<GeocoderSettings>,
}

impl GeocodingClient {
    pub fn new(settings: GeocoderSettings) -> AppResult<Self> {
        if settings.api_key.is_none() {
            warn!(target: "geocoder", "no geocoder API key configured; provider calls will likely be rejected");
        }
        let provider = HttpGeocodeProvider::new(&settings)?;
        Ok(Self::with_provider(Arc::new(provider), settings))
    }

    pub fn with_provider(provider: Arc<dyn GeocodeProvider>, settings: GeocoderSettings) -> Self {
        Self {
            provider,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &GeocoderSettings {
        &self.settings
    }

    /// Runs the house → street → settlement cascade and returns the first tier
    /// whose answer validates. Transport, decoding and validation failures only
    /// fail the tier; this never errors and never retries.
    pub async fn resolve(&self, address: &StructuredAddress) -> GeocodeResult {
        let Some(settlement) = address.settlement.as_deref() else {
            debug!(target: "geocoder", "address has no settlement to validate against");
            return GeocodeResult::not_found();
        };

        for tier in Tier::CASCADE {
            let query = match self.plan(tier, settlement, address) {
                TierPlan::Run(query) => query,
                TierPlan::NotApplicable => continue,
                TierPlan::LargeSettlementSkip => {
                    debug!(
                        target: "geocoder",
                        settlement,
                        "settlement fallback disabled for large settlement"
                    );
                    break;
                }
            };

            match self.provider.query(&query).await {
                Ok(Some(feature)) => match self.validate(settlement, &feature) {
                    Ok(()) => {
                        debug!(
                            target: "geocoder",
                            tier = tier.as_str(),
                            lat = feature.latitude,
                            lon = feature.longitude,
                            "tier validated"
                        );
                        return GeocodeResult::located(&feature, tier);
                    }
                    Err(mismatch) => {
                        debug!(target: "geocoder", tier = tier.as_str(), %mismatch, "tier rejected by validation");
                    }
                },
                Ok(None) => {
                    debug!(target: "geocoder", tier = tier.as_str(), "tier returned no candidates");
                }
                Err(err) => {
                    warn!(target: "geocoder", tier = tier.as_str(), ?err, "tier query failed");
                }
            }
        }

        GeocodeResult::not_found()
    }

    fn plan(&self, tier: Tier, settlement: &str, address: &StructuredAddress) -> TierPlan {
        let text = match (tier, address.street.as_deref(), address.house.as_deref()) {
            (Tier::House, Some(street), Some(house)) => format!("{settlement}, {street} {house}"),
            (Tier::Street, Some(street), _) => format!("{settlement}, {street}"),
            (Tier::Settlement, _, _) => {
                if self.settings.is_large_settlement(settlement) {
                    return TierPlan::LargeSettlementSkip;
                }
                settlement.to_string()
            }
            _ => return TierPlan::NotApplicable,
        };
        TierPlan::Run(TierQuery {
            tier,
            text,
            categories: self.settings.category(tier).to_string(),
        })
    }

    fn validate(&self, expected: &str, feature: &ProviderFeature) -> Result<(), Mismatch> {
        if !feature
            .settlement
            .as_deref()
            .is_some_and(|returned| names_overlap(expected, returned))
        {
            return Err(Mismatch::Settlement {
                expected: expected.to_string(),
                returned: feature.settlement.clone(),
            });
        }
        if let Some(region) = self.settings.region.as_deref() {
            if !feature
                .region
                .as_deref()
                .is_some_and(|returned| names_overlap(region, returned))
            {
                return Err(Mismatch::Region {
                    expected: region.to_string(),
                    returned: feature.region.clone(),
                });
            }
        }
        Ok(())
    }
}

fn names_overlap(expected: &str, returned: &str) -> bool {
    let expected = expected.trim().to_lowercase();
    let returned = returned.trim().to_lowercase();
    !expected.is_empty()
        && !returned.is_empty()
        && (expected.contains(&returned) || returned.contains(&expected))
}

pub struct HttpGeocodeProvider {
    http: Client,
    endpoint: Url,
    api_key: Option<SecretString>,
    intersect: Option<String>,
}

impl HttpGeocodeProvider {
    pub fn new(settings: &GeocoderSettings) -> AppResult<Self> {
        let endpoint = Url::parse(&settings.api_url)
            .map_err(|err| AppError::Config(format!("invalid geocoder endpoint: {err}")))?;
        let http = Client::builder()
            .user_agent("address-geomap/0.1.0")
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key: settings.api_key.clone(),
            intersect: settings.intersect.clone(),
        })
    }

    fn request_url(&self, request: &TierQuery) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("text", &request.text);
            if let Some(key) = &self.api_key {
                pairs.append_pair("key", key.expose_secret());
            }
            pairs
                .append_pair("limit", "1")
                .append_pair("categories", &request.categories);
            if let Some(intersect) = &self.intersect {
                pairs.append_pair(INTERSECT_PARAM, intersect);
            }
        }
        url
    }
}

#[async_trait]
impl GeocodeProvider for HttpGeocodeProvider {
    async fn query(&self, request: &TierQuery) -> AppResult<Option<ProviderFeature>> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Response {
            Collection { features: Vec<Feature> },
            Single(Feature),
        }

        #[derive(Deserialize)]
        struct Feature {
            geo_centroid: Option<Centroid>,
            #[serde(default)]
            properties: Properties,
        }

        #[derive(Deserialize)]
        struct Centroid {
            coordinates: Vec<f64>,
        }

        #[derive(Default, Deserialize)]
        struct Properties {
            name: Option<String>,
            settlement: Option<String>,
            #[serde(alias = "region")]
            level1: Option<String>,
        }

        let response = self
            .http
            .get(self.request_url(request))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        let feature = match serde_json::from_str::<Response>(&body)? {
            Response::Collection { features } => features.into_iter().next(),
            Response::Single(feature) => Some(feature),
        };
        let Some(feature) = feature else {
            return Ok(None);
        };
        let Some((longitude, latitude)) = feature
            .geo_centroid
            .and_then(|centroid| match centroid.coordinates.as_slice() {
                [lon, lat, ..] => Some((*lon, *lat)),
                _ => None,
            })
        else {
            return Err(AppError::Provider(
                "feature is missing a centroid coordinate pair".into(),
            ));
        };

        let Properties {
            name,
            settlement,
            level1,
        } = feature.properties;
        let settlement = match request.tier {
            Tier::Settlement => settlement.or(name),
            _ => settlement,
        };

        Ok(Some(ProviderFeature {
            latitude,
            longitude,
            settlement,
            region: level1,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::address::normalize;

    type Scripted = Result<Option<ProviderFeature>, String>;

    #[derive(Default)]
    struct ScriptedProvider {
        responses: Mutex<HashMap<Tier, Scripted>>,
        calls: Mutex<Vec<TierQuery>>,
    }

    impl ScriptedProvider {
        fn answer(self, tier: Tier, response: Scripted) -> Self {
            self.responses.lock().insert(tier, response);
            self
        }

        fn calls(&self) -> Vec<TierQuery> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GeocodeProvider for ScriptedProvider {
        async fn query(&self, request: &TierQuery) -> AppResult<Option<ProviderFeature>> {
            self.calls.lock().push(request.clone());
            match self.responses.lock().get(&request.tier).cloned() {
                Some(Ok(feature)) => Ok(feature),
                Some(Err(message)) => Err(AppError::Provider(message)),
                None => Ok(None),
            }
        }
    }

    fn settings() -> GeocoderSettings {
        GeocoderSettings {
            api_url: "http://127.0.0.1:9/geocode.json".into(),
            api_key: Some(SecretString::from("test-key".to_string())),
            request_timeout: Duration::from_secs(2),
            region: None,
            intersect: None,
            large_settlements: vec!["Харків".into(), "Київ".into()],
            categories: TierCategories::default(),
        }
    }

    fn feature(lat: f64, lon: f64, settlement: &str) -> ProviderFeature {
        ProviderFeature {
            latitude: lat,
            longitude: lon,
            settlement: Some(settlement.into()),
            region: Some("Харківська".into()),
        }
    }

    fn client(provider: &Arc<ScriptedProvider>, settings: GeocoderSettings) -> GeocodingClient {
        GeocodingClient::with_provider(provider.clone(), settings)
    }

    #[tokio::test]
    async fn house_tier_wins_over_valid_street_tier() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .answer(Tier::House, Ok(Some(feature(50.05, 36.32, "Циркуни"))))
                .answer(Tier::Street, Ok(Some(feature(50.06, 36.33, "Циркуни")))),
        );
        let result = client(&provider, settings())
            .resolve(&normalize("с. Циркуни, вул. Сонячна, 12"))
            .await;

        assert!(result.found);
        assert_eq!(result.precision, Precision::House);
        assert_eq!((result.latitude, result.longitude), (50.05, 36.32));
        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].text, "Циркуни, вул. Сонячна 12");
        assert_eq!(calls[0].categories, "adr_address");
    }

    #[tokio::test]
    async fn falls_through_to_street_when_house_mismatches() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .answer(Tier::House, Ok(Some(feature(49.99, 36.23, "Мала Данилівка"))))
                .answer(Tier::Street, Ok(Some(feature(50.06, 36.33, "циркуни")))),
        );
        let result = client(&provider, settings())
            .resolve(&normalize("с. Циркуни, вул. Сонячна, 12"))
            .await;

        assert_eq!(result.precision, Precision::Street);
        let calls = provider.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].text, "Циркуни, вул. Сонячна");
        assert_eq!(calls[1].categories, "adr_street");
    }

    #[tokio::test]
    async fn network_errors_only_fail_the_tier() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .answer(Tier::House, Err("connection reset".into()))
                .answer(Tier::Street, Err("timeout".into()))
                .answer(Tier::Settlement, Ok(Some(feature(50.07, 36.31, "Циркуни")))),
        );
        let result = client(&provider, settings())
            .resolve(&normalize("с. Циркуни, вул. Сонячна, 12"))
            .await;

        assert_eq!(result.precision, Precision::Settlement);
        assert_eq!(provider.calls().len(), 3);
        assert_eq!(provider.calls()[2].text, "Циркуни");
    }

    #[tokio::test]
    async fn large_settlement_never_falls_back_to_centroid() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .answer(Tier::House, Ok(None))
                .answer(Tier::Street, Err("boom".into()))
                .answer(Tier::Settlement, Ok(Some(feature(49.99, 36.23, "Харків")))),
        );
        let result = client(&provider, settings())
            .resolve(&normalize("м. Харків, вул. Невідома, 7"))
            .await;

        assert_eq!(result, GeocodeResult::not_found());
        let tiers: Vec<Tier> = provider.calls().iter().map(|c| c.tier).collect();
        assert_eq!(tiers, vec![Tier::House, Tier::Street]);
    }

    #[tokio::test]
    async fn large_settlement_match_is_case_insensitive_substring() {
        let settings = settings();
        assert!(settings.is_large_settlement("ХАРКІВ"));
        assert!(settings.is_large_settlement("місто Київ"));
        assert!(!settings.is_large_settlement("Циркуни"));
    }

    #[tokio::test]
    async fn settlement_only_address_queries_one_tier() {
        let provider = Arc::new(
            ScriptedProvider::default()
                .answer(Tier::Settlement, Ok(Some(feature(50.07, 36.31, "Циркуни")))),
        );
        let result = client(&provider, settings())
            .resolve(&normalize("61037, с. Циркуни"))
            .await;

        assert_eq!(result.precision, Precision::Settlement);
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(provider.calls()[0].categories, "adm_settlement");
    }

    #[tokio::test]
    async fn missing_settlement_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::default());
        let result = client(&provider, settings())
            .resolve(&normalize("вул. Сонячна, 12"))
            .await;

        assert!(!result.found);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn region_constraint_rejects_other_regions() {
        let mut constrained = settings();
        constrained.region = Some("Полтавська".into());
        let provider = Arc::new(
            ScriptedProvider::default()
                .answer(Tier::House, Ok(Some(feature(50.05, 36.32, "Циркуни")))),
        );
        let result = client(&provider, constrained)
            .resolve(&normalize("с. Циркуни, вул. Сонячна, 12"))
            .await;

        assert!(!result.found);
        assert_eq!(result.precision, Precision::Unknown);
        assert_eq!(provider.calls().len(), 3);
    }

    #[test]
    fn precision_orders_by_confidence() {
        assert!(Precision::House > Precision::Street);
        assert!(Precision::Street > Precision::Settlement);
        assert!(Precision::Settlement > Precision::Unknown);
    }

    #[test]
    fn names_overlap_either_direction() {
        assert!(names_overlap("Циркуни", "с. Циркуни"));
        assert!(names_overlap("Харківська область", "харківська"));
        assert!(!names_overlap("Циркуни", ""));
        assert!(!names_overlap("Циркуни", "Руська Лозова"));
    }

    fn http_settings(server: &Server) -> GeocoderSettings {
        let mut settings = settings();
        settings.api_url = server.url("/geocode.json").to_string();
        settings.intersect = Some("POLYGON((36 49,37 49,37 50,36 50,36 49))".into());
        settings
    }

    fn house_query() -> TierQuery {
        TierQuery {
            tier: Tier::House,
            text: "Циркуни, вул. Сонячна 12".into(),
            categories: "adr_address".into(),
        }
    }

    #[tokio::test]
    async fn http_provider_swaps_coordinates_and_sends_filters() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of!(
                request::method("GET"),
                request::path("/geocode.json"),
                request::query(url_decoded(contains(("text", "Циркуни, вул. Сонячна 12")))),
                request::query(url_decoded(contains(("key", "test-key")))),
                request::query(url_decoded(contains(("limit", "1")))),
                request::query(url_decoded(contains(("categories", "adr_address")))),
                request::query(url_decoded(contains((
                    INTERSECT_PARAM,
                    "POLYGON((36 49,37 49,37 50,36 50,36 49))"
                )))),
            ))
            .respond_with(json_encoded(json!({
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geo_centroid": { "type": "Point", "coordinates": [36.3215, 50.0521] },
                    "properties": {
                        "name": "12",
                        "settlement": "Циркуни",
                        "level1": "Харківська"
                    }
                }]
            }))),
        );

        let provider = HttpGeocodeProvider::new(&http_settings(&server)).unwrap();
        let feature = provider.query(&house_query()).await.unwrap().unwrap();
        assert_eq!(feature.latitude, 50.0521);
        assert_eq!(feature.longitude, 36.3215);
        assert_eq!(feature.settlement.as_deref(), Some("Циркуни"));
        assert_eq!(feature.region.as_deref(), Some("Харківська"));
    }

    #[tokio::test]
    async fn http_provider_accepts_single_feature_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/geocode.json")).respond_with(json_encoded(
                json!({
                    "type": "Feature",
                    "geo_centroid": { "type": "Point", "coordinates": [36.30, 50.07] },
                    "properties": { "name": "Циркуни", "level1": "Харківська" }
                }),
            )),
        );

        let provider = HttpGeocodeProvider::new(&http_settings(&server)).unwrap();
        let query = TierQuery {
            tier: Tier::Settlement,
            text: "Циркуни".into(),
            categories: "adm_settlement".into(),
        };
        let feature = provider.query(&query).await.unwrap().unwrap();
        assert_eq!(feature.settlement.as_deref(), Some("Циркуни"));
        assert_eq!((feature.latitude, feature.longitude), (50.07, 36.30));
    }

    #[tokio::test]
    async fn http_provider_reports_empty_and_broken_answers() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("text", "empty")))))
                .respond_with(json_encoded(json!({ "type": "FeatureCollection", "features": [] }))),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("text", "broken")))))
                .respond_with(status_code(200).body("{not json")),
        );
        server.expect(
            Expectation::matching(request::query(url_decoded(contains(("text", "down")))))
                .respond_with(status_code(503)),
        );

        let provider = HttpGeocodeProvider::new(&http_settings(&server)).unwrap();
        let mut query = house_query();

        query.text = "empty".into();
        assert!(provider.query(&query).await.unwrap().is_none());

        query.text = "broken".into();
        assert!(matches!(provider.query(&query).await, Err(AppError::Json(_))));

        query.text = "down".into();
        assert!(matches!(provider.query(&query).await, Err(AppError::Http(_))));
    }

    #[tokio::test]
    async fn http_failures_resolve_to_not_found() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::path("/geocode.json"))
                .times(3)
                .respond_with(status_code(500)),
        );

        let client = GeocodingClient::new(http_settings(&server)).unwrap();
        let result = client
            .resolve(&normalize("с. Циркуни, вул. Сонячна, 12"))
            .await;
        assert_eq!(result, GeocodeResult::not_found());
    }
}
