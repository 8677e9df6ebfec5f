use std::time::Duration;

use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use url::Url;

pub mod row;
pub mod stream;

pub use row::{ChangeEvent, LocationRow};

const REST_PATH: &str = "rest/v1/";
const REALTIME_PATH: &str = "realtime/v1/websocket";
const REALTIME_VSN: &str = "1.0.0";
const LOCATION_COLUMNS: &str = "user_id,latitude,longitude,last_updated";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(thiserror::Error, Debug)]
pub enum RealtimeError {
    #[error("Connection Error: {0}")]
    Connection(#[from] reqwest::Error),
    #[error("Unexpected response `{0}`")]
    Request(StatusCode),
    #[error("Backend rejected the request ({0}): {1}")]
    ApiError(StatusCode, String),
    #[error("Url parse error `{0}`")]
    ParseError(#[from] url::ParseError),
    #[error("Invalid url `{0}`")]
    InvalidUrl(String),
    #[error("Invalid header value `{0}`")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("WebSocket error `{0}`")]
    WebSocketError(Box<tungstenite::Error>),
    #[error("Error decoding json, {0}")]
    JsonDecodeError(#[from] serde_json::Error),
    #[error("Channel join rejected: {0}")]
    JoinRejected(String),
}

impl From<tungstenite::Error> for RealtimeError {
    fn from(e: tungstenite::Error) -> RealtimeError {
        RealtimeError::WebSocketError(Box::new(e))
    }
}

/// Error body returned by the REST layer
#[derive(Debug, Default, Serialize, Deserialize)]
struct ApiResponse {
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl std::fmt::Display for ApiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message.as_deref().unwrap_or("unknown error"))?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, ", hint: {hint}")?;
        }
        Ok(())
    }
}

/// Everything needed to open the realtime websocket for one table.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Url,
    pub schema: String,
    pub table: String,
    pub access_token: String,
}

impl Endpoint {
    pub fn topic(&self) -> String {
        format!("realtime:{}:{}", self.schema, self.table)
    }
}

pub struct RealtimeClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    access_token: Option<String>,
    table: String,
}

impl RealtimeClient {
    /// `access_token` is the signed-in user's session token. Without one every request is made
    /// with the anonymous api key.
    pub fn new(
        base_url: &str,
        api_key: &str,
        access_token: Option<String>,
        table: &str,
    ) -> Result<Self, RealtimeError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let bearer = access_token.as_deref().unwrap_or(api_key);
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(api_key)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer}"))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.to_string(),
            access_token,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn rest_url(&self) -> Result<Url, RealtimeError> {
        Ok(self.base_url.join(REST_PATH)?.join(&self.table)?)
    }

    /// Websocket endpoint derived from the REST base url
    pub fn endpoint(&self) -> Result<Endpoint, RealtimeError> {
        let mut url = self.base_url.join(REALTIME_PATH)?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(RealtimeError::InvalidUrl(format!("unsupported scheme `{other}`"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::InvalidUrl(self.base_url.to_string()))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", REALTIME_VSN);

        Ok(Endpoint {
            url,
            schema: DEFAULT_SCHEMA.to_string(),
            table: self.table.clone(),
            access_token: self
                .access_token
                .clone()
                .unwrap_or_else(|| self.api_key.clone()),
        })
    }

    /// Current row of every participant. Rows that fail to decode are returned as
    /// `ChangeEvent::Malformed` so one bad row does not hide the others.
    pub async fn fetch_locations(&self) -> Result<Vec<ChangeEvent>, RealtimeError> {
        let mut url = self.rest_url()?;
        url.query_pairs_mut().append_pair("select", LOCATION_COLUMNS);

        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        let rows: Vec<serde_json::Value> = response.json().await?;

        Ok(rows.into_iter().map(ChangeEvent::from_record).collect())
    }

    /// Insert or replace the row keyed by `row.user_id`
    pub async fn upsert_location(&self, row: &LocationRow) -> Result<(), RealtimeError> {
        let response = self
            .client
            .post(self.rest_url()?)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RealtimeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        return Err(RealtimeError::Request(status));
    }
    match serde_json::from_str::<ApiResponse>(&body) {
        Ok(api_response) => Err(RealtimeError::ApiError(status, api_response.to_string())),
        Err(_) => Err(RealtimeError::ApiError(status, body)),
    }
}
