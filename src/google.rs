//! Google Sheets access through a service account

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::RunConfiguration;
use crate::sheets::{a1_cell, column_letters, CellValue, SheetConnector, Worksheet};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets https://www.googleapis.com/auth/drive";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Fields of a service account key file that the token exchange needs
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid service account key in {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Build the signed JWT assertion for the token endpoint
fn signed_assertion(key: &ServiceAccountKey, issued_at: i64) -> Result<String> {
    let claims = Claims {
        iss: &key.client_email,
        scope: SCOPES,
        aud: &key.token_uri,
        iat: issued_at,
        exp: issued_at + TOKEN_LIFETIME_SECS,
    };
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .context("Service account private key is not a valid RSA PEM")?;
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .context("Failed to sign token request")
}

fn fetch_access_token(client: &Client, key: &ServiceAccountKey) -> Result<String> {
    let assertion = signed_assertion(key, chrono::Utc::now().timestamp())?;
    exchange_assertion(client, &key.token_uri, &assertion)
}

/// Trade a signed assertion for a bearer token
fn exchange_assertion(client: &Client, token_uri: &str, assertion: &str) -> Result<String> {
    let response = client
        .post(token_uri)
        .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion)])
        .send()
        .context("Token request failed")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        anyhow::bail!("Token endpoint returned HTTP {}: {}", status, body);
    }

    let token: TokenResponse = response.json().context("Unexpected token response")?;
    Ok(token.access_token)
}

/// Pull the spreadsheet id out of a `.../spreadsheets/d/<id>/...` URL
pub fn spreadsheet_id_from_url(url: &str) -> Result<String> {
    let marker = "/spreadsheets/d/";
    let start = url
        .find(marker)
        .map(|i| i + marker.len())
        .with_context(|| format!("Not a Google Sheets URL: {}", url))?;

    let id: String = url[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if id.is_empty() {
        anyhow::bail!("No spreadsheet id in URL: {}", url);
    }
    Ok(id)
}

/// Append `segments` to the API base, percent-encoding each one.
///
/// Sheet titles may contain `?`, `#` or `%`, so ranges must never be
/// spliced into the path as raw text.
fn sheets_url(api_base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(api_base)
        .with_context(|| format!("Invalid Sheets API base URL: {}", api_base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Sheets API base URL cannot take a path: {}", api_base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Quote a sheet title for use in A1 ranges
fn quoted_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Connects to Google Sheets with the credentials named in the configuration
pub struct GoogleSheets {
    client: Client,
    api_base: String,
}

impl GoogleSheets {
    const TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: SHEETS_API.to_string(),
        })
    }

    /// Send spreadsheet requests somewhere other than the public Sheets API
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Check that `title` exists in the spreadsheet and return a handle to it
    fn open_worksheet(
        &self,
        token: String,
        spreadsheet_id: String,
        title: &str,
    ) -> Result<GoogleWorksheet> {
        let url = sheets_url(&self.api_base, &[&spreadsheet_id])?;
        let response = self
            .client
            .get(url)
            .query(&[("fields", "sheets.properties.title")])
            .bearer_auth(&token)
            .send()
            .context("Failed to open spreadsheet")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Opening spreadsheet returned HTTP {}: {}", status, body);
        }

        let meta: SpreadsheetMeta = response.json().context("Unexpected spreadsheet metadata")?;
        if !meta.sheets.iter().any(|s| s.properties.title == title) {
            anyhow::bail!("Worksheet '{}' not found", title);
        }

        tracing::info!(spreadsheet = %spreadsheet_id, worksheet = %title, "opened worksheet");
        Ok(GoogleWorksheet {
            client: self.client.clone(),
            api_base: self.api_base.clone(),
            token,
            spreadsheet_id,
            title: title.to_string(),
        })
    }
}

impl SheetConnector for GoogleSheets {
    fn connect(&self, config: &RunConfiguration) -> Result<Box<dyn Worksheet>> {
        let key = ServiceAccountKey::from_file(Path::new(&config.credentials_path))?;
        let token = fetch_access_token(&self.client, &key)?;
        tracing::debug!(account = %key.client_email, "obtained access token");

        let spreadsheet_id = spreadsheet_id_from_url(&config.spreadsheet_url)?;
        let worksheet = self.open_worksheet(token, spreadsheet_id, &config.worksheet_name)?;
        Ok(Box::new(worksheet))
    }
}

/// A worksheet reached through the Sheets values API
pub struct GoogleWorksheet {
    client: Client,
    api_base: String,
    token: String,
    spreadsheet_id: String,
    title: String,
}

impl GoogleWorksheet {
    fn values_url(&self, range: &str) -> Result<Url> {
        let a1 = format!("{}!{}", quoted_title(&self.title), range);
        sheets_url(&self.api_base, &[&self.spreadsheet_id, "values", &a1])
    }
}

impl Worksheet for GoogleWorksheet {
    fn col_values(&self, col: u32) -> Result<Vec<String>> {
        let letters = column_letters(col);
        let response = self
            .client
            .get(self.values_url(&format!("{}:{}", letters, letters))?)
            .query(&[("majorDimension", "COLUMNS")])
            .bearer_auth(&self.token)
            .send()
            .context("Failed to read column values")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Reading column {} returned HTTP {}: {}", letters, status, body);
        }

        let range: ValueRange = response.json().context("Unexpected values response")?;
        let values = range
            .values
            .into_iter()
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        Ok(values)
    }

    fn update_cell(&mut self, row: u32, col: u32, value: CellValue) -> Result<()> {
        let cell = a1_cell(row, col);
        let body = serde_json::json!({
            "range": format!("{}!{}", quoted_title(&self.title), cell),
            "majorDimension": "ROWS",
            "values": [[value]],
        });

        let response = self
            .client
            .put(self.values_url(&cell)?)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .with_context(|| format!("Failed to write cell {}", cell))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("Writing cell {} returned HTTP {}: {}", cell, status, body);
        }

        tracing::debug!(cell = %cell, value = %value, "updated cell");
        Ok(())
    }
}
