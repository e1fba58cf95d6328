//! REST (v2) session against the destination store.
//!
//! Every call is a JSON request with basic auth. Statement results come back
//! with a `code` field where 200 means success; anything else is surfaced as
//! [`ClientError::Execution`] with the store's code and message.

use super::{ClientError, SeriesSession, Tablet};
use crate::types::SeriesSchema;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

// ============================================================================
// Endpoints
// ============================================================================

const PING_PATH: &str = "/ping";
const QUERY_PATH: &str = "/rest/v2/query";
const NON_QUERY_PATH: &str = "/rest/v2/nonQuery";
const INSERT_TABLET_PATH: &str = "/rest/v2/insertTablet";

const SUCCESS_CODE: i64 = 200;

/// Status body returned by statements and inserts.
#[derive(Debug, Deserialize)]
struct StatusBody {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Column-major query result.
#[derive(Debug, Deserialize)]
struct QueryBody {
    #[serde(default)]
    column_names: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl QueryBody {
    /// First value of the named column, as text.
    fn first(&self, column: &str) -> Option<&str> {
        let index = self.column_names.iter().position(|c| c.eq_ignore_ascii_case(column))?;
        self.values.get(index)?.first()?.as_str()
    }
}

pub struct RestSession {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl RestSession {
    pub fn new(http: Client, base_url: &str, username: &str, password: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a JSON body and return the decoded response body.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        decode(response).await
    }

    async fn execute(&self, sql: &str) -> Result<(), ClientError> {
        debug!(endpoint = %self.base_url, sql, "Executing statement");
        let body = self.post(NON_QUERY_PATH, &json!({ "sql": sql })).await?;
        check_status(body)
    }
}

/// Read the body, mapping HTTP failures and non-success codes to errors.
async fn decode(response: reqwest::Response) -> Result<Value, ClientError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))?;

    if !status.is_success() {
        return Err(match serde_json::from_str::<StatusBody>(&text) {
            Ok(body) => ClientError::Execution {
                code: body.code,
                message: body.message,
            },
            Err(_) => ClientError::Execution {
                code: i64::from(status.as_u16()),
                message: text,
            },
        });
    }

    serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))
}

fn check_status(body: Value) -> Result<(), ClientError> {
    let status: StatusBody =
        serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))?;
    if status.code == SUCCESS_CODE {
        Ok(())
    } else {
        Err(ClientError::Execution {
            code: status.code,
            message: status.message,
        })
    }
}

fn measurement_clause(name: &str, schema: &SeriesSchema) -> String {
    format!(
        "{} {} ENCODING={} COMPRESSOR={}",
        name, schema.data_type, schema.encoding, schema.compression
    )
}

#[async_trait]
impl SeriesSession for RestSession {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .get(self.url(PING_PATH))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        check_status(decode(response).await?)
    }

    async fn series_schema(&self, series: &str) -> Result<Option<SeriesSchema>, ClientError> {
        let sql = format!("SHOW TIMESERIES {}", series);
        let body = self.post(QUERY_PATH, &json!({ "sql": sql })).await?;

        // Errors arrive as a status body even with HTTP 200.
        if body
            .get("code")
            .and_then(Value::as_i64)
            .is_some_and(|code| code != SUCCESS_CODE)
        {
            return check_status(body).map(|()| None);
        }

        let result: QueryBody =
            serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))?;

        let Some(data_type) = result.first("DataType") else {
            return Ok(None);
        };
        let encoding = result.first("Encoding").unwrap_or_default();
        let compression = result.first("Compression").unwrap_or_default();

        Ok(Some(SeriesSchema {
            data_type: data_type.parse().map_err(ClientError::Decode)?,
            encoding: encoding.parse().map_err(ClientError::Decode)?,
            compression: compression.parse().map_err(ClientError::Decode)?,
        }))
    }

    async fn create_series(&self, series: &str, schema: &SeriesSchema) -> Result<(), ClientError> {
        self.execute(&format!(
            "CREATE TIMESERIES {} WITH DATATYPE={}, ENCODING={}, COMPRESSOR={}",
            series, schema.data_type, schema.encoding, schema.compression
        ))
        .await
    }

    async fn create_aligned_series(
        &self,
        device: &str,
        measurements: &[(String, SeriesSchema)],
    ) -> Result<(), ClientError> {
        let clauses: Vec<String> = measurements
            .iter()
            .map(|(name, schema)| measurement_clause(name, schema))
            .collect();

        self.execute(&format!(
            "CREATE ALIGNED TIMESERIES {}({})",
            device,
            clauses.join(", ")
        ))
        .await
    }

    async fn insert_tablet(&self, tablet: &Tablet, aligned: bool) -> Result<(), ClientError> {
        let measurements: Vec<&str> = tablet.columns.iter().map(|c| c.measurement.as_str()).collect();
        let data_types: Vec<&str> = tablet.columns.iter().map(|c| c.data_type.as_str()).collect();
        let values: Vec<Vec<Value>> = tablet
            .columns
            .iter()
            .map(|column| {
                column
                    .values
                    .iter()
                    .map(|v| v.as_ref().map_or(Value::Null, |v| v.to_json()))
                    .collect()
            })
            .collect();

        let body = json!({
            "timestamps": tablet.timestamps,
            "measurements": measurements,
            "data_types": data_types,
            "values": values,
            "is_aligned": aligned,
            "device": tablet.device,
        });

        debug!(
            endpoint = %self.base_url,
            device = %tablet.device,
            rows = tablet.row_count(),
            "Inserting tablet"
        );
        check_status(self.post(INSERT_TABLET_PATH, &body).await?)
    }
}
