use chrono::{Local, NaiveDate};
use rusqlite::Connection;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::err;
use super::types::{AppState, Request};

/// Error carried between the small db/parse helpers inside a handler and the
/// point where it becomes a wire response.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Optional "YYYY-MM-DD" param; present but malformed is a bad_params error.
pub fn optional_iso_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, serde_json::Value> {
    let Some(raw) = optional_str(req, key) else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(date) => Ok(Some(date)),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be YYYY-MM-DD", key),
            Some(serde_json::json!({ key: raw })),
        )),
    }
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn today_iso() -> String {
    today().format("%Y-%m-%d").to_string()
}

pub fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
