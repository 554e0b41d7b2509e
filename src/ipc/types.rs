use std::collections::HashMap;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::engine::{Baseline, EditOverlay};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// One enrolled student as the open gradebook sees them, in roster order.
#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub dni: String,
}

/// Editing state of one open course gradebook. `baseline` mirrors what the
/// store last confirmed; `overlay` accumulates edits until a save flushes
/// them and the baseline is refreshed from the store.
pub struct GradebookSession {
    pub course_id: String,
    pub roster: Vec<RosterStudent>,
    pub baseline: Baseline,
    pub overlay: EditOverlay,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub sessions: HashMap<String, GradebookSession>,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            db: None,
            sessions: HashMap::new(),
        }
    }
}
