//! Aggregated data for the datahub fan-in: one GitHub profile fetch plus
//! one database query, merged by a `FanIn<AggregatedData>` barrier.

use serde_json::Value;

use minuet_mysql::QueryResult;

pub const ERROR_MESSAGE_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct GithubUser {
    pub login: String,
    pub name: Option<String>,
    pub public_repos: i64,
    pub followers: i64,
}

impl GithubUser {
    pub fn from_json(value: &Value) -> Option<Self> {
        Some(GithubUser {
            login: value.get("login")?.as_str()?.to_string(),
            name: value
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            public_repos: value
                .get("public_repos")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            followers: value.get("followers").and_then(Value::as_i64).unwrap_or(0),
        })
    }
}

#[derive(Debug, Default)]
pub struct AggregatedData {
    pub has_http: bool,
    pub http_error: bool,
    pub http_error_message: String,
    pub has_db: bool,
    pub db_error: bool,
    pub db_error_message: String,
    pub github: Option<GithubUser>,
    pub db_result: Option<QueryResult>,
}

fn capped(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_CAP {
        return message.to_string();
    }
    let mut end = ERROR_MESSAGE_CAP;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

impl AggregatedData {
    pub fn set_http_error(&mut self, message: &str) {
        self.http_error = true;
        self.http_error_message = capped(message);
    }

    pub fn set_db_error(&mut self, message: &str) {
        self.db_error = true;
        self.db_error_message = capped(message);
    }
}
