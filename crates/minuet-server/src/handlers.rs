//! Demo handlers shipped with the server binary.

use std::fmt::Write;
use std::rc::Rc;

use tracing::debug;

use minuet_core::fanin::FanIn;
use minuet_core::http::ResponseState;
use minuet_core::pipeline::Exchange;
use minuet_core::server::ServerContext;
use minuet_fetch::{FetchClient, FetchConfig, FetchRequest};
use minuet_mysql::{MysqlConfig, run_query};

use crate::aggregate::{AggregatedData, GithubUser};

/// Landing page; completes synchronously.
pub fn home(_ctx: &Rc<ServerContext>, exchange: &Rc<Exchange>) {
    let mut res = exchange.res.borrow_mut();
    res.status = 200;
    res.add_header("Content-Type", "text/html");
    res.set_static_body(
        b"<!DOCTYPE html>\n<html>\n<head><title>Minuet</title></head>\n<body>\n\
          <h1>Minuet</h1>\n<p>Event-loop application server.</p>\n\
          <ul><li><a href=\"/datahub\">datahub</a></li>\
          <li><a href=\"/speedtest\">speedtest</a></li></ul>\n</body>\n</html>\n",
    );
    res.state = ResponseState::Processed;
}

/// Request-timing history as JSON.
pub fn speedtest(ctx: &Rc<ServerContext>, exchange: &Rc<Exchange>) {
    let samples: Vec<serde_json::Value> = ctx
        .bench
        .borrow()
        .history()
        .iter()
        .map(|sample| {
            serde_json::json!({
                "path": sample.path,
                "duration_ms": sample.duration_ms,
            })
        })
        .collect();

    let mut res = exchange.res.borrow_mut();
    res.status = 200;
    res.add_header("Content-Type", "application/json");
    res.set_body(serde_json::json!({ "samples": samples }).to_string());
    res.state = ResponseState::Processed;
}

/// Fan-in of a GitHub profile fetch and a database query. The response
/// stays in `Processing` until both operations settled; the pending sweep
/// sends it afterwards.
pub fn datahub(ctx: &Rc<ServerContext>, exchange: &Rc<Exchange>) {
    {
        let mut res = exchange.res.borrow_mut();
        res.state = ResponseState::Processing;
        // Cancellation bookkeeping: if the peer disappears before both
        // operations settle, the hook observes which request died.
        res.async_data = Some(Box::new(exchange.req.path.clone()));
        res.async_cancel = Some(Box::new(|data| {
            let path = data
                .and_then(|d| d.downcast::<String>().ok())
                .map(|p| *p)
                .unwrap_or_default();
            debug!(target: "datahub", path = %path, "aggregation cancelled by peer");
        }));
    }

    let weak = Rc::downgrade(exchange);
    let fanin = FanIn::new(AggregatedData::default(), move |data| {
        let Some(exchange) = weak.upgrade() else {
            return;
        };
        if exchange.cancelled.get() {
            return;
        }
        let mut res = exchange.res.borrow_mut();
        res.status = 200;
        res.add_header("Content-Type", "text/html");
        res.set_body(render_datahub(data));
        res.state = ResponseState::Processed;
    });

    start_github_fetch(ctx, &fanin);
    start_db_query(ctx, &fanin);
}

fn start_github_fetch(ctx: &Rc<ServerContext>, fanin: &FanIn<AggregatedData>) {
    let username =
        std::env::var("GITHUB_USERNAME").unwrap_or_else(|_| "octocat".to_string());
    let base =
        std::env::var("GITHUB_API_BASE").unwrap_or_else(|_| "http://api.github.com".to_string());

    let client = FetchClient::new(ctx.reactor.clone(), FetchConfig::default());
    client.set_default_header("Accept", "application/vnd.github+json");

    let op = fanin.start();
    client.execute(
        FetchRequest::get(format!("{base}/users/{username}")),
        Box::new(move |_request, result| {
            op.settle(|data| match result {
                Ok(response) if response.status == 200 => {
                    let user = response
                        .json()
                        .ok()
                        .and_then(|value| GithubUser::from_json(&value));
                    match user {
                        Some(user) => {
                            data.github = Some(user);
                            data.has_http = true;
                        }
                        None => data.set_http_error("unexpected GitHub payload"),
                    }
                }
                Ok(response) => {
                    data.set_http_error(&format!("GitHub returned status {}", response.status));
                }
                Err(e) => data.set_http_error(&e.to_string()),
            });
        }),
    );
}

fn start_db_query(ctx: &Rc<ServerContext>, fanin: &FanIn<AggregatedData>) {
    let config = MysqlConfig::from_env();
    let op = fanin.start();
    run_query(
        &ctx.reactor,
        &config,
        "SELECT id, title FROM entries ORDER BY id DESC LIMIT 10",
        Box::new(move |result| {
            op.settle(|data| match result {
                Ok(rows) => {
                    data.db_result = Some(rows);
                    data.has_db = true;
                }
                Err(e) => data.set_db_error(&e.to_string()),
            });
        }),
    );
}

fn render_datahub(data: &AggregatedData) -> String {
    let mut html = String::with_capacity(1024);
    html.push_str("<!DOCTYPE html>\n<html>\n<head><title>Datahub</title></head>\n<body>\n");
    html.push_str("<h1>Datahub</h1>\n");

    html.push_str("<h2>GitHub</h2>\n");
    if data.has_http {
        if let Some(user) = &data.github {
            let _ = write!(
                html,
                "<p>{} ({}) — {} public repos, {} followers</p>\n",
                user.login,
                user.name.as_deref().unwrap_or("no display name"),
                user.public_repos,
                user.followers
            );
        }
    } else {
        let _ = write!(
            html,
            "<p class=\"error\">fetch failed: {}</p>\n",
            data.http_error_message
        );
    }

    html.push_str("<h2>Database</h2>\n");
    if data.has_db {
        if let Some(result) = &data.db_result {
            html.push_str("<table>\n<tr>");
            for column in &result.column_names {
                let _ = write!(html, "<th>{column}</th>");
            }
            html.push_str("</tr>\n");
            for row in &result.rows {
                html.push_str("<tr>");
                for idx in 0..result.column_names.len() {
                    match row.get_str(idx) {
                        Ok(Some(text)) => {
                            let _ = write!(html, "<td>{text}</td>");
                        }
                        Ok(None) => html.push_str("<td><em>NULL</em></td>"),
                        Err(_) => html.push_str("<td><em>binary</em></td>"),
                    }
                }
                html.push_str("</tr>\n");
            }
            html.push_str("</table>\n");
        }
    } else {
        let _ = write!(
            html,
            "<p class=\"error\">query failed: {}</p>\n",
            data.db_error_message
        );
    }

    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use minuet_mysql::QueryResult;

    #[test]
    fn render_includes_both_error_branches() {
        let mut data = AggregatedData::default();
        data.set_http_error("timeout");
        data.set_db_error("connection closed");
        let html = render_datahub(&data);
        assert!(html.contains("fetch failed: timeout"));
        assert!(html.contains("query failed: connection closed"));
    }

    #[test]
    fn render_includes_successful_sections() {
        let mut data = AggregatedData::default();
        data.has_http = true;
        data.github = Some(GithubUser {
            login: "octocat".to_string(),
            name: Some("The Octocat".to_string()),
            public_repos: 8,
            followers: 100,
        });
        data.has_db = true;
        data.db_result = Some(QueryResult {
            column_names: vec!["id".to_string(), "title".to_string()],
            rows: Vec::new(),
            affected_rows: 0,
        });

        let html = render_datahub(&data);
        assert!(html.contains("octocat"));
        assert!(html.contains("<th>id</th><th>title</th>"));
    }
}
