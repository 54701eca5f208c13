//! Client-level configuration and request launching.

use std::cell::RefCell;
use std::rc::Rc;

use minuet_core::reactor::Reactor;

use crate::request::FetchRequest;
use crate::transfer::{FetchCallback, FetchHandle, Transfer};

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: String,
    /// Whole-transfer ceiling in milliseconds.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub follow_redirects: bool,
    pub max_redirects: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            user_agent: "Minuet-Fetch/1.0".to_string(),
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            follow_redirects: true,
            max_redirects: 5,
        }
    }
}

/// Multiplexed outbound HTTP bound to one reactor. Every transfer it
/// launches is driven by that reactor's readiness events.
pub struct FetchClient {
    reactor: Rc<Reactor>,
    config: FetchConfig,
    default_headers: RefCell<Vec<(String, String)>>,
}

impl FetchClient {
    pub fn new(reactor: Rc<Reactor>, config: FetchConfig) -> Self {
        FetchClient {
            reactor,
            config,
            default_headers: RefCell::new(Vec::new()),
        }
    }

    /// Header applied to every request that does not set it itself.
    pub fn set_default_header(&self, name: &str, value: &str) {
        self.remove_default_header(name);
        self.default_headers
            .borrow_mut()
            .push((name.to_string(), value.to_string()));
    }

    pub fn remove_default_header(&self, name: &str) {
        self.default_headers
            .borrow_mut()
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Hand a request to the engine. The completion callback fires exactly
    /// once, on a later reactor tick — also for launch failures.
    pub fn execute(&self, mut request: FetchRequest, callback: FetchCallback) -> FetchHandle {
        for (name, value) in self.default_headers.borrow().iter() {
            if !request.has_header(name) {
                request.push_header(name, value);
            }
        }
        Transfer::start(self.reactor.clone(), self.config.clone(), request, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_timeouts() {
        let config = FetchConfig::default();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert!(config.follow_redirects);
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn default_headers_replace_and_remove() {
        let reactor = Reactor::new().unwrap();
        let client = FetchClient::new(reactor, FetchConfig::default());

        client.set_default_header("Accept", "application/json");
        client.set_default_header("accept", "text/plain");
        assert_eq!(client.default_headers.borrow().len(), 1);
        assert_eq!(client.default_headers.borrow()[0].1, "text/plain");

        client.remove_default_header("ACCEPT");
        assert!(client.default_headers.borrow().is_empty());
    }
}
