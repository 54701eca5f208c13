//! Route table: exact paths plus opt-in dynamic subpath/query matching.

use std::rc::Rc;

use arrayvec::ArrayVec;
use tracing::{debug, error, warn};

use crate::pipeline::Exchange;
use crate::server::ServerContext;

pub const MAX_ROUTES: usize = 128;

/// A handler populates the response; it may finish synchronously (state set
/// to `Processed` before returning) or leave the response pending behind
/// registered async completions.
pub type RouteHandler = Rc<dyn Fn(&Rc<ServerContext>, &Rc<Exchange>)>;

pub struct Route {
    pub path: String,
    pub handler: RouteHandler,
    pub requires_session: bool,
    pub has_dynamic_subpath: bool,
    pub has_dynamic_param: bool,
}

pub struct RouteMatch {
    pub handler: RouteHandler,
    pub requires_session: bool,
}

pub struct RouteTable {
    routes: ArrayVec<Route, MAX_ROUTES>,
    fallback: Option<RouteHandler>,
}

/// True when the path has a second `/` before any `?`.
pub fn has_subpath(path: &str) -> bool {
    let stop = path.find('?').unwrap_or(path.len());
    match path.find('/') {
        Some(first) => path[first + 1..stop].contains('/'),
        None => false,
    }
}

/// True when the path carries a query string.
pub fn has_param(path: &str) -> bool {
    path.contains('?')
}

/// Prefix of the path up to the first `?` or the second `/`, whichever comes
/// first.
pub fn base_path(path: &str) -> &str {
    let query = path.find('?').unwrap_or(path.len());
    let second_slash = match path.find('/') {
        Some(first) => path[first + 1..]
            .find('/')
            .map(|idx| first + 1 + idx)
            .unwrap_or(path.len()),
        None => path.len(),
    };
    &path[..query.min(second_slash)]
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable {
            routes: ArrayVec::new(),
            fallback: None,
        }
    }

    pub fn add_route(
        &mut self,
        path: &str,
        handler: RouteHandler,
        requires_session: bool,
    ) {
        debug!(target: "routing", path, requires_session, "adding route");
        if self.routes.is_full() {
            error!(target: "routing", path, "route limit reached, route dropped");
            return;
        }
        self.routes.push(Route {
            path: path.to_string(),
            handler,
            requires_session,
            has_dynamic_subpath: false,
            has_dynamic_param: false,
        });
    }

    pub fn set_dynamic_subpath(&mut self, path: &str, dynamic: bool) {
        match self.routes.iter_mut().find(|r| r.path == path) {
            Some(route) => {
                route.has_dynamic_subpath = dynamic;
                if route.has_dynamic_subpath && route.has_dynamic_param {
                    warn!(target: "routing", path, "route matches only subpath+query requests now");
                }
            }
            None => warn!(target: "routing", path, "route not found for dynamic subpath"),
        }
    }

    pub fn set_dynamic_param(&mut self, path: &str, dynamic: bool) {
        match self.routes.iter_mut().find(|r| r.path == path) {
            Some(route) => {
                route.has_dynamic_param = dynamic;
                if route.has_dynamic_subpath && route.has_dynamic_param {
                    warn!(target: "routing", path, "route matches only subpath+query requests now");
                }
            }
            None => warn!(target: "routing", path, "route not found for dynamic param"),
        }
    }

    /// Point an existing route at a new path.
    pub fn rewrite_route_path(&mut self, current: &str, new: &str) -> bool {
        match self.routes.iter_mut().find(|r| r.path == current) {
            Some(route) => {
                debug!(target: "routing", from = current, to = new, "route path rewritten");
                route.path = new.to_string();
                true
            }
            None => false,
        }
    }

    /// Process-wide single-slot fallback.
    pub fn set_fallback_handler(&mut self, handler: RouteHandler) {
        self.fallback = Some(handler);
    }

    /// Resolve a handler for an incoming path: exact match first, then the
    /// dynamic truth table against the base path, then the fallback.
    pub fn lookup(&self, path: &str) -> Option<RouteMatch> {
        if path.is_empty() {
            return None;
        }

        for route in &self.routes {
            if route.path == path {
                debug!(target: "routing", path, "exact route match");
                return Some(RouteMatch {
                    handler: route.handler.clone(),
                    requires_session: route.requires_session,
                });
            }
        }

        let base = base_path(path);
        let sub = has_subpath(path);
        let qry = has_param(path);

        for route in &self.routes {
            if route.path != base {
                continue;
            }
            let matched = match (route.has_dynamic_subpath, route.has_dynamic_param) {
                (true, true) => sub && qry,
                (true, false) => sub && !qry,
                (false, true) => !sub && qry,
                (false, false) => false,
            };
            if matched {
                debug!(target: "routing", path, base, "dynamic route match");
                return Some(RouteMatch {
                    handler: route.handler.clone(),
                    requires_session: route.requires_session,
                });
            }
        }

        if let Some(fallback) = &self.fallback {
            warn!(target: "routing", path, "no specific handler, using fallback");
            return Some(RouteMatch {
                handler: fallback.clone(),
                requires_session: false,
            });
        }

        None
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
