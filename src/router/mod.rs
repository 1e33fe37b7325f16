//! Route lookup engine.
//!
//! Routes are matched in insertion order against an exact method (or `all`)
//! and either a literal pattern with `:name` placeholders or a compiled
//! regex. A fully-literal match always wins over a parameterized one. The
//! table performs no trailing-slash normalization; middleware may impose it.
//!
//! The route list is swapped atomically so dispatch reads are lock-free
//! snapshots; mutations are serialized against each other only.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::Method;
use regex::Regex;

use crate::core::{Request, Response, XyPrissError, XyResult};

/// A route target.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<()>;
}

/// Adapter turning a plain function into a [`Handler`].
pub struct HandlerFn<F>(pub F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut Request, &mut Response) -> XyResult<()> + Send + Sync,
{
    async fn handle(&self, req: &mut Request, res: &mut Response) -> XyResult<()> {
        (self.0)(req, res)
    }
}

/// Method selector: a concrete method, or `all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMethod {
    Any,
    Exact(Method),
}

impl RouteMethod {
    /// Parses `"all"` (case-insensitive) or an HTTP method name.
    pub fn parse(method: &str) -> XyResult<Self> {
        if method.eq_ignore_ascii_case("all") {
            return Ok(RouteMethod::Any);
        }
        method
            .to_ascii_uppercase()
            .parse::<Method>()
            .map(RouteMethod::Exact)
            .map_err(|_| XyPrissError::Config(format!("invalid route method: {method}")))
    }

    fn matches(&self, method: &Method) -> bool {
        match self {
            RouteMethod::Any => true,
            RouteMethod::Exact(m) => m == method,
        }
    }
}

/// One segment of a literal pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
}

/// Route pattern: literal path with `:name` placeholders, or a regex whose
/// capture groups become parameters.
pub enum Pattern {
    Path(String),
    Regex(Regex, Vec<String>),
}

enum CompiledPattern {
    Literal {
        segments: Vec<Segment>,
        has_params: bool,
    },
    Regex {
        regex: Regex,
        param_names: Vec<String>,
    },
}

/// Per-route counters updated by the Dispatcher.
#[derive(Default)]
pub struct RouteStats {
    pub hits: AtomicU64,
    pub errors: AtomicU64,
    pub total_micros: AtomicU64,
}

impl RouteStats {
    pub fn record(&self, latency: Duration, failed: bool) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }
}

pub struct Route {
    pub method: RouteMethod,
    pattern: CompiledPattern,
    /// Ids of route-scoped middleware, run after the global chain.
    pub middleware: Vec<String>,
    pub handler: Arc<dyn Handler>,
    /// Per-route request timeout override.
    pub timeout: Option<Duration>,
    pub stats: RouteStats,
    /// Original pattern text, for logs and priority mapping.
    pub pattern_text: String,
}

/// A successful lookup: the route plus extracted parameters.
pub struct RouteMatch {
    pub route: Arc<Route>,
    pub params: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct RouteTable {
    routes: ArcSwap<Vec<Arc<Route>>>,
    write_lock: std::sync::Mutex<()>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a route. Collisions are not detected; the first matching
    /// route in insertion order wins.
    pub fn add(
        &self,
        method: &str,
        pattern: Pattern,
        middleware: Vec<String>,
        handler: Arc<dyn Handler>,
    ) -> XyResult<()> {
        self.add_route(method, pattern, middleware, handler, None)
    }

    pub fn add_route(
        &self,
        method: &str,
        pattern: Pattern,
        middleware: Vec<String>,
        handler: Arc<dyn Handler>,
        timeout: Option<Duration>,
    ) -> XyResult<()> {
        let method = RouteMethod::parse(method)?;
        let (compiled, pattern_text) = compile_pattern(pattern)?;
        let route = Arc::new(Route {
            method,
            pattern: compiled,
            middleware,
            handler,
            timeout,
            stats: RouteStats::default(),
            pattern_text,
        });

        let _guard = self.write_lock.lock().unwrap();
        let mut routes = (**self.routes.load()).clone();
        routes.push(route);
        self.routes.store(Arc::new(routes));
        Ok(())
    }

    /// Finds the route for `(method, path)`.
    ///
    /// Scans insertion order; a fully-literal match returns immediately,
    /// otherwise the first parameterized/regex match is remembered and
    /// returned at the end.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let routes = self.routes.load();
        let mut fallback: Option<RouteMatch> = None;

        for route in routes.iter() {
            if !route.method.matches(method) {
                continue;
            }
            match &route.pattern {
                CompiledPattern::Literal {
                    segments,
                    has_params,
                } => {
                    if let Some(params) = match_literal(segments, path) {
                        if !*has_params {
                            return Some(RouteMatch {
                                route: route.clone(),
                                params,
                            });
                        }
                        if fallback.is_none() {
                            fallback = Some(RouteMatch {
                                route: route.clone(),
                                params,
                            });
                        }
                    }
                }
                CompiledPattern::Regex { regex, param_names } => {
                    if let Some(params) = match_regex(regex, param_names, path) {
                        if fallback.is_none() {
                            fallback = Some(RouteMatch {
                                route: route.clone(),
                                params,
                            });
                        }
                    }
                }
            }
        }
        fallback
    }

    pub fn len(&self) -> usize {
        self.routes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered route, for status and hooks.
    pub fn all(&self) -> Vec<Arc<Route>> {
        self.routes.load().iter().cloned().collect()
    }

    pub fn clear(&self) {
        let _guard = self.write_lock.lock().unwrap();
        self.routes.store(Arc::new(Vec::new()));
    }
}

fn compile_pattern(pattern: Pattern) -> XyResult<(CompiledPattern, String)> {
    match pattern {
        Pattern::Path(path) => {
            if !path.starts_with('/') {
                return Err(XyPrissError::Config(format!(
                    "route pattern must start with '/': {path}"
                )));
            }
            let segments: Vec<Segment> = path
                .split('/')
                .map(|seg| match seg.strip_prefix(':') {
                    Some(name) => Segment::Param(name.to_string()),
                    None => Segment::Static(seg.to_string()),
                })
                .collect();
            let has_params = segments.iter().any(|s| matches!(s, Segment::Param(_)));
            Ok((
                CompiledPattern::Literal {
                    segments,
                    has_params,
                },
                path,
            ))
        }
        Pattern::Regex(regex, param_names) => {
            let text = regex.as_str().to_string();
            // Full-path semantics: anchor the expression if the author
            // hasn't.
            let regex = if text.starts_with('^') && text.ends_with('$') {
                regex
            } else {
                let anchored = format!(
                    "^{}$",
                    text.trim_start_matches('^').trim_end_matches('$')
                );
                Regex::new(&anchored)
                    .map_err(|e| XyPrissError::Config(format!("invalid route regex: {e}")))?
            };
            Ok((CompiledPattern::Regex { regex, param_names }, text))
        }
    }
}

/// Matches a path against literal segments; segment counts must be equal.
fn match_literal(segments: &[Segment], path: &str) -> Option<BTreeMap<String, String>> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != segments.len() {
        return None;
    }
    let mut params = BTreeMap::new();
    for (segment, part) in segments.iter().zip(parts.iter()) {
        match segment {
            Segment::Static(expected) => {
                if expected != part {
                    return None;
                }
            }
            Segment::Param(name) => {
                if part.is_empty() {
                    // `/users/:id` does not match `/users/`.
                    return None;
                }
                params.insert(name.clone(), part.to_string());
            }
        }
    }
    Some(params)
}

fn match_regex(
    regex: &Regex,
    param_names: &[String],
    path: &str,
) -> Option<BTreeMap<String, String>> {
    let captures = regex.captures(path)?;
    let mut params = BTreeMap::new();

    if !param_names.is_empty() {
        // Registered names map onto capture groups in order.
        for (i, name) in param_names.iter().enumerate() {
            if let Some(group) = captures.get(i + 1) {
                params.insert(name.clone(), group.as_str().to_string());
            }
        }
    } else {
        // Named captures first, positional fallbacks otherwise.
        let names: Vec<Option<&str>> = regex.capture_names().collect();
        for (i, name) in names.iter().enumerate().skip(1) {
            if let Some(group) = captures.get(i) {
                let key = match name {
                    Some(n) => (*n).to_string(),
                    None => format!("param{i}"),
                };
                params.insert(key, group.as_str().to_string());
            }
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Arc<dyn Handler> {
        Arc::new(HandlerFn(|_req: &mut Request, _res: &mut Response| Ok(())))
    }

    fn table_with(routes: &[(&str, &str)]) -> RouteTable {
        let table = RouteTable::new();
        for (method, pattern) in routes {
            table
                .add(
                    method,
                    Pattern::Path(pattern.to_string()),
                    Vec::new(),
                    noop_handler(),
                )
                .unwrap();
        }
        table
    }

    #[test]
    fn test_param_extraction() {
        let table = table_with(&[("GET", "/items/:id/:action")]);
        let m = table.lookup(&Method::GET, "/items/7/delete").unwrap();
        assert_eq!(m.params["id"], "7");
        assert_eq!(m.params["action"], "delete");

        // Segment counts must match exactly.
        assert!(table.lookup(&Method::GET, "/items/7").is_none());
        assert!(table.lookup(&Method::GET, "/items/7/delete/now").is_none());
    }

    #[test]
    fn test_param_does_not_match_empty_segment() {
        let table = table_with(&[("GET", "/users/:id")]);
        assert!(table.lookup(&Method::GET, "/users/42").is_some());
        assert!(table.lookup(&Method::GET, "/users/").is_none());
        assert!(table.lookup(&Method::GET, "/users/42/edit").is_none());
    }

    #[test]
    fn test_no_trailing_slash_normalization() {
        let table = table_with(&[("GET", "/about")]);
        assert!(table.lookup(&Method::GET, "/about").is_some());
        assert!(table.lookup(&Method::GET, "/about/").is_none());
    }

    #[test]
    fn test_method_matching() {
        let table = table_with(&[("GET", "/a"), ("all", "/b")]);
        assert!(table.lookup(&Method::GET, "/a").is_some());
        assert!(table.lookup(&Method::POST, "/a").is_none());
        assert!(table.lookup(&Method::DELETE, "/b").is_some());
    }

    #[test]
    fn test_literal_wins_over_param() {
        let table = table_with(&[("GET", "/users/:id"), ("GET", "/users/me")]);
        // Even though the parameterized route was added first, the literal
        // exact match takes precedence.
        let m = table.lookup(&Method::GET, "/users/me").unwrap();
        assert_eq!(m.route.pattern_text, "/users/me");
        assert!(m.params.is_empty());

        let m = table.lookup(&Method::GET, "/users/42").unwrap();
        assert_eq!(m.params["id"], "42");
    }

    #[test]
    fn test_insertion_order_wins() {
        let table = table_with(&[("GET", "/x/:a"), ("GET", "/x/:b")]);
        let m = table.lookup(&Method::GET, "/x/1").unwrap();
        assert_eq!(m.route.pattern_text, "/x/:a");
    }

    #[test]
    fn test_regex_with_registered_param_names() {
        let table = RouteTable::new();
        table
            .add(
                "GET",
                Pattern::Regex(
                    Regex::new(r"/files/(\d+)/(\w+)").unwrap(),
                    vec!["id".to_string(), "name".to_string()],
                ),
                Vec::new(),
                noop_handler(),
            )
            .unwrap();

        let m = table.lookup(&Method::GET, "/files/42/report").unwrap();
        assert_eq!(m.params["id"], "42");
        assert_eq!(m.params["name"], "report");

        // Anchored full-path semantics.
        assert!(table.lookup(&Method::GET, "/files/42/report/x").is_none());
    }

    #[test]
    fn test_regex_named_and_positional_captures() {
        let table = RouteTable::new();
        table
            .add(
                "GET",
                Pattern::Regex(
                    Regex::new(r"/v(?P<version>\d+)/(\w+)").unwrap(),
                    Vec::new(),
                ),
                Vec::new(),
                noop_handler(),
            )
            .unwrap();

        let m = table.lookup(&Method::GET, "/v2/status").unwrap();
        assert_eq!(m.params["version"], "2");
        assert_eq!(m.params["param2"], "status");
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let table = RouteTable::new();
        assert!(table
            .add(
                "NOT A METHOD!",
                Pattern::Path("/x".into()),
                Vec::new(),
                noop_handler()
            )
            .is_err());
        assert!(table
            .add("GET", Pattern::Path("no-slash".into()), Vec::new(), noop_handler())
            .is_err());
    }

    #[test]
    fn test_route_stats_record() {
        let table = table_with(&[("GET", "/a")]);
        let m = table.lookup(&Method::GET, "/a").unwrap();
        m.route.stats.record(Duration::from_micros(15), false);
        m.route.stats.record(Duration::from_micros(5), true);
        assert_eq!(m.route.stats.hits.load(Ordering::Relaxed), 2);
        assert_eq!(m.route.stats.errors.load(Ordering::Relaxed), 1);
        assert_eq!(m.route.stats.total_micros.load(Ordering::Relaxed), 20);
    }
}
