//! Multi-tier request classification.
//!
//! Every request is tagged before middleware dispatch: `ultra-fast` requests
//! are answered straight from the secure cache, `fast` requests run a chain
//! declared entirely fast-safe, everything else is `standard`. The decision
//! is deterministic from the request attributes and the registered templates
//! and never consults the clock.

use std::sync::RwLock;

use http::Method;
use matchit::Router as TemplateRouter;

use crate::core::{Classification, Request, XyPrissError, XyResult};
use crate::middleware::MiddlewareChain;
use crate::router::RouteTable;

/// Cache key for an ultra-fast response: `ultra:{METHOD}:{path}`.
pub fn ultra_fast_key(method: &Method, path: &str) -> String {
    format!("ultra:{}:{}", method.as_str(), path)
}

#[derive(Default)]
pub struct RequestClassifier {
    templates: RwLock<TemplateRouter<String>>,
    template_patterns: RwLock<Vec<String>>,
}

impl RequestClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an ultra-fast path template. `:name` placeholders are
    /// accepted and rewritten to the matcher's `{name}` syntax.
    pub fn register_template(&self, template: &str) -> XyResult<()> {
        let pattern = template
            .split('/')
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) => format!("{{{name}}}"),
                None => seg.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");

        let mut templates = self.templates.write().unwrap();
        templates
            .insert(pattern.clone(), template.to_string())
            .map_err(|e| {
                XyPrissError::Config(format!("invalid ultra-fast template {template}: {e}"))
            })?;
        self.template_patterns.write().unwrap().push(pattern);
        Ok(())
    }

    pub fn templates(&self) -> Vec<String> {
        self.template_patterns.read().unwrap().clone()
    }

    fn matches_template(&self, path: &str) -> bool {
        self.templates.read().unwrap().at(path).is_ok()
    }

    /// Decides the dispatch path for a request.
    pub fn classify(
        &self,
        req: &Request,
        chain: &MiddlewareChain,
        routes: &RouteTable,
    ) -> Classification {
        if matches!(req.method, Method::GET | Method::HEAD)
            && !req.has_cookies()
            && self.matches_template(req.path())
        {
            return Classification::UltraFast;
        }

        // Fast path: the global chain and the matched route's middleware set
        // must be empty or declared fast-safe throughout.
        if chain.is_fast_safe(req.path()) {
            let route_fast = match routes.lookup(&req.method, req.path()) {
                Some(found) => found
                    .route
                    .middleware
                    .iter()
                    .all(|id| chain.get(id).map(|e| e.fast_safe || !e.enabled()).unwrap_or(false)),
                None => true,
            };
            if route_fast {
                return Classification::Fast;
            }
        }

        Classification::Standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Flow, MiddlewareFn, RegisterOptions};
    use crate::router::{Handler, HandlerFn, Pattern};
    use crate::core::Response;
    use std::sync::Arc;

    fn noop() -> Arc<dyn Handler> {
        Arc::new(HandlerFn(|_req: &mut Request, _res: &mut Response| Ok(())))
    }

    fn passthrough(fast_safe: bool, id: &str) -> (Arc<dyn crate::middleware::Middleware>, RegisterOptions) {
        (
            Arc::new(MiddlewareFn(|_req: &mut Request, _res: &mut Response| {
                Ok(Flow::Continue)
            })),
            RegisterOptions {
                id: Some(id.to_string()),
                fast_safe,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_ultra_fast_key_shape() {
        assert_eq!(ultra_fast_key(&Method::GET, "/health"), "ultra:GET:/health");
    }

    #[test]
    fn test_ultra_fast_requires_template_and_no_cookies() {
        let classifier = RequestClassifier::new();
        classifier.register_template("/health").unwrap();
        let chain = MiddlewareChain::new();
        let routes = RouteTable::new();

        let req = Request::from_parts(Method::GET, "/health");
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::UltraFast
        );

        // Unregistered path is not ultra-fast.
        let req = Request::from_parts(Method::GET, "/other");
        assert_ne!(
            classifier.classify(&req, &chain, &routes),
            Classification::UltraFast
        );

        // Cookies indicate personalization.
        let mut req = Request::from_parts(Method::GET, "/health");
        req.headers
            .insert(http::header::COOKIE, "session=1".parse().unwrap());
        assert_ne!(
            classifier.classify(&req, &chain, &routes),
            Classification::UltraFast
        );

        // Only GET and HEAD qualify.
        let req = Request::from_parts(Method::POST, "/health");
        assert_ne!(
            classifier.classify(&req, &chain, &routes),
            Classification::UltraFast
        );
    }

    #[test]
    fn test_parameterized_template() {
        let classifier = RequestClassifier::new();
        classifier.register_template("/api/items/:id").unwrap();
        let chain = MiddlewareChain::new();
        let routes = RouteTable::new();

        let req = Request::from_parts(Method::HEAD, "/api/items/42");
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::UltraFast
        );
    }

    #[test]
    fn test_fast_vs_standard() {
        let classifier = RequestClassifier::new();
        let chain = MiddlewareChain::new();
        let routes = RouteTable::new();

        // Empty chain: fast.
        let req = Request::from_parts(Method::POST, "/submit");
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::Fast
        );

        // All middleware fast-safe: still fast.
        let (mw, opts) = passthrough(true, "fast-1");
        chain.register(mw, opts).unwrap();
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::Fast
        );

        // One non-fast-safe middleware drops to standard.
        let (mw, opts) = passthrough(false, "slow-1");
        chain.register(mw, opts).unwrap();
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::Standard
        );
    }

    #[test]
    fn test_route_middleware_affects_fast_path() {
        let classifier = RequestClassifier::new();
        let chain = MiddlewareChain::new();
        let routes = RouteTable::new();

        let (mw, opts) = passthrough(false, "heavy");
        chain.register(mw, opts).unwrap();
        chain.disable("heavy");

        routes
            .add(
                "GET",
                Pattern::Path("/r".to_string()),
                vec!["heavy".to_string()],
                noop(),
            )
            .unwrap();

        // Disabled route middleware does not forfeit the fast path.
        let req = Request::from_parts(Method::GET, "/r");
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::Fast
        );

        chain.enable("heavy");
        assert_eq!(
            classifier.classify(&req, &chain, &routes),
            Classification::Standard
        );
    }
}
