//! Response compression.
//!
//! Applied to the final response body when the client accepts the chosen
//! algorithm, the content type is eligible, the body meets the size
//! threshold, and the response is not already encoded. Brotli is preferred
//! over gzip over deflate when the client accepts several.

use std::io::Write;

use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use http::header;

use crate::core::{Request, Response, XyPrissError, XyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Gzip,
    Deflate,
    Brotli,
}

impl Algorithm {
    fn token(&self) -> &'static str {
        match self {
            Algorithm::Gzip => "gzip",
            Algorithm::Deflate => "deflate",
            Algorithm::Brotli => "br",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub enabled: bool,
    /// 1-9; clamped.
    pub level: u32,
    /// Bodies below this size are left alone.
    pub threshold: usize,
    /// Content-type prefixes eligible for compression.
    pub content_types: Vec<String>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
            threshold: 1024,
            content_types: vec![
                "text/".to_string(),
                "application/json".to_string(),
                "application/javascript".to_string(),
                "image/svg+xml".to_string(),
            ],
        }
    }
}

pub struct CompressionPlugin {
    options: CompressionOptions,
}

impl CompressionPlugin {
    pub fn new(options: CompressionOptions) -> Self {
        Self { options }
    }

    /// Picks the response algorithm from the `Accept-Encoding` header.
    fn negotiate(accept_encoding: &str) -> Option<Algorithm> {
        let mut gzip = false;
        let mut deflate = false;
        let mut brotli = false;
        for token in accept_encoding.split(',') {
            let token = token.trim();
            let (name, q) = match token.split_once(";q=") {
                Some((name, q)) => (name.trim(), q.trim().parse::<f32>().unwrap_or(1.0)),
                None => (token, 1.0),
            };
            if q <= 0.0 {
                continue;
            }
            match name {
                "br" => brotli = true,
                "gzip" | "x-gzip" => gzip = true,
                "deflate" => deflate = true,
                "*" => gzip = true,
                _ => {}
            }
        }
        if brotli {
            Some(Algorithm::Brotli)
        } else if gzip {
            Some(Algorithm::Gzip)
        } else if deflate {
            Some(Algorithm::Deflate)
        } else {
            None
        }
    }

    fn content_type_eligible(&self, content_type: &str) -> bool {
        self.options
            .content_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }

    /// Compresses the response in place when every gate passes. Returns the
    /// algorithm applied, if any.
    pub fn apply(&self, req: &Request, res: &mut Response) -> XyResult<Option<Algorithm>> {
        if !self.options.enabled || res.body_len() < self.options.threshold {
            return Ok(None);
        }
        if res.headers.contains_key(header::CONTENT_ENCODING) {
            return Ok(None);
        }
        let content_type = res
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !self.content_type_eligible(content_type) {
            return Ok(None);
        }
        let Some(algorithm) = req.header("accept-encoding").and_then(Self::negotiate) else {
            return Ok(None);
        };

        let level = self.options.level.clamp(1, 9);
        let packed = match algorithm {
            Algorithm::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(res.body()).map_err(XyPrissError::Network)?;
                encoder.finish().map_err(XyPrissError::Network)?
            }
            Algorithm::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
                encoder.write_all(res.body()).map_err(XyPrissError::Network)?;
                encoder.finish().map_err(XyPrissError::Network)?
            }
            Algorithm::Brotli => {
                let mut encoder =
                    brotli::CompressorWriter::new(Vec::new(), 4096, level, 22);
                encoder.write_all(res.body()).map_err(XyPrissError::Network)?;
                encoder.flush().map_err(XyPrissError::Network)?;
                encoder.into_inner()
            }
        };

        // Swap the body under the sent flag: compression runs after the
        // handler finished the response.
        res.headers.insert(
            header::CONTENT_ENCODING,
            algorithm.token().parse().unwrap(),
        );
        res.headers
            .append(header::VARY, "accept-encoding".parse().unwrap());
        res.replace_body_post_send(packed);
        Ok(Some(algorithm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn plugin() -> CompressionPlugin {
        CompressionPlugin::new(CompressionOptions {
            threshold: 16,
            ..Default::default()
        })
    }

    fn request_accepting(encoding: &str) -> Request {
        let mut req = Request::from_parts(Method::GET, "/");
        req.headers
            .insert("accept-encoding", encoding.parse().unwrap());
        req
    }

    fn json_response(size: usize) -> Response {
        let mut res = Response::new();
        res.set_header("content-type", "application/json");
        res.send_bytes("x".repeat(size).into_bytes());
        res
    }

    #[test]
    fn test_negotiation_prefers_brotli() {
        assert_eq!(
            CompressionPlugin::negotiate("gzip, br, deflate"),
            Some(Algorithm::Brotli)
        );
        assert_eq!(CompressionPlugin::negotiate("gzip"), Some(Algorithm::Gzip));
        assert_eq!(
            CompressionPlugin::negotiate("deflate;q=0.5"),
            Some(Algorithm::Deflate)
        );
        assert_eq!(CompressionPlugin::negotiate("br;q=0"), None);
        assert_eq!(CompressionPlugin::negotiate("identity"), None);
    }

    #[test]
    fn test_gzip_applied() {
        let req = request_accepting("gzip");
        let mut res = json_response(2048);
        let applied = plugin().apply(&req, &mut res).unwrap();
        assert_eq!(applied, Some(Algorithm::Gzip));
        assert_eq!(res.headers.get("content-encoding").unwrap(), "gzip");
        assert!(res.body_len() < 2048);
    }

    #[test]
    fn test_below_threshold_untouched() {
        let req = request_accepting("gzip");
        let mut res = json_response(8);
        assert_eq!(plugin().apply(&req, &mut res).unwrap(), None);
        assert!(!res.headers.contains_key("content-encoding"));
    }

    #[test]
    fn test_ineligible_content_type_untouched() {
        let req = request_accepting("gzip");
        let mut res = Response::new();
        res.set_header("content-type", "image/png");
        res.send_bytes(vec![0u8; 4096]);
        assert_eq!(plugin().apply(&req, &mut res).unwrap(), None);
    }

    #[test]
    fn test_already_encoded_untouched() {
        let req = request_accepting("gzip");
        let mut res = json_response(2048);
        res.headers
            .insert(header::CONTENT_ENCODING, "br".parse().unwrap());
        assert_eq!(plugin().apply(&req, &mut res).unwrap(), None);
    }

    #[test]
    fn test_no_accept_encoding_untouched() {
        let req = Request::from_parts(Method::GET, "/");
        let mut res = json_response(2048);
        assert_eq!(plugin().apply(&req, &mut res).unwrap(), None);
    }

    #[test]
    fn test_brotli_roundtrip() {
        let req = request_accepting("br");
        let mut res = json_response(4096);
        assert_eq!(plugin().apply(&req, &mut res).unwrap(), Some(Algorithm::Brotli));

        let mut decoded = Vec::new();
        let mut reader = brotli::Decompressor::new(res.body(), 4096);
        std::io::Read::read_to_end(&mut reader, &mut decoded).unwrap();
        assert_eq!(decoded, "x".repeat(4096).into_bytes());
    }
}
