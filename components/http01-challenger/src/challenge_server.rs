use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};

use crate::{extract_token_from_path, ChallengeDirectoryRef};

/// Header set by the networking layer's probes.
pub const PROBE_HEADER_NAME: &str = "K-Network-Probe";
pub const PROBE_HEADER_VALUE: &str = "probe";
/// Header a network probe expects echoed back.
pub const HASH_HEADER_NAME: &str = "K-Network-Hash";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChallengeServerConfig {
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
}

fn default_probe_path() -> String {
    "/healthz".to_string()
}

impl Default for ChallengeServerConfig {
    fn default() -> Self {
        Self {
            probe_path: default_probe_path(),
        }
    }
}

/// Answers ACME HTTP-01 lookups from a [`crate::ChallengeDirectory`] and
/// health probes that must succeed whether or not any order is outstanding.
pub struct ChallengeServer {
    config: ChallengeServerConfig,
    directory: ChallengeDirectoryRef,
}

pub type ChallengeServerRef = Arc<ChallengeServer>;

impl ChallengeServer {
    pub fn new(directory: ChallengeDirectoryRef) -> Self {
        Self::with_config(directory, ChallengeServerConfig::default())
    }

    pub fn with_config(directory: ChallengeDirectoryRef, config: ChallengeServerConfig) -> Self {
        ChallengeServer { config, directory }
    }

    pub fn directory(&self) -> &ChallengeDirectoryRef {
        &self.directory
    }

    /// Never fails: every request ends as 200, 400 (malformed probe) or 404.
    pub fn serve_request<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if let Some(probe) = req.headers().get(PROBE_HEADER_NAME) {
            if probe.as_bytes() == PROBE_HEADER_VALUE.as_bytes() {
                return self.serve_network_probe(req);
            }
        }

        let path = req.uri().path();
        if path == self.config.probe_path {
            return text_response(StatusCode::OK, "ok");
        }

        if let Some(payload) = self.directory.get_response(path) {
            debug!("serve challenge {} {}", req.method(), path);
            let mut resp = Response::new(Full::new(Bytes::from(payload)));
            resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
            return resp;
        }

        match extract_token_from_path(path) {
            Some(token) => info!("challenge token {} not found", token),
            None => debug!("{} {} not found", req.method(), path),
        }
        text_response(StatusCode::NOT_FOUND, "Not Found")
    }

    fn serve_network_probe<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        match req.headers().get(HASH_HEADER_NAME) {
            Some(hash) if !hash.is_empty() => {
                let mut resp = text_response(StatusCode::OK, "");
                resp.headers_mut().insert(HASH_HEADER_NAME, hash.clone());
                resp
            }
            _ => text_response(
                StatusCode::BAD_REQUEST,
                format!("header {} missing", HASH_HEADER_NAME),
            ),
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChallengeDirectory;
    use http::Method;
    use http_body_util::BodyExt;

    fn get(path: &str) -> Request<()> {
        Request::builder().method(Method::GET).uri(path).body(()).unwrap()
    }

    async fn body_of(resp: Response<Full<Bytes>>) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_basic_lifecycle() {
        let cases: Vec<Vec<(&str, &str)>> = vec![
            vec![("/foo/bar", "baz")],
            vec![
                ("/foo/bar", "baz"),
                ("/.well-known/acme/dsaflkjhsdf", "ugh"),
                ("/wtf", "is this"),
            ],
        ];

        for paths in cases {
            let dir = Arc::new(ChallengeDirectory::new());
            let server = ChallengeServer::new(dir.clone());

            for (path, _) in &paths {
                assert_eq!(server.serve_request(&get(path)).status(), StatusCode::NOT_FOUND);
            }

            for (path, payload) in &paths {
                dir.register_challenge(path, payload);
                let resp = server.serve_request(&get(path));
                assert_eq!(resp.status(), StatusCode::OK);
                assert_eq!(body_of(resp).await, Bytes::from(payload.to_string()));
            }

            for (path, _) in &paths {
                dir.unregister_challenge(path);
                assert_eq!(server.serve_request(&get(path)).status(), StatusCode::NOT_FOUND);
            }
        }
    }

    #[tokio::test]
    async fn test_payload_is_byte_exact_for_any_method() {
        let dir = Arc::new(ChallengeDirectory::new());
        let server = ChallengeServer::new(dir.clone());
        let payload = "tok-1.Zx9_-thumb \n";
        dir.register_challenge("/.well-known/acme-challenge/tok-1", payload);

        let req = Request::builder()
            .method(Method::POST)
            .uri("/.well-known/acme-challenge/tok-1")
            .body(())
            .unwrap();
        let resp = server.serve_request(&req);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_of(resp).await, Bytes::from(payload));
    }

    #[tokio::test]
    async fn test_probe_path_independent_of_challenges() {
        let dir = Arc::new(ChallengeDirectory::new());
        let server = ChallengeServer::with_config(
            dir.clone(),
            ChallengeServerConfig { probe_path: "/ready".to_string() },
        );

        assert_eq!(server.serve_request(&get("/ready")).status(), StatusCode::OK);
        dir.register_challenge("/x", "y");
        assert_eq!(server.serve_request(&get("/ready")).status(), StatusCode::OK);
        assert_eq!(server.serve_request(&get("/healthz")).status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_network_probe_header() {
        let dir = Arc::new(ChallengeDirectory::new());
        let server = ChallengeServer::new(dir.clone());
        dir.register_challenge("/.well-known/acme-challenge/t", "payload");

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/t")
            .header(PROBE_HEADER_NAME, PROBE_HEADER_VALUE)
            .header(HASH_HEADER_NAME, "abc")
            .body(())
            .unwrap();
        let resp = server.serve_request(&req);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(HASH_HEADER_NAME).unwrap(), "abc");

        let req = Request::builder()
            .uri("/anything")
            .header(PROBE_HEADER_NAME, PROBE_HEADER_VALUE)
            .body(())
            .unwrap();
        assert_eq!(server.serve_request(&req).status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri("/.well-known/acme-challenge/t")
            .header(PROBE_HEADER_NAME, "not-a-probe")
            .body(())
            .unwrap();
        let resp = server.serve_request(&req);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_of(resp).await, Bytes::from("payload"));
    }
}
