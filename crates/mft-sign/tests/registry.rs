//! Push and pull against an in-process registry.
//!
//! The registry speaks enough of the distribution API for the client:
//! upload sessions, blobs, manifests, tag listing and, optionally, the
//! referrers API. It can require Basic auth or deny every repository.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::Response,
    Router,
};
use mft::{
    credentials::{Anonymous, Credential, CredentialStore},
    digest::sha256_digest,
    test::TestEnv,
    CopyOptions, Error, Repository,
};
use mft_sign::{ops, KeyStore, PackOptions, PullOptions, DEFAULT_KEY_NAME};
use serde_json::json;

const DEPLOYMENT: &[u8] = b"apiVersion: apps/v1\nkind: Deployment\nx:\n";
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// `Basic` credentials for mft:s3cret.
const AUTHORIZATION: &str = "Basic bWZ0OnMzY3JldA==";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Open,
    Login,
    Deny,
}

#[derive(Debug, Default)]
struct Inner {
    blobs: HashMap<String, Bytes>,
    /// repository -> tag or digest -> (media type, body)
    manifests: HashMap<String, HashMap<String, (String, Bytes)>>,
    uploads: HashMap<String, Vec<u8>>,
    next_upload: usize,
    requests: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockRegistry {
    host: String,
    access: Access,
    referrers_api: bool,
    inner: Arc<Mutex<Inner>>,
}

impl MockRegistry {
    async fn start(access: Access, referrers_api: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = Self {
            host: listener.local_addr().unwrap().to_string(),
            access,
            referrers_api,
            inner: Arc::default(),
        };
        let app = Router::new()
            .fallback(handle)
            .with_state(registry.clone());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        registry
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn reference(&self, repository_and_tag: &str) -> String {
        format!("{}/{repository_and_tag}", self.host)
    }

    fn manifest(&self, repository: &str, reference: &str) -> Option<Bytes> {
        self.lock()
            .manifests
            .get(repository)
            .and_then(|m| m.get(reference))
            .map(|(_, body)| body.clone())
    }

    fn requested(&self, needle: &str) -> bool {
        self.lock().requests.iter().any(|r| r.contains(needle))
    }

    fn upload(&self, method: &Method, repository: &str, id: &str, query: &str, body: Bytes) -> Response {
        let mut inner = self.lock();
        let id = if !id.is_empty() {
            id.to_string()
        } else if *method == Method::POST {
            inner.next_upload += 1;
            let id = inner.next_upload.to_string();
            inner.uploads.insert(id.clone(), Vec::new());
            id
        } else {
            return reply(StatusCode::METHOD_NOT_ALLOWED, &[], Body::empty());
        };
        let Some(buffer) = inner.uploads.get_mut(&id) else {
            return reply(
                StatusCode::NOT_FOUND,
                &[],
                error_body("BLOB_UPLOAD_UNKNOWN", "blob upload unknown to registry"),
            );
        };
        buffer.extend_from_slice(&body);
        let received = buffer.len();

        let Some(digest) = query_digest(query) else {
            return reply(
                StatusCode::ACCEPTED,
                &[
                    ("location", format!("http://{}/v2/{repository}/blobs/uploads/{id}", self.host)),
                    ("range", format!("0-{}", received.saturating_sub(1))),
                    ("docker-upload-uuid", id),
                ],
                Body::empty(),
            );
        };
        let data = Bytes::from(inner.uploads.remove(&id).unwrap_or_default());
        if sha256_digest(&data) != digest {
            return reply(
                StatusCode::BAD_REQUEST,
                &[],
                error_body("DIGEST_INVALID", "provided digest did not match uploaded content"),
            );
        }
        inner.blobs.insert(digest.clone(), data);
        reply(
            StatusCode::CREATED,
            &[
                ("location", format!("http://{}/v2/{repository}/blobs/{digest}", self.host)),
                ("docker-content-digest", digest),
            ],
            Body::empty(),
        )
    }

    fn blob(&self, method: &Method, digest: &str) -> Response {
        match self.lock().blobs.get(digest) {
            Some(data) => reply(
                StatusCode::OK,
                &[
                    ("content-type", "application/octet-stream".into()),
                    ("docker-content-digest", digest.into()),
                ],
                if *method == Method::HEAD {
                    Body::empty()
                } else {
                    Body::from(data.clone())
                },
            ),
            None => reply(
                StatusCode::NOT_FOUND,
                &[],
                error_body("BLOB_UNKNOWN", "blob unknown to registry"),
            ),
        }
    }

    fn manifest_request(
        &self,
        method: &Method,
        repository: &str,
        reference: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response {
        let mut inner = self.lock();
        if *method == Method::PUT {
            let media_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let digest = sha256_digest(&body);
            let has_subject = serde_json::from_slice::<serde_json::Value>(&body)
                .is_ok_and(|v| v.get("subject").is_some());
            let stored = inner.manifests.entry(repository.to_string()).or_default();
            stored.insert(digest.clone(), (media_type.clone(), body.clone()));
            stored.insert(reference.to_string(), (media_type, body));

            let mut headers = vec![
                ("location", format!("http://{}/v2/{repository}/manifests/{digest}", self.host)),
                ("docker-content-digest", digest.clone()),
            ];
            if has_subject && self.referrers_api {
                headers.push(("oci-subject", digest));
            }
            return reply(StatusCode::CREATED, &headers, Body::empty());
        }

        match inner.manifests.get(repository).and_then(|m| m.get(reference)) {
            Some((media_type, data)) => reply(
                StatusCode::OK,
                &[
                    ("content-type", media_type.clone()),
                    ("docker-content-digest", sha256_digest(data)),
                ],
                if *method == Method::HEAD {
                    Body::empty()
                } else {
                    Body::from(data.clone())
                },
            ),
            None => reply(
                StatusCode::NOT_FOUND,
                &[],
                error_body("MANIFEST_UNKNOWN", "manifest unknown to registry"),
            ),
        }
    }

    fn referrers(&self, repository: &str, subject: &str) -> Response {
        if !self.referrers_api {
            return reply(StatusCode::NOT_FOUND, &[], Body::from("404 page not found"));
        }
        let inner = self.lock();
        let mut manifests = Vec::new();
        for (reference, (media_type, body)) in inner.manifests.get(repository).into_iter().flatten() {
            if !reference.starts_with("sha256:") {
                continue;
            }
            let Ok(doc) = serde_json::from_slice::<serde_json::Value>(body) else {
                continue;
            };
            if doc["subject"]["digest"].as_str() != Some(subject) {
                continue;
            }
            manifests.push(json!({
                "mediaType": media_type,
                "digest": reference,
                "size": body.len(),
                "artifactType": doc["artifactType"].clone(),
            }));
        }
        let index = json!({
            "schemaVersion": 2,
            "mediaType": INDEX_MEDIA_TYPE,
            "manifests": manifests,
        });
        reply(
            StatusCode::OK,
            &[("content-type", INDEX_MEDIA_TYPE.into())],
            Body::from(index.to_string()),
        )
    }

    fn tags(&self, repository: &str) -> Response {
        let inner = self.lock();
        let mut tags: Vec<&String> = inner
            .manifests
            .get(repository)
            .into_iter()
            .flat_map(|m| m.keys())
            .filter(|r| !r.contains(':'))
            .collect();
        tags.sort();
        let list = json!({ "name": repository, "tags": tags });
        reply(
            StatusCode::OK,
            &[("content-type", "application/json".into())],
            Body::from(list.to_string()),
        )
    }
}

async fn handle(
    State(registry): State<MockRegistry>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    registry.lock().requests.push(format!("{method} {path}"));
    let Some(rest) = path.strip_prefix("/v2/") else {
        return reply(StatusCode::NOT_FOUND, &[], Body::empty());
    };

    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(AUTHORIZATION);
    match registry.access {
        Access::Login if !authorized => {
            return reply(
                StatusCode::UNAUTHORIZED,
                &[("www-authenticate", r#"Basic realm="mock""#.into())],
                error_body("UNAUTHORIZED", "authentication required"),
            )
        }
        Access::Deny if !rest.is_empty() => {
            return reply(
                StatusCode::FORBIDDEN,
                &[],
                error_body("DENIED", "requested access to the resource is denied"),
            )
        }
        _ => {}
    }
    if rest.is_empty() {
        return reply(
            StatusCode::OK,
            &[("content-type", "application/json".into())],
            Body::from("{}"),
        );
    }

    let query = uri.query().unwrap_or_default();
    if let Some((repository, id)) = rest.split_once("/blobs/uploads/") {
        registry.upload(&method, repository, id, query, body)
    } else if let Some((_, digest)) = rest.split_once("/blobs/") {
        registry.blob(&method, digest)
    } else if let Some((repository, reference)) = rest.split_once("/manifests/") {
        registry.manifest_request(&method, repository, reference, &headers, body)
    } else if let Some((repository, digest)) = rest.split_once("/referrers/") {
        registry.referrers(repository, digest)
    } else if let Some(repository) = rest.strip_suffix("/tags/list") {
        registry.tags(repository)
    } else {
        reply(StatusCode::NOT_FOUND, &[], Body::empty())
    }
}

fn reply(status: StatusCode, headers: &[(&str, String)], body: Body) -> Response {
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder.body(body).unwrap()
}

fn error_body(code: &str, message: &str) -> Body {
    Body::from(json!({ "errors": [{ "code": code, "message": message }] }).to_string())
}

fn query_digest(query: &str) -> Option<String> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("digest="))
        .map(|d| d.replace("%3A", ":").replace("%3a", ":"))
}

#[derive(Debug)]
struct Login;

impl CredentialStore for Login {
    fn get(&self, _registry: &str) -> mft::Result<Option<Credential>> {
        Ok(Some(Credential {
            username: "mft".into(),
            password: "s3cret".into(),
        }))
    }
}

fn with_referrers() -> CopyOptions {
    CopyOptions {
        with_referrers: true,
        ..Default::default()
    }
}

/// Packs and signs [`DEPLOYMENT`] as `reference` in a fresh store.
async fn packed(reference: &str, credentials: Arc<dyn CredentialStore>) -> (TestEnv, KeyStore, Repository) {
    let env = TestEnv::new();
    let keys = KeyStore::from_config(&env.config);
    keys.generate(DEFAULT_KEY_NAME, false).unwrap();
    let repo = Repository::new(&env.config, reference)
        .unwrap()
        .with_credentials(credentials);
    ops::pack(
        &repo,
        &keys,
        &env.write_manifest("deployment.yaml", DEPLOYMENT),
        &PackOptions::default(),
    )
    .await
    .unwrap();
    (env, keys, repo)
}

#[tokio::test]
async fn push_then_pull_verifies_signature() {
    let registry = MockRegistry::start(Access::Open, true).await;
    let reference = registry.reference("team/app:v1");
    let (_env, keys, repo) = packed(&reference, Arc::new(Anonymous)).await;

    let pushed = repo.push(&with_referrers()).await.unwrap();
    assert_eq!(pushed.root.digest(), repo.resolve().await.unwrap().digest());
    assert!(registry.manifest("team/app", "v1").is_some());
    let subject_tag = pushed.root.digest().to_string().replace(':', "-");
    assert!(registry.manifest("team/app", &subject_tag).is_none());

    // everything is already there the second time
    let again = repo.push(&with_referrers()).await.unwrap();
    assert_eq!(again.copied, 0);

    let other = TestEnv::new();
    let pulled_repo = Repository::new(&other.config, &reference)
        .unwrap()
        .with_credentials(Arc::new(Anonymous));
    let pulled = ops::pull(&pulled_repo, &keys, &PullOptions::default())
        .await
        .unwrap();
    assert_eq!(pulled.copy.root.digest(), pushed.root.digest());
    assert_eq!(pulled.verified.unwrap().key, DEFAULT_KEY_NAME);
    assert_eq!(pulled_repo.dump().await.unwrap(), DEPLOYMENT);
    assert!(registry.requested("GET /v2/team/app/referrers/"));
}

#[tokio::test]
async fn pull_of_unknown_tag_is_not_found() {
    let registry = MockRegistry::start(Access::Open, true).await;
    let env = TestEnv::new();
    let keys = KeyStore::from_config(&env.config);
    let repo = Repository::new(&env.config, &registry.reference("team/app:nope"))
        .unwrap()
        .with_credentials(Arc::new(Anonymous));

    let err = ops::pull(&repo, &keys, &PullOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(!repo.exists().await.unwrap());
}

#[tokio::test]
async fn missing_credentials_are_unauthorized() {
    let registry = MockRegistry::start(Access::Login, true).await;
    let reference = registry.reference("team/app:v1");
    let (_env, keys, repo) = packed(&reference, Arc::new(Anonymous)).await;

    let err = repo.push(&with_referrers()).await.unwrap_err();
    assert!(
        matches!(&err, Error::Unauthorized { registry: r, .. } if *r == registry.host),
        "{err}"
    );
    assert!(registry.manifest("team/app", "v1").is_none());

    // the same artifact goes through once the registry gets credentials
    let repo = repo.with_credentials(Arc::new(Login));
    repo.push(&with_referrers()).await.unwrap();
    assert!(registry.manifest("team/app", "v1").is_some());

    let other = TestEnv::new();
    let pulled_repo = Repository::new(&other.config, &reference)
        .unwrap()
        .with_credentials(Arc::new(Login));
    ops::pull(&pulled_repo, &keys, &PullOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn denied_repository_is_forbidden() {
    let registry = MockRegistry::start(Access::Deny, true).await;
    let reference = registry.reference("team/app:v1");
    let (_env, keys, repo) = packed(&reference, Arc::new(Login)).await;

    let err = repo.push(&with_referrers()).await.unwrap_err();
    let expected = format!("{}/team/app", registry.host);
    assert!(
        matches!(&err, Error::Forbidden { repository, .. } if *repository == expected),
        "{err}"
    );

    let other = TestEnv::new();
    let pulled_repo = Repository::new(&other.config, &reference)
        .unwrap()
        .with_credentials(Arc::new(Login));
    let err = ops::pull(&pulled_repo, &keys, &PullOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden { .. }), "{err}");
    assert!(!pulled_repo.exists().await.unwrap());
}

#[tokio::test]
async fn referrers_fall_back_to_tag_schema() {
    let registry = MockRegistry::start(Access::Open, false).await;
    let reference = registry.reference("team/app:v1");
    let (_env, keys, repo) = packed(&reference, Arc::new(Anonymous)).await;

    let pushed = repo.push(&with_referrers()).await.unwrap();
    let subject_tag = pushed.root.digest().to_string().replace(':', "-");
    let index = registry
        .manifest("team/app", &subject_tag)
        .expect("signature indexed under the subject's digest tag");
    let index: serde_json::Value = serde_json::from_slice(&index).unwrap();
    let entries = index["manifests"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0]["artifactType"],
        "application/vnd.kubectl-mft.signature.v1"
    );

    // pushing again must not duplicate the entry
    repo.push(&with_referrers()).await.unwrap();
    let index: serde_json::Value =
        serde_json::from_slice(&registry.manifest("team/app", &subject_tag).unwrap()).unwrap();
    assert_eq!(index["manifests"].as_array().unwrap().len(), 1);

    let other = TestEnv::new();
    let pulled_repo = Repository::new(&other.config, &reference)
        .unwrap()
        .with_credentials(Arc::new(Anonymous));
    let pulled = ops::pull(&pulled_repo, &keys, &PullOptions::default())
        .await
        .unwrap();
    assert_eq!(pulled.verified.unwrap().key, DEFAULT_KEY_NAME);
    assert!(registry.requested("GET /v2/team/app/referrers/"));
    assert!(registry.requested(&format!("GET /v2/team/app/manifests/{subject_tag}")));
}
