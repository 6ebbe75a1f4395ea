//! End-to-end pull-through behavior against in-memory collaborators and
//! real HTTP upstreams.

use bytes::Bytes;
use pullgate::catalog::{ImageStream, MemoryCatalog, TagImportPolicy, TagReference};
use pullgate::image::{
    Digest, Image, Manifest, INSECURE_REPOSITORY_ANNOTATION, MEDIA_TYPE_SCHEMA2,
};
use pullgate::registry::{
    RegistryError, RemoteBlob, TransportKind, UpstreamClientFactory, UpstreamRepository,
};
use pullgate::server::{App, Error, PullthroughConfig, RequestContext};
use pullgate::store::{LocalBlobStore, LocalManifestStore, MemoryStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn schema2_payload(seed: &str) -> String {
    format!(
        r#"{{"schemaVersion": 2, "mediaType": "{}", "config": {{"mediaType": "application/vnd.docker.container.image.v1+json", "digest": "{}", "size": 2}}, "layers": []}}"#,
        MEDIA_TYPE_SCHEMA2,
        Digest::from_bytes(seed.as_bytes())
    )
}

fn image_for(manifest: &Manifest, upstream_repo: &str) -> Image {
    Image {
        name: manifest.digest.to_string(),
        docker_image_reference: format!("{}@{}", upstream_repo, manifest.digest),
        docker_image_manifest: String::new(),
        docker_image_manifest_media_type: MEDIA_TYPE_SCHEMA2.to_string(),
        ..Default::default()
    }
}

fn stream_with_annotations(namespace: &str, name: &str, annotations: &[(&str, &str)]) -> ImageStream {
    ImageStream {
        namespace: namespace.to_string(),
        name: name.to_string(),
        annotations: annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

/// In-process upstream registry that records which hosts were contacted.
#[derive(Default)]
struct FakeState {
    manifests: Mutex<HashMap<(String, String), Manifest>>,
    blobs: Mutex<HashMap<(String, String), Bytes>>,
    contacted: Mutex<Vec<String>>,
}

impl FakeState {
    fn add_manifest(&self, host: &str, manifest: Manifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert((host.to_string(), manifest.digest.to_string()), manifest);
    }

    fn add_blob(&self, host: &str, data: Bytes) {
        let digest = Digest::from_bytes(&data);
        self.blobs
            .lock()
            .unwrap()
            .insert((host.to_string(), digest.to_string()), data);
    }

    fn contacted_hosts(&self) -> Vec<String> {
        self.contacted.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct FakeUpstreamFactory {
    state: Arc<FakeState>,
}

impl FakeUpstreamFactory {
    fn new() -> (Self, Arc<FakeState>) {
        let state = Arc::new(FakeState::default());
        (Self { state: state.clone() }, state)
    }
}

impl UpstreamClientFactory for FakeUpstreamFactory {
    fn repository(
        &self,
        host: &str,
        _repository: &str,
        _kind: TransportKind,
    ) -> Arc<dyn UpstreamRepository> {
        Arc::new(FakeUpstreamRepository {
            state: self.state.clone(),
            host: host.to_string(),
        })
    }
}

struct FakeUpstreamRepository {
    state: Arc<FakeState>,
    host: String,
}

impl FakeUpstreamRepository {
    fn touch(&self) {
        self.state.contacted.lock().unwrap().push(self.host.clone());
    }
}

#[async_trait::async_trait]
impl UpstreamRepository for FakeUpstreamRepository {
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest, RegistryError> {
        self.touch();
        self.state
            .manifests
            .lock()
            .unwrap()
            .get(&(self.host.clone(), digest.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("manifest {}", digest)))
    }

    async fn stat_blob(&self, digest: &Digest) -> Result<pullgate::image::Descriptor, RegistryError> {
        self.touch();
        self.state
            .blobs
            .lock()
            .unwrap()
            .get(&(self.host.clone(), digest.to_string()))
            .map(|data| pullgate::image::Descriptor {
                media_type: "application/octet-stream".to_string(),
                digest: digest.to_string(),
                size: data.len() as u64,
            })
            .ok_or_else(|| RegistryError::NotFound(format!("blob {}", digest)))
    }

    async fn open_blob(&self, digest: &Digest) -> Result<RemoteBlob, RegistryError> {
        let descriptor = self.stat_blob(digest).await?;
        let data = self
            .state
            .blobs
            .lock()
            .unwrap()
            .get(&(self.host.clone(), digest.to_string()))
            .cloned()
            .expect("stat verified presence");
        Ok(RemoteBlob {
            descriptor,
            stream: Box::pin(futures_util::stream::iter([Ok::<_, std::io::Error>(data)])),
        })
    }
}

fn app_with(
    catalog: Arc<MemoryCatalog>,
    store: Arc<MemoryStore>,
    factory: Option<FakeUpstreamFactory>,
    mirror: bool,
) -> Arc<App> {
    let mut builder = App::builder()
        .catalog(catalog)
        .manifest_store(store.clone())
        .blob_store(store)
        .pullthrough(PullthroughConfig {
            enabled: true,
            mirror,
        });
    if let Some(factory) = factory {
        builder = builder.upstream_factory(Arc::new(factory));
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn local_manifest_hit_needs_no_upstream() {
    let catalog = Arc::new(MemoryCatalog::new());
    let store = Arc::new(MemoryStore::new());
    let (factory, state) = FakeUpstreamFactory::new();

    let manifest = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(schema2_payload("m1")));
    store.put_manifest(&manifest).await.unwrap();

    let app = app_with(catalog, store.clone(), Some(factory), false);
    let repo = app.repository("ns/app").unwrap();
    let ctx = RequestContext::authorized();

    let served = repo.manifests().get(&ctx, &manifest.digest).await.unwrap();
    assert_eq!(served, manifest);
    assert_eq!(store.manifest_get_count(), 1);
    assert!(state.contacted_hosts().is_empty());
}

#[tokio::test]
async fn pullthrough_fetches_schema2_from_insecure_upstream() {
    let mut server = mockito::Server::new_async().await;
    let host = server.host_with_port();

    let payload = schema2_payload("m2");
    let manifest = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(payload.clone()));

    let mock = server
        .mock(
            "GET",
            format!("/v2/remote-ns/remote-app/manifests/{}", manifest.digest).as_str(),
        )
        .with_header("content-type", MEDIA_TYPE_SCHEMA2)
        .with_body(payload)
        .create_async()
        .await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_image_stream(stream_with_annotations(
        "ns",
        "app",
        &[(INSECURE_REPOSITORY_ANNOTATION, "true")],
    ));
    let image = image_for(&manifest, &format!("{}/remote-ns/remote-app", host));
    catalog.tag_image(&image, "ns", "app", "latest");

    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog, store.clone(), None, true);
    let repo = app.repository("ns/app").unwrap();
    let ctx = RequestContext::authorized();

    let served = repo.manifests().get(&ctx, &manifest.digest).await.unwrap();
    assert_eq!(served.payload, manifest.payload);
    assert_eq!(served.digest, manifest.digest);
    mock.assert_async().await;

    // Mirroring was on: the manifest is now local.
    assert!(store.manifest_exists(&manifest.digest).await.unwrap());
}

#[tokio::test]
async fn secure_transport_rejects_http_upstream() {
    let server = mockito::Server::new_async().await;
    let host = server.host_with_port();

    let payload = schema2_payload("m3");
    let manifest = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(payload));

    // The stream explicitly sets the annotation to "false"; the tag policy
    // stays default, so the secure transport is used against a plain-HTTP
    // upstream.
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_image_stream(stream_with_annotations(
        "ns",
        "app",
        &[(INSECURE_REPOSITORY_ANNOTATION, "false")],
    ));
    let image = image_for(&manifest, &format!("{}/remote-ns/remote-app", host));
    catalog.tag_image(&image, "ns", "app", "latest");

    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog, store, None, false);
    let repo = app.repository("ns/app").unwrap();
    let ctx = RequestContext::authorized();

    let err = repo
        .manifests()
        .get(&ctx, &manifest.digest)
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("server gave HTTP response to HTTPS client"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn tag_level_insecure_overrides_missing_stream_annotation() {
    let mut server = mockito::Server::new_async().await;
    let host = server.host_with_port();

    let payload = schema2_payload("m4");
    let manifest = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(payload.clone()));

    server
        .mock(
            "GET",
            format!("/v2/remote-ns/remote-app/manifests/{}", manifest.digest).as_str(),
        )
        .with_header("content-type", MEDIA_TYPE_SCHEMA2)
        .with_body(payload)
        .create_async()
        .await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_image_stream(stream_with_annotations("ns", "app", &[]));
    let image = image_for(&manifest, &format!("{}/remote-ns/remote-app", host));
    catalog.tag_image(&image, "ns", "app", "latest");
    catalog.set_tag_reference(
        "ns",
        "app",
        TagReference {
            name: "latest".to_string(),
            import_policy: TagImportPolicy { insecure: true },
        },
    );

    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog, store, None, false);
    let repo = app.repository("ns/app").unwrap();
    let ctx = RequestContext::authorized();

    let served = repo.manifests().get(&ctx, &manifest.digest).await.unwrap();
    assert_eq!(served.payload, manifest.payload);
}

#[tokio::test]
async fn unknown_digest_is_unknown_revision_without_upstream_contact() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_image_stream(stream_with_annotations("ns", "app", &[]));

    let store = Arc::new(MemoryStore::new());
    let (factory, state) = FakeUpstreamFactory::new();
    let app = app_with(catalog, store.clone(), Some(factory), false);
    let repo = app.repository("ns/app").unwrap();
    let ctx = RequestContext::authorized();

    let digest = Digest::from_bytes(b"nowhere");
    let err = repo.manifests().get(&ctx, &digest).await.unwrap_err();

    match err {
        Error::ManifestUnknownRevision { name, revision } => {
            assert_eq!(name, "ns/app");
            assert_eq!(revision, digest);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(store.manifest_get_count(), 1);
    assert!(state.contacted_hosts().is_empty());
}

#[tokio::test]
async fn each_repository_contacts_only_its_own_upstream() {
    let (factory, state) = FakeUpstreamFactory::new();

    let manifest1 = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(schema2_payload("r1")));
    let manifest2 = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(schema2_payload("r2")));
    state.add_manifest("server1.example.com", manifest1.clone());
    state.add_manifest("server2.example.com", manifest2.clone());

    let catalog = Arc::new(MemoryCatalog::new());
    for (name, upstream, manifest) in [
        ("repo1", "server1.example.com/repo/name", &manifest1),
        ("repo2", "server2.example.com/foo/bar", &manifest2),
    ] {
        catalog.add_image_stream(stream_with_annotations(
            "ns",
            name,
            &[(INSECURE_REPOSITORY_ANNOTATION, "true")],
        ));
        let image = image_for(manifest, upstream);
        catalog.tag_image(&image, "ns", name, "latest");
    }

    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog, store, Some(factory), false);
    let ctx = RequestContext::authorized();

    let repo1 = app.repository("ns/repo1").unwrap();
    repo1
        .manifests()
        .get(&ctx, &manifest1.digest)
        .await
        .unwrap();
    assert_eq!(state.contacted_hosts(), vec!["server1.example.com"]);

    let repo2 = app.repository("ns/repo2").unwrap();
    repo2
        .manifests()
        .get(&ctx, &manifest2.digest)
        .await
        .unwrap();
    assert_eq!(
        state.contacted_hosts(),
        vec!["server1.example.com", "server2.example.com"]
    );
}

#[tokio::test]
async fn blob_serve_streams_and_mirrors_from_upstream() {
    let mut server = mockito::Server::new_async().await;
    let host = server.host_with_port();

    let blob = Bytes::from_static(b"layer bytes for the serve test");
    let blob_digest = Digest::from_bytes(&blob);

    server
        .mock(
            "GET",
            format!("/v2/remote-ns/remote-app/blobs/{}", blob_digest).as_str(),
        )
        .with_header("content-type", "application/octet-stream")
        .with_body(blob.as_ref())
        .create_async()
        .await;

    let payload = schema2_payload("blob-manifest");
    let manifest = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(payload));

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_image_stream(stream_with_annotations(
        "ns",
        "app",
        &[(INSECURE_REPOSITORY_ANNOTATION, "true")],
    ));
    let image = image_for(&manifest, &format!("{}/remote-ns/remote-app", host));
    catalog.tag_image(&image, "ns", "app", "latest");

    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog, store.clone(), None, true);
    let repo = app.repository("ns/app").unwrap();
    let ctx = RequestContext::authorized();

    let mut body: Vec<u8> = Vec::new();
    let descriptor = repo
        .blobs()
        .serve_blob(&ctx, &blob_digest, &mut body)
        .await
        .unwrap();

    assert_eq!(Bytes::from(body), blob);
    assert_eq!(descriptor.digest, blob_digest.to_string());
    assert_eq!(descriptor.size, blob.len() as u64);

    // Mirror-on-read committed the local copy on clean EOF.
    assert_eq!(store.get_blob(&blob_digest).await.unwrap(), blob);
}

#[tokio::test]
async fn blob_stat_probes_candidates_in_order_and_caches_the_winner() {
    let (factory, state) = FakeUpstreamFactory::new();

    let blob = Bytes::from_static(b"cached layer");
    let blob_digest = Digest::from_bytes(&blob);
    state.add_blob("server2.example.com", blob.clone());

    let payload = schema2_payload("stat-manifest");
    let manifest = Manifest::from_payload(MEDIA_TYPE_SCHEMA2, Bytes::from(payload));

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_image_stream(stream_with_annotations(
        "ns",
        "app",
        &[(INSECURE_REPOSITORY_ANNOTATION, "true")],
    ));
    // Two tags, the first pointing at a host that lacks the blob.
    let miss = image_for(&manifest, "server1.example.com/repo/name");
    catalog.tag_image(&miss, "ns", "app", "older");
    let hit = image_for(&manifest, "server2.example.com/foo/bar");
    catalog.tag_image(&hit, "ns", "app", "newer");

    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog.clone(), store, Some(factory), false);
    let ctx = RequestContext::authorized();

    let repo = app.repository("ns/app").unwrap();
    let descriptor = repo.blobs().stat(&ctx, &blob_digest).await.unwrap();
    assert_eq!(descriptor.size, blob.len() as u64);
    assert_eq!(
        state.contacted_hosts(),
        vec!["server1.example.com", "server2.example.com"]
    );

    // A later request against a stream that no longer references the
    // winning upstream still finds the blob through the digest cache.
    catalog.add_image_stream(stream_with_annotations(
        "ns",
        "app",
        &[(INSECURE_REPOSITORY_ANNOTATION, "true")],
    ));
    let repo = app.repository("ns/app").unwrap();
    let descriptor = repo.blobs().stat(&ctx, &blob_digest).await.unwrap();
    assert_eq!(descriptor.digest, blob_digest.to_string());
    assert!(state
        .contacted_hosts()
        .last()
        .unwrap()
        .contains("server2.example.com"));
}

#[tokio::test]
async fn pending_errors_short_circuit_every_operation() {
    let catalog = Arc::new(MemoryCatalog::new());
    let store = Arc::new(MemoryStore::new());
    let (factory, state) = FakeUpstreamFactory::new();
    let app = app_with(catalog, store.clone(), Some(factory), false);
    let repo = app.repository("ns/app").unwrap();

    let mut ctx = RequestContext::authorized();
    ctx.defer_error("ns", "app", Error::Denied("pull access denied".into()));

    let digest = Digest::from_bytes(b"anything");
    let err = repo.manifests().get(&ctx, &digest).await.unwrap_err();
    assert_eq!(err.to_string(), "denied: pull access denied");

    let err = repo.blobs().stat(&ctx, &digest).await.unwrap_err();
    assert_eq!(err.to_string(), "denied: pull access denied");

    // The recorded error fired before any store or upstream work.
    assert_eq!(store.manifest_get_count(), 0);
    assert!(state.contacted_hosts().is_empty());
}

#[tokio::test]
async fn missing_auth_marker_fails_operations() {
    let catalog = Arc::new(MemoryCatalog::new());
    let store = Arc::new(MemoryStore::new());
    let app = app_with(catalog, store, None, false);
    let repo = app.repository("ns/app").unwrap();

    let ctx = RequestContext::unauthorized();
    let err = repo
        .manifests()
        .get(&ctx, &Digest::from_bytes(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthIncomplete));
}
