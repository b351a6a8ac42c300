use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
#[cfg(feature = "aws")]
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{GetOptions, GetRange, MultipartUpload, ObjectStore, PutPayload};
use parking_lot::Mutex;
use tessera_error::{tessera_bail, tessera_err, TesseraExpect, TesseraResult};

use crate::uri::Uri;

/// Part size for multipart uploads.
const UPLOAD_PART_SIZE: usize = 25 * 1024 * 1024;

/// Resolves bucket names to [`ObjectStore`] clients and manages bucket
/// lifecycle where the deployment allows it.
pub trait BucketProvider: Send + Sync + 'static {
    /// Open a client scoped to `bucket`.
    fn open(&self, bucket: &str) -> TesseraResult<Arc<dyn ObjectStore>>;

    /// Whether `bucket` exists, when the provider can answer without IO.
    /// `None` defers to a listing probe on the opened client.
    fn bucket_exists(&self, bucket: &str) -> TesseraResult<Option<bool>> {
        let _ = bucket;
        Ok(None)
    }

    fn create_bucket(&self, bucket: &str) -> TesseraResult<()> {
        tessera_bail!(Backend: "this provider cannot create bucket '{bucket}'")
    }

    fn remove_bucket(&self, bucket: &str) -> TesseraResult<()> {
        tessera_bail!(Backend: "this provider cannot remove bucket '{bucket}'")
    }
}

/// Bucket provider backed by in-memory stores. Supports the full bucket
/// lifecycle and backs the object-store tests.
#[derive(Default)]
pub struct InMemoryProvider {
    buckets: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketProvider for InMemoryProvider {
    fn open(&self, bucket: &str) -> TesseraResult<Arc<dyn ObjectStore>> {
        self.buckets
            .lock()
            .get(bucket)
            .cloned()
            .ok_or_else(|| tessera_err!(NotFound: "no such bucket '{bucket}'"))
    }

    fn bucket_exists(&self, bucket: &str) -> TesseraResult<Option<bool>> {
        Ok(Some(self.buckets.lock().contains_key(bucket)))
    }

    fn create_bucket(&self, bucket: &str) -> TesseraResult<()> {
        match self.buckets.lock().entry(bucket.to_string()) {
            Entry::Occupied(_) => {
                tessera_bail!(AlreadyExists: "bucket '{bucket}' already exists")
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(InMemory::new()));
                Ok(())
            }
        }
    }

    fn remove_bucket(&self, bucket: &str) -> TesseraResult<()> {
        match self.buckets.lock().remove(bucket) {
            Some(_) => Ok(()),
            None => tessera_bail!(NotFound: "no such bucket '{bucket}'"),
        }
    }
}

/// Bucket provider constructing S3 clients from the process environment.
/// Bucket creation and removal are administrative operations outside the
/// reach of the client and are reported as unsupported.
#[cfg(feature = "aws")]
#[derive(Default)]
pub struct S3Provider;

#[cfg(feature = "aws")]
impl BucketProvider for S3Provider {
    fn open(&self, bucket: &str) -> TesseraResult<Arc<dyn ObjectStore>> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        Ok(Arc::new(store))
    }
}

enum Stores {
    /// One client per bucket, resolved through a provider (`s3`).
    Buckets(Arc<dyn BucketProvider>),
    /// A single injected store serving every URI of the scheme (`hdfs`).
    Single(Arc<dyn ObjectStore>),
}

struct PendingUpload {
    upload: Box<dyn MultipartUpload>,
    buffer: BytesMut,
}

/// Adapter for object stores addressed as `<scheme>://<authority>/<key>`.
///
/// Objects live in a flat keyspace: directories are key prefixes,
/// `create_dir` and `sync` are no-ops, and moves are server-side renames.
/// Writes append to a pending multipart upload that becomes visible once
/// [`flush`][ObjectBackend::flush] completes it.
pub struct ObjectBackend {
    scheme: &'static str,
    stores: Stores,
    runtime: tokio::runtime::Runtime,
    pending: Mutex<HashMap<String, PendingUpload>>,
}

impl ObjectBackend {
    pub fn with_buckets(
        scheme: &'static str,
        provider: Arc<dyn BucketProvider>,
    ) -> TesseraResult<Self> {
        Ok(Self {
            scheme,
            stores: Stores::Buckets(provider),
            runtime: Self::runtime(scheme)?,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_store(
        scheme: &'static str,
        store: Arc<dyn ObjectStore>,
    ) -> TesseraResult<Self> {
        Ok(Self {
            scheme,
            stores: Stores::Single(store),
            runtime: Self::runtime(scheme)?,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn runtime(scheme: &str) -> TesseraResult<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name(format!("tessera-{scheme}-io"))
            .enable_all()
            .build()?)
    }

    /// Split `<scheme>://<authority>/<key>` into a client, the
    /// `<scheme>://<authority>` base for reconstructing child URIs, and the
    /// in-store key.
    fn resolve(&self, uri: &Uri) -> TesseraResult<(Arc<dyn ObjectStore>, String, StorePath)> {
        let (authority, key) = self.split(uri)?;
        let store = match &self.stores {
            Stores::Buckets(provider) => provider.open(&authority)?,
            Stores::Single(store) => store.clone(),
        };
        let base = format!("{}://{}", self.scheme, authority);
        Ok((store, base, StorePath::from(key)))
    }

    fn split(&self, uri: &Uri) -> TesseraResult<(String, String)> {
        let rest = uri
            .as_str()
            .strip_prefix(self.scheme)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(
                || tessera_err!("URI '{uri}' does not carry scheme '{}'", self.scheme),
            )?;
        match rest.split_once('/') {
            Some((authority, key)) => Ok((authority.to_string(), key.to_string())),
            None => Ok((rest.to_string(), String::new())),
        }
    }

    fn prefix(key: &StorePath) -> Option<&StorePath> {
        (!key.as_ref().is_empty()).then_some(key)
    }

    pub fn create_dir(&self, _uri: &Uri) -> TesseraResult<()> {
        // Directories are implied by the keys below them.
        Ok(())
    }

    pub fn remove_dir(&self, uri: &Uri) -> TesseraResult<()> {
        let (store, _, key) = self.resolve(uri)?;
        let locations = self.list_keys(&store, Self::prefix(&key))?;
        for location in locations {
            self.runtime.block_on(store.delete(&location))?;
        }
        Ok(())
    }

    pub fn is_dir(&self, uri: &Uri) -> TesseraResult<bool> {
        let (store, _, key) = self.resolve(uri)?;
        if key.as_ref().is_empty() {
            return self.probe_bucket(&store);
        }
        let listing = self
            .runtime
            .block_on(store.list_with_delimiter(Some(&key)))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    pub fn is_file(&self, uri: &Uri) -> TesseraResult<bool> {
        let (store, _, key) = self.resolve(uri)?;
        match self.runtime.block_on(store.head(&key)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Immediate children of the prefix, as full URIs.
    pub fn ls(&self, uri: &Uri) -> TesseraResult<Vec<String>> {
        let (store, base, key) = self.resolve(uri)?;
        let listing = self
            .runtime
            .block_on(store.list_with_delimiter(Self::prefix(&key)))?;
        let mut children = Vec::with_capacity(listing.objects.len() + listing.common_prefixes.len());
        for dir in &listing.common_prefixes {
            children.push(format!("{base}/{dir}"));
        }
        for object in &listing.objects {
            children.push(format!("{base}/{}", object.location));
        }
        Ok(children)
    }

    pub fn touch(&self, uri: &Uri) -> TesseraResult<()> {
        if self.is_file(uri)? {
            return Ok(());
        }
        let (store, _, key) = self.resolve(uri)?;
        self.runtime
            .block_on(store.put(&key, PutPayload::default()))?;
        Ok(())
    }

    pub fn remove_file(&self, uri: &Uri) -> TesseraResult<()> {
        let (store, _, key) = self.resolve(uri)?;
        self.runtime.block_on(store.delete(&key))?;
        Ok(())
    }

    pub fn file_size(&self, uri: &Uri) -> TesseraResult<u64> {
        let (store, _, key) = self.resolve(uri)?;
        let meta = self.runtime.block_on(store.head(&key))?;
        Ok(meta.size as u64)
    }

    pub fn read(&self, uri: &Uri, offset: u64, buffer: &mut [u8]) -> TesseraResult<()> {
        let (store, _, key) = self.resolve(uri)?;
        let start: usize = offset
            .try_into()
            .map_err(|_| tessera_err!("read offset {offset} does not fit in usize"))?;
        let range = GetRange::Bounded(start..start + buffer.len());
        let bytes = self.runtime.block_on(async {
            store
                .get_opts(
                    &key,
                    GetOptions {
                        range: Some(range),
                        ..Default::default()
                    },
                )
                .await?
                .bytes()
                .await
        })?;
        if bytes.len() != buffer.len() {
            tessera_bail!(Backend: "short read of '{uri}': got {} of {} bytes", bytes.len(), buffer.len());
        }
        buffer.copy_from_slice(&bytes);
        Ok(())
    }

    /// Append to the pending upload for `uri`, starting one if needed.
    /// The object becomes visible when [`flush`][Self::flush] completes it.
    pub fn write(&self, uri: &Uri, buffer: &[u8]) -> TesseraResult<()> {
        let (store, _, key) = self.resolve(uri)?;
        let mut pending = self.pending.lock();
        let entry = match pending.entry(uri.as_str().to_string()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let upload = self.runtime.block_on(store.put_multipart(&key))?;
                vacant.insert(PendingUpload {
                    upload,
                    buffer: BytesMut::new(),
                })
            }
        };
        entry.buffer.extend_from_slice(buffer);
        while entry.buffer.len() >= UPLOAD_PART_SIZE {
            let part = entry.buffer.split_to(UPLOAD_PART_SIZE).freeze();
            self.runtime
                .block_on(entry.upload.put_part(PutPayload::from_bytes(part)))?;
        }
        Ok(())
    }

    /// Complete the pending upload for `uri`, if any.
    pub fn flush(&self, uri: &Uri) -> TesseraResult<()> {
        let entry = self.pending.lock().remove(uri.as_str());
        let Some(mut entry) = entry else {
            return Ok(());
        };
        if !entry.buffer.is_empty() {
            let len = entry.buffer.len();
            let part = entry.buffer.split_to(len).freeze();
            self.runtime
                .block_on(entry.upload.put_part(PutPayload::from_bytes(part)))?;
        }
        self.runtime.block_on(entry.upload.complete())?;
        Ok(())
    }

    /// Complete every pending upload.
    pub fn disconnect(&self) -> TesseraResult<()> {
        let keys: Vec<String> = self.pending.lock().keys().cloned().collect();
        for key in keys {
            self.flush(&Uri::new(key))?;
        }
        Ok(())
    }

    pub fn move_file(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        let (store, old_base, old_key) = self.resolve(old_uri)?;
        let (new_store, new_base, new_key) = self.resolve(new_uri)?;
        if old_base == new_base {
            self.runtime.block_on(store.rename(&old_key, &new_key))?;
            return Ok(());
        }
        // Different authorities mean different clients; copy through memory.
        let bytes = self
            .runtime
            .block_on(async { store.get(&old_key).await?.bytes().await })?;
        self.runtime
            .block_on(new_store.put(&new_key, PutPayload::from_bytes(bytes)))?;
        self.runtime.block_on(store.delete(&old_key))?;
        Ok(())
    }

    pub fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> TesseraResult<()> {
        let (store, old_base, old_key) = self.resolve(old_uri)?;
        let (_, new_base, new_key) = self.resolve(new_uri)?;
        if old_base != new_base {
            tessera_bail!(Backend: "directory moves across authorities are not supported");
        }
        let old_prefix = old_key.as_ref().to_string();
        for location in self.list_keys(&store, Self::prefix(&old_key))? {
            let suffix = location
                .as_ref()
                .strip_prefix(&old_prefix)
                .map(|s| s.trim_start_matches('/'))
                .tessera_expect("listed key lies under the listed prefix");
            let target = StorePath::from(format!("{new_key}/{suffix}"));
            self.runtime.block_on(store.rename(&location, &target))?;
        }
        Ok(())
    }

    pub fn create_bucket(&self, uri: &Uri) -> TesseraResult<()> {
        let (bucket, _) = self.split(uri)?;
        self.provider()?.create_bucket(&bucket)
    }

    pub fn remove_bucket(&self, uri: &Uri) -> TesseraResult<()> {
        let (bucket, _) = self.split(uri)?;
        self.pending
            .lock()
            .retain(|key, _| !key.starts_with(uri.as_str()));
        self.provider()?.remove_bucket(&bucket)
    }

    pub fn is_bucket(&self, uri: &Uri) -> TesseraResult<bool> {
        let (bucket, _) = self.split(uri)?;
        let provider = self.provider()?;
        if let Some(known) = provider.bucket_exists(&bucket)? {
            return Ok(known);
        }
        let store = provider.open(&bucket)?;
        self.probe_bucket(&store)
    }

    pub fn is_empty_bucket(&self, uri: &Uri) -> TesseraResult<bool> {
        let (bucket, _) = self.split(uri)?;
        let store = self.provider()?.open(&bucket)?;
        let first = self
            .runtime
            .block_on(async { store.list(None).next().await });
        match first {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e.into()),
        }
    }

    pub fn empty_bucket(&self, uri: &Uri) -> TesseraResult<()> {
        let (bucket, _) = self.split(uri)?;
        let store = self.provider()?.open(&bucket)?;
        for location in self.list_keys(&store, None)? {
            self.runtime.block_on(store.delete(&location))?;
        }
        Ok(())
    }

    fn provider(&self) -> TesseraResult<&Arc<dyn BucketProvider>> {
        match &self.stores {
            Stores::Buckets(provider) => Ok(provider),
            Stores::Single(_) => {
                tessera_bail!(Backend: "bucket operations are not available on '{}'", self.scheme)
            }
        }
    }

    /// Whether listing the store root succeeds, i.e. the bucket exists.
    fn probe_bucket(&self, store: &Arc<dyn ObjectStore>) -> TesseraResult<bool> {
        let first = self
            .runtime
            .block_on(async { store.list(None).next().await });
        match first {
            None | Some(Ok(_)) => Ok(true),
            Some(Err(object_store::Error::NotFound { .. })) => Ok(false),
            Some(Err(e)) => Err(e.into()),
        }
    }

    fn list_keys(
        &self,
        store: &Arc<dyn ObjectStore>,
        prefix: Option<&StorePath>,
    ) -> TesseraResult<Vec<StorePath>> {
        let metas = self.runtime.block_on(async {
            store
                .list(prefix)
                .collect::<Vec<object_store::Result<object_store::ObjectMeta>>>()
                .await
        });
        let mut locations = Vec::with_capacity(metas.len());
        for meta in metas {
            locations.push(meta?.location);
        }
        Ok(locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ObjectBackend {
        let provider = Arc::new(InMemoryProvider::new());
        provider.create_bucket("data").unwrap();
        ObjectBackend::with_buckets("s3", provider).unwrap()
    }

    #[test]
    fn write_flush_read_round_trip() {
        let backend = backend();
        let uri = Uri::new("s3://data/frames/f0");

        backend.write(&uri, b"alpha").unwrap();
        backend.write(&uri, b"beta").unwrap();
        assert!(!backend.is_file(&uri).unwrap());

        backend.flush(&uri).unwrap();
        assert!(backend.is_file(&uri).unwrap());
        assert_eq!(backend.file_size(&uri).unwrap(), 9);

        let mut buf = vec![0u8; 4];
        backend.read(&uri, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"beta");
    }

    #[test]
    fn directories_are_prefixes() {
        let backend = backend();
        let file = Uri::new("s3://data/a/b/object");
        backend.write(&file, b"x").unwrap();
        backend.flush(&file).unwrap();

        assert!(backend.is_dir(&Uri::new("s3://data/a")).unwrap());
        assert!(backend.is_dir(&Uri::new("s3://data/a/b")).unwrap());
        assert!(!backend.is_dir(&Uri::new("s3://data/a/b/object")).unwrap());

        let children = backend.ls(&Uri::new("s3://data/a")).unwrap();
        assert_eq!(children, vec!["s3://data/a/b".to_string()]);

        backend.remove_dir(&Uri::new("s3://data/a")).unwrap();
        assert!(!backend.is_dir(&Uri::new("s3://data/a")).unwrap());
    }

    #[test]
    fn moves_are_key_renames() {
        let backend = backend();
        let old = Uri::new("s3://data/src/obj");
        backend.write(&old, b"payload").unwrap();
        backend.flush(&old).unwrap();

        let new = Uri::new("s3://data/dst/obj");
        backend.move_file(&old, &new).unwrap();
        assert!(!backend.is_file(&old).unwrap());
        assert!(backend.is_file(&new).unwrap());

        backend
            .move_dir(&Uri::new("s3://data/dst"), &Uri::new("s3://data/final"))
            .unwrap();
        assert!(backend.is_file(&Uri::new("s3://data/final/obj")).unwrap());
    }

    #[test]
    fn bucket_lifecycle() {
        let provider = Arc::new(InMemoryProvider::new());
        let backend = ObjectBackend::with_buckets("s3", provider).unwrap();
        let bucket = Uri::new("s3://fresh");

        assert!(!backend.is_bucket(&bucket).unwrap());
        backend.create_bucket(&bucket).unwrap();
        assert!(backend.is_bucket(&bucket).unwrap());
        assert!(backend.is_empty_bucket(&bucket).unwrap());

        let obj = Uri::new("s3://fresh/k");
        backend.write(&obj, b"v").unwrap();
        backend.flush(&obj).unwrap();
        assert!(!backend.is_empty_bucket(&bucket).unwrap());

        backend.empty_bucket(&bucket).unwrap();
        assert!(backend.is_empty_bucket(&bucket).unwrap());

        backend.remove_bucket(&bucket).unwrap();
        assert!(!backend.is_bucket(&bucket).unwrap());
    }
}
