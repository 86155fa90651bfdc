use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Body, Client, Response};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    determine_part_size, dir_prefix, sha256_file, ObjectStore, Result, StoreError,
    DEFAULT_PART_SIZE,
};

pub const DIGEST_HEADER: &str = "x-content-sha256";
pub const SIZE_HEADER: &str = "x-object-size";

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    pub preferred_part_size: u64,
    pub timeout: Duration,
}

impl HttpStoreConfig {
    pub fn new(endpoint: &str, bucket: &str, access_key_id: &str, access_key_secret: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            bucket: bucket.to_string(),
            access_key_id: access_key_id.to_string(),
            access_key_secret: access_key_secret.to_string(),
            preferred_part_size: DEFAULT_PART_SIZE,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    objects: Vec<ListedObject>,
    #[serde(default)]
    prefixes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InitUploadResponse {
    upload_id: String,
}

#[derive(Debug, Serialize)]
struct CompletedPart {
    part_number: u64,
    etag: String,
}

#[derive(Debug, Serialize)]
struct CompleteUpload {
    parts: Vec<CompletedPart>,
}

/// Client for an object gateway speaking plain HTTP verbs per object
/// (`HEAD`/`GET`/`PUT` on `<endpoint>/<bucket>/<name>`), JSON listings and a
/// three-step multipart upload.
pub struct HttpStore {
    client: Client,
    base: Url,
    config: HttpStoreConfig,
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_builder() {
        StoreError::Config(e.to_string())
    } else {
        StoreError::Transient(e.to_string())
    }
}

fn check_status(resp: Response, what: &str) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(match status.as_u16() {
        401 | 403 => StoreError::Config(format!("{} rejected ({}): {}", what, status, body.trim())),
        404 => StoreError::NotFound(what.to_string()),
        _ => StoreError::Transient(format!("{} failed ({}): {}", what, status, body.trim())),
    })
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| StoreError::Config(format!("invalid endpoint '{}': {}", config.endpoint, e)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Config(format!("invalid endpoint '{}'", config.endpoint)));
        }
        if config.bucket.is_empty() || config.bucket.contains('/') {
            return Err(StoreError::Config(format!("invalid bucket name: '{}'", config.bucket)));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            client,
            base,
            config,
        })
    }

    fn bucket_url(&self) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&self.config.bucket);
        }
        url
    }

    fn object_url(&self, name: &str) -> Url {
        let mut url = self.bucket_url();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.extend(name.split('/').filter(|p| !p.is_empty()));
        }
        url
    }

    fn authed(&self, builder: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        builder.basic_auth(
            &self.config.access_key_id,
            Some(&self.config.access_key_secret),
        )
    }

    fn fetch_listing(&self, prefix: &str, delimiter: bool) -> Result<ListResponse> {
        let mut url = self.bucket_url();
        url.query_pairs_mut().append_pair("prefix", prefix);
        if delimiter {
            url.query_pairs_mut().append_pair("delimiter", "/");
        }
        let resp = self
            .authed(self.client.get(url))
            .send()
            .map_err(transport_error)?;
        let resp = check_status(resp, &format!("list {}", prefix))?;
        resp.json::<ListResponse>()
            .map_err(|e| StoreError::Transient(format!("invalid listing: {}", e)))
    }

    fn put_single(&self, local: &Path, name: &str, digest: &str) -> Result<()> {
        let body = Body::from(fs::File::open(local)?);
        let resp = self
            .authed(self.client.put(self.object_url(name)))
            .header(DIGEST_HEADER, digest)
            .body(body)
            .send()
            .map_err(transport_error)?;
        check_status(resp, name)?;
        Ok(())
    }

    fn put_multipart(&self, local: &Path, name: &str, digest: &str) -> Result<()> {
        let total = fs::metadata(local)?.len();
        let part_size = determine_part_size(total, self.config.preferred_part_size);

        let mut url = self.object_url(name);
        url.query_pairs_mut().append_pair("uploads", "");
        let resp = self
            .authed(self.client.post(url))
            .send()
            .map_err(transport_error)?;
        let init: InitUploadResponse = check_status(resp, name)?
            .json()
            .map_err(|e| StoreError::Transient(format!("invalid upload init: {}", e)))?;

        let mut file = fs::File::open(local)?;
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1u64;
        while offset < total {
            let len = part_size.min(total - offset);
            let mut chunk = Vec::with_capacity(len as usize);
            (&mut file).take(len).read_to_end(&mut chunk)?;
            let mut url = self.object_url(name);
            url.query_pairs_mut()
                .append_pair("uploadId", &init.upload_id)
                .append_pair("partNumber", &part_number.to_string());
            let resp = self
                .authed(self.client.put(url))
                .body(chunk)
                .send()
                .map_err(transport_error)?;
            let resp = check_status(resp, name)?;
            let etag = resp
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim_matches('"').to_string())
                .ok_or_else(|| StoreError::Transient(format!("part {} of {} has no etag", part_number, name)))?;
            debug!(name, part_number, len, "part uploaded");
            parts.push(CompletedPart { part_number, etag });
            offset += len;
            part_number += 1;
        }

        let mut url = self.object_url(name);
        url.query_pairs_mut().append_pair("uploadId", &init.upload_id);
        let resp = self
            .authed(self.client.post(url))
            .header(DIGEST_HEADER, digest)
            .json(&CompleteUpload { parts })
            .send()
            .map_err(transport_error)?;
        check_status(resp, name)?;
        Ok(())
    }
}

impl ObjectStore for HttpStore {
    fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let listing = self.fetch_listing(prefix, false)?;
        let mut names: Vec<String> = listing
            .objects
            .into_iter()
            .map(|o| o.name)
            .filter(|n| n.starts_with(prefix))
            .collect();
        names.sort();
        Ok(names)
    }

    fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = dir_prefix(prefix);
        let listing = self.fetch_listing(&dir, true)?;
        let mut names: Vec<String> = listing
            .prefixes
            .iter()
            .chain(listing.objects.iter().map(|o| &o.name))
            .filter_map(|n| n.strip_prefix(dir.as_str()))
            .map(|n| n.trim_end_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn size(&self, name: &str) -> Result<Option<u64>> {
        let resp = self
            .authed(self.client.head(self.object_url(name)))
            .send()
            .map_err(transport_error)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, name)?;
        let headers = resp.headers();
        let size = headers
            .get(SIZE_HEADER)
            .or_else(|| headers.get(reqwest::header::CONTENT_LENGTH))
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| StoreError::Transient(format!("no size reported for {}", name)))?;
        Ok(Some(size))
    }

    fn put(&self, local: &Path, name: &str, multipart: bool) -> Result<()> {
        let digest = sha256_file(local)?;
        if multipart {
            self.put_multipart(local, name, &digest)
        } else {
            self.put_single(local, name, &digest)
        }
    }

    fn get(&self, name: &str, local: &Path) -> Result<()> {
        let resp = self
            .authed(self.client.get(self.object_url(name)))
            .send()
            .map_err(transport_error)?;
        let mut resp = check_status(resp, name)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = local
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("object");
        let tmp = local.with_file_name(format!(".{}.seqmirror-download", file_name));
        let mut file = fs::File::create(&tmp)?;
        if let Err(e) = resp.copy_to(&mut file) {
            let _ = fs::remove_file(&tmp);
            return Err(transport_error(e));
        }
        file.sync_all()?;
        fs::rename(&tmp, local)?;
        Ok(())
    }
}
