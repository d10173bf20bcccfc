//! Clients for the two external collaborators: the username -> pubkey
//! resolver and the permanent ciphertext store. The server consumes only
//! these two interfaces; everything behind them is someone else's problem.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::{Config, Error, Result};

#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolves a username to its registered public key. `None` means the
    /// username is unknown to the registry.
    async fn resolve(&self, username: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads a ciphertext, returning the handle it can later be fetched
    /// under. Errors here are expected and callers degrade gracefully.
    async fn upload(&self, data: &str) -> Result<String>;

    async fn fetch(&self, handle: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct ResolveResponse {
    pubkey: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: String,
}

#[derive(Deserialize)]
struct FetchResponse {
    data: String,
}

pub struct HttpDirectory {
    client: reqwest::Client,
    endpoint: Option<Url>,
}

impl HttpDirectory {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: config.identity_lookup_endpoint.clone(),
        })
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn resolve(&self, username: &str) -> Result<Option<String>> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::bad_config("Identity lookup endpoint is not configured"))?;

        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| Error::bad_config("Identity lookup endpoint cannot carry a path"))?
            .push(username);

        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response
            .error_for_status()
            .map_err(|_| Error::BadServerResponse("Identity lookup failed"))?;

        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|_| Error::BadServerResponse("Identity lookup returned invalid JSON"))?;

        Ok(Some(body.pubkey))
    }
}

pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: Option<Url>,
}

impl HttpBlobStore {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            endpoint: config.blob_upload_endpoint.clone(),
        })
    }

    fn endpoint(&self) -> Result<&Url> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| Error::bad_config("Blob upload endpoint is not configured"))
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, data: &str) -> Result<String> {
        let endpoint = self.endpoint()?;

        let response = self
            .client
            .post(endpoint.clone())
            .json(&serde_json::json!({ "data": data }))
            .send()
            .await?
            .error_for_status()
            .map_err(|_| Error::BadServerResponse("Blob upload failed"))?;

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|_| Error::BadServerResponse("Blob store returned invalid JSON"))?;

        Ok(body.id)
    }

    async fn fetch(&self, handle: &str) -> Result<String> {
        let endpoint = self.endpoint()?;

        let mut url = endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| Error::bad_config("Blob upload endpoint cannot carry a path"))?
            .push(handle);

        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()
            .map_err(|_| Error::BadServerResponse("Blob fetch failed"))?;

        let body: FetchResponse = response
            .json()
            .await
            .map_err(|_| Error::BadServerResponse("Blob store returned invalid JSON"))?;

        Ok(body.data)
    }
}
