//! An HTTP client for the DILA open data service.

use super::{Fetch, Fetched, Publication};
use anyhow::Error;
use async_trait::async_trait;
use std::time::Duration;
use surf::{http::StatusCode, Url};

/// How long to wait for a single archive before giving up.
const TIMEOUT: Duration = Duration::from_secs(30);

/// A DILA client.
#[derive(Clone, Debug)]
pub struct Client {
    client: surf::Client,
}

impl Client {
    /// Connect to the DILA archive rooted at `base_url`.
    pub fn new(mut base_url: Url) -> Result<Self, Error> {
        // Relative paths are resolved against the base, which drops the last segment unless it
        // ends with a slash.
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let config = surf::Config::new()
            .set_base_url(base_url)
            .set_timeout(Some(TIMEOUT));
        let client = surf::Client::try_from(config)
            .map_err(|err| Error::msg(format!("unable to configure HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for Client {
    async fn fetch(&self, publication: Publication) -> Result<Fetched, Error> {
        let path = publication.remote_path();
        tracing::debug!(%publication, %path, "DILA request");
        let mut res = self.client.get(&path).await.map_err(Error::msg)?;
        match res.status() {
            StatusCode::Ok => Ok(Fetched::Found(
                res.body_bytes().await.map_err(Error::msg)?,
            )),
            StatusCode::NotFound => Ok(Fetched::Missing),
            status => Err(Error::msg(format!("error {status} for {path}"))),
        }
    }
}
