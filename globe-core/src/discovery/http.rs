use super::{Announcement, DiscoveryService, EnvelopeBody, SharedKey};
use crate::crypto::{KeyHash, PublicKey, Signed};
use crate::error::Result;
use crate::transport::{base_url, check_response, endpoint, request_error};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;

/// Client for a discovery directory served over HTTP.
pub struct HttpDiscoveryService {
    base: Url,
    client: Client,
}

impl HttpDiscoveryService {
    pub fn new(address: &str, client: Client) -> Result<Self> {
        Ok(Self {
            base: base_url(address)?,
            client,
        })
    }

    async fn get_envelope<T: DeserializeOwned>(&self, url: Url) -> Result<Option<Signed<T>>> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: EnvelopeBody = check_response(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        Ok(Some(Signed::from_hex(&body.envelope)?))
    }
}

#[async_trait]
impl DiscoveryService for HttpDiscoveryService {
    async fn announce(&self, owner: PublicKey, announcement: Signed<Announcement>) -> Result<()> {
        let url = endpoint(&self.base, &["discovery", "announce", owner.to_hex().as_str()], None)?;
        let body = EnvelopeBody {
            envelope: announcement.to_hex()?,
        };
        let response = self
            .client
            .put(url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        check_response(response).await?;
        Ok(())
    }

    async fn find(&self, owner: PublicKey) -> Result<Option<Signed<Announcement>>> {
        let url = endpoint(&self.base, &["discovery", "find", owner.to_hex().as_str()], None)?;
        self.get_envelope(url).await
    }

    async fn share_key(&self, owner: PublicKey, record: Signed<SharedKey>) -> Result<()> {
        let url = endpoint(&self.base, &["discovery", "share", owner.to_hex().as_str()], None)?;
        let body = EnvelopeBody {
            envelope: record.to_hex()?,
        };
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        check_response(response).await?;
        Ok(())
    }

    async fn get_shared_key(
        &self,
        owner: PublicKey,
        receiver: PublicKey,
        hash: KeyHash,
    ) -> Result<Option<Signed<SharedKey>>> {
        let url = endpoint(
            &self.base,
            &[
                "discovery",
                "shared",
                owner.to_hex().as_str(),
                receiver.to_hex().as_str(),
                hash.to_hex().as_str(),
            ],
            None,
        )?;
        self.get_envelope(url).await
    }
}
