use super::wire::{
    CheckpointBody, CheckpointListBody, DownloadQuery, IndexBody, ListQuery, PositionBody, UploadQuery,
};
use crate::crypto::PublicKey;
use crate::discovery::EnvelopeBody;
use crate::error::Result;
use crate::frame::{FrameStream, SignedCheckpoint, decode_frames, encode_frames};
use crate::node::FsNode;
use crate::transport::{base_url, check_response, endpoint, request_error};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Body, Client, Url};

/// A remote node reached over the `/fs` HTTP routes.
pub struct HttpFsNode {
    base: Url,
    client: Client,
}

impl HttpFsNode {
    pub fn new(address: &str, client: Client) -> Result<Self> {
        Ok(Self {
            base: base_url(address)?,
            client,
        })
    }

    fn file_url(&self, action: &str, owner: &PublicKey, filename: &str) -> Result<Url> {
        endpoint(&self.base, &["fs", action, owner.to_hex().as_str()], Some(filename))
    }
}

#[async_trait]
impl FsNode for HttpFsNode {
    async fn upload(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        frames: FrameStream,
    ) -> Result<u64> {
        let url = self.file_url("upload", &owner, filename)?;
        let response = self
            .client
            .post(url)
            .query(&UploadQuery { offset })
            .body(Body::wrap_stream(encode_frames(frames)))
            .send()
            .await
            .map_err(request_error)?;

        let body: PositionBody = check_response(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        Ok(body.position)
    }

    async fn download(
        &self,
        owner: PublicKey,
        filename: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<FrameStream> {
        let url = self.file_url("download", &owner, filename)?;
        let response = self
            .client
            .get(url)
            .query(&DownloadQuery { offset, length })
            .send()
            .await
            .map_err(request_error)?;

        let bytes = check_response(response)
            .await?
            .bytes_stream()
            .map_err(request_error)
            .boxed();
        Ok(decode_frames(bytes))
    }

    async fn delete(&self, owner: PublicKey, tombstone: SignedCheckpoint) -> Result<()> {
        let url = endpoint(&self.base, &["fs", "delete", owner.to_hex().as_str()], None)?;
        let body = EnvelopeBody {
            envelope: tombstone.to_hex()?,
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

    async fn latest(&self, owner: PublicKey, filename: &str) -> Result<Option<SignedCheckpoint>> {
        let url = self.file_url("latest", &owner, filename)?;
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let body: CheckpointBody = check_response(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        body.decode()
    }

    async fn list(&self, owner: PublicKey, pattern: &str) -> Result<Vec<SignedCheckpoint>> {
        let url = endpoint(&self.base, &["fs", "list", owner.to_hex().as_str()], None)?;
        let response = self
            .client
            .get(url)
            .query(&ListQuery {
                glob: pattern.to_string(),
            })
            .send()
            .await
            .map_err(request_error)?;
        let body: CheckpointListBody = check_response(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        body.decode()
    }

    async fn list_index(&self, owner: PublicKey, filename: &str) -> Result<Vec<u64>> {
        let url = self.file_url("index", &owner, filename)?;
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let body: IndexBody = check_response(response)
            .await?
            .json()
            .await
            .map_err(request_error)?;
        Ok(body.positions)
    }
}
