//! Bridges the SM controller's `GetBlobsInfos` RPC (spec.md §4.6) to the
//! cloud's `requestBlobUrls`/`blobUrls` correlated pair (spec.md §6), so the
//! fleet asks the cloud for blob download URLs through the same link it
//! uses for everything else.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cm_cloudlink::link::CloudLink;
use cm_ore::error::CmError;
use cm_proto::envelope::MessageData;
use cm_smcontroller::controller::BlobInfoProvider;
use uuid::Uuid;

pub struct CloudBlobInfoProvider {
    link: Arc<CloudLink>,
}

impl CloudBlobInfoProvider {
    pub fn new(link: Arc<CloudLink>) -> Self {
        CloudBlobInfoProvider { link }
    }
}

#[async_trait]
impl BlobInfoProvider for CloudBlobInfoProvider {
    async fn get_blob_urls(&self, digests: &[String]) -> Result<HashMap<String, String>, CmError> {
        let correlation_id = Uuid::new_v4().to_string();
        let request = MessageData::RequestBlobUrls { correlation_id, digests: digests.to_vec() };
        let response = self.link.request(request, "blobUrls").await?;

        let items = match response.data {
            MessageData::BlobUrls { items, .. } => items,
            other => return Err(CmError::internal(format!("unexpected response to requestBlobUrls: {}", other.message_type()))),
        };

        Ok(items
            .into_iter()
            .filter_map(|item| {
                let digest = item.get("digest")?.as_str()?.to_string();
                let url = item.get("url")?.as_str()?.to_string();
                Some((digest, url))
            })
            .collect())
    }
}
