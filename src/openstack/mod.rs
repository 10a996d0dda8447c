//! HTTP client for OpenStack-style compute, image, network, and
//! block-storage endpoints.
//!
//! [`NovaClient`] implements [`ComputeApi`], [`CatalogLookup`], and
//! [`BlockStorageApi`]. Every call carries the configured token as
//! `X-Auth-Token` and a fresh `X-OpenStack-Request-ID`; calls that need a
//! microversion send it per request, so a shared client never leaks one
//! call's protocol version into another.

mod protocol;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::compute::{
    ApiFuture, BlockStorageApi, CatalogLookup, ComputeApi, CreatedServer, InterfaceRecord,
    InterfaceRequest, Microversion, ServerAction, ServerRecord, ServerUpdate,
    VolumeAttachmentRecord,
};
use crate::config::CloudConfig;
use crate::error::ApiError;
use crate::request::CreateSubmission;

use protocol::{
    CreatedEnvelope, FlavorsEnvelope, ImagesEnvelope, InterfaceAttachBody, InterfaceEnvelope,
    InterfaceListEnvelope, MetadataEnvelope, NetworksEnvelope, ServerEnvelope, ServerUpdateBody,
    TagsEnvelope, Target, VolumeAttachmentsEnvelope, VolumeEnvelope, classify_status,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_ID_HEADER: &str = "X-OpenStack-Request-ID";
const NOVA_VERSION_HEADER: &str = "X-OpenStack-Nova-API-Version";
const API_VERSION_HEADER: &str = "OpenStack-API-Version";

/// Service behind one configured endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Service {
    Image,
    Network,
    Volume,
}

impl Service {
    const fn env_var(self) -> &'static str {
        match self {
            Self::Image => "OS_IMAGE_ENDPOINT",
            Self::Network => "OS_NETWORK_ENDPOINT",
            Self::Volume => "OS_VOLUME_ENDPOINT",
        }
    }
}

/// Joins path segments onto an endpoint, escaping each segment.
fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url, ApiError> {
    let mut url = Url::parse(base).map_err(|err| ApiError::Transport {
        message: format!("invalid endpoint {base}: {err}"),
    })?;
    url.path_segments_mut()
        .map_err(|()| ApiError::Transport {
            message: format!("endpoint {base} cannot carry a path"),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn decode<T>(response: Response, what: &str) -> Result<T, ApiError>
where
    T: DeserializeOwned,
{
    let bytes = response.bytes().await.map_err(|err| ApiError::Transport {
        message: err.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode {
        what: what.to_owned(),
        message: err.to_string(),
    })
}

/// Control-plane client backed by `reqwest`.
#[derive(Clone)]
pub struct NovaClient {
    http: reqwest::Client,
    token: String,
    compute: String,
    image: Option<String>,
    network: Option<String>,
    volume: Option<String>,
}

impl fmt::Debug for NovaClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("NovaClient")
            .field("compute", &self.compute)
            .field("image", &self.image)
            .field("network", &self.network)
            .field("volume", &self.volume)
            .finish_non_exhaustive()
    }
}

impl NovaClient {
    /// Builds a client from validated configuration.
    #[must_use]
    pub fn new(config: &CloudConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            token: config.auth_token.clone(),
            compute: config.compute_endpoint.clone(),
            image: config.image_endpoint.clone(),
            network: config.network_endpoint.clone(),
            volume: config.volume_endpoint.clone(),
        }
    }

    fn endpoint(&self, service: Service) -> Result<&str, ApiError> {
        let configured = match service {
            Service::Image => self.image.as_deref(),
            Service::Network => self.network.as_deref(),
            Service::Volume => self.volume.as_deref(),
        };
        configured.ok_or_else(|| ApiError::Transport {
            message: format!("no endpoint configured; set {}", service.env_var()),
        })
    }

    fn compute_url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        endpoint_url(&self.compute, segments)
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        microversion: Option<Microversion>,
    ) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("X-Auth-Token", &self.token)
            .header("Accept", "application/json");
        match microversion {
            Some(version) => builder
                .header(NOVA_VERSION_HEADER, version.as_str())
                .header(API_VERSION_HEADER, format!("compute {}", version.as_str())),
            None => builder,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        target: Target<'_>,
    ) -> Result<Response, ApiError> {
        let request_id = format!("req-{}", Uuid::new_v4());
        let response = request
            .header(REQUEST_ID_HEADER, &request_id)
            .send()
            .await
            .map_err(|err| ApiError::Transport {
                message: err.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            debug!(
                %request_id,
                status = status.as_u16(),
                resource = target.resource,
                "call accepted"
            );
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = classify_status(status.as_u16(), &body, target);
        debug!(%request_id, status = status.as_u16(), error = %error, "call failed");
        Err(error)
    }

    async fn post_action(
        &self,
        server_id: &str,
        body: serde_json::Value,
        microversion: Option<Microversion>,
    ) -> Result<(), ApiError> {
        let url = self.compute_url(&["servers", server_id, "action"])?;
        let request = self.request(Method::POST, url, microversion).json(&body);
        self.send(request, Target::new("server", server_id)).await?;
        Ok(())
    }
}

impl ComputeApi for NovaClient {
    fn create_server<'a>(
        &'a self,
        submission: &'a CreateSubmission,
    ) -> ApiFuture<'a, CreatedServer> {
        Box::pin(async move {
            let url = self.compute_url(&[submission.endpoint.path()])?;
            let request = self
                .request(Method::POST, url, submission.microversion)
                .json(&submission.body);
            let target = Target::new("endpoint", submission.endpoint.path());
            let response = self.send(request, target).await?;
            let created: CreatedEnvelope = decode(response, "create response").await?;
            Ok(created.server.into())
        })
    }

    fn get_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ServerRecord> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id])?;
            let request = self.request(Method::GET, url, None);
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: ServerEnvelope = decode(response, "server").await?;
            Ok(envelope.server.into())
        })
    }

    fn update_server<'a>(
        &'a self,
        server_id: &'a str,
        update: &'a ServerUpdate,
    ) -> ApiFuture<'a, ServerRecord> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id])?;
            let request = self
                .request(Method::PUT, url, None)
                .json(&ServerUpdateBody { server: update });
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: ServerEnvelope = decode(response, "server").await?;
            Ok(envelope.server.into())
        })
    }

    fn delete_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id])?;
            let request = self.request(Method::DELETE, url, None);
            self.send(request, Target::new("server", server_id)).await?;
            Ok(())
        })
    }

    fn force_delete_server<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(self.post_action(server_id, json!({ "forceDelete": null }), None))
    }

    fn server_action<'a>(
        &'a self,
        server_id: &'a str,
        action: &'a ServerAction,
    ) -> ApiFuture<'a, ()> {
        debug!(instance_id = server_id, action = action.name(), "submitting server action");
        Box::pin(self.post_action(server_id, action.body(), action.microversion()))
    }

    fn update_metadata<'a>(
        &'a self,
        server_id: &'a str,
        metadata: &'a BTreeMap<String, String>,
    ) -> ApiFuture<'a, BTreeMap<String, String>> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "metadata"])?;
            let request = self
                .request(Method::POST, url, None)
                .json(&MetadataEnvelope { metadata });
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: MetadataEnvelope<BTreeMap<String, String>> =
                decode(response, "metadata").await?;
            Ok(envelope.metadata)
        })
    }

    fn delete_metadata_key<'a>(
        &'a self,
        server_id: &'a str,
        key: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "metadata", key])?;
            let request = self.request(Method::DELETE, url, None);
            self.send(request, Target::new("metadata key", key)).await?;
            Ok(())
        })
    }

    fn list_tags<'a>(
        &'a self,
        server_id: &'a str,
        microversion: Microversion,
    ) -> ApiFuture<'a, BTreeSet<String>> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "tags"])?;
            let request = self.request(Method::GET, url, Some(microversion));
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: TagsEnvelope<BTreeSet<String>> = decode(response, "tags").await?;
            Ok(envelope.tags)
        })
    }

    fn replace_tags<'a>(
        &'a self,
        server_id: &'a str,
        tags: &'a BTreeSet<String>,
        microversion: Microversion,
    ) -> ApiFuture<'a, BTreeSet<String>> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "tags"])?;
            let request = self
                .request(Method::PUT, url, Some(microversion))
                .json(&TagsEnvelope { tags });
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: TagsEnvelope<BTreeSet<String>> = decode(response, "tags").await?;
            Ok(envelope.tags)
        })
    }

    fn list_interfaces<'a>(&'a self, server_id: &'a str) -> ApiFuture<'a, Vec<InterfaceRecord>> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "os-interface"])?;
            let request = self.request(Method::GET, url, None);
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: InterfaceListEnvelope = decode(response, "interfaces").await?;
            Ok(envelope.interfaces.into_iter().map(Into::into).collect())
        })
    }

    fn get_interface<'a>(
        &'a self,
        server_id: &'a str,
        port_id: &'a str,
    ) -> ApiFuture<'a, InterfaceRecord> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "os-interface", port_id])?;
            let request = self.request(Method::GET, url, None);
            let response = self.send(request, Target::new("interface", port_id)).await?;
            let envelope: InterfaceEnvelope = decode(response, "interface").await?;
            Ok(envelope.interface.into())
        })
    }

    fn attach_interface<'a>(
        &'a self,
        server_id: &'a str,
        request: &'a InterfaceRequest,
    ) -> ApiFuture<'a, InterfaceRecord> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "os-interface"])?;
            let call = self
                .request(Method::POST, url, None)
                .json(&InterfaceAttachBody { interface: request });
            let response = self.send(call, Target::new("server", server_id)).await?;
            let envelope: InterfaceEnvelope = decode(response, "interface").await?;
            Ok(envelope.interface.into())
        })
    }

    fn detach_interface<'a>(
        &'a self,
        server_id: &'a str,
        port_id: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "os-interface", port_id])?;
            let request = self.request(Method::DELETE, url, None);
            self.send(request, Target::new("interface", port_id)).await?;
            Ok(())
        })
    }

    fn list_volume_attachments<'a>(
        &'a self,
        server_id: &'a str,
    ) -> ApiFuture<'a, Vec<VolumeAttachmentRecord>> {
        Box::pin(async move {
            let url = self.compute_url(&["servers", server_id, "os-volume_attachments"])?;
            let request = self.request(Method::GET, url, None);
            let response = self.send(request, Target::new("server", server_id)).await?;
            let envelope: VolumeAttachmentsEnvelope =
                decode(response, "volume attachments").await?;
            Ok(envelope.attachments.into_iter().map(Into::into).collect())
        })
    }
}

impl CatalogLookup for NovaClient {
    fn image_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>> {
        Box::pin(async move {
            let url = endpoint_url(self.endpoint(Service::Image)?, &["v2", "images"])?;
            let request = self
                .request(Method::GET, url, None)
                .query(&[("name", name)]);
            let response = self.send(request, Target::new("image", name)).await?;
            let envelope: ImagesEnvelope = decode(response, "images").await?;
            Ok(envelope.images.into_iter().map(|image| image.id).collect())
        })
    }

    fn flavor_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>> {
        Box::pin(async move {
            // The flavor listing has no name filter.
            let url = self.compute_url(&["flavors"])?;
            let request = self.request(Method::GET, url, None);
            let response = self.send(request, Target::new("flavor", name)).await?;
            let envelope: FlavorsEnvelope = decode(response, "flavors").await?;
            Ok(envelope
                .flavors
                .into_iter()
                .filter(|flavor| flavor.name == name)
                .map(|flavor| flavor.id)
                .collect())
        })
    }

    fn network_ids_by_name<'a>(&'a self, name: &'a str) -> ApiFuture<'a, Vec<String>> {
        Box::pin(async move {
            let url = endpoint_url(self.endpoint(Service::Network)?, &["v2.0", "networks"])?;
            let request = self
                .request(Method::GET, url, None)
                .query(&[("name", name)]);
            let response = self.send(request, Target::new("network", name)).await?;
            let envelope: NetworksEnvelope = decode(response, "networks").await?;
            Ok(envelope.networks.into_iter().map(|network| network.id).collect())
        })
    }
}

impl BlockStorageApi for NovaClient {
    fn volume_status<'a>(&'a self, volume_id: &'a str) -> ApiFuture<'a, String> {
        Box::pin(async move {
            let url = endpoint_url(self.endpoint(Service::Volume)?, &["volumes", volume_id])?;
            let request = self.request(Method::GET, url, None);
            let response = self.send(request, Target::new("volume", volume_id)).await?;
            let envelope: VolumeEnvelope = decode(response, "volume").await?;
            Ok(envelope.volume.status)
        })
    }

    fn tracks_volumes(&self) -> bool {
        self.volume.is_some()
    }
}

#[cfg(test)]
mod tests;
