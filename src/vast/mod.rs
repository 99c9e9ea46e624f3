//! Vast.ai backend implementation of the marketplace capabilities.

mod error;
mod types;

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::backend::{
    BackendFuture, InstanceHandle, InstanceLifecycle, InstanceSnapshot, KeyRegistry,
    LaunchRequest, LogFetch, Marketplace, Offer, OfferQuery, OfferSearch,
};
use crate::config::VastConfig;
use types::{
    CreateInstancePayload, CreateInstanceResponse, InstanceResponse, LogRequestResponse,
    OffersResponse,
};

pub use error::VastBackendError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const LOG_TAIL_LINES: &str = "1000";
const LOG_FETCH_ATTEMPTS: u32 = 10;
const LOG_FETCH_DELAY: Duration = Duration::from_secs(1);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Backend that rents instances through the Vast.ai REST API.
#[derive(Clone, Debug)]
pub struct VastBackend {
    api_url: String,
    api_key: String,
}

impl VastBackend {
    /// Constructs a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VastBackendError::Config`] when the API key or URL is
    /// missing.
    pub fn new(config: &VastConfig) -> Result<Self, VastBackendError> {
        if config.api_key.trim().is_empty() {
            return Err(VastBackendError::Config(String::from(
                "missing Vast.ai API key: set VASTAI_API_KEY or add api_key to vastdev.toml",
            )));
        }
        if config.api_url.trim().is_empty() {
            return Err(VastBackendError::Config(String::from(
                "missing Vast.ai API URL: set VASTAI_API_URL or add api_url to vastdev.toml",
            )));
        }
        Ok(Self {
            api_url: config.api_url.trim().trim_end_matches('/').to_owned(),
            api_key: config.api_key.trim().to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        HTTP_CLIENT
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
    }

    async fn send(action: &str, builder: RequestBuilder) -> Result<Response, VastBackendError> {
        let response = builder
            .send()
            .await
            .map_err(|err| VastBackendError::Transport {
                action: action.to_owned(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(VastBackendError::Api {
            action: action.to_owned(),
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        action: &str,
        builder: RequestBuilder,
    ) -> Result<T, VastBackendError> {
        let response = Self::send(action, builder).await?;
        let body = response
            .bytes()
            .await
            .map_err(|err| VastBackendError::Transport {
                action: action.to_owned(),
                message: err.to_string(),
            })?;
        serde_json::from_slice(&body).map_err(|err| VastBackendError::Decode {
            action: action.to_owned(),
            message: err.to_string(),
        })
    }

    async fn download_logs(
        instance_id: u64,
        result_url: &str,
    ) -> Result<String, VastBackendError> {
        for attempt in 1..=LOG_FETCH_ATTEMPTS {
            let response = HTTP_CLIENT.get(result_url).send().await;
            match response {
                Ok(body) if body.status().is_success() => {
                    return body.text().await.map_err(|err| VastBackendError::Transport {
                        action: String::from("log download"),
                        message: err.to_string(),
                    });
                }
                Ok(body) => {
                    debug!(instance_id, attempt, status = %body.status(), "logs not ready yet");
                }
                Err(err) => {
                    debug!(instance_id, attempt, error = %err, "log download failed");
                }
            }
            tokio::time::sleep(LOG_FETCH_DELAY).await;
        }
        Err(VastBackendError::LogsUnavailable {
            instance_id,
            attempts: LOG_FETCH_ATTEMPTS,
        })
    }
}

impl Marketplace for VastBackend {
    type Error = VastBackendError;
}

impl KeyRegistry for VastBackend {
    fn register_ssh_key<'a>(&'a self, public_key: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let builder = self
                .request(Method::POST, "ssh/")
                .json(&json!({ "ssh_key": public_key }));
            Self::send("ssh key registration", builder).await?;
            Ok(())
        })
    }
}

impl OfferSearch for VastBackend {
    fn search_offers<'a>(
        &'a self,
        query: &'a OfferQuery,
    ) -> BackendFuture<'a, Vec<Offer>, Self::Error> {
        Box::pin(async move {
            query.validate()?;
            let builder = self
                .request(Method::POST, "bundles/")
                .json(&types::search_body(query));
            let response: OffersResponse = Self::send_json("offer search", builder).await?;
            Ok(response.offers.into_iter().map(Offer::from).collect())
        })
    }
}

impl InstanceLifecycle for VastBackend {
    fn create_instance<'a>(
        &'a self,
        offer: &'a Offer,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let payload = CreateInstancePayload::from_request(request);
            let builder = self
                .request(Method::PUT, &format!("asks/{}/", offer.id))
                .json(&payload);
            let response: CreateInstanceResponse =
                Self::send_json("instance creation", builder).await?;
            match response.new_contract {
                Some(id) if response.success => Ok(InstanceHandle { id }),
                _ => Err(VastBackendError::CreateRejected {
                    offer_id: offer.id,
                    message: response.failure_message(),
                }),
            }
        })
    }

    fn fetch_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>, Self::Error> {
        Box::pin(async move {
            let builder = self.request(Method::GET, &format!("instances/{}/", handle.id));
            let response: InstanceResponse = Self::send_json("instance lookup", builder).await?;
            response
                .into_snapshot()
                .map_err(|err| VastBackendError::Decode {
                    action: String::from("instance lookup"),
                    message: err.to_string(),
                })
        })
    }

    fn destroy_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let builder = self.request(Method::DELETE, &format!("instances/{}/", handle.id));
            Self::send("instance destruction", builder).await?;
            Ok(())
        })
    }
}

impl LogFetch for VastBackend {
    fn fetch_logs<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let builder = self
                .request(Method::PUT, &format!("instances/request_logs/{}/", handle.id))
                .json(&json!({ "tail": LOG_TAIL_LINES }));
            let response: LogRequestResponse = Self::send_json("log request", builder).await?;
            let Some(result_url) = response.result_url else {
                return Err(VastBackendError::Decode {
                    action: String::from("log request"),
                    message: response
                        .msg
                        .unwrap_or_else(|| String::from("response carried no result_url")),
                });
            };
            Self::download_logs(handle.id, &result_url).await
        })
    }
}
