//! HTTP network adapter backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::cache::{FetchRequest, Network, NetworkError, ResponseSnapshot};

use super::error::InfraError;

pub struct HttpNetwork {
    client: Client,
}

impl HttpNetwork {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("pantry/", env!("CARGO_PKG_VERSION"))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<ResponseSnapshot, NetworkError> {
        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone());
        for (name, value) in request.headers() {
            // reqwest derives both from the target URL and the body.
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body().is_empty() {
            builder = builder.body(request.body().clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| classify(request, err))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(request, err))?;

        Ok(ResponseSnapshot::new(status, headers, body))
    }
}

fn classify(request: &FetchRequest, err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::timeout(request)
    } else {
        NetworkError::transport(request, err.to_string())
    }
}
