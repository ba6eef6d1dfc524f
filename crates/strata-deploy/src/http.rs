//! HTTP-backed routing updater.
//!
//! Drives the routing configurator's admin API: one POST flips the
//! service's upstream to the new container and returns the previous one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::RoutingUpdater;

pub struct HttpRoutingUpdater {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RoutingResponse {
    #[serde(default)]
    previous_upstream: String,
}

impl HttpRoutingUpdater {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RoutingUpdater for HttpRoutingUpdater {
    async fn update_routing(
        &self,
        service: &str,
        new_container: &str,
        port: u16,
    ) -> Result<String> {
        let url = format!("{}/v1/routing/{}", self.base_url, service);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "upstream": new_container,
                "port": port,
            }))
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .context("routing update request failed")?
            .error_for_status()
            .context("routing update returned error")?;

        let body: RoutingResponse = response
            .json()
            .await
            .context("routing update response malformed")?;
        Ok(body.previous_upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_response_defaults_previous_upstream() {
        let body: RoutingResponse = serde_json::from_str("{}").expect("parse");
        assert_eq!(body.previous_upstream, "");

        let body: RoutingResponse =
            serde_json::from_str(r#"{"previous_upstream":"shop-api-v1"}"#).expect("parse");
        assert_eq!(body.previous_upstream, "shop-api-v1");
    }
}
