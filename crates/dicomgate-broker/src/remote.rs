use async_trait::async_trait;
use dashmap::DashMap;
use dicomgate_types::GatewayError;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{Crosswalk, IdType};

/// Authentication for the remote broker API.
#[derive(Debug, Clone)]
pub enum RemoteAuth {
    Token(String),
    Basic { username: String, password: String },
    None,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    output_id: String,
}

/// HTTP crosswalk backend with an in-memory TTL cache.
///
/// Cache entries are keyed by `(input_id, id_type)`; a bounded size is
/// enforced with oldest-first eviction on insert.
pub struct RemoteBroker {
    name: String,
    url: String,
    auth: RemoteAuth,
    client: reqwest::Client,
    cache_ttl: Duration,
    cache_max: usize,
    cache: DashMap<(String, &'static str), (String, Instant)>,
}

impl RemoteBroker {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        auth: RemoteAuth,
        timeout: Duration,
        cache_ttl: Duration,
        cache_max: usize,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::crosswalk(format!("http client init failed: {}", e)))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            auth,
            client,
            cache_ttl,
            cache_max,
            cache: DashMap::new(),
        })
    }

    fn request(&self, input_id: &str, id_type: IdType) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(format!("{}/lookup", self.url.trim_end_matches('/')))
            .query(&[("input_id", input_id), ("id_type", id_type.as_str())]);
        match &self.auth {
            RemoteAuth::Token(token) => req.bearer_auth(token),
            RemoteAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            RemoteAuth::None => req,
        }
    }

    fn cache_get(&self, key: &(String, &'static str)) -> Option<String> {
        let hit = self.cache.get(key)?;
        let (value, inserted) = hit.value();
        if inserted.elapsed() > self.cache_ttl {
            drop(hit);
            self.cache.remove(key);
            return None;
        }
        Some(value.clone())
    }

    fn cache_put(&self, key: (String, &'static str), value: String) {
        if self.cache.len() >= self.cache_max {
            // evict the oldest entry
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.value().1)
                .map(|e| e.key().clone());
            if let Some(k) = oldest {
                self.cache.remove(&k);
            }
        }
        self.cache.insert(key, (value, Instant::now()));
    }
}

#[async_trait]
impl Crosswalk for RemoteBroker {
    async fn lookup(&self, input_id: &str, id_type: IdType) -> Result<String, GatewayError> {
        let key = (input_id.to_string(), id_type.as_str());
        if let Some(cached) = self.cache_get(&key) {
            debug!(broker = %self.name, "crosswalk cache hit");
            return Ok(cached);
        }

        let response = self
            .request(input_id, id_type)
            .send()
            .await
            .map_err(|e| GatewayError::crosswalk(format!("remote lookup failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            warn!(broker = %self.name, %status, "remote broker returned error");
            return Err(GatewayError::crosswalk(format!(
                "remote broker returned {}",
                status
            )));
        }
        let body: LookupResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::crosswalk(format!("bad lookup response: {}", e)))?;

        self.cache_put(key, body.output_id.clone());
        Ok(body.output_id)
    }

    async fn test(&self) -> Result<(), GatewayError> {
        let response = self
            .request("__probe__", IdType::PatientId)
            .send()
            .await
            .map_err(|e| GatewayError::crosswalk(format!("remote broker unreachable: {}", e)))?;
        if response.status().is_server_error() {
            return Err(GatewayError::crosswalk(format!(
                "remote broker returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }
}
