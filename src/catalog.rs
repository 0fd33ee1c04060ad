//! Remote model catalog search
//!
//! Used only to suggest repository ids when adding a model. Nothing in the
//! supervisor or relay depends on the catalog being reachable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::CatalogConfig;
use crate::error::{MlxAdminError, Result};

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Repository id, usable as a model reference
    pub id: String,
    /// Download count, when the hub reports it
    #[serde(default)]
    pub downloads: Option<u64>,
    /// Like count, when the hub reports it
    #[serde(default)]
    pub likes: Option<u64>,
}

/// Query-by-tag lookup of candidate model repositories
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    /// Search repositories matching `query`, restricted to `tag`
    async fn search(&self, query: &str, tag: &str) -> Result<Vec<CatalogEntry>>;
}

/// Catalog backed by the Hugging Face hub model API
#[derive(Debug, Clone)]
pub struct HubCatalog {
    client: Client,
    base_url: String,
    limit: usize,
}

impl HubCatalog {
    /// Create a catalog client from configuration
    ///
    /// # Examples
    ///
    /// ```
    /// use mlxadmin::catalog::HubCatalog;
    /// use mlxadmin::config::CatalogConfig;
    ///
    /// let catalog = HubCatalog::new(&CatalogConfig::default());
    /// assert!(catalog.is_ok());
    /// ```
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("mlxadmin/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MlxAdminError::Catalog(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: config.limit,
        })
    }
}

#[async_trait]
impl CatalogSearch for HubCatalog {
    async fn search(&self, query: &str, tag: &str) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/api/models", self.base_url);
        tracing::debug!("Searching catalog: {} query={} tag={}", url, query, tag);

        let limit = self.limit.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[("search", query), ("filter", tag), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to reach model catalog: {}", e);
                MlxAdminError::Catalog(format!("Failed to reach {}: {}", self.base_url, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(MlxAdminError::Catalog(format!(
                "catalog returned error {}: {}",
                status, error_text
            ))
            .into());
        }

        let entries: Vec<CatalogEntry> = response.json().await.map_err(|e| {
            MlxAdminError::Catalog(format!("Failed to parse catalog response: {}", e))
        })?;

        Ok(entries)
    }
}
