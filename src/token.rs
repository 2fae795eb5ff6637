// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

//! OAuth2 access tokens for the routing API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Tokens this close to expiry are refreshed instead of reused.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Token {
    pub access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: u64,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a valid token. `force_refresh` bypasses any cached token.
    async fn fetch_token(&self, force_refresh: bool) -> Result<Token>;
}

/// Token source for routing APIs running with authentication disabled.
#[derive(Debug, Default)]
pub struct NoopTokenSource;

#[async_trait]
impl TokenSource for NoopTokenSource {
    async fn fetch_token(&self, _force_refresh: bool) -> Result<Token> {
        Ok(Token::default())
    }
}

/// Client-credentials token fetcher for a UAA-style OAuth2 server.
pub struct UaaTokenFetcher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_margin: Duration,
    cached: Mutex<Option<(Token, Instant)>>,
}

impl UaaTokenFetcher {
    pub fn new(
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
        skip_tls_verification: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tcp-router/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(skip_tls_verification)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build OAuth HTTP client")?;

        Ok(Self {
            http,
            token_url: format!("{}/oauth/token", token_endpoint.trim_end_matches('/')),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            cached: Mutex::new(None),
        })
    }

    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    async fn request_token(&self) -> Result<Token> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .with_context(|| format!("Failed to request token from {}", self.token_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "token request failed (status={}): {}",
                status,
                body
            ));
        }

        response
            .json::<Token>()
            .await
            .context("Failed to decode token response")
    }
}

#[async_trait]
impl TokenSource for UaaTokenFetcher {
    async fn fetch_token(&self, force_refresh: bool) -> Result<Token> {
        let mut cached = self.cached.lock().await;

        if !force_refresh {
            if let Some((token, fetched_at)) = cached.as_ref() {
                let lifetime = Duration::from_secs(token.expires_in);
                if fetched_at.elapsed() + self.refresh_margin < lifetime {
                    return Ok(token.clone());
                }
            }
        }

        debug!(
            "Fetching OAuth token from {} (force_refresh={}).",
            self.token_url, force_refresh
        );
        let token = self.request_token().await?;
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }
}
