// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Authenticated cookie session against the Proteus backend

use crate::config::ProteusConfig;
use crate::errors::{ProteusError, ProteusResult};
use crate::transport::log_failed_response;
use chrono::{DateTime, Utc};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, ORIGIN};
use reqwest::{Client, StatusCode, Url};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const LOGIN_ENDPOINT: &str = "users.loginWithEmailAndPassword";
pub const CSRF_COOKIE: &str = "proteus_csrf";
pub const CSRF_HEADER: &str = "x-proteus-csrf";

/// One logged-in HTTP session. Cheap to clone, clones share the cookie jar.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    jar: Arc<Jar>,
    authenticated_since: DateTime<Utc>,
    closed: Arc<AtomicBool>,
}

impl Session {
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn authenticated_since(&self) -> DateTime<Utc> {
        self.authenticated_since
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Read the CSRF token from the current cookie store
    pub fn csrf_token(&self, base_url: &Url) -> Option<String> {
        let cookies = self.jar.cookies(base_url)?;
        let cookies = cookies.to_str().ok()?;
        cookies
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == CSRF_COOKIE)
            .map(|(_, value)| value.to_owned())
    }

    /// Returns false if the session was already closed
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Owns the single session of one inverter and logs in on demand
#[derive(Debug)]
pub struct SessionManager {
    config: ProteusConfig,
    base_url: Url,
    origin: HeaderValue,
    session: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(config: &ProteusConfig) -> ProteusResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ProteusError::Config(format!("invalid base_url: {e}")))?;
        let origin = HeaderValue::from_str(&config.origin)
            .map_err(|e| ProteusError::Config(format!("invalid origin: {e}")))?;

        Ok(Self {
            config: config.clone(),
            base_url,
            origin,
            session: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Return the open session, logging in first if there is none
    pub async fn ensure_session(&self) -> ProteusResult<Session> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref()
            && !session.is_closed()
        {
            return Ok(session.clone());
        }

        let session = self.login().await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Headers for the next request, including the live CSRF token once a session exists
    pub async fn headers(&self) -> ProteusResult<HeaderMap> {
        let mut headers = self.static_headers();

        let slot = self.session.lock().await;
        if let Some(session) = slot.as_ref().filter(|s| !s.is_closed()) {
            let token = session
                .csrf_token(&self.base_url)
                .ok_or(ProteusError::MissingCsrf)?;
            let value = HeaderValue::from_str(&token).map_err(|_| ProteusError::MissingCsrf)?;
            headers.insert(HeaderName::from_static(CSRF_HEADER), value);
        }

        Ok(headers)
    }

    /// Drop the current session so the next call logs in again
    pub async fn invalidate(&self) {
        if let Some(session) = self.session.lock().await.take()
            && session.close()
        {
            warn!("🔐 [PROTEUS LOGIN] Session invalidated, next call will log in again");
        }
    }

    /// Release the session. Calling it again is a no-op.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take()
            && session.close()
        {
            info!("🔐 [PROTEUS LOGIN] Session closed");
        }
    }

    fn static_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, self.origin.clone());
        headers
    }

    async fn login(&self) -> ProteusResult<Session> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.config.request_timeout())
            .build()
            .map_err(|e| ProteusError::Auth(format!("Failed to build HTTP client: {e}")))?;

        let url = self
            .base_url
            .join(LOGIN_ENDPOINT)
            .map_err(|e| ProteusError::Config(format!("invalid login URL: {e}")))?;
        let payload = json!({
            "json": {
                "tenantId": self.config.tenant_id,
                "email": self.config.email,
                "password": self.config.password,
            }
        });

        info!("🔐 [PROTEUS LOGIN] Logging in as {}", self.config.email);
        debug!("   URL: {}", url);

        let response = client
            .post(url.clone())
            .headers(self.static_headers())
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProteusError::Auth(format!("login request failed: {e}")))?;

        // A rejected login still yields a session; the first call made with it
        // fails on the missing CSRF cookie instead.
        if response.status() == StatusCode::OK {
            info!("✅ [PROTEUS LOGIN] Logged in");
        } else {
            log_failed_response("POST", url.as_str(), response).await;
        }

        Ok(Session {
            client,
            jar,
            authenticated_since: Utc::now(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}
