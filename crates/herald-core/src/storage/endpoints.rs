//! Repository for endpoint database operations.
//!
//! Manages webhook endpoint registration: target URLs, signing secrets,
//! event subscriptions, custom headers, retry/timeout policy, and rolling
//! delivery statistics. Endpoints define where and how events are delivered.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{
        Endpoint, EndpointId, EndpointPatch, NewEndpoint, DEFAULT_MAX_ATTEMPTS,
        DEFAULT_TIMEOUT_SECONDS,
    },
    signer,
};

/// Repository for endpoint database operations.
///
/// Handles registration, configuration updates, secret rotation, activation
/// toggling, and the per-endpoint delivery counters updated once per
/// terminal outcome.
pub struct Repository {
    pool: Arc<PgPool>,
    allow_insecure_urls: bool,
}

impl Repository {
    /// Creates a new repository instance.
    ///
    /// Registration and updates require `https://` URLs.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool, allow_insecure_urls: false }
    }

    /// Creates a repository that also accepts `http://` URLs.
    ///
    /// For local development and tests against plain-HTTP receivers.
    pub fn allowing_insecure_urls(pool: Arc<PgPool>) -> Self {
        Self { pool, allow_insecure_urls: true }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Registers a new endpoint and generates its signing secret.
    ///
    /// The endpoint starts active. The returned row carries the full secret;
    /// this is the one chance to show it unmasked.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` for an empty name, an empty
    /// subscription set, a non-positive policy value, or a URL with a
    /// disallowed scheme.
    pub async fn create(&self, new: NewEndpoint) -> Result<Endpoint> {
        self.validate_new(&new)?;

        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            INSERT INTO endpoints (
                id, name, url, description, secret, event_types,
                is_active, headers, max_attempts, timeout_seconds
            ) VALUES (
                $1, $2, $3, $4, $5, $6, true, $7, $8, $9
            )
            RETURNING id, name, url, description, secret, event_types,
                      is_active, headers, max_attempts, timeout_seconds,
                      total_deliveries, successful_deliveries, failed_deliveries,
                      last_delivery_at, created_at, updated_at
            ",
        )
        .bind(EndpointId::new())
        .bind(&new.name)
        .bind(&new.url)
        .bind(&new.description)
        .bind(signer::generate_secret())
        .bind(&new.event_types)
        .bind(sqlx::types::Json(&new.headers))
        .bind(new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS))
        .bind(new.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS))
        .fetch_one(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Finds an endpoint by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, endpoint_id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            SELECT id, name, url, description, secret, event_types,
                   is_active, headers, max_attempts, timeout_seconds,
                   total_deliveries, successful_deliveries, failed_deliveries,
                   last_delivery_at, created_at, updated_at
            FROM endpoints
            WHERE id = $1
            ",
        )
        .bind(endpoint_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Lists all endpoints, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(
            r"
            SELECT id, name, url, description, secret, event_types,
                   is_active, headers, max_attempts, timeout_seconds,
                   total_deliveries, successful_deliveries, failed_deliveries,
                   last_delivery_at, created_at, updated_at
            FROM endpoints
            ORDER BY created_at DESC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Finds active endpoints subscribed to `event_type`.
    ///
    /// Subscription matches either the literal event type or the `*`
    /// wildcard. This is the fan-out query: every returned endpoint gets its
    /// own delivery when an event of this type is published.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_active_by_event(&self, event_type: &str) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(
            r"
            SELECT id, name, url, description, secret, event_types,
                   is_active, headers, max_attempts, timeout_seconds,
                   total_deliveries, successful_deliveries, failed_deliveries,
                   last_delivery_at, created_at, updated_at
            FROM endpoints
            WHERE is_active = true
              AND (event_types @> ARRAY[$1] OR event_types @> ARRAY['*'])
            ORDER BY created_at ASC
            ",
        )
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(endpoints)
    }

    /// Applies a partial configuration update.
    ///
    /// `None` fields keep their current value; the description can be
    /// replaced but not cleared. Policy changes affect future deliveries
    /// only, since each delivery copies the policy at creation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no endpoint has this ID, or
    /// `CoreError::Validation` if a present field fails the same checks as
    /// registration.
    pub async fn update(&self, endpoint_id: EndpointId, patch: EndpointPatch) -> Result<Endpoint> {
        if let Some(name) = &patch.name {
            if name.trim().is_empty() {
                return Err(CoreError::validation("endpoint name cannot be empty"));
            }
        }
        if let Some(url) = &patch.url {
            self.validate_url(url)?;
        }
        if let Some(event_types) = &patch.event_types {
            if event_types.is_empty() {
                return Err(CoreError::validation("subscription set cannot be empty"));
            }
        }

        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            UPDATE endpoints
            SET name = COALESCE($2, name),
                url = COALESCE($3, url),
                description = COALESCE($4, description),
                event_types = COALESCE($5, event_types),
                headers = COALESCE($6, headers),
                is_active = COALESCE($7, is_active),
                max_attempts = COALESCE($8, max_attempts),
                timeout_seconds = COALESCE($9, timeout_seconds),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, url, description, secret, event_types,
                      is_active, headers, max_attempts, timeout_seconds,
                      total_deliveries, successful_deliveries, failed_deliveries,
                      last_delivery_at, created_at, updated_at
            ",
        )
        .bind(endpoint_id)
        .bind(patch.name)
        .bind(patch.url)
        .bind(patch.description)
        .bind(patch.event_types)
        .bind(patch.headers.map(sqlx::types::Json))
        .bind(patch.is_active)
        .bind(patch.max_attempts)
        .bind(patch.timeout_seconds)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found("endpoint", endpoint_id))?;

        Ok(endpoint)
    }

    /// Rotates the endpoint's signing secret.
    ///
    /// The old secret stops signing new attempts immediately; attempts
    /// already in flight keep the signature they were built with. Returns
    /// the endpoint with the new secret unmasked.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no endpoint has this ID.
    pub async fn rotate_secret(&self, endpoint_id: EndpointId) -> Result<Endpoint> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            UPDATE endpoints
            SET secret = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, name, url, description, secret, event_types,
                      is_active, headers, max_attempts, timeout_seconds,
                      total_deliveries, successful_deliveries, failed_deliveries,
                      last_delivery_at, created_at, updated_at
            ",
        )
        .bind(endpoint_id)
        .bind(signer::generate_secret())
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found("endpoint", endpoint_id))?;

        Ok(endpoint)
    }

    /// Enables or disables an endpoint.
    ///
    /// Disabled endpoints are skipped during fan-out; their configuration
    /// and delivery history are preserved.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no endpoint has this ID.
    pub async fn set_active(&self, endpoint_id: EndpointId, active: bool) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE endpoints
            SET is_active = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(endpoint_id)
        .bind(active)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("endpoint", endpoint_id));
        }

        Ok(())
    }

    /// Deletes an endpoint permanently.
    ///
    /// Delivery and attempt history reference the endpoint by plain ID, not
    /// a foreign key, so the ledger survives the delete.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no endpoint has this ID.
    pub async fn delete(&self, endpoint_id: EndpointId) -> Result<()> {
        let result = sqlx::query(
            r"
            DELETE FROM endpoints
            WHERE id = $1
            ",
        )
        .bind(endpoint_id)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("endpoint", endpoint_id));
        }

        Ok(())
    }

    /// Records one terminal delivery outcome in the rolling counters.
    ///
    /// Called exactly once per delivery, when it reaches `success` or
    /// `dead_letter`. The increments happen in a single UPDATE so concurrent
    /// workers cannot lose counts.
    ///
    /// # Errors
    ///
    /// Returns error if update fails. A missing endpoint is not an error
    /// here: deliveries may outlive their endpoint.
    pub async fn record_outcome(&self, endpoint_id: EndpointId, delivered: bool) -> Result<()> {
        sqlx::query(
            r"
            UPDATE endpoints
            SET total_deliveries = total_deliveries + 1,
                successful_deliveries = successful_deliveries
                    + CASE WHEN $2 THEN 1 ELSE 0 END,
                failed_deliveries = failed_deliveries
                    + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_delivery_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(endpoint_id)
        .bind(delivered)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    fn validate_new(&self, new: &NewEndpoint) -> Result<()> {
        if new.name.trim().is_empty() {
            return Err(CoreError::validation("endpoint name is required"));
        }
        self.validate_url(&new.url)?;
        if new.event_types.is_empty() {
            return Err(CoreError::validation("at least one event type is required"));
        }
        if matches!(new.max_attempts, Some(n) if n < 1) {
            return Err(CoreError::validation("max_attempts must be at least 1"));
        }
        if matches!(new.timeout_seconds, Some(n) if n < 1) {
            return Err(CoreError::validation("timeout_seconds must be at least 1"));
        }

        Ok(())
    }

    fn validate_url(&self, url: &str) -> Result<()> {
        let rest = url.strip_prefix("https://").or_else(|| {
            if self.allow_insecure_urls {
                url.strip_prefix("http://")
            } else {
                None
            }
        });

        match rest {
            Some(host) if !host.is_empty() => Ok(()),
            Some(_) => Err(CoreError::validation(format!("endpoint url has no host: {url}"))),
            None if self.allow_insecure_urls => Err(CoreError::validation(format!(
                "endpoint url must use http or https: {url}"
            ))),
            None => {
                Err(CoreError::validation(format!("endpoint url must use https: {url}")))
            },
        }
    }
}
