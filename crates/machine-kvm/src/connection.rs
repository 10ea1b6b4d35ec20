//! Lazily-opened hypervisor session owned by one driver instance.

use crate::error::Result;
use crate::hypervisor::Connector;
use tokio::sync::OnceCell;

/// Lazily-established session to one hypervisor endpoint.
///
/// The first successful [`session`](Self::session) call opens the session;
/// later calls return the same one. A failed attempt leaves the cell empty,
/// so the next call dials again. An open session is never replaced: a
/// dropped connection surfaces as errors from the calls routed through it.
pub struct Connection<C: Connector> {
    uri: String,
    connector: C,
    session: OnceCell<C::Session>,
}

impl<C: Connector> Connection<C> {
    /// Create an unopened connection to `uri`.
    pub fn new(uri: impl Into<String>, connector: C) -> Self {
        Self {
            uri: uri.into(),
            connector,
            session: OnceCell::new(),
        }
    }

    /// Endpoint this connection dials.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether a session has been opened.
    pub fn is_open(&self) -> bool {
        self.session.initialized()
    }

    /// Return the open session, opening it first if needed.
    ///
    /// # Errors
    /// Returns [`DriverError::Connection`](crate::DriverError::Connection)
    /// if the endpoint can't be opened.
    pub async fn session(&self) -> Result<&C::Session> {
        self.session
            .get_or_try_init(|| async {
                tracing::debug!(uri = %self.uri, "Opening hypervisor session");
                match self.connector.connect(&self.uri).await {
                    Ok(session) => {
                        tracing::info!(uri = %self.uri, "Hypervisor session opened");
                        Ok(session)
                    }
                    Err(e) => {
                        tracing::error!(
                            uri = %self.uri,
                            error = %e,
                            "Failed to connect to hypervisor"
                        );
                        Err(e)
                    }
                }
            })
            .await
    }
}
