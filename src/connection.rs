//! The single shared XMPP session.
//!
//! Every job shares one connection. The manager tracks the session state
//! machine and refuses to hand out the client until authenticated.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::XmppSettings;
use crate::error::{ElOyenteResult, TransportError};
use crate::xmpp::{Jid, PubSubClient};

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticated,
}

#[derive(Debug)]
struct Session {
    state: ConnectionState,
    server: Option<String>,
    jid: Option<Jid>,
}

/// Owns the connection lifecycle for a [`PubSubClient`].
pub struct ConnectionManager {
    client: Arc<dyn PubSubClient>,
    connect_timeout: Duration,
    session: Mutex<Session>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connect_timeout", &self.connect_timeout)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(client: Arc<dyn PubSubClient>, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
            session: Mutex::new(Session {
                state: ConnectionState::Disconnected,
                server: None,
                jid: None,
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Validates `settings`, then connects and authenticates.
    ///
    /// # Errors
    ///
    /// Returns a validation error for incomplete settings, or the transport
    /// error of the failing step.
    pub fn open(&self, settings: &XmppSettings) -> ElOyenteResult<Jid> {
        settings.validate()?;
        self.connect(&settings.server)?;
        let jid = self.authenticate(&settings.user, &settings.password, settings.resource())?;
        Ok(jid)
    }

    /// Connects to `server`. Already connected sessions are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the host is unreachable.
    pub fn connect(&self, server: &str) -> Result<(), TransportError> {
        let mut session = self.session();
        if session.state != ConnectionState::Disconnected {
            debug!(server = %server, "already connected");
            return Ok(());
        }
        self.client.connect(server, self.connect_timeout).map_err(|e| {
            warn!(server = %server, error = %e, "connection failed");
            e
        })?;
        session.state = ConnectionState::Connected;
        session.server = Some(server.to_string());
        info!(server = %server, "connected");
        Ok(())
    }

    /// Logs in. Already authenticated sessions are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] before [`connect`](Self::connect)
    /// and [`TransportError::AuthFailed`] on bad credentials.
    pub fn authenticate(&self, user: &str, password: &str, resource: &str) -> Result<Jid, TransportError> {
        let mut session = self.session();
        match session.state {
            ConnectionState::Disconnected => return Err(TransportError::NotConnected),
            ConnectionState::Authenticated => {
                if let Some(jid) = &session.jid {
                    return Ok(jid.clone());
                }
            }
            ConnectionState::Connected => {}
        }
        let jid = self.client.authenticate(user, password, resource).map_err(|e| {
            warn!(user = %user, error = %e, "authentication failed");
            e
        })?;
        info!(jid = %jid, "authenticated");
        session.state = ConnectionState::Authenticated;
        session.jid = Some(jid.clone());
        Ok(jid)
    }

    /// Tears the session down. Idempotent.
    pub fn disconnect(&self) {
        let mut session = self.session();
        if session.state == ConnectionState::Disconnected {
            return;
        }
        self.client.disconnect();
        info!(server = ?session.server, "disconnected");
        session.state = ConnectionState::Disconnected;
        session.server = None;
        session.jid = None;
    }

    /// Full JID bound by the session, when authenticated.
    #[must_use]
    pub fn jid(&self) -> Option<Jid> {
        self.session().jid.clone()
    }

    #[must_use]
    pub fn bare_jid(&self) -> Option<Jid> {
        self.jid().map(|j| j.to_bare())
    }

    /// The transport regardless of session state, for in-process bookkeeping
    /// such as detaching listeners.
    pub(crate) fn transport(&self) -> Arc<dyn PubSubClient> {
        Arc::clone(&self.client)
    }

    /// The transport for authenticated operations.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotAuthenticated`] unless authenticated.
    pub fn client(&self) -> Result<Arc<dyn PubSubClient>, TransportError> {
        if self.is_authenticated() {
            Ok(Arc::clone(&self.client))
        } else {
            Err(TransportError::NotAuthenticated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::xmpp::InMemoryPubSub;

    fn setup() -> (InMemoryPubSub, ConnectionManager) {
        let service = InMemoryPubSub::new("xmpp.test");
        service.add_account("ci", "pw");
        let manager = ConnectionManager::new(Arc::new(service.session()), Duration::from_secs(30));
        (service, manager)
    }

    #[test]
    fn open_reaches_authenticated() {
        let (service, manager) = setup();
        let jid = manager.open(&XmppSettings::new("xmpp.test", "ci", "pw")).unwrap();
        assert_eq!(jid.as_str(), "ci@xmpp.test/eloyente");
        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(manager.bare_jid().unwrap().as_str(), "ci@xmpp.test");
        assert_eq!(service.last_connect_timeout(), Some(Duration::from_secs(30)));
        assert!(manager.client().is_ok());
    }

    #[test]
    fn repeated_connect_does_not_open_a_second_session() {
        let (service, manager) = setup();
        manager.connect("xmpp.test").unwrap();
        manager.connect("xmpp.test").unwrap();
        manager.authenticate("ci", "pw", "r").unwrap();
        manager.connect("xmpp.test").unwrap();
        manager.authenticate("ci", "pw", "r").unwrap();
        assert_eq!(service.counters().connects.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn incomplete_settings_are_rejected_before_connecting() {
        let (service, manager) = setup();
        let err = manager.open(&XmppSettings::new("xmpp.test", "", "pw")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ElOyenteError::Validation(ValidationError::IncompleteSettings { .. })
        ));
        assert_eq!(service.counters().connects.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn failures_leave_state_unchanged() {
        let (service, manager) = setup();
        assert_eq!(manager.authenticate("ci", "pw", "r").unwrap_err(), TransportError::NotConnected);

        service.set_unreachable(true);
        assert!(matches!(manager.connect("xmpp.test"), Err(TransportError::ConnectFailed { .. })));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        service.set_unreachable(false);
        manager.connect("xmpp.test").unwrap();
        assert!(matches!(
            manager.authenticate("ci", "bad", "r"),
            Err(TransportError::AuthFailed { .. })
        ));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(matches!(manager.client(), Err(TransportError::NotAuthenticated)));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (_service, manager) = setup();
        manager.open(&XmppSettings::new("xmpp.test", "ci", "pw")).unwrap();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.jid().is_none());
    }
}
