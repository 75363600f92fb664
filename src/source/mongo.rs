//! MongoDB connections and capped-collection polling
//!
//! Every server gets a client verified with a `ping` before any recording
//! starts. Connection and authentication failures abort startup. Each
//! source then polls through a dedicated client of its own, so that
//! cancelling one source can shut its connections down without touching
//! the others.

use crate::config::ServerSpec;
use crate::error::{SourceError, SourceResult};
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, Credential, FindOptions, ServerAddress};
use mongodb::sync::{Client, Collection, Database};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port used when a host in the URI has none
pub const DEFAULT_PORT: u16 = 27017;

/// Split the host list out of a `mongodb://` URI
///
/// `mongodb://user:pw@h1:27017,h2/db?replicaSet=rs` -> `["h1:27017", "h2"]`
pub fn parse_hosts(uri: &str) -> Option<Vec<String>> {
    let rest = uri.trim().strip_prefix("mongodb://")?;
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let hosts = authority.rsplit('@').next().unwrap_or_default();

    let hosts: Vec<String> = hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();

    if hosts.is_empty() {
        None
    } else {
        Some(hosts)
    }
}

/// `host:port` of the first node in the URI, used to name a server
pub fn server_label(uri: &str) -> String {
    match parse_hosts(uri).and_then(|hosts| hosts.into_iter().next()) {
        Some(host) if host.contains(':') => host,
        Some(host) => format!("{}:{}", host, DEFAULT_PORT),
        None => uri.to_string(),
    }
}

/// Builder for a verified client connection
pub struct MongoConnector {
    spec: ServerSpec,
    timeout: Duration,
    socket_timeout: Option<Duration>,
    retries: u32,
}

impl MongoConnector {
    /// Create a new connector for one server
    pub fn new(spec: ServerSpec) -> Self {
        Self {
            spec,
            timeout: Duration::from_secs(10),
            socket_timeout: None,
            retries: 2,
        }
    }

    /// Set connect / server selection timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the socket read/write timeout; must exceed the server-side
    /// time limit of a poll
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Set retry count
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Build the client options for this server
    fn client_options(&self, server: &str) -> SourceResult<ClientOptions> {
        let hosts = parse_hosts(&self.spec.mongodb_uri).ok_or_else(|| {
            SourceError::ConnectionFailed {
                server: server.to_string(),
                reason: format!("no hosts in URI '{}'", self.spec.redacted_uri()),
            }
        })?;

        let addresses = hosts
            .iter()
            .map(|h| {
                ServerAddress::parse(h).map_err(|e| SourceError::ConnectionFailed {
                    server: server.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<SourceResult<Vec<_>>>()?;

        let single_host = addresses.len() == 1;
        let mut options = ClientOptions::builder().hosts(addresses).build();
        options.app_name = Some("mongo-recorder".to_string());
        options.connect_timeout = Some(self.timeout);
        options.server_selection_timeout = Some(self.timeout);
        options.socket_timeout = self.socket_timeout;
        options.repl_set_name = self.spec.repl_set.clone();
        if self.spec.repl_set.is_none() && single_host {
            options.direct_connection = Some(true);
        }

        if let (Some(user), Some(password)) = (&self.spec.user, &self.spec.password) {
            let mut credential = Credential::default();
            credential.username = Some(user.clone());
            credential.password = Some(password.clone());
            credential.source = self.spec.auth_db.clone();
            options.credential = Some(credential);
        }

        Ok(options)
    }

    /// Connect and verify with retries
    pub fn connect(self) -> SourceResult<ClientHandle> {
        let server = server_label(&self.spec.mongodb_uri);
        let options = self.client_options(&server)?;
        let ping_db = self.spec.auth_db.clone().unwrap_or_else(|| "admin".to_string());
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                // Exponential backoff: 200ms, 400ms, 800ms, ...
                let delay = Duration::from_millis(200 * (1 << (attempt - 1)));
                std::thread::sleep(delay);
            }

            let client = match Client::with_options(options.clone()) {
                Ok(client) => client,
                Err(e) => {
                    last_error = Some(SourceError::ConnectionFailed {
                        server: server.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            match client.database(&ping_db).run_command(doc! { "ping": 1 }, None) {
                Ok(_) => {
                    info!(server = %server, "Connected");
                    return Ok(ClientHandle { client, options, server });
                }
                Err(e) if matches!(*e.kind, ErrorKind::Authentication { .. }) => {
                    return Err(SourceError::AuthFailed {
                        server,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    warn!(server = %server, attempt = attempt + 1, error = %e, "Connection attempt failed");
                    last_error = Some(SourceError::ConnectionFailed {
                        server: server.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or(SourceError::ConnectionFailed {
            server,
            reason: "no connection attempts made".into(),
        }))
    }
}

/// A verified client and the server it talks to
#[derive(Clone)]
pub struct ClientHandle {
    client: Client,
    options: ClientOptions,
    server: String,
}

impl ClientHandle {
    /// `host:port` label of the server
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Get a database handle
    pub fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }

    /// A new client to the same server with its own connection pool
    ///
    /// The options were verified by `connect`, so no ping is sent.
    pub fn dedicated(&self) -> SourceResult<ClientHandle> {
        let client = Client::with_options(self.options.clone()).map_err(|e| SourceError::ConnectionFailed {
            server: self.server.clone(),
            reason: e.to_string(),
        })?;
        Ok(ClientHandle {
            client,
            options: self.options.clone(),
            server: self.server.clone(),
        })
    }

    /// Close every connection of this client
    ///
    /// Operations still running on it fail, and later ones fail at once.
    pub fn shutdown(&self) {
        self.client.clone().shutdown_immediate();
        debug!(server = %self.server, "Client shut down");
    }

    /// Run an admin command
    pub fn admin_command(&self, command: Document) -> SourceResult<Document> {
        self.client
            .database("admin")
            .run_command(command, None)
            .map_err(|e| SourceError::Query {
                namespace: "admin".into(),
                reason: e.to_string(),
            })
    }
}

/// Verify that `collection` exists in `db` and is capped
pub(crate) fn ensure_capped(db: &Database, collection: &str, namespace: &str) -> SourceResult<()> {
    let reply = db
        .run_command(
            doc! { "listCollections": 1, "filter": { "name": collection } },
            None,
        )
        .map_err(|e| SourceError::Unavailable {
            namespace: namespace.to_string(),
            reason: e.to_string(),
        })?;

    let first = reply
        .get_document("cursor")
        .and_then(|cursor| cursor.get_array("firstBatch"))
        .map_err(|e| SourceError::Decode {
            namespace: namespace.to_string(),
            reason: format!("unexpected listCollections reply: {}", e),
        })?
        .first()
        .and_then(Bson::as_document);

    let Some(spec) = first else {
        return Err(SourceError::Unavailable {
            namespace: namespace.to_string(),
            reason: "collection not found".into(),
        });
    };

    let capped = spec
        .get_document("options")
        .ok()
        .and_then(|options| options.get_bool("capped").ok())
        .unwrap_or(false);

    if !capped {
        return Err(SourceError::Unavailable {
            namespace: namespace.to_string(),
            reason: "collection is not capped".into(),
        });
    }

    debug!(namespace = %namespace, "Capped collection verified");
    Ok(())
}

/// Fetch up to `limit` records matching `filter` in natural order
pub(crate) fn poll_batch(
    collection: &Collection<Document>,
    filter: Document,
    limit: i64,
    max_time: Duration,
    namespace: &str,
) -> SourceResult<Vec<Document>> {
    let query_error = |e: mongodb::error::Error| SourceError::Query {
        namespace: namespace.to_string(),
        reason: e.to_string(),
    };

    let mut options = FindOptions::default();
    options.sort = Some(doc! { "$natural": 1 });
    options.limit = Some(limit);
    options.max_time = Some(max_time);

    let cursor = collection.find(filter, options).map_err(query_error)?;
    let mut batch = Vec::new();
    for document in cursor {
        batch.push(document.map_err(query_error)?);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hosts() {
        assert_eq!(
            parse_hosts("mongodb://db1.local:27017").unwrap(),
            vec!["db1.local:27017"]
        );
        assert_eq!(
            parse_hosts("mongodb://user:secret@h1:27018,h2/admin?replicaSet=rs0").unwrap(),
            vec!["h1:27018", "h2"]
        );
        assert!(parse_hosts("http://h1").is_none());
        assert!(parse_hosts("mongodb:///admin").is_none());
    }

    #[test]
    fn test_server_label() {
        assert_eq!(server_label("mongodb://h1:27018,h2"), "h1:27018");
        assert_eq!(server_label("mongodb://h2/?ssl=true"), "h2:27017");
    }

    #[test]
    fn test_client_options() {
        let spec = ServerSpec {
            mongodb_uri: "mongodb://db1:27017".into(),
            repl_set: None,
            auth_db: Some("admin".into()),
            user: Some("ops".into()),
            password: Some("hunter2".into()),
        };
        let options = MongoConnector::new(spec)
            .timeout(Duration::from_secs(3))
            .socket_timeout(Duration::from_secs(15))
            .client_options("db1:27017")
            .unwrap();

        assert_eq!(options.socket_timeout, Some(Duration::from_secs(15)));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(options.direct_connection, Some(true));
        let credential = options.credential.unwrap();
        assert_eq!(credential.username.as_deref(), Some("ops"));
        assert_eq!(credential.source.as_deref(), Some("admin"));
    }

    #[test]
    fn test_replica_set_options() {
        let spec = ServerSpec {
            mongodb_uri: "mongodb://h1:27017,h2:27017".into(),
            repl_set: Some("rs0".into()),
            auth_db: None,
            user: None,
            password: None,
        };
        let options = MongoConnector::new(spec).client_options("h1:27017").unwrap();

        assert_eq!(options.hosts.len(), 2);
        assert_eq!(options.repl_set_name.as_deref(), Some("rs0"));
        assert_eq!(options.direct_connection, None);
        assert_eq!(options.socket_timeout, None);
        assert!(options.credential.is_none());
    }
}
