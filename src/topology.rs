//! Server discovery and session planning
//!
//! With `auto_config`, the servers are read from the router's
//! `connPoolStats`: every replica set it pools connections to, with its
//! primary and secondaries. The oplog comes from the primary; profiling
//! data from the primary and, with `use_secondaries`, the secondaries too.
//!
//! A session tails exactly one oplog, so a cluster with more than one shard
//! is rejected.

use crate::config::{single_oplog_server, AutoConfigOptions, OutputLayout, RecordConfig, ServerSelection, ServerSpec};
use crate::error::{Result, SourceError, SourceResult};
use crate::recorder::{SessionPlan, TailerSpec};
use crate::source::{MongoConnector, OplogSource, ProfilerSource, SourceRole};
use mongodb::bson::{doc, Bson, Document};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Socket timeout on top of the server-side time limit of a poll
const SOCKET_GRACE: Duration = Duration::from_secs(10);

/// Members of one replica set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSetMembers {
    /// Replica set name
    pub name: String,

    /// `host:port` of the primary
    pub primary: Option<String>,

    /// `host:port` of each secondary
    pub secondaries: Vec<String>,
}

/// Oplog and profiler servers of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionServers {
    pub oplog: ServerSpec,
    pub profilers: Vec<ServerSpec>,
}

/// Parse the `replicaSets` section of a `connPoolStats` reply
pub fn parse_conn_pool_stats(reply: &Document) -> SourceResult<Vec<ReplicaSetMembers>> {
    let sets = reply
        .get_document("replicaSets")
        .map_err(|_| SourceError::Topology("connPoolStats reply has no replicaSets".into()))?;

    let mut members: BTreeMap<String, ReplicaSetMembers> = BTreeMap::new();
    for (name, set) in sets {
        let hosts = set
            .as_document()
            .and_then(|set| set.get_array("hosts").ok())
            .ok_or_else(|| SourceError::Topology(format!("replica set '{}' lists no hosts", name)))?;

        let entry = members.entry(name.clone()).or_insert_with(|| ReplicaSetMembers {
            name: name.clone(),
            ..ReplicaSetMembers::default()
        });

        for host in hosts.iter().filter_map(Bson::as_document) {
            let Ok(addr) = host.get_str("addr") else {
                continue;
            };
            if host.get_bool("ismaster").unwrap_or(false) {
                entry.primary = Some(addr.to_string());
            } else if host.get_bool("secondary").unwrap_or(false) {
                entry.secondaries.push(addr.to_string());
            }
        }
    }

    Ok(members.into_values().collect())
}

/// Derive the session's servers from discovered replica sets
pub fn servers_from_topology(sets: &[ReplicaSetMembers], options: &AutoConfigOptions) -> Result<SessionServers> {
    let mut oplogs = Vec::new();
    let mut profilers = Vec::new();

    for set in sets {
        let primary = set
            .primary
            .as_ref()
            .ok_or_else(|| SourceError::Topology(format!("replica set '{}' has no primary", set.name)))?;
        let primary_spec = options.server_spec(&format!("mongodb://{}", primary), Some(set.name.clone()));
        oplogs.push(primary_spec.clone());
        profilers.push(primary_spec);

        if options.use_secondaries {
            for secondary in &set.secondaries {
                profilers.push(options.server_spec(&format!("mongodb://{}", secondary), None));
            }
        }
    }

    let oplog = single_oplog_server(&oplogs)?;
    Ok(SessionServers { oplog, profilers })
}

/// Ask the router for the cluster layout
pub fn discover(options: &AutoConfigOptions, timeout: Duration) -> Result<SessionServers> {
    let router = MongoConnector::new(options.router_spec()).timeout(timeout).connect()?;
    let reply = router.admin_command(doc! { "connPoolStats": 1 })?;
    let sets = parse_conn_pool_stats(&reply)?;
    debug!(sets = ?sets, "Discovered topology");
    servers_from_topology(&sets, options)
}

/// Resolve the configured or discovered servers
pub fn resolve_servers(config: &RecordConfig, timeout: Duration) -> Result<SessionServers> {
    match &config.servers {
        ServerSelection::Explicit { oplog, profilers } => Ok(SessionServers {
            oplog: oplog.clone(),
            profilers: profilers.clone(),
        }),
        ServerSelection::Auto(options) => discover(options, timeout),
    }
}

/// Key of a profiler source: `<db>_<host:port>`
pub fn profiler_key(db: &str, server: &str) -> String {
    format!("{}_{}", db, server)
}

/// Connect to every server and build the session plan
///
/// Fails before anything is recorded if a server cannot be reached or
/// rejects the credentials.
pub fn build_plan(
    config: &RecordConfig,
    servers: &SessionServers,
    timeout: Duration,
    batch_size: i64,
    max_time: Duration,
) -> Result<SessionPlan> {
    let mut plan = SessionPlan::new(config.output.clone());

    let socket_timeout = max_time + SOCKET_GRACE;

    let oplog_client = MongoConnector::new(servers.oplog.clone())
        .timeout(timeout)
        .socket_timeout(socket_timeout)
        .connect()?;
    info!(server = %servers.oplog, "oplog server");
    let oplog = OplogSource::new(&oplog_client, &config.targets)?
        .batch_size(batch_size)
        .max_time(max_time);
    plan = plan.with_source(
        TailerSpec::new("oplog", SourceRole::ChangeFeed, oplog)
            .named(format!("tailing-oplogs on {}", oplog_client.server())),
        config.oplog_output.clone(),
    );

    for (index, spec) in servers.profilers.iter().enumerate() {
        let client = MongoConnector::new(spec.clone())
            .timeout(timeout)
            .socket_timeout(socket_timeout)
            .connect()?;
        info!(index = index, server = %spec, "profiling server");

        for db in &config.targets.databases {
            let key = profiler_key(db, client.server());
            let source = ProfilerSource::new(&client, db, &config.targets)?
                .batch_size(batch_size)
                .max_time(max_time);
            let stream = OutputLayout::profiler_stream(&config.oplog_output, &key);
            plan = plan.with_source(
                TailerSpec::new(key, SourceRole::Profiler, source)
                    .named(format!("tailing-profiler for {} on {}", db, client.server())),
                stream,
            );
        }
    }

    plan.validate()?;
    Ok(plan)
}
