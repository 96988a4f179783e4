// Remote info metric collector
//
// Polls the `/_remote/info` endpoint of a node and exposes the connectivity
// statistics of every configured remote cluster, plus scrape bookkeeping
// (up, total scrapes, JSON parse failures).

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, IntCounter, Opts};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::io::Read;
use thiserror::Error;
use tracing::{debug, warn};

use super::{build_fq_name, MetricDefinition};

const STATS_SUBSYSTEM: &str = "remote_info_stats";
const SUBSYSTEM: &str = "remote_info";
const REMOTE_INFO_PATH: &str = "_remote/info";
const REMOTE_CLUSTER_LABELS: &[&str] = &["remote_cluster"];

/// Connectivity statistics of one remote cluster.
///
/// Missing and `null` fields decode as zero; unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteClusterRecord {
    #[serde(deserialize_with = "null_as_zero")]
    pub num_nodes_connected: u64,
    #[serde(deserialize_with = "null_as_zero")]
    pub num_proxy_sockets_connected: u64,
    #[serde(deserialize_with = "null_as_zero")]
    pub max_connections_per_cluster: u64,
}

fn null_as_zero<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decoded `/_remote/info` payload, keyed by remote cluster name
pub type RemoteInfoResponse = HashMap<String, RemoteClusterRecord>;

/// Decodes a remote info document
///
/// A `null` document is an empty response and a `null` cluster entry is an
/// all-zero record.
pub fn decode_remote_info<R: Read>(reader: R) -> serde_json::Result<RemoteInfoResponse> {
    let decoded: Option<HashMap<String, Option<RemoteClusterRecord>>> =
        serde_json::from_reader(reader)?;

    Ok(decoded
        .unwrap_or_default()
        .into_iter()
        .map(|(remote_cluster, stats)| (remote_cluster, stats.unwrap_or_default()))
        .collect())
}

/// Why a remote info scrape failed
#[derive(Error, Debug)]
pub enum FetchError {
    /// The endpoint could not be reached (DNS, connect, TLS, timeout)
    #[error("failed to get remote info from {scheme}://{host}:{port}{path}: {source}")]
    Fetch {
        scheme: String,
        host: String,
        port: String,
        path: String,
        source: reqwest::Error,
    },

    /// The endpoint answered with something other than 200
    #[error("HTTP Request failed with code {0}")]
    Status(u16),

    /// The body was not a valid remote info document
    #[error("failed to decode remote info response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FetchError {
    /// Short classification used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Fetch { .. } => "fetch",
            FetchError::Status(_) => "status",
            FetchError::Decode(_) => "decode",
        }
    }
}

fn remote_cluster_labels(remote_cluster: &str) -> Vec<String> {
    vec![remote_cluster.to_string()]
}

/// Returns `base` with the remote info path joined onto its existing path
pub fn remote_info_url(base: &Url) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}/{}", prefix, REMOTE_INFO_PATH));
    url
}

/// Remote info collector
///
/// Each `collect` call performs exactly one blocking GET against the remote
/// info endpoint. The HTTP client is injected fully configured (timeouts,
/// TLS, auth); this collector never retries.
///
/// Bookkeeping metrics are atomics, so overlapping scrapes are safe.
pub struct RemoteInfo {
    client: Client,
    url: Url,

    up: Gauge,
    total_scrapes: IntCounter,
    json_parse_failures: IntCounter,

    definitions: Vec<MetricDefinition<RemoteClusterRecord>>,
}

impl RemoteInfo {
    /// Creates a new RemoteInfo collector
    ///
    /// # Arguments
    /// * `namespace` - Metric name prefix (e.g., "elasticsearch")
    /// * `client` - Pre-configured blocking HTTP client
    /// * `url` - Base URL of the node; may carry a path prefix
    pub fn new(namespace: &str, client: Client, url: Url) -> prometheus::Result<Self> {
        let up = Gauge::with_opts(
            Opts::new(
                "up",
                "Was the last scrape of the ElasticSearch remote info endpoint successful.",
            )
            .namespace(namespace)
            .subsystem(STATS_SUBSYSTEM),
        )?;
        let total_scrapes = IntCounter::with_opts(
            Opts::new("total_scrapes", "Current total ElasticSearch remote info scrapes.")
                .namespace(namespace)
                .subsystem(STATS_SUBSYSTEM),
        )?;
        let json_parse_failures = IntCounter::with_opts(
            Opts::new("json_parse_failures", "Number of errors while parsing JSON.")
                .namespace(namespace)
                .subsystem(STATS_SUBSYSTEM),
        )?;

        let definitions = vec![
            MetricDefinition::gauge(
                build_fq_name(namespace, SUBSYSTEM, "num_nodes_connected"),
                "Number of nodes connected",
                REMOTE_CLUSTER_LABELS,
                |stats: &RemoteClusterRecord| stats.num_nodes_connected as f64,
                remote_cluster_labels,
            )?,
            MetricDefinition::gauge(
                build_fq_name(namespace, SUBSYSTEM, "num_proxy_sockets_connected"),
                "Number of proxy sockets connected",
                REMOTE_CLUSTER_LABELS,
                |stats: &RemoteClusterRecord| stats.num_proxy_sockets_connected as f64,
                remote_cluster_labels,
            )?,
            MetricDefinition::gauge(
                build_fq_name(namespace, SUBSYSTEM, "max_connections_per_cluster"),
                "Max connections per cluster",
                REMOTE_CLUSTER_LABELS,
                |stats: &RemoteClusterRecord| stats.max_connections_per_cluster as f64,
                remote_cluster_labels,
            )?,
        ];

        Ok(RemoteInfo {
            client,
            url,
            up,
            total_scrapes,
            json_parse_failures,
            definitions,
        })
    }

    /// Fetches and decodes the remote info document
    ///
    /// A decode failure also increments `json_parse_failures`. The response
    /// body is released when `response` goes out of scope on every path.
    ///
    /// # Errors
    /// * `FetchError::Fetch` - transport failure
    /// * `FetchError::Status` - non-200 status, body left undecoded
    /// * `FetchError::Decode` - malformed or mistyped JSON
    pub fn fetch(&self) -> Result<RemoteInfoResponse, FetchError> {
        let url = remote_info_url(&self.url);
        debug!(
            "Fetching remote info from {}{}",
            url.host_str().unwrap_or_default(),
            url.path()
        );

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|source| FetchError::Fetch {
                scheme: url.scheme().to_string(),
                host: url.host_str().unwrap_or_default().to_string(),
                port: url.port().map(|port| port.to_string()).unwrap_or_default(),
                path: url.path().to_string(),
                source,
            })?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        match decode_remote_info(response) {
            Ok(remote_info) => {
                debug!("Decoded remote info for {} cluster(s)", remote_info.len());
                Ok(remote_info)
            }
            Err(e) => {
                self.json_parse_failures.inc();
                Err(FetchError::Decode(e))
            }
        }
    }

    /// One family per definition, one sample per remote cluster
    fn cluster_families(&self, remote_info: &RemoteInfoResponse) -> Vec<MetricFamily> {
        if remote_info.is_empty() {
            return Vec::new();
        }

        self.definitions
            .iter()
            .map(|definition| {
                definition.family(
                    remote_info
                        .iter()
                        .map(|(remote_cluster, stats)| definition.sample(remote_cluster, stats)),
                )
            })
            .collect()
    }
}

impl Collector for RemoteInfo {
    fn desc(&self) -> Vec<&Desc> {
        self.definitions
            .iter()
            .map(|definition| &definition.desc)
            .chain(self.up.desc())
            .chain(self.total_scrapes.desc())
            .chain(self.json_parse_failures.desc())
            .collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        // Counted once per cycle, whatever the outcome.
        self.total_scrapes.inc();

        let mut families = match self.fetch() {
            Ok(remote_info) => {
                self.up.set(1.0);
                self.cluster_families(&remote_info)
            }
            Err(e) => {
                self.up.set(0.0);
                warn!(
                    kind = e.kind(),
                    error = %e,
                    "failed to fetch and decode remote info"
                );
                Vec::new()
            }
        };

        families.extend(self.up.collect());
        families.extend(self.total_scrapes.collect());
        families.extend(self.json_parse_failures.collect());
        families
    }
}
