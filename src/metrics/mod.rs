// Metrics module - declarative metric definitions and registry wiring
//
// Collectors in this module expose data through the prometheus `Collector`
// contract (`desc` / `collect`). Per-entity metrics are described by a static
// table of `MetricDefinition`s instead of bespoke emission code, so adding a
// new metric means adding one table entry.

use prometheus::core::Desc;
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::Registry;
use reqwest::blocking::Client;
use reqwest::Url;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::ExporterSettings;

pub mod remote_info;

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "elasticsearch";

/// Errors that can occur while building the collector registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to build HTTP client: {0}")]
    ClientError(#[from] reqwest::Error),

    #[error("invalid metric definition or duplicate registration: {0}")]
    MetricError(#[from] prometheus::Error),
}

/// Joins the non-empty parts of a metric name with underscores.
///
/// # Example
/// ```
/// build_fq_name("elasticsearch", "remote_info", "num_nodes_connected")
/// // => "elasticsearch_remote_info_num_nodes_connected"
/// ```
pub fn build_fq_name(namespace: &str, subsystem: &str, name: &str) -> String {
    [namespace, subsystem, name]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// A single row of a metric definition table.
///
/// Binds one output metric to a pure value extractor over a record of type `R`
/// and a pure label extractor over the record's identifier. The label values
/// returned by `labels` line up with the variable labels of `desc`.
pub struct MetricDefinition<R> {
    pub desc: Desc,
    pub value_type: MetricType,
    pub value: fn(&R) -> f64,
    pub labels: fn(&str) -> Vec<String>,
}

impl<R> MetricDefinition<R> {
    /// Creates a gauge definition
    ///
    /// # Errors
    /// Returns an error if the name or label names are not valid metric identifiers.
    pub fn gauge(
        fq_name: String,
        help: &str,
        label_names: &[&str],
        value: fn(&R) -> f64,
        labels: fn(&str) -> Vec<String>,
    ) -> prometheus::Result<Self> {
        let desc = Desc::new(
            fq_name,
            help.to_string(),
            label_names.iter().map(|name| name.to_string()).collect(),
            HashMap::new(),
        )?;

        Ok(MetricDefinition {
            desc,
            value_type: MetricType::GAUGE,
            value,
            labels,
        })
    }

    /// Builds one sample for `record`, labeled from `id`
    pub fn sample(&self, id: &str, record: &R) -> Metric {
        let value = (self.value)(record);
        let mut metric = Metric::default();

        for (name, label_value) in self.desc.variable_labels.iter().zip((self.labels)(id)) {
            let mut pair = LabelPair::default();
            pair.set_name(name.clone());
            pair.set_value(label_value);
            metric.mut_label().push(pair);
        }

        let mut gauge = Gauge::default();
        gauge.set_value(value);
        metric.set_gauge(gauge);

        metric
    }

    /// Wraps samples of this definition into a metric family
    pub fn family(&self, samples: impl IntoIterator<Item = Metric>) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(self.desc.fq_name.clone());
        family.set_help(self.desc.help.clone());
        family.set_field_type(self.value_type);
        for sample in samples {
            family.mut_metric().push(sample);
        }
        family
    }
}

/// Builds the registry holding every collector of this exporter.
///
/// Must be called outside of an async context: the blocking HTTP client
/// owns its own runtime thread.
///
/// # Arguments
/// * `settings` - Validated exporter settings (namespace, timeout, TLS)
/// * `url` - Base URL of the remote node
pub fn create_registry(settings: &ExporterSettings, url: Url) -> Result<Registry, RegistryError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(settings.timeout))
        .danger_accept_invalid_certs(settings.insecure)
        .build()?;

    let registry = Registry::new();
    let collector = remote_info::RemoteInfo::new(&settings.namespace, client, url)?;
    registry.register(Box::new(collector))?;

    info!(
        "Registered remote info collector (namespace '{}', timeout {}s)",
        settings.namespace, settings.timeout
    );

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Record {
        count: u32,
    }

    fn single_label(id: &str) -> Vec<String> {
        vec![id.to_string()]
    }

    #[test]
    fn test_build_fq_name() {
        assert_eq!(
            build_fq_name("elasticsearch", "remote_info_stats", "up"),
            "elasticsearch_remote_info_stats_up"
        );
        assert_eq!(build_fq_name("", "remote_info", "up"), "remote_info_up");
        assert_eq!(build_fq_name("ns", "", "up"), "ns_up");
    }

    #[test]
    fn test_definition_sample_and_family() {
        let definition = MetricDefinition::gauge(
            build_fq_name("test", "records", "count"),
            "Record count",
            &["entity"],
            |record: &Record| f64::from(record.count),
            single_label,
        )
        .unwrap();

        let sample = definition.sample("first", &Record { count: 7 });
        assert_eq!(sample.get_gauge().get_value(), 7.0);
        assert_eq!(sample.get_label().len(), 1);
        assert_eq!(sample.get_label()[0].get_name(), "entity");
        assert_eq!(sample.get_label()[0].get_value(), "first");

        let family = definition.family(vec![sample]);
        assert_eq!(family.get_name(), "test_records_count");
        assert_eq!(family.get_help(), "Record count");
        assert_eq!(family.get_field_type(), MetricType::GAUGE);
        assert_eq!(family.get_metric().len(), 1);
    }

    #[test]
    fn test_definition_rejects_invalid_name() {
        let result = MetricDefinition::gauge(
            "invalid name".to_string(),
            "help",
            &["entity"],
            |record: &Record| f64::from(record.count),
            single_label,
        );
        assert!(result.is_err());
    }
}
