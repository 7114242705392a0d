//! Deployment descriptors: the YAML file declaring services and volumes.
//!
//! ```yaml
//! services:
//!   db:
//!     command: ["postgres", "-D", "/var/lib/postgresql/data"]
//!     volumes: ["pgdata:PGDATA"]
//!     healthcheck:
//!       test: { type: postgres, user: todo, password: "${DB_PASSWORD}", database: todo }
//!       interval: 1s
//!   app:
//!     command: ["stack-api"]
//!     depends_on: [db]
//! volumes:
//!   pgdata:
//! ```
//!
//! String values anywhere in the file go through `${VAR}` interpolation
//! before the file is decoded, then the whole deployment is validated. A
//! deployment that fails validation is never started.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use url::{Host, Url};

use stack_common::interpolate::{interpolate, InterpolationError};
use stack_common::probe::{probe_for, ProbeError};
use stack_common::spec::{HealthCheckSpec, ProbeSpec, ServiceSpec, VolumeSpec};

use crate::volume::is_valid_name;

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid descriptor: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{path}: {source}")]
    Interpolation {
        path: String,
        #[source]
        source: InterpolationError,
    },
    #[error("the deployment declares no services")]
    NoServices,
    #[error("invalid service name {0:?}")]
    InvalidServiceName(String),
    #[error("invalid volume name {0:?}")]
    InvalidVolumeName(String),
    #[error("service {0} has an empty command")]
    EmptyCommand(String),
    #[error("service {0} depends on itself")]
    SelfDependency(String),
    #[error("service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },
    #[error("dependency cycle between services {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("service {service} mounts unknown volume {volume}")]
    UnknownVolume { service: String, volume: String },
    #[error("host port {port} is bound by both {first} and {second}")]
    DuplicateHostPort {
        port: u16,
        first: String,
        second: String,
    },
    #[error("service {service} health check probes port {port}, which is not one of its ports {declared:?}")]
    ProbePortMismatch {
        service: String,
        port: u16,
        declared: Vec<String>,
    },
    #[error("service {service} has an invalid health check: {source}")]
    InvalidProbe {
        service: String,
        #[source]
        source: ProbeError,
    },
}

#[derive(Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    services: BTreeMap<String, ServiceSpec>,
    /// `pgdata:` with no body is a volume with default settings.
    #[serde(default)]
    volumes: BTreeMap<String, Option<VolumeSpec>>,
}

/// A validated deployment. Immutable once loaded: a redeploy loads a new one.
#[derive(Debug, Clone)]
pub struct Deployment {
    services: BTreeMap<String, ServiceSpec>,
    volumes: BTreeMap<String, VolumeSpec>,
    start_order: Vec<String>,
}

impl Deployment {
    pub async fn load(path: &Path) -> Result<Self, DescriptorError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DescriptorError::Read {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_yaml(&yaml)
    }

    /// Parse a descriptor, interpolating from the process environment.
    pub fn from_yaml(yaml: &str) -> Result<Self, DescriptorError> {
        Self::from_yaml_with(yaml, |name| std::env::var(name).ok())
    }

    pub fn from_yaml_with<F>(yaml: &str, lookup: F) -> Result<Self, DescriptorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut document: Value = serde_yaml::from_str(yaml)?;
        interpolate_value(&mut document, &mut Vec::new(), &lookup)?;
        let raw: RawDescriptor = serde_yaml::from_value(document)?;

        let services = raw
            .services
            .into_iter()
            .map(|(name, mut spec)| {
                spec.name = name.clone();
                (name, spec)
            })
            .collect();
        let volumes = raw
            .volumes
            .into_iter()
            .map(|(name, spec)| (name, spec.unwrap_or_default()))
            .collect();

        Self::new(services, volumes)
    }

    pub fn new(
        services: BTreeMap<String, ServiceSpec>,
        volumes: BTreeMap<String, VolumeSpec>,
    ) -> Result<Self, DescriptorError> {
        validate(&services, &volumes)?;
        let start_order = start_order(&services)?;

        Ok(Self {
            services,
            volumes,
            start_order,
        })
    }

    /// Service names such that every service comes after its dependencies.
    /// Ties are broken by name, so the order is stable across loads.
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    pub fn services_in_start_order(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.start_order
            .iter()
            .filter_map(|name| self.services.get(name))
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    pub fn volumes(&self) -> &BTreeMap<String, VolumeSpec> {
        &self.volumes
    }

    pub fn plan(&self) -> Plan<'_> {
        Plan(self)
    }
}

fn interpolate_value<F>(
    value: &mut Value,
    path: &mut Vec<String>,
    lookup: &F,
) -> Result<(), DescriptorError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(text) => {
            *text = interpolate(text, lookup).map_err(|source| DescriptorError::Interpolation {
                path: path.join("."),
                source,
            })?;
        }
        Value::Sequence(items) => {
            for (index, item) in items.iter_mut().enumerate() {
                path.push(index.to_string());
                interpolate_value(item, path, lookup)?;
                path.pop();
            }
        }
        Value::Mapping(mapping) => {
            for (key, item) in mapping.iter_mut() {
                path.push(key.as_str().unwrap_or("?").to_owned());
                interpolate_value(item, path, lookup)?;
                path.pop();
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, path, lookup)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

fn validate(
    services: &BTreeMap<String, ServiceSpec>,
    volumes: &BTreeMap<String, VolumeSpec>,
) -> Result<(), DescriptorError> {
    if services.is_empty() {
        return Err(DescriptorError::NoServices);
    }
    if let Some(name) = volumes.keys().find(|name| !is_valid_name(name)) {
        return Err(DescriptorError::InvalidVolumeName(name.clone()));
    }

    let mut host_ports: HashMap<u16, &str> = HashMap::new();

    for (name, service) in services {
        if !is_valid_name(name) {
            return Err(DescriptorError::InvalidServiceName(name.clone()));
        }
        if service.command.is_empty() {
            return Err(DescriptorError::EmptyCommand(name.clone()));
        }

        for dependency in &service.depends_on {
            if dependency == name {
                return Err(DescriptorError::SelfDependency(name.clone()));
            }
            if !services.contains_key(dependency) {
                return Err(DescriptorError::UnknownDependency {
                    service: name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        for mount in &service.volumes {
            if !volumes.contains_key(&mount.source) {
                return Err(DescriptorError::UnknownVolume {
                    service: name.clone(),
                    volume: mount.source.clone(),
                });
            }
        }

        for binding in &service.ports {
            if let Some(first) = host_ports.insert(binding.host, name) {
                return Err(DescriptorError::DuplicateHostPort {
                    port: binding.host,
                    first: first.to_owned(),
                    second: name.clone(),
                });
            }
        }

        if let Some(check) = &service.healthcheck {
            probe_for(&check.test).map_err(|source| DescriptorError::InvalidProbe {
                service: name.clone(),
                source,
            })?;
            check_probe_port(service, check)?;
        }
    }

    Ok(())
}

/// An HTTP probe against this host must hit one of the ports the service
/// declares, otherwise it can never pass.
fn check_probe_port(service: &ServiceSpec, check: &HealthCheckSpec) -> Result<(), DescriptorError> {
    let ProbeSpec::Http { url, .. } = &check.test else {
        return Ok(());
    };
    let Ok(url) = Url::parse(url) else {
        return Ok(());
    };

    let local = match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Some(Host::Ipv6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        None => false,
    };
    let Some(port) = url.port_or_known_default() else {
        return Ok(());
    };
    if !local {
        return Ok(());
    }

    let declared = service
        .ports
        .iter()
        .any(|binding| binding.host == port || binding.container == port);
    match declared {
        true => Ok(()),
        false => Err(DescriptorError::ProbePortMismatch {
            service: service.name.clone(),
            port,
            declared: service.ports.iter().map(|b| String::from(*b)).collect(),
        }),
    }
}

fn start_order(services: &BTreeMap<String, ServiceSpec>) -> Result<Vec<String>, DescriptorError> {
    let mut waiting: BTreeMap<&str, BTreeSet<&str>> = services
        .iter()
        .map(|(name, spec)| {
            let dependencies = spec.depends_on.iter().map(String::as_str).collect();
            (name.as_str(), dependencies)
        })
        .collect();
    let mut order = Vec::with_capacity(services.len());

    while !waiting.is_empty() {
        let ready: Vec<&str> = waiting
            .iter()
            .filter(|(_, dependencies)| dependencies.is_empty())
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            // everything left is on or behind a cycle
            return Err(DescriptorError::DependencyCycle(
                waiting.keys().map(|name| (*name).to_owned()).collect(),
            ));
        }

        for name in ready {
            drop(waiting.remove(name));
            for dependencies in waiting.values_mut() {
                _ = dependencies.remove(name);
            }
            order.push(name.to_owned());
        }
    }

    Ok(order)
}

/// Human readable start plan, printed by `validate`.
pub struct Plan<'a>(&'a Deployment);

impl fmt::Display for Plan<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deployment = self.0;
        writeln!(f, "start order:")?;
        for (position, service) in deployment.services_in_start_order().enumerate() {
            let dependencies = match service.depends_on.is_empty() {
                true => "-".to_owned(),
                false => service.depends_on.join(", "),
            };
            writeln!(
                f,
                "  {}. {} (after: {}, restart: {})",
                position + 1,
                service.name,
                dependencies,
                service.restart
            )?;
            match &service.healthcheck {
                Some(check) => writeln!(
                    f,
                    "     health: {} every {}, timeout {}, {} retries after {} (unhealthy after {:?})",
                    describe_probe(&check.test),
                    check.interval,
                    check.timeout,
                    check.retries(),
                    check.start_period,
                    check.unhealthy_after()
                )?,
                None => writeln!(f, "     health: process liveness only")?,
            }
        }

        if !deployment.volumes.is_empty() {
            writeln!(f, "volumes:")?;
            for (name, volume) in &deployment.volumes {
                match volume.external {
                    true => writeln!(f, "  {name} (external)")?,
                    false => writeln!(f, "  {name}")?,
                }
            }
        }
        Ok(())
    }
}

fn describe_probe(probe: &ProbeSpec) -> String {
    match probe {
        ProbeSpec::Http { url, .. } => format!("GET {url}"),
        ProbeSpec::Postgres(target) => target.to_string(),
        ProbeSpec::Tcp { address } => format!("tcp {address}"),
        ProbeSpec::Command { argv } => argv.join(" "),
        ProbeSpec::Shell { command } => format!("sh -c {command:?}"),
    }
}
