//! Mapping from a [Scenario] to the cluster deployment that runs it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use url::Url;

use crate::catalog::Scenario;

/// Name of the network shared by every service of a deployment.
pub const SHARED_NETWORK: &str = "spark-tunnel-net";
/// Service name, and hostname on the shared network, of the Spark master.
pub const MASTER_SERVICE: &str = "spark-master";
/// Service name of the benchmark API.
pub const API_SERVICE: &str = "benchmark-api";
/// Where the host data directory is mounted in every container.
pub const CONTAINER_DATA_DIR: &str = "/data";

/// Upper bounds on what a single deployment may request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub max_workers: u32,
    /// Total memory across all workers, in GB
    pub max_total_memory_gb: f64,
    /// Total cores across all workers
    pub max_total_cores: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_workers: 64,
            max_total_memory_gb: 4096.0,
            max_total_cores: 1024,
        }
    }
}

/// Proxies to pass through to the benchmark API service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    pub http: Option<Url>,
    pub https: Option<Url>,
}

impl ProxyConfig {
    /// Equivalent JVM system properties, only for proxies with both a host and a port.
    fn java_options(&self) -> Option<String> {
        let mut options = Vec::new();
        for (scheme, proxy) in [("http", &self.http), ("https", &self.https)] {
            let Some(proxy) = proxy else { continue };
            if let (Some(host), Some(port)) = (proxy.host_str(), proxy.port_or_known_default()) {
                options.push(format!("-D{scheme}.proxyHost={host}"));
                options.push(format!("-D{scheme}.proxyPort={port}"));
            }
        }

        (!options.is_empty()).then(|| options.join(" "))
    }
}

/// Settings shared by the descriptors of every scenario in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorConfig {
    pub spark_image: String,
    pub api_image: String,
    /// Path of the dataset as seen from inside the containers
    pub dataset_path: String,
    /// Host directory mounted read-only at [CONTAINER_DATA_DIR]
    pub data_dir: Option<PathBuf>,
    pub driver_memory: String,
    pub master_port: u16,
    /// Host port the Spark master web UI is published on, if any
    pub master_ui_port: Option<u16>,
    /// Port the benchmark API listens on, published on the same host port
    pub api_port: u16,
    pub limits: ResourceLimits,
    pub proxy: ProxyConfig,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            spark_image: "bitnami/spark:3.5".to_string(),
            api_image: "spark-tunnel/benchmark-api:latest".to_string(),
            dataset_path: format!("{CONTAINER_DATA_DIR}/train.csv"),
            data_dir: None,
            driver_memory: "16g".to_string(),
            master_port: 7077,
            master_ui_port: Some(8080),
            api_port: 8000,
            limits: ResourceLimits::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Master,
    Worker,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// One container of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub role: ServiceRole,
    pub environment: BTreeMap<String, String>,
    /// Memory limit in docker notation, e.g. `4g`
    pub memory_limit: Option<String>,
    pub cpus: Option<u32>,
    pub ports: Vec<PortMapping>,
    pub depends_on: Vec<String>,
    pub volumes: Vec<String>,
}

/// Values handed to the benchmark job through its environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentBindings {
    pub master_host: String,
    pub dataset_path: String,
    pub driver_memory: String,
    pub dataset_scale: f64,
}

/// Everything needed to bring up the cluster for one scenario.
///
/// Only [DescriptorBuilder::build] creates descriptors and nothing modifies one afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentDescriptor {
    scenario_name: String,
    network: String,
    master: ServiceSpec,
    workers: Vec<ServiceSpec>,
    api: ServiceSpec,
    bindings: EnvironmentBindings,
}

impl DeploymentDescriptor {
    pub fn scenario_name(&self) -> &str {
        &self.scenario_name
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn master(&self) -> &ServiceSpec {
        &self.master
    }

    pub fn workers(&self) -> &[ServiceSpec] {
        &self.workers
    }

    pub fn api(&self) -> &ServiceSpec {
        &self.api
    }

    pub fn bindings(&self) -> &EnvironmentBindings {
        &self.bindings
    }

    /// Port on the host where the benchmark API is reachable.
    pub fn api_host_port(&self) -> Option<u16> {
        self.api.ports.first().map(|p| p.host)
    }

    /// Every service in start order: master, workers, then the API service.
    pub fn services(&self) -> impl Iterator<Item = &ServiceSpec> {
        std::iter::once(&self.master)
            .chain(self.workers.iter())
            .chain(std::iter::once(&self.api))
    }

    /// Render as a docker compose document.
    pub fn to_compose_yaml(&self) -> Result<String, serde_yaml::Error> {
        let file = ComposeFile {
            services: self
                .services()
                .map(|service| (service.name.clone(), ComposeService::new(service, &self.network)))
                .collect(),
            networks: BTreeMap::from([(
                self.network.clone(),
                ComposeNetwork {
                    driver: "bridge".to_string(),
                },
            )]),
        };

        serde_yaml::to_string(&file)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BuildError {
    #[error("Scenario '{scenario}' requests {requested} workers but at most {limit} are allowed")]
    TooManyWorkers {
        scenario: String,
        requested: u32,
        limit: u32,
    },
    #[error("Scenario '{scenario}' requests {requested_gb} GB per worker, less than the 1 MB minimum")]
    TooLittleMemory { scenario: String, requested_gb: f64 },
    #[error("Scenario '{scenario}' requests {requested} GB of worker memory in total but the limit is {limit} GB")]
    TooMuchMemory {
        scenario: String,
        requested: f64,
        limit: f64,
    },
    #[error("Scenario '{scenario}' requests {requested} cores in total but the limit is {limit}")]
    TooManyCores {
        scenario: String,
        requested: u64,
        limit: u32,
    },
}

#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    config: DescriptorConfig,
}

impl DescriptorBuilder {
    pub fn new(config: DescriptorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DescriptorConfig {
        &self.config
    }

    /// Build the deployment for `scenario`.
    ///
    /// The same scenario and configuration always produce an identical descriptor.
    pub fn build(&self, scenario: &Scenario) -> Result<DeploymentDescriptor, BuildError> {
        self.check_limits(scenario)?;

        let config = &self.config;
        let master_url = format!("spark://{MASTER_SERVICE}:{}", config.master_port);
        let volumes = config
            .data_dir
            .iter()
            .map(|dir| format!("{}:{CONTAINER_DATA_DIR}:ro", dir.display()))
            .collect::<Vec<_>>();
        let worker_memory = format_memory(scenario.memory_per_worker());

        let master = ServiceSpec {
            name: MASTER_SERVICE.to_string(),
            image: config.spark_image.clone(),
            role: ServiceRole::Master,
            environment: BTreeMap::from([
                ("SPARK_MODE".to_string(), "master".to_string()),
                ("SPARK_MASTER_PORT".to_string(), config.master_port.to_string()),
            ]),
            memory_limit: None,
            cpus: None,
            ports: config
                .master_ui_port
                .map(|host| PortMapping {
                    host,
                    container: 8080,
                })
                .into_iter()
                .collect(),
            depends_on: Vec::new(),
            volumes: volumes.clone(),
        };

        let workers = (1..=scenario.worker_count())
            .map(|index| ServiceSpec {
                name: format!("spark-worker-{index}"),
                image: config.spark_image.clone(),
                role: ServiceRole::Worker,
                environment: BTreeMap::from([
                    ("SPARK_MODE".to_string(), "worker".to_string()),
                    ("SPARK_MASTER_URL".to_string(), master_url.clone()),
                    ("SPARK_WORKER_MEMORY".to_string(), worker_memory.clone()),
                    (
                        "SPARK_WORKER_CORES".to_string(),
                        scenario.cores_per_worker().to_string(),
                    ),
                ]),
                memory_limit: Some(worker_memory.clone()),
                cpus: Some(scenario.cores_per_worker()),
                ports: Vec::new(),
                depends_on: vec![MASTER_SERVICE.to_string()],
                volumes: volumes.clone(),
            })
            .collect::<Vec<_>>();

        let bindings = EnvironmentBindings {
            master_host: master_url,
            dataset_path: config.dataset_path.clone(),
            driver_memory: config.driver_memory.clone(),
            dataset_scale: scenario.dataset_scale(),
        };

        let mut api_environment = BTreeMap::from([
            ("SPARK_MASTER_HOST".to_string(), bindings.master_host.clone()),
            ("DATASET_PATH".to_string(), bindings.dataset_path.clone()),
            ("DRIVER_MEMORY".to_string(), bindings.driver_memory.clone()),
            ("DATASET_SCALE".to_string(), bindings.dataset_scale.to_string()),
            ("NUM_WORKERS".to_string(), scenario.worker_count().to_string()),
            (
                "MEM_PER_WORKER".to_string(),
                scenario.memory_per_worker().to_string(),
            ),
            (
                "CORES_PER_WORKER".to_string(),
                scenario.cores_per_worker().to_string(),
            ),
        ]);
        if let Some(http) = &config.proxy.http {
            api_environment.insert("http_proxy".to_string(), http.to_string());
        }
        if let Some(https) = &config.proxy.https {
            api_environment.insert("https_proxy".to_string(), https.to_string());
        }
        if let Some(java_options) = config.proxy.java_options() {
            api_environment.insert("SPARK_DRIVER_EXTRA_JAVA_OPTIONS".to_string(), java_options);
        }

        let api = ServiceSpec {
            name: API_SERVICE.to_string(),
            image: config.api_image.clone(),
            role: ServiceRole::Api,
            environment: api_environment,
            memory_limit: None,
            cpus: None,
            ports: vec![PortMapping {
                host: config.api_port,
                container: config.api_port,
            }],
            depends_on: vec![MASTER_SERVICE.to_string()],
            volumes,
        };

        Ok(DeploymentDescriptor {
            scenario_name: scenario.name().to_string(),
            network: SHARED_NETWORK.to_string(),
            master,
            workers,
            api,
            bindings,
        })
    }

    fn check_limits(&self, scenario: &Scenario) -> Result<(), BuildError> {
        let limits = &self.config.limits;

        if scenario.worker_count() > limits.max_workers {
            return Err(BuildError::TooManyWorkers {
                scenario: scenario.name().to_string(),
                requested: scenario.worker_count(),
                limit: limits.max_workers,
            });
        }

        if scenario.memory_per_worker() * 1024.0 < 1.0 {
            return Err(BuildError::TooLittleMemory {
                scenario: scenario.name().to_string(),
                requested_gb: scenario.memory_per_worker(),
            });
        }

        let total_memory = scenario.memory_per_worker() * f64::from(scenario.worker_count());
        if total_memory > limits.max_total_memory_gb {
            return Err(BuildError::TooMuchMemory {
                scenario: scenario.name().to_string(),
                requested: total_memory,
                limit: limits.max_total_memory_gb,
            });
        }

        let total_cores =
            u64::from(scenario.cores_per_worker()) * u64::from(scenario.worker_count());
        if total_cores > u64::from(limits.max_total_cores) {
            return Err(BuildError::TooManyCores {
                scenario: scenario.name().to_string(),
                requested: total_cores,
                limit: limits.max_total_cores,
            });
        }

        Ok(())
    }
}

/// Format a size in GB the way Spark and docker expect: `4g`, or `1536m` for fractional sizes.
///
/// Fractional sizes are rounded up to the next whole megabyte.
pub fn format_memory(gb: f64) -> String {
    if gb.fract() == 0.0 {
        format!("{}g", gb as u64)
    } else {
        format!("{}m", (gb * 1024.0).ceil() as u64)
    }
}

#[derive(Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
    networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Serialize)]
struct ComposeNetwork {
    driver: String,
}

#[derive(Serialize)]
struct ComposeService {
    image: String,
    hostname: String,
    environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mem_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpus: Option<u32>,
}

impl ComposeService {
    fn new(service: &ServiceSpec, network: &str) -> Self {
        Self {
            image: service.image.clone(),
            hostname: service.name.clone(),
            environment: service.environment.clone(),
            ports: service
                .ports
                .iter()
                .map(|p| format!("{}:{}", p.host, p.container))
                .collect(),
            depends_on: service.depends_on.clone(),
            volumes: service.volumes.clone(),
            networks: vec![network.to_string()],
            mem_limit: service.memory_limit.clone(),
            cpus: service.cpus,
        }
    }
}
