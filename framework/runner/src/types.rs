/// Result type for the runner's entry points and the deployment driver, where errors only need
/// to be reported with context rather than matched on.
pub type SparkTunnelResult<T> = anyhow::Result<T>;
