//! `kproxy info`: launch the host, run the handshake, print what it reports.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use kproxy_core::{ConnectorConfig, KernelInfo, KernelRegistry, StdioKernelConnector};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoReport<'a> {
    process_id: Option<u32>,
    kernel_info: &'a KernelInfo,
    sub_kernels: Vec<&'a KernelInfo>,
}

pub async fn run_info(config: ConnectorConfig, json: bool) -> Result<()> {
    let connector = StdioKernelConnector::new(config);
    let root = connector
        .create_root_proxy_kernel()
        .await
        .context("failed to connect to kernel host")?;
    let registry = connector
        .kernel_infos()
        .context("kernel host handshake did not complete")?;

    debug!(sub_kernels = registry.len(), "kernel host handshake complete");

    if json {
        let report = InfoReport {
            process_id: connector.process_id(),
            kernel_info: registry.root(),
            sub_kernels: registry.sub_kernels().collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_registry(registry, connector.process_id()));
    }

    root.dispose();
    connector.wait_for_exit().await;
    Ok(())
}

fn render_registry(registry: &KernelRegistry, pid: Option<u32>) -> String {
    let root = registry.root();
    let mut out = String::new();
    out.push_str(&format!(
        "Kernel host: {} (pid {})\n",
        root.local_name,
        pid.map_or_else(|| "?".to_string(), |p| p.to_string())
    ));
    if let Some(uri) = &root.remote_uri {
        out.push_str(&format!("  uri: {uri}\n"));
    }
    if !root.supported_directives.is_empty() {
        let directives: Vec<_> = root.supported_directives.iter().map(String::as_str).collect();
        out.push_str(&format!("  directives: {}\n", directives.join(", ")));
    }

    out.push_str(&format!("Sub-kernels ({}):\n", registry.len()));
    for kernel in registry.sub_kernels() {
        let language = match (&kernel.language_name, &kernel.language_version) {
            (Some(name), Some(version)) => format!("{name} {version}"),
            (Some(name), None) => name.clone(),
            _ => "-".to_string(),
        };
        out.push_str(&format!("  {:<12} {language}\n", kernel.local_name));
    }
    out
}
