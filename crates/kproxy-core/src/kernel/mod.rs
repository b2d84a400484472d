//! Kernel metadata and proxy routing targets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Local name given to the proxy bound to the host's composite kernel.
pub const ROOT_PROXY_NAME: &str = "root";

/// Metadata describing a kernel: its language, where it lives, and what it
/// supports.
///
/// Entries from the handshake describe remote kernels. A proxy's copy has
/// `local_name` replaced by the proxy's name and `is_proxy` set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelInfo {
    pub local_name: String,
    #[serde(default)]
    pub is_proxy: bool,
    #[serde(default)]
    pub is_composite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_uri: Option<String>,
    #[serde(default)]
    pub supported_directives: BTreeSet<String>,
    #[serde(default)]
    pub supported_kernel_commands: BTreeSet<String>,
}

impl KernelInfo {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            ..Self::default()
        }
    }

    /// Builder: mark as the composite root.
    pub fn composite(mut self) -> Self {
        self.is_composite = true;
        self
    }

    /// Builder: set language name and version.
    pub fn with_language(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.language_name = Some(name.into());
        self.language_version = Some(version.into());
        self
    }

    /// Builder: set the remote URI.
    pub fn with_remote_uri(mut self, uri: impl Into<String>) -> Self {
        self.remote_uri = Some(uri.into());
        self
    }

    /// Builder: add supported directives.
    pub fn with_directives<I, S>(mut self, directives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_directives
            .extend(directives.into_iter().map(Into::into));
        self
    }

    /// Builder: add supported kernel command names.
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_kernel_commands
            .extend(commands.into_iter().map(Into::into));
        self
    }

    /// Snapshot of this remote entry as seen through a proxy named `name`.
    pub fn for_proxy(&self, name: &str) -> KernelInfo {
        KernelInfo {
            local_name: name.to_string(),
            is_proxy: true,
            ..self.clone()
        }
    }
}

/// Where a proxy's commands are routed inside the kernel host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelTarget {
    /// The composite kernel itself; commands carry no target name.
    Root,
    /// One sub-kernel, addressed by its name in the host.
    Named { remote_name: String },
}

impl KernelTarget {
    pub fn named(remote_name: impl Into<String>) -> Self {
        KernelTarget::Named {
            remote_name: remote_name.into(),
        }
    }

    /// The `targetKernelName` written on the wire, if any.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            KernelTarget::Root => None,
            KernelTarget::Named { remote_name } => Some(remote_name),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, KernelTarget::Root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csharp() -> KernelInfo {
        KernelInfo::new("csharp")
            .with_language("C#", "12.0")
            .with_remote_uri("kernel://host/csharp")
            .with_directives(["#!who"])
            .with_commands(["SubmitCode", "RequestKernelInfo"])
    }

    #[test]
    fn for_proxy_overrides_name_and_marks_proxy() {
        let proxy = csharp().for_proxy("cs2");
        assert_eq!(proxy.local_name, "cs2");
        assert!(proxy.is_proxy);
        assert!(!proxy.is_composite);
        assert_eq!(proxy.language_name.as_deref(), Some("C#"));
        assert_eq!(proxy.language_version.as_deref(), Some("12.0"));
        assert_eq!(proxy.remote_uri.as_deref(), Some("kernel://host/csharp"));
        assert_eq!(proxy.supported_kernel_commands.len(), 2);
    }

    #[test]
    fn for_proxy_keeps_composite_flag_of_root() {
        let root = KernelInfo::new(".NET").composite().for_proxy(ROOT_PROXY_NAME);
        assert!(root.is_composite);
        assert!(root.is_proxy);
        assert_eq!(root.local_name, "root");
    }

    #[test]
    fn serializes_camel_case_and_skips_missing_language() {
        let json = serde_json::to_value(KernelInfo::new("composite").composite()).unwrap();
        assert_eq!(json["localName"], "composite");
        assert_eq!(json["isComposite"], true);
        assert!(json.get("languageName").is_none());
    }

    #[test]
    fn deserializes_with_defaults() {
        let info: KernelInfo =
            serde_json::from_str(r#"{"localName":"fsharp","languageName":"F#"}"#).unwrap();
        assert_eq!(info.local_name, "fsharp");
        assert!(!info.is_proxy);
        assert!(info.supported_directives.is_empty());
    }

    #[test]
    fn target_remote_name() {
        assert_eq!(KernelTarget::Root.remote_name(), None);
        assert!(KernelTarget::Root.is_root());
        let named = KernelTarget::named("fsharp");
        assert_eq!(named.remote_name(), Some("fsharp"));
        assert!(!named.is_root());
    }
}
