//! Deny/allow policy for modules resolved inside an isolation boundary
//!
//! The deny-list is evaluated first, so a denied module can never be reached
//! through the shared allow-list or a platform prefix. Names match exactly or
//! by segment prefix on `::` or `.`; `-` and `_` are treated as equal so crate
//! and package spellings both match.

/// Facilities no plugin may reach: code emission, dynamic library loading,
/// process spawning and dynamic compilation
pub const DEFAULT_DENIED: &[&str] = &[
    "std::process",
    "tokio::process",
    "async_process",
    "libloading",
    "dlopen2",
    "libc::dlopen",
    "libc::dlsym",
    "libc::fork",
    "libc::execve",
    "libc::posix_spawn",
    "libc::system",
    "nix::unistd::fork",
    "nix::unistd::execv",
    "cranelift",
    "cranelift_jit",
    "dynasmrt",
    "inkwell",
    "wasmtime::component::Linker",
    "rustc_driver",
    "rustc_interface",
];

/// Host modules shared with every plugin instead of being loaded twice
pub const DEFAULT_SHARED: &[&str] = &[
    "bulwark_sdk",
    "bulwark_core",
    "bulwark_domain",
    "bulwark_ui",
    "egui",
    "plotters",
    "serde",
    "serde_json",
    "tokio_util",
    "async_trait",
];

/// Platform and runtime prefixes always served by the host
pub const DEFAULT_PLATFORM_PREFIXES: &[&str] = &["std", "core", "alloc"];

/// Segments denied anywhere below a platform prefix, so platform extension
/// modules such as `std::os::unix::process` are caught too
pub const DEFAULT_PLATFORM_DENIED_SEGMENTS: &[&str] = &["process"];

/// Outcome of checking a module name against the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Fatal security violation
    Deny,
    /// Use the host's already-loaded copy
    Shared,
    /// Resolve within the plugin's private dependency closure
    Private,
}

/// Isolation policy shared by every boundary
#[derive(Debug, Clone)]
pub struct IsolationPolicy {
    denied: Vec<String>,
    shared: Vec<String>,
    platform_prefixes: Vec<String>,
    platform_denied_segments: Vec<String>,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            denied: DEFAULT_DENIED.iter().map(|s| normalize(s)).collect(),
            shared: DEFAULT_SHARED.iter().map(|s| normalize(s)).collect(),
            platform_prefixes: DEFAULT_PLATFORM_PREFIXES
                .iter()
                .map(|s| normalize(s))
                .collect(),
            platform_denied_segments: DEFAULT_PLATFORM_DENIED_SEGMENTS
                .iter()
                .map(|s| normalize(s))
                .collect(),
        }
    }
}

impl IsolationPolicy {
    /// Extend the deny-list
    pub fn with_denied<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.denied
            .extend(names.into_iter().map(|n| normalize(n.as_ref())));
        self
    }

    /// Extend the shared allow-list
    pub fn with_shared<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.shared
            .extend(names.into_iter().map(|n| normalize(n.as_ref())));
        self
    }

    pub fn decide(&self, module: &str) -> PolicyDecision {
        let module = normalize(module);
        if self.denied.iter().any(|p| matches_module(p, &module))
            || self.denied_below_platform(&module)
        {
            PolicyDecision::Deny
        } else if self.shared.iter().any(|p| matches_module(p, &module))
            || self
                .platform_prefixes
                .iter()
                .any(|p| matches_module(p, &module))
        {
            PolicyDecision::Shared
        } else {
            PolicyDecision::Private
        }
    }

    fn denied_below_platform(&self, module: &str) -> bool {
        let mut segments = module.split("::").flat_map(|s| s.split('.'));
        match segments.next() {
            Some(root) if self.platform_prefixes.iter().any(|p| p == root) => {
                segments.any(|s| self.platform_denied_segments.iter().any(|d| d == s))
            }
            _ => false,
        }
    }

    pub fn is_denied(&self, module: &str) -> bool {
        self.decide(module) == PolicyDecision::Deny
    }

    pub fn denied(&self) -> &[String] {
        &self.denied
    }

    pub fn shared(&self) -> &[String] {
        &self.shared
    }
}

fn normalize(name: &str) -> String {
    name.trim().replace('-', "_")
}

/// `pattern` matches `module` exactly or as a leading path segment
fn matches_module(pattern: &str, module: &str) -> bool {
    match module.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) => rest.starts_with("::") || rest.starts_with('.'),
        None => false,
    }
}
