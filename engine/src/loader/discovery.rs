//! Plugin discovery
//!
//! Walks the install root's immediate subdirectories and reads each one's
//! manifest independently. Directories without a manifest are not plugins
//! and are skipped; corrupt manifests are reported per directory.

use super::error::LoadError;
use bulwark_sdk::{PluginManifest, MANIFEST_FILE_NAME};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// One plugin directory found under the install root
#[derive(Debug)]
pub struct Discovered {
    pub directory: PathBuf,
    pub manifest: Result<PluginManifest, LoadError>,
}

/// Read and validate the manifest in `directory`
pub async fn read_manifest(directory: &Path) -> Result<PluginManifest, LoadError> {
    let path = directory.join(MANIFEST_FILE_NAME);
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
        LoadError::Manifest(format!("failed to read {}: {}", path.display(), e))
    })?;
    Ok(PluginManifest::from_json(&content)?)
}

/// Enumerate plugin directories under `root`, sorted by directory name
///
/// # Errors
///
/// Returns an error only if `root` exists but cannot be listed.
pub async fn discover(root: &Path) -> std::io::Result<Vec<Discovered>> {
    if !root.exists() {
        tracing::warn!("Plugin install root {} does not exist", root.display());
        return Ok(Vec::new());
    }

    let mut directories = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if !path.join(MANIFEST_FILE_NAME).exists() {
            tracing::debug!("Skipping {}: no {}", path.display(), MANIFEST_FILE_NAME);
            continue;
        }
        directories.push(path);
    }
    directories.sort();

    let mut found = Vec::with_capacity(directories.len());
    for directory in directories {
        let manifest = read_manifest(&directory).await;
        if let Err(e) = &manifest {
            tracing::warn!("Corrupt plugin in {}: {}", directory.display(), e);
        }
        found.push(Discovered {
            directory,
            manifest,
        });
    }

    tracing::info!("Discovered {} plugin directories in {}", found.len(), root.display());
    Ok(found)
}

/// Order manifests so dependencies come before their dependents
///
/// Returns indices into `manifests`. Dependencies on ids outside the batch are
/// ignored here (the loader checks them against the registry). Members of a
/// cycle keep their discovery order at the end.
pub fn dependency_order(manifests: &[&PluginManifest]) -> Vec<usize> {
    let index: HashMap<&str, usize> = manifests
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; manifests.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); manifests.len()];
    for (i, manifest) in manifests.iter().enumerate() {
        for dep in &manifest.dependencies {
            if let Some(&d) = index.get(dep.id.as_str()) {
                if d != i {
                    indegree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..manifests.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(manifests.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < manifests.len() {
        let placed: Vec<bool> = {
            let mut placed = vec![false; manifests.len()];
            for &i in &order {
                placed[i] = true;
            }
            placed
        };
        let cyclic: Vec<usize> = (0..manifests.len()).filter(|&i| !placed[i]).collect();
        tracing::warn!(
            "Dependency cycle among {} plugins, loading them in discovery order",
            cyclic.len()
        );
        order.extend(cyclic);
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_sdk::{DependencySpec, EntryPoint};

    fn manifest(id: &str, deps: &[&str]) -> PluginManifest {
        PluginManifest {
            id: id.into(),
            name: id.into(),
            version: "1.0.0".into(),
            author: String::new(),
            description: String::new(),
            kind: Default::default(),
            entry: EntryPoint {
                binary: format!("{}.bin", id),
                type_name: "T".into(),
            },
            permissions: vec![],
            dependencies: deps
                .iter()
                .map(|d| DependencySpec {
                    id: d.to_string(),
                    min_version: None,
                    optional: false,
                })
                .collect(),
            compatibility: Default::default(),
            signer_thumbprint: None,
            resource_limits: None,
        }
    }

    #[test]
    fn test_dependencies_come_first() {
        let a = manifest("a", &["c"]);
        let b = manifest("b", &[]);
        let c = manifest("c", &["b"]);
        let order = dependency_order(&[&a, &b, &c]);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let a = manifest("a", &["elsewhere"]);
        let b = manifest("b", &[]);
        assert_eq!(dependency_order(&[&a, &b]), vec![0, 1]);
    }

    #[test]
    fn test_cycle_keeps_discovery_order() {
        let a = manifest("a", &["b"]);
        let b = manifest("b", &["a"]);
        let c = manifest("c", &[]);
        assert_eq!(dependency_order(&[&a, &b, &c]), vec![2, 0, 1]);
    }

    #[tokio::test]
    async fn test_discover_reports_corrupt_manifests() {
        let root = tempfile::tempdir().unwrap();
        let good = root.path().join("good");
        let bad = root.path().join("bad");
        let empty = root.path().join("empty");
        for dir in [&good, &bad, &empty] {
            std::fs::create_dir(dir).unwrap();
        }
        std::fs::write(
            good.join(MANIFEST_FILE_NAME),
            manifest("good", &[]).to_json().unwrap(),
        )
        .unwrap();
        std::fs::write(bad.join(MANIFEST_FILE_NAME), "{ not json").unwrap();

        let found = discover(root.path()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].directory, bad);
        assert!(found[0].manifest.is_err());
        assert_eq!(found[1].manifest.as_ref().unwrap().id, "good");
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let found = discover(&root.path().join("absent")).await.unwrap();
        assert!(found.is_empty());
    }
}
