//! Template image catalog: which provider image a named template boots
//! from, split by environment. Provisioning must resolve every requested
//! template through here; a missing entry is a hard configuration error,
//! never a silent fallback to the base image.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::sandbox::error::SandboxError;

/// Catalog half used at provisioning time, derived from the runtime
/// mode flag: "development" reads `dev`, everything else reads `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    Main,
    Dev,
}

impl Environment {
    pub fn from_runtime_mode(mode: &str) -> Self {
        if mode.trim().eq_ignore_ascii_case("development") {
            Environment::Dev
        } else {
            Environment::Main
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Main => "main",
            Environment::Dev => "dev",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    entries: HashMap<(String, Environment), String>,
}

impl TemplateCatalog {
    /// The static table shipped with the binary.
    pub fn builtin() -> Self {
        let mut catalog = Self {
            entries: HashMap::new(),
        };
        for (name, main, dev) in [
            ("vite-react", "tmpl-vite-react-main", "tmpl-vite-react-dev"),
            ("nextjs", "tmpl-nextjs-main", "tmpl-nextjs-dev"),
            ("astro", "tmpl-astro-main", "tmpl-astro-dev"),
        ] {
            catalog.register(name, Environment::Main, main);
            catalog.register(name, Environment::Dev, dev);
        }
        catalog
    }

    /// Builtin table plus operator overrides from a YAML file. An
    /// unreadable or malformed file is logged and ignored rather than
    /// taking provisioning down with it.
    pub fn load(path: Option<&Path>) -> Self {
        let mut catalog = Self::builtin();
        let Some(path) = path else {
            return catalog;
        };
        match std::fs::read_to_string(path)
            .context("read template catalog")
            .and_then(|raw| parse_catalog_yaml(&raw))
        {
            Ok(entries) => {
                let count = entries.len();
                for entry in entries {
                    if let Some(image) = entry.main {
                        catalog.register(&entry.name, Environment::Main, image);
                    }
                    if let Some(image) = entry.dev {
                        catalog.register(&entry.name, Environment::Dev, image);
                    }
                }
                tracing::info!(count, path = %path.display(), "loaded template catalog overrides");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring template catalog file");
            }
        }
        catalog
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        env: Environment,
        image: impl Into<String>,
    ) {
        self.entries.insert((name.into(), env), image.into());
    }

    pub fn lookup(&self, template: &str, env: Environment) -> Option<&str> {
        self.entries
            .get(&(template.to_string(), env))
            .map(String::as_str)
    }

    /// Resolve or fail fast. Callers asked for a specific stack; booting
    /// an unconfigured base image instead would hand them a wrong one.
    pub fn require(&self, template: &str, env: Environment) -> Result<&str, SandboxError> {
        self.lookup(template, env).ok_or_else(|| {
            SandboxError::Config(format!(
                "template {template} has no image for environment {env}"
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct CatalogYaml {
    #[serde(default)]
    templates: Vec<TemplateEntryYaml>,
}

#[derive(Debug, Deserialize)]
struct TemplateEntryYaml {
    name: String,
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    dev: Option<String>,
}

fn parse_catalog_yaml(raw: &str) -> Result<Vec<TemplateEntryYaml>> {
    let doc: CatalogYaml = serde_yaml::from_str(raw).context("parse template catalog YAML")?;
    Ok(doc.templates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn environment_from_runtime_mode() {
        assert_eq!(Environment::from_runtime_mode("development"), Environment::Dev);
        assert_eq!(Environment::from_runtime_mode("Development"), Environment::Dev);
        assert_eq!(Environment::from_runtime_mode("production"), Environment::Main);
        assert_eq!(Environment::from_runtime_mode("staging"), Environment::Main);
        assert_eq!(Environment::from_runtime_mode(""), Environment::Main);
    }

    #[test]
    fn builtin_resolves_per_environment() {
        let catalog = TemplateCatalog::builtin();
        assert_eq!(
            catalog.lookup("vite-react", Environment::Main),
            Some("tmpl-vite-react-main")
        );
        assert_eq!(
            catalog.lookup("vite-react", Environment::Dev),
            Some("tmpl-vite-react-dev")
        );
    }

    #[test]
    fn missing_template_is_a_config_error() {
        let catalog = TemplateCatalog::builtin();
        let err = catalog.require("svelte", Environment::Main).unwrap_err();
        match err {
            SandboxError::Config(msg) => {
                assert!(msg.contains("svelte"));
                assert!(msg.contains("main"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn yaml_overrides_builtin_entries() {
        let yaml = r#"
templates:
  - name: vite-react
    main: tmpl-vite-react-main-v9
  - name: solid
    main: tmpl-solid-main
    dev: tmpl-solid-dev
"#;
        let entries = parse_catalog_yaml(yaml).unwrap();
        let mut catalog = TemplateCatalog::builtin();
        for entry in entries {
            if let Some(image) = entry.main {
                catalog.register(&entry.name, Environment::Main, image);
            }
            if let Some(image) = entry.dev {
                catalog.register(&entry.name, Environment::Dev, image);
            }
        }

        assert_eq!(
            catalog.lookup("vite-react", Environment::Main),
            Some("tmpl-vite-react-main-v9")
        );
        // Untouched env keeps the builtin image.
        assert_eq!(
            catalog.lookup("vite-react", Environment::Dev),
            Some("tmpl-vite-react-dev")
        );
        assert_eq!(catalog.lookup("solid", Environment::Dev), Some("tmpl-solid-dev"));
    }

    #[test]
    fn malformed_catalog_file_keeps_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "templates: {{ not valid").unwrap();

        let catalog = TemplateCatalog::load(Some(&path));
        assert_eq!(
            catalog.lookup("nextjs", Environment::Main),
            Some("tmpl-nextjs-main")
        );
    }

    #[test]
    fn missing_catalog_path_keeps_builtin() {
        let catalog = TemplateCatalog::load(None);
        assert!(catalog.lookup("astro", Environment::Main).is_some());
    }
}
