use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toolrig_host::{Backoff, HealerSettings, ResourceRef, RetryPolicy, RuntimeSettings};

/// Config file looked up under the workspace root when none is given.
pub const CONFIG_FILE_NAME: &str = "toolrig.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("image reference is not pinned: '{0}' (use an explicit tag other than 'latest' or an @sha256 digest)")]
    UnpinnedImage(String),
    #[error("invalid image reference '{0}'")]
    InvalidImage(String),
    #[error("{0}")]
    Invalid(String),
}

/// Container image reference that names exactly one image build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Accepts `repo:tag`, `repo@sha256:<hex>` and `repo:tag@sha256:<hex>`.
    /// A missing tag or `latest` without a digest is rejected.
    pub fn parse(reference: &str) -> Result<Self, ConfigError> {
        let reference = reference.trim();
        if reference.is_empty() || reference.contains(char::is_whitespace) {
            return Err(ConfigError::InvalidImage(reference.to_owned()));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let hex = digest
                    .strip_prefix("sha256:")
                    .ok_or_else(|| ConfigError::InvalidImage(reference.to_owned()))?;
                if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ConfigError::InvalidImage(reference.to_owned()));
                }
                (name, Some(digest.to_owned()))
            }
            None => (reference, None),
        };

        // A colon before the last '/' is a registry port, not a tag.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_owned()))
            }
            None => (name, None),
        };
        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(ConfigError::InvalidImage(reference.to_owned()));
        }

        let pinned_tag = tag.as_deref().is_some_and(|t| t != "latest");
        if digest.is_none() && !pinned_tag {
            return Err(ConfigError::UnpinnedImage(reference.to_owned()));
        }

        Ok(Self {
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepoSection {
    pub url: String,
    pub revision: Option<String>,
    /// Paths a completed fetch must contain, relative to the repository.
    pub required_paths: Vec<String>,
    pub allow_shallow: bool,
}

impl Default for RepoSection {
    fn default() -> Self {
        Self {
            url: "https://github.com/The-OpenROAD-Project/OpenLane.git".to_owned(),
            revision: None,
            required_paths: vec!["Makefile".to_owned(), "flow.tcl".to_owned()],
            allow_shallow: true,
        }
    }
}

impl RepoSection {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.url.clone(), self.revision.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub fetch: RetryPolicy,
    pub lock: RetryPolicy,
    pub image: RetryPolicy,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            fetch: RetryPolicy::new(
                3,
                Backoff::Exponential {
                    initial_ms: 2_000,
                    max_ms: 30_000,
                },
            )
            .with_timeout_secs(600),
            lock: RetryPolicy::new(u32::MAX, Backoff::Fixed { delay_ms: 1_000 })
                .with_timeout_secs(300),
            image: RetryPolicy::new(
                3,
                Backoff::Linear {
                    initial_ms: 5_000,
                    step_ms: 5_000,
                },
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackagesSection {
    pub lock_paths: Vec<String>,
    /// Best-effort host packages; failure to install them degrades the run.
    pub auxiliary: Vec<String>,
    pub bad_mirror_hosts: Vec<String>,
    pub fallback_mirror: String,
    pub retired_repos: Vec<String>,
}

impl Default for PackagesSection {
    fn default() -> Self {
        let healer = HealerSettings::default();
        Self {
            lock_paths: vec![
                "/var/lib/dpkg/lock-frontend".to_owned(),
                "/var/lib/dpkg/lock".to_owned(),
                "/var/lib/apt/lists/lock".to_owned(),
            ],
            auxiliary: ["git", "make", "python3", "python3-venv", "psmisc"]
                .map(str::to_owned)
                .to_vec(),
            bad_mirror_hosts: healer.bad_mirror_hosts,
            fallback_mirror: healer.fallback_mirror,
            retired_repos: healer.retired_repos,
        }
    }
}

impl PackagesSection {
    pub fn healer_settings(&self) -> HealerSettings {
        HealerSettings {
            bad_mirror_hosts: self.bad_mirror_hosts.clone(),
            fallback_mirror: self.fallback_mirror.clone(),
            retired_repos: self.retired_repos.clone(),
        }
    }
}

/// The downstream tool. Command templates expand `{design}`, `{tag}`,
/// `{pdk}` and `{pdk_root}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolSection {
    /// Where the runtime repository is mounted inside the container.
    pub mount_point: String,
    pub pdk: String,
    /// Defaults to `<workspace_root>/pdks`.
    pub pdk_root: Option<String>,
    pub smoke_test_design: String,
    pub run_tag: String,
    pub flow_command: Vec<String>,
    pub init_command: Vec<String>,
    pub interactive_command: Vec<String>,
    /// Run on the host inside the runtime repository.
    pub pdk_install_command: Vec<String>,
    /// Relative to the runtime repository.
    pub result_artifact: String,
    /// Any one of these marks a valid design area.
    pub design_markers: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

impl Default for ToolSection {
    fn default() -> Self {
        Self {
            mount_point: "/openlane".to_owned(),
            pdk: "sky130A".to_owned(),
            pdk_root: None,
            smoke_test_design: "spm".to_owned(),
            run_tag: "toolrig".to_owned(),
            flow_command: words(&["./flow.tcl", "-design", "{design}", "-tag", "{tag}", "-overwrite"]),
            init_command: words(&["./flow.tcl", "-design", "{design}", "-init_design_config", "-add_to_designs"]),
            interactive_command: words(&["./flow.tcl", "-interactive"]),
            pdk_install_command: words(&["make", "pdk"]),
            result_artifact: "designs/{design}/runs/{tag}/reports/metrics.csv".to_owned(),
            design_markers: words(&["config.json", "config.tcl"]),
        }
    }
}

impl ToolSection {
    /// Substitute template variables in each word.
    pub fn expand(&self, template: &[String], design: &str, pdk_root: &Path) -> Vec<String> {
        template
            .iter()
            .map(|word| self.expand_one(word, design, pdk_root))
            .collect()
    }

    pub fn expand_one(&self, word: &str, design: &str, pdk_root: &Path) -> String {
        word.replace("{design}", design)
            .replace("{tag}", &self.run_tag)
            .replace("{pdk}", &self.pdk)
            .replace("{pdk_root}", &pdk_root.to_string_lossy())
    }
}

/// Everything that parameterises one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Pinned toolchain image.
    pub image: String,
    /// Runtime repository directory under the workspace root.
    pub runtime_repo_dir: String,
    pub repo: RepoSection,
    pub retry: RetrySection,
    pub packages: PackagesSection,
    pub runtime: RuntimeSettings,
    pub tool: ToolSection,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            image: "efabless/openlane:2023.07.19".to_owned(),
            runtime_repo_dir: "OpenLane".to_owned(),
            repo: RepoSection::default(),
            retry: RetrySection::default(),
            packages: PackagesSection::default(),
            runtime: RuntimeSettings::default(),
            tool: ToolSection::default(),
        }
    }
}

impl ProvisionConfig {
    pub fn from_toml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_owned(),
            source,
        })
    }

    /// Read `explicit` if given (it must exist), otherwise
    /// `<workspace_root>/toolrig.toml` when present, otherwise defaults.
    pub fn load(explicit: Option<&Path>, workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => {
                let candidate = workspace_root.join(CONFIG_FILE_NAME);
                if !candidate.is_file() {
                    return Ok(Self::default());
                }
                candidate
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Apply `CONTAINER_IMAGE`, `PDK_ROOT` and `PDK` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(image) = lookup("CONTAINER_IMAGE").filter(|v| !v.is_empty()) {
            self.image = image;
        }
        if let Some(root) = lookup("PDK_ROOT").filter(|v| !v.is_empty()) {
            self.tool.pdk_root = Some(root);
        }
        if let Some(pdk) = lookup("PDK").filter(|v| !v.is_empty()) {
            self.tool.pdk = pdk;
        }
    }

    /// Checks that must pass before any stage runs.
    pub fn validate(&self) -> Result<ImageRef, ConfigError> {
        let image = ImageRef::parse(&self.image)?;
        if self.runtime_repo_dir.is_empty()
            || self.runtime_repo_dir.contains('/')
            || self.runtime_repo_dir.starts_with('.')
        {
            return Err(ConfigError::Invalid(format!(
                "runtime_repo_dir must be a plain directory name, got '{}'",
                self.runtime_repo_dir
            )));
        }
        for (name, policy) in [
            ("fetch", &self.retry.fetch),
            ("lock", &self.retry.lock),
            ("image", &self.retry.image),
        ] {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retry.{name}.max_attempts must be at least 1"
                )));
            }
        }
        if self.tool.flow_command.is_empty() || self.tool.pdk_install_command.is_empty() {
            return Err(ConfigError::Invalid(
                "tool.flow_command and tool.pdk_install_command must not be empty".to_owned(),
            ));
        }
        Ok(image)
    }

    pub fn pdk_root(&self, workspace_root: &Path) -> PathBuf {
        self.tool
            .pdk_root
            .as_ref()
            .map_or_else(|| workspace_root.join("pdks"), PathBuf::from)
    }
}

/// `~/toolrig`.
pub fn default_workspace_root() -> Result<PathBuf, ConfigError> {
    let home = std::env::var("HOME")
        .map_err(|_| ConfigError::Invalid("HOME not set; pass --workspace".to_owned()))?;
    Ok(PathBuf::from(home).join("toolrig"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn default_config_validates() {
        let image = ProvisionConfig::default().validate().unwrap();
        assert_eq!(image.tag.as_deref(), Some("2023.07.19"));
    }

    #[test]
    fn image_pinning_rules() {
        assert!(ImageRef::parse("efabless/openlane:2023.07.19").is_ok());
        assert!(ImageRef::parse(&format!("efabless/openlane@{DIGEST}")).is_ok());
        assert!(ImageRef::parse(&format!("efabless/openlane:latest@{DIGEST}")).is_ok());
        assert!(matches!(
            ImageRef::parse("efabless/openlane"),
            Err(ConfigError::UnpinnedImage(_))
        ));
        assert!(matches!(
            ImageRef::parse("efabless/openlane:latest"),
            Err(ConfigError::UnpinnedImage(_))
        ));
        assert!(matches!(
            ImageRef::parse("efabless/openlane@sha256:abc"),
            Err(ConfigError::InvalidImage(_))
        ));
        assert!(matches!(ImageRef::parse(""), Err(ConfigError::InvalidImage(_))));
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        assert!(matches!(
            ImageRef::parse("registry.local:5000/openlane"),
            Err(ConfigError::UnpinnedImage(_))
        ));
        let image = ImageRef::parse("registry.local:5000/openlane:1.0").unwrap();
        assert_eq!(image.repository, "registry.local:5000/openlane");
        assert_eq!(image.to_string(), "registry.local:5000/openlane:1.0");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ProvisionConfig::from_toml(
            r#"
            image = "efabless/openlane:2024.01.01"

            [repo]
            allow_shallow = false

            [retry.fetch]
            max_attempts = 5
            backoff = { kind = "fixed", delay_ms = 100 }
            "#,
            "test",
        )
        .unwrap();
        assert_eq!(config.image, "efabless/openlane:2024.01.01");
        assert!(!config.repo.allow_shallow);
        assert_eq!(config.repo.required_paths, RepoSection::default().required_paths);
        assert_eq!(config.retry.fetch.max_attempts, 5);
        assert_eq!(config.retry.lock, RetrySection::default().lock);
        assert_eq!(config.runtime.probe_image, "hello-world");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ProvisionConfig::from_toml("imgae = \"x:1\"", "toolrig.toml").unwrap_err();
        assert!(err.to_string().contains("toolrig.toml"));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = ProvisionConfig::default();
        config.apply_env(|key| match key {
            "CONTAINER_IMAGE" => Some("efabless/openlane:2022.11.19".to_owned()),
            "PDK_ROOT" => Some("/opt/pdks".to_owned()),
            "PDK" => Some("gf180mcuC".to_owned()),
            _ => None,
        });
        assert_eq!(config.image, "efabless/openlane:2022.11.19");
        assert_eq!(config.pdk_root(Path::new("/w")), PathBuf::from("/opt/pdks"));
        assert_eq!(config.tool.pdk, "gf180mcuC");
    }

    #[test]
    fn unpinned_env_image_fails_validation() {
        let mut config = ProvisionConfig::default();
        config.apply_env(|key| (key == "CONTAINER_IMAGE").then(|| "efabless/openlane:latest".to_owned()));
        assert!(matches!(config.validate(), Err(ConfigError::UnpinnedImage(_))));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProvisionConfig::load(Some(&dir.path().join("nope.toml")), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_reads_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "runtime_repo_dir = \"OL2\"\n").unwrap();
        let config = ProvisionConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.runtime_repo_dir, "OL2");
        let defaults = ProvisionConfig::load(None, &dir.path().join("empty")).unwrap();
        assert_eq!(defaults, ProvisionConfig::default());
    }

    #[test]
    fn templates_expand() {
        let tool = ToolSection::default();
        let words = tool.expand(&tool.flow_command, "spm", Path::new("/pdks"));
        assert_eq!(words.join(" "), "./flow.tcl -design spm -tag toolrig -overwrite");
        assert_eq!(
            tool.expand_one(&tool.result_artifact, "spm", Path::new("/pdks")),
            "designs/spm/runs/toolrig/reports/metrics.csv"
        );
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = ProvisionConfig::default();
        config.retry.image.max_attempts = 0;
        assert!(config.validate().unwrap_err().to_string().contains("retry.image"));
    }
}
