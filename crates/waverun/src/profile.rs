use std::path::Path;

use serde::{Deserialize, Serialize};

/// Data-only description of one cluster site.
///
/// Sites differ in node size, partition names and extra scheduler directives;
/// everything else is handled by the shared orchestrator. Profiles are loaded
/// from TOML files and never carry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteProfile {
    pub name: String,
    /// Cores available on one node of this site.
    pub cores_per_node: u32,
    /// Low-latency partition used for arrays whose tasks span at most
    /// `small_max_nodes` nodes.
    #[serde(default)]
    pub small_partition: Option<String>,
    /// Partition used for everything larger.
    #[serde(default)]
    pub general_partition: Option<String>,
    /// Largest nodes-per-task still routed to `small_partition`.
    #[serde(default = "default_small_max_nodes")]
    pub small_max_nodes: u32,
    /// Extra directives appended verbatim to every submission script.
    #[serde(default)]
    pub sbatch_args: Vec<String>,
}

fn default_small_max_nodes() -> u32 {
    2
}

impl SiteProfile {
    pub fn from_file(path: &Path) -> crate::Result<SiteProfile> {
        let raw = std::fs::read_to_string(path)?;
        let profile: SiteProfile = toml::from_str(&raw)?;
        Ok(profile)
    }

    /// Profile used when no site file is given: 24-core nodes, scheduler
    /// default partition.
    pub fn generic() -> SiteProfile {
        SiteProfile {
            name: "generic".to_string(),
            cores_per_node: 24,
            small_partition: None,
            general_partition: None,
            small_max_nodes: default_small_max_nodes(),
            sbatch_args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SiteProfile;

    #[test]
    fn parse_full_profile() {
        let profile: SiteProfile = toml::from_str(
            r#"
            name = "chinook"
            cores_per_node = 24
            small_partition = "t1small"
            general_partition = "t1standard"
            small_max_nodes = 2
            sbatch_args = ["--account=geophys"]
            "#,
        )
        .unwrap();
        assert_eq!(profile.cores_per_node, 24);
        assert_eq!(profile.small_partition.as_deref(), Some("t1small"));
        assert_eq!(profile.sbatch_args, vec!["--account=geophys"]);
    }

    #[test]
    fn partitions_and_args_are_optional() {
        let profile: SiteProfile = toml::from_str(
            r#"
            name = "tiger"
            cores_per_node = 16
            "#,
        )
        .unwrap();
        assert!(profile.small_partition.is_none());
        assert!(profile.general_partition.is_none());
        assert_eq!(profile.small_max_nodes, 2);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(
            toml::from_str::<SiteProfile>(
                r#"
                name = "typo"
                cores_per_node = 16
                small_partiton = "t1small"
                "#,
            )
            .is_err()
        );
    }
}
