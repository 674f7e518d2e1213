use serde::{Deserialize, Serialize};

/// What a node can run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCapabilities {
    /// Browser engines installed on the node (e.g. "chromium", "firefox").
    pub browsers: Vec<String>,
    pub os: String,
    pub memory_mb: u64,
    pub cores: usize,
    pub tags: Vec<String>,
}

impl NodeCapabilities {
    /// Ranking used by capability-match selection.
    pub fn hardware_score(&self) -> u64 {
        self.memory_mb + self.cores as u64 * 1000
    }
}

/// What a task needs from the node that runs it. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirements {
    /// Every listed browser must be present.
    pub browsers: Vec<String>,
    /// Allowed operating systems.
    pub os: Vec<String>,
    pub min_memory_mb: Option<u64>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
}

impl TaskRequirements {
    pub fn is_empty(&self) -> bool {
        self.browsers.is_empty()
            && self.os.is_empty()
            && self.min_memory_mb.is_none()
            && self.tags.is_empty()
    }

    pub fn is_satisfied_by(&self, caps: &NodeCapabilities) -> bool {
        let browsers = self.browsers.iter().all(|b| caps.browsers.contains(b));
        let os = self.os.is_empty() || self.os.contains(&caps.os);
        let memory = self.min_memory_mb.map_or(true, |min| caps.memory_mb >= min);
        let tags = self.tags.iter().all(|t| caps.tags.contains(t));
        browsers && os && memory && tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_chromium() -> NodeCapabilities {
        NodeCapabilities {
            browsers: vec!["chromium".into(), "firefox".into()],
            os: "linux".into(),
            memory_mb: 8192,
            cores: 4,
            tags: vec!["gpu".into()],
        }
    }

    #[test]
    fn empty_requirements_match_anything() {
        let req = TaskRequirements::default();
        assert!(req.is_empty());
        assert!(req.is_satisfied_by(&NodeCapabilities::default()));
        assert!(req.is_satisfied_by(&linux_chromium()));
    }

    #[test]
    fn every_requested_browser_must_be_present() {
        let mut req = TaskRequirements {
            browsers: vec!["chromium".into()],
            ..Default::default()
        };
        assert!(req.is_satisfied_by(&linux_chromium()));

        req.browsers.push("webkit".into());
        assert!(!req.is_satisfied_by(&linux_chromium()));
    }

    #[test]
    fn os_must_be_in_allowed_set() {
        let req = TaskRequirements {
            os: vec!["macos".into(), "windows".into()],
            ..Default::default()
        };
        assert!(!req.is_satisfied_by(&linux_chromium()));

        let req = TaskRequirements {
            os: vec!["macos".into(), "linux".into()],
            ..Default::default()
        };
        assert!(req.is_satisfied_by(&linux_chromium()));
    }

    #[test]
    fn memory_and_tags_are_checked() {
        let req = TaskRequirements {
            min_memory_mb: Some(16_384),
            ..Default::default()
        };
        assert!(!req.is_satisfied_by(&linux_chromium()));

        let req = TaskRequirements {
            min_memory_mb: Some(8192),
            tags: vec!["gpu".into()],
            ..Default::default()
        };
        assert!(req.is_satisfied_by(&linux_chromium()));

        let req = TaskRequirements {
            tags: vec!["gpu".into(), "arm".into()],
            ..Default::default()
        };
        assert!(!req.is_satisfied_by(&linux_chromium()));
    }

    #[test]
    fn hardware_score_weights_cores() {
        assert_eq!(linux_chromium().hardware_score(), 8192 + 4000);
    }
}
