use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::issue::Issue;

/// A platform tag derived from a tracker issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Tag name, which is also the tracker issue key and the platform tag id.
    pub name: String,
    pub path: String,
    pub description: String,
    #[serde(default)]
    pub additional_keywords: Vec<String>,
}

impl Tag {
    pub fn from_issue(issue: &Issue, path: &str) -> Self {
        Self {
            name: issue.key.clone(),
            path: path.to_string(),
            description: issue.summary.clone(),
            additional_keywords: vec![issue.key.clone()],
        }
    }

    /// Platform-side identifier for this tag.
    pub fn id(&self) -> &str {
        &self.name
    }

    /// Hash of the attributes pushed to the platform; a change means the tag needs an update.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.path.as_bytes());
        hasher.update([0]);
        hasher.update(self.description.as_bytes());
        for keyword in &self.additional_keywords {
            hasher.update([0]);
            hasher.update(keyword.as_bytes());
        }
        format!("{:x}", hasher.finalize())[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn issue(summary: &str) -> Issue {
        Issue {
            id: "10001".into(),
            key: "PROJ-42".into(),
            project_key: "PROJ".into(),
            summary: summary.into(),
            status: Some("Open".into()),
            status_category: Some("To Do".into()),
            updated: Utc::now(),
        }
    }

    #[test]
    fn tag_carries_issue_key_as_name_and_keyword() {
        let tag = Tag::from_issue(&issue("Fix login"), "/Jira/");
        assert_eq!(tag.id(), "PROJ-42");
        assert_eq!(tag.path, "/Jira/");
        assert_eq!(tag.description, "Fix login");
        assert_eq!(tag.additional_keywords, vec!["PROJ-42".to_string()]);
    }

    #[test]
    fn fingerprint_tracks_summary_changes() {
        let a = Tag::from_issue(&issue("Fix login"), "/Jira/");
        let b = Tag::from_issue(&issue("Fix login"), "/Jira/");
        let c = Tag::from_issue(&issue("Fix logout"), "/Jira/");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn serializes_in_platform_casing() {
        let tag = Tag::from_issue(&issue("Fix login"), "/Jira/");
        let json = serde_json::to_string(&tag).unwrap();
        assert!(json.contains("additionalKeywords"));
    }
}
