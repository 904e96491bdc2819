use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A group of posted time received from the platform. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRecord {
    #[serde(rename = "groupId")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_key: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<PostedTag>,
    pub user: Author,
    #[serde(default)]
    pub time_rows: Vec<TimeRow>,
    pub total_duration_secs: u64,
    #[serde(default)]
    pub duration_split_strategy: DurationSplitStrategy,
    #[serde(default = "Utc::now")]
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedTag {
    pub name: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default = "full_weighting")]
    pub experience_weighting_percent: u32,
}

fn full_weighting() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRow {
    /// Hour of activity formatted as `yyyyMMddHH`, e.g. `2018110109`.
    pub activity_hour: u32,
    #[serde(default)]
    pub activity: String,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DurationSplitStrategy {
    #[default]
    DivideBetweenTags,
    WholeDurationToEachTag,
}

impl TimeRecord {
    /// Seconds to post against each tag, after the author's experience weighting.
    pub fn per_tag_duration_secs(&self) -> u64 {
        if self.tags.is_empty() {
            return 0;
        }
        let weighted =
            self.total_duration_secs as f64 * self.user.experience_weighting_percent as f64 / 100.0;
        let per_tag = match self.duration_split_strategy {
            DurationSplitStrategy::WholeDurationToEachTag => weighted,
            DurationSplitStrategy::DivideBetweenTags => weighted / self.tags.len() as f64,
        };
        per_tag.round() as u64
    }

    /// Start of the earliest activity hour, or `None` when there are no time rows.
    pub fn activity_start(&self) -> Option<DateTime<Utc>> {
        self.time_rows
            .iter()
            .map(|row| row.activity_hour)
            .min()
            .and_then(parse_activity_hour)
    }
}

fn parse_activity_hour(hour: u32) -> Option<DateTime<Utc>> {
    let year = (hour / 1_000_000) as i32;
    let month = (hour / 10_000) % 100;
    let day = (hour / 100) % 100;
    let h = hour % 100;
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(h, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}


#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn no_tags_means_no_duration() {
        let r = record("r1", &[], 600, "");
        assert_eq!(r.per_tag_duration_secs(), 0);
    }

    #[test]
    fn zero_experience_weighting_gives_zero() {
        let mut r = record("r1", &["PROJ-1"], 600, "");
        r.user.experience_weighting_percent = 0;
        assert_eq!(r.per_tag_duration_secs(), 0);
    }

    #[test]
    fn divides_weighted_duration_between_tags() {
        let mut r = record("r1", &["PROJ-1", "PROJ-2"], 1000, "");
        r.user.experience_weighting_percent = 50;
        r.duration_split_strategy = DurationSplitStrategy::DivideBetweenTags;
        assert_eq!(r.per_tag_duration_secs(), 250);
    }

    #[test]
    fn whole_duration_goes_to_each_tag() {
        let mut r = record("r1", &["PROJ-1", "PROJ-2"], 1000, "");
        r.user.experience_weighting_percent = 10;
        assert_eq!(r.per_tag_duration_secs(), 100);
    }

    #[test]
    fn activity_start_is_earliest_row() {
        let mut r = record("r1", &["PROJ-1"], 600, "");
        r.time_rows.push(TimeRow {
            activity_hour: 2018110107,
            activity: "Browser".into(),
            duration_secs: 60,
        });
        assert_eq!(
            r.activity_start(),
            Some(Utc.with_ymd_and_hms(2018, 11, 1, 7, 0, 0).unwrap())
        );
    }

    #[test]
    fn no_rows_means_no_start() {
        let mut r = record("r1", &["PROJ-1"], 600, "");
        r.time_rows.clear();
        assert_eq!(r.activity_start(), None);
    }

    #[test]
    fn deserializes_platform_payload() {
        let json = r#"{
            "groupId": "g-1",
            "callerKey": "secret",
            "description": "fixed bug",
            "tags": [{"name": "PROJ-42", "path": "/Jira/PROJ-42"}],
            "user": {"name": "Bob", "email": "bob@example.com"},
            "timeRows": [{"activityHour": 2019010214, "activity": "IDE", "durationSecs": 5400}],
            "totalDurationSecs": 5400,
            "durationSplitStrategy": "WHOLE_DURATION_TO_EACH_TAG"
        }"#;
        let r: TimeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.id, "g-1");
        assert_eq!(r.user.experience_weighting_percent, 100);
        assert_eq!(r.duration_split_strategy, DurationSplitStrategy::WholeDurationToEachTag);
        assert_eq!(r.per_tag_duration_secs(), 5400);
    }
}
