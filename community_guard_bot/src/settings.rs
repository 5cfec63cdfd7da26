//! Per-community moderation settings: a plain configuration record with
//! independent feature toggles. Stored in the database as one JSON blob
//! per community and deserialized into these typed structs, with every
//! field defaulted so old rows survive new fields.

use serde::{Deserialize, Serialize};

use crate::types::{ModAction, WordFilterAction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BannedWordsSettings {
    pub enabled: bool,
    pub words: Vec<String>,
    pub action: WordFilterAction,
    pub warnings_before_punish: u32,
}

impl Default for BannedWordsSettings {
    fn default() -> Self {
        BannedWordsSettings {
            enabled: false,
            words: Vec::new(),
            action: WordFilterAction::Warn,
            warnings_before_punish: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiSpamSettings {
    pub enabled: bool,
    pub max_messages: u32,
    /// Seconds.
    pub time_window: u32,
    pub action: ModAction,
    /// Seconds.
    pub mute_duration: u32,
}

impl Default for AntiSpamSettings {
    fn default() -> Self {
        AntiSpamSettings {
            enabled: true,
            max_messages: 5,
            time_window: 10,
            action: ModAction::Mute,
            mute_duration: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiFloodSettings {
    pub enabled: bool,
    pub max_repeats: u32,
    pub action: ModAction,
}

impl Default for AntiFloodSettings {
    fn default() -> Self {
        AntiFloodSettings {
            enabled: true,
            max_repeats: 3,
            action: ModAction::Mute,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaRestrictions {
    pub enabled: bool,
    pub block_photos: bool,
    pub block_videos: bool,
    pub block_stickers: bool,
    pub block_gifs: bool,
    pub block_documents: bool,
    pub block_links: bool,
}

impl Default for MediaRestrictions {
    fn default() -> Self {
        MediaRestrictions {
            enabled: false,
            block_photos: false,
            block_videos: false,
            block_stickers: false,
            block_gifs: false,
            block_documents: false,
            block_links: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiJoinSettings {
    pub enabled: bool,
    /// How many distinct groups within the window count as a violation.
    pub max_groups_in_time: u32,
    /// Seconds.
    pub time_window: u32,
    pub action: ModAction,
    pub auto_report: bool,
}

impl Default for MultiJoinSettings {
    fn default() -> Self {
        MultiJoinSettings {
            enabled: true,
            max_groups_in_time: 5,
            time_window: 3600,
            action: ModAction::Report,
            auto_report: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarningSystemSettings {
    pub enabled: bool,
    pub max_warnings: u32,
    /// Seconds after which a warning stops counting.
    pub warning_expiry: u32,
    pub action_on_max: ModAction,
}

impl Default for WarningSystemSettings {
    fn default() -> Self {
        WarningSystemSettings {
            enabled: true,
            max_warnings: 3,
            warning_expiry: 86400 * 7,
            action_on_max: ModAction::Ban,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoDeleteSettings {
    pub enabled: bool,
    /// Seconds.
    pub delete_after: u32,
    pub exclude_admins: bool,
    /// If non-empty, only these users' messages get queued.
    pub specific_users: Vec<u64>,
}

impl Default for AutoDeleteSettings {
    fn default() -> Self {
        AutoDeleteSettings {
            enabled: false,
            delete_after: 86400,
            exclude_admins: true,
            specific_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub enabled: bool,
    /// Where alerts go: a `@channelusername` or a numeric chat ID.
    /// Empty means nowhere.
    pub report_channel: String,
    pub auto_report_spam: bool,
    pub auto_report_banned_words: bool,
}

impl Default for ReportSettings {
    fn default() -> Self {
        ReportSettings {
            enabled: true,
            report_channel: String::new(),
            auto_report_spam: true,
            auto_report_banned_words: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewUserRestrictions {
    pub enabled: bool,
    /// Seconds.
    pub restrict_duration: u32,
    pub can_send_messages: bool,
    pub can_send_media: bool,
    pub can_send_stickers: bool,
    pub can_send_polls: bool,
}

impl Default for NewUserRestrictions {
    fn default() -> Self {
        NewUserRestrictions {
            enabled: false,
            restrict_duration: 3600,
            can_send_messages: true,
            can_send_media: false,
            can_send_stickers: false,
            can_send_polls: false,
        }
    }
}

/// The whole per-community configuration record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationSettings {
    pub banned_words: BannedWordsSettings,
    pub anti_spam: AntiSpamSettings,
    pub anti_flood: AntiFloodSettings,
    pub media_restrictions: MediaRestrictions,
    pub multi_join: MultiJoinSettings,
    pub warning_system: WarningSystemSettings,
    pub auto_delete: AutoDeleteSettings,
    pub report_settings: ReportSettings,
    pub new_user_restrictions: NewUserRestrictions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ones() {
        let settings = ModerationSettings::default();
        assert!(!settings.banned_words.enabled);
        assert!(settings.anti_spam.enabled);
        assert_eq!(settings.anti_spam.max_messages, 5);
        assert!(settings.multi_join.enabled);
        assert_eq!(settings.multi_join.max_groups_in_time, 5);
        assert_eq!(settings.multi_join.time_window, 3600);
        assert_eq!(settings.multi_join.action, ModAction::Report);
        assert!(settings.multi_join.auto_report);
        assert_eq!(settings.warning_system.max_warnings, 3);
        assert_eq!(settings.warning_system.action_on_max, ModAction::Ban);
        assert!(settings.report_settings.report_channel.is_empty());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        // A row written before most toggles existed.
        let settings: ModerationSettings =
            serde_json::from_str(r#"{"multi_join":{"max_groups_in_time":3,"action":"kick"}}"#)
                .unwrap();
        assert_eq!(settings.multi_join.max_groups_in_time, 3);
        assert_eq!(settings.multi_join.action, ModAction::Kick);
        // Untouched sections and fields come out as defaults.
        assert_eq!(settings.multi_join.time_window, 3600);
        assert!(settings.anti_spam.enabled);
        assert_eq!(settings.banned_words.warnings_before_punish, 3);
    }
}
