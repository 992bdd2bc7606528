//! Normalized view of who sits in a watched voice channel.
//!
//! A [`PresenceSnapshot`] is rebuilt from scratch on every presence event and
//! compared against the previous one. Equality only looks at member ids and
//! audio flags; names and ordering are for rendering.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use teloxide::utils::html;

/// Raw channel state as handed over by the guild platform adapter.
///
/// Every field the platform may fail to provide is optional.
#[derive(Debug, Clone, Default)]
pub struct RawChannelState {
    pub channel_id: u64,
    pub channel_name: Option<String>,
    pub channel_type: Option<String>,
    pub guild_id: Option<u64>,
    pub guild_name: Option<String>,
    pub members: Vec<RawMember>,
}

/// Raw voice state of one member.
#[derive(Debug, Clone, Default)]
pub struct RawMember {
    pub user_id: u64,
    pub member_id: Option<u64>,
    pub user_name: Option<String>,
    pub display_name: Option<String>,
    pub self_mute: Option<bool>,
    pub self_deaf: Option<bool>,
    pub server_mute: Option<bool>,
    pub server_deaf: Option<bool>,
    pub streaming: Option<bool>,
}

/// mute, deaf, stream, server mute, server deaf
type Flags = (bool, bool, bool, bool, bool);

/// One member of a watched channel and their audio state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPresence {
    pub user_id: u64,
    #[serde(default)]
    pub user_name: String,
    pub member_id: u64,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub server_muted: bool,
    #[serde(default)]
    pub server_deafened: bool,
}

impl MemberPresence {
    fn flags(&self) -> Flags {
        (
            self.muted,
            self.deafened,
            self.streaming,
            self.server_muted,
            self.server_deafened,
        )
    }

    fn status_glyphs(&self) -> String {
        let mut glyphs = String::new();
        if self.muted || self.server_muted {
            glyphs.push_str(" 🔇");
        }
        if self.deafened || self.server_deafened {
            glyphs.push_str(" 🙉");
        }
        if self.streaming {
            glyphs.push_str(" 🔴");
        }
        glyphs
    }
}

/// Snapshot of a watched channel at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub channel_id: u64,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub channel_url: String,
    #[serde(default)]
    pub channel_type: String,
    #[serde(default)]
    pub guild_id: u64,
    #[serde(default)]
    pub guild_name: String,
    #[serde(default)]
    pub members: Vec<MemberPresence>,
}

impl PresenceSnapshot {
    /// Build a snapshot from raw platform state. Never fails.
    pub fn build(raw: &RawChannelState) -> Self {
        let guild_id = raw.guild_id.unwrap_or_default();

        let mut seen = HashSet::new();
        let mut members: Vec<MemberPresence> = raw
            .members
            .iter()
            .map(|m| MemberPresence {
                user_id: m.user_id,
                user_name: m
                    .display_name
                    .clone()
                    .or_else(|| m.user_name.clone())
                    .unwrap_or_else(|| m.user_id.to_string()),
                member_id: m.member_id.unwrap_or(m.user_id),
                muted: m.self_mute.unwrap_or(false),
                deafened: m.self_deaf.unwrap_or(false),
                streaming: m.streaming.unwrap_or(false),
                server_muted: m.server_mute.unwrap_or(false),
                server_deafened: m.server_deaf.unwrap_or(false),
            })
            .filter(|m| seen.insert(m.member_id))
            .collect();
        members.sort_by(|a, b| {
            a.user_name
                .to_lowercase()
                .cmp(&b.user_name.to_lowercase())
                .then(a.member_id.cmp(&b.member_id))
        });

        let channel_url = if guild_id != 0 {
            format!("https://discord.com/channels/{}/{}", guild_id, raw.channel_id)
        } else {
            String::new()
        };

        Self {
            channel_id: raw.channel_id,
            channel_name: raw
                .channel_name
                .clone()
                .unwrap_or_else(|| raw.channel_id.to_string()),
            channel_url,
            channel_type: raw.channel_type.clone().unwrap_or_default(),
            guild_id,
            guild_name: raw.guild_name.clone().unwrap_or_default(),
            members,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Render the notification text (Telegram HTML).
    pub fn render(&self) -> String {
        let name = html::escape(&self.channel_name);
        let header = if self.channel_url.is_empty() {
            format!("🔊 <b>{}</b>", name)
        } else {
            format!("🔊 <a href=\"{}\">{}</a>", self.channel_url, name)
        };

        let mut text = header;
        for member in &self.members {
            text.push('\n');
            text.push_str(&html::escape(&member.user_name));
            text.push_str(&member.status_glyphs());
        }
        text
    }
}

impl PartialEq for PresenceSnapshot {
    fn eq(&self, other: &Self) -> bool {
        fn by_member(members: &[MemberPresence]) -> HashMap<u64, Flags> {
            members.iter().map(|m| (m.member_id, m.flags())).collect()
        }
        self.members.len() == other.members.len()
            && by_member(&self.members) == by_member(&other.members)
    }
}

impl Eq for PresenceSnapshot {}

#[cfg(test)]
pub(crate) fn member(id: u64, name: &str) -> RawMember {
    RawMember {
        user_id: id,
        user_name: Some(name.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) fn channel(members: Vec<RawMember>) -> RawChannelState {
    RawChannelState {
        channel_id: 42,
        channel_name: Some("General".to_string()),
        channel_type: Some("Voice".to_string()),
        guild_id: Some(7),
        guild_name: Some("Guild".to_string()),
        members,
    }
}
