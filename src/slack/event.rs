//! Typed RTM frames and bootstrap snapshot payloads.
//!
//! Every inbound stream frame is a JSON object with a `type` field; it
//! parses into [`RtmEvent`], a sum type keyed on that tag. Event types the
//! gateway does not recognize map to [`RtmEvent::Unknown`] and are ignored
//! by the router.

use serde::Deserialize;

/// An inbound RTM stream event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RtmEvent {
    #[serde(rename = "presence_change")]
    PresenceChange {
        user: Option<String>,
        presence: String,
    },
    /// Presence change of the session owner, reported without a user id.
    #[serde(rename = "manual_presence_change")]
    ManualPresenceChange { presence: String },

    #[serde(rename = "im_open")]
    ImOpen { user: String, channel: String },
    #[serde(rename = "im_close")]
    ImClose { user: String, channel: String },

    #[serde(rename = "channel_joined")]
    ChannelJoined { channel: ChannelSnapshot },
    #[serde(rename = "group_joined")]
    GroupJoined { channel: ChannelSnapshot },
    #[serde(rename = "channel_left")]
    ChannelLeft { channel: String },
    #[serde(rename = "group_left")]
    GroupLeft { channel: String },
    #[serde(rename = "channel_archive")]
    ChannelArchive { channel: String },
    #[serde(rename = "group_archive")]
    GroupArchive { channel: String },

    #[serde(rename = "member_joined_channel")]
    MemberJoined { user: String, channel: String },
    #[serde(rename = "member_left_channel")]
    MemberLeft { user: String, channel: String },

    #[serde(rename = "message")]
    Message(MessageEvent),

    #[serde(rename = "pong")]
    Pong { reply_to: Option<u64> },

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    /// Anything else. Ignored.
    #[serde(other)]
    Unknown,
}

/// A `message` event. Field presence varies wildly by subtype, so
/// everything but the type tag is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEvent {
    pub channel: Option<String>,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub comment: Option<Comment>,
    pub subtype: Option<String>,
    pub text: Option<String>,
    pub ts: Option<String>,
    /// Set on `channel_topic` / `group_topic` subtypes.
    pub topic: Option<String>,
    /// Set on `file_share` subtypes.
    pub file: Option<FileRef>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageEvent {
    /// The user responsible for the message: `user`, `comment.user`, or
    /// `bot_id`, in that order.
    pub fn sender(&self) -> Option<&str> {
        self.user
            .as_deref()
            .or_else(|| self.comment.as_ref().map(|c| c.user.as_str()))
            .or(self.bot_id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub title: Option<String>,
    pub text: Option<String>,
    pub title_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    pub code: Option<i64>,
    pub msg: Option<String>,
}

// ── Bootstrap snapshot ───────────────────────────────────────────

/// The `rtm.start` response: the event-stream URL plus a full snapshot of
/// the workspace at stream-open time.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub url: String,
    #[serde(rename = "self")]
    pub self_info: SelfInfo,
    #[serde(default)]
    pub users: Vec<UserSnapshot>,
    #[serde(default)]
    pub channels: Vec<ChannelSnapshot>,
    #[serde(default)]
    pub groups: Vec<ChannelSnapshot>,
    #[serde(default)]
    pub ims: Vec<ImSnapshot>,
    #[serde(default)]
    pub bots: Vec<BotSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfInfo {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSnapshot {
    pub id: String,
    pub name: String,
    pub real_name: Option<String>,
    pub presence: Option<String>,
    pub deleted: Option<bool>,
}

/// A bot identity; projected as a user so `bot_id` senders resolve.
#[derive(Debug, Clone, Deserialize)]
pub struct BotSnapshot {
    pub id: String,
    pub name: String,
}

impl BotSnapshot {
    pub fn as_user(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            real_name: None,
            presence: None,
            deleted: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub name: String,
    pub topic: Option<Topic>,
    pub members: Option<Vec<String>>,
    pub is_member: Option<bool>,
    pub is_archived: Option<bool>,
    /// Groups only: whether the conversation is open in the client.
    pub is_open: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topic {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImSnapshot {
    pub id: String,
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> RtmEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parse_presence_change() {
        let ev = parse(r#"{"type":"presence_change","user":"U1","presence":"away"}"#);
        assert!(matches!(
            ev,
            RtmEvent::PresenceChange { user: Some(u), presence } if u == "U1" && presence == "away"
        ));
    }

    #[test]
    fn parse_message() {
        let ev = parse(
            r#"{"type":"message","channel":"C1","user":"U1","text":"hello","ts":"123.456"}"#,
        );
        let RtmEvent::Message(msg) = ev else {
            panic!("expected message event");
        };
        assert_eq!(msg.channel.as_deref(), Some("C1"));
        assert_eq!(msg.sender(), Some("U1"));
        assert_eq!(msg.text.as_deref(), Some("hello"));
    }

    #[test]
    fn message_sender_priority() {
        let from_comment = MessageEvent {
            comment: Some(Comment { user: "U2".into() }),
            bot_id: Some("B1".into()),
            ..Default::default()
        };
        assert_eq!(from_comment.sender(), Some("U2"));

        let from_bot = MessageEvent {
            bot_id: Some("B1".into()),
            ..Default::default()
        };
        assert_eq!(from_bot.sender(), Some("B1"));

        let anonymous = MessageEvent::default();
        assert_eq!(anonymous.sender(), None);
    }

    #[test]
    fn parse_file_share_subtype() {
        let ev = parse(
            r#"{"type":"message","subtype":"file_share","channel":"C1","user":"U1",
               "file":{"id":"F1","name":"notes.txt"},"text":"shared a file"}"#,
        );
        let RtmEvent::Message(msg) = ev else {
            panic!("expected message event");
        };
        assert_eq!(msg.subtype.as_deref(), Some("file_share"));
        assert_eq!(msg.file.unwrap().id, "F1");
    }

    #[test]
    fn unknown_event_types_map_to_unknown() {
        assert!(matches!(
            parse(r#"{"type":"user_typing","channel":"C1","user":"U1"}"#),
            RtmEvent::Unknown
        ));
        assert!(matches!(parse(r#"{"type":"hello"}"#), RtmEvent::Unknown));
    }

    #[test]
    fn parse_channel_joined_with_snapshot() {
        let ev = parse(
            r#"{"type":"channel_joined","channel":{"id":"C1","name":"general",
               "topic":{"value":"the topic"},"members":["U1","U2"],"is_member":true}}"#,
        );
        let RtmEvent::ChannelJoined { channel } = ev else {
            panic!("expected channel_joined");
        };
        assert_eq!(channel.id, "C1");
        assert_eq!(channel.topic.unwrap().value, "the topic");
        assert_eq!(channel.members.unwrap(), vec!["U1", "U2"]);
    }

    #[test]
    fn parse_snapshot() {
        let snapshot: Snapshot = serde_json::from_str(
            r#"{"ok":true,"url":"wss://example.test/ws","self":{"id":"U_ME"},
               "users":[{"id":"U_ME","name":"me"}],
               "channels":[{"id":"C1","name":"general","is_member":true}],
               "groups":[],"ims":[{"id":"D1","user":"U2"}],
               "bots":[{"id":"B1","name":"deploybot"}]}"#,
        )
        .unwrap();
        assert_eq!(snapshot.url, "wss://example.test/ws");
        assert_eq!(snapshot.self_info.id, "U_ME");
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.ims[0].user, "U2");
        assert_eq!(snapshot.bots[0].as_user().name, "deploybot");
    }
}
