//! Identifier translation and escaping between IRC text and upstream text.
//!
//! Outbound (IRC → upstream): HTML-escape `&<>"` in that order, then
//! rewrite `&lt;@NICK&gt;` / `&lt;#NAME&gt;` into `<@id>` / `<#id>` using
//! the world's folded-name lookup. Unknown references pass through
//! unchanged.
//!
//! Inbound (upstream → IRC): per recipient, rewrite `<@id>` / `<#id>` into
//! `<@nick>` / `<#name>` (substituting the recipient's own nick for self),
//! then unescape the entities.

use crate::slack::event::Attachment;
use crate::world::World;

/// HTML-escape the characters the upstream service reserves.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Undo [`escape`].
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Translate IRC message text into upstream message text.
pub fn irc_to_api(world: &World, text: &str) -> String {
    let escaped = escape(text);
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped.as_str();

    while let Some(start) = rest.find("&lt;") {
        out.push_str(&rest[..start]);
        let token_start = &rest[start..];
        match rewrite_outbound_ref(world, token_start) {
            Some((replacement, consumed)) => {
                out.push_str(&replacement);
                rest = &token_start[consumed..];
            }
            None => {
                out.push_str("&lt;");
                rest = &token_start["&lt;".len()..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Try to rewrite a `&lt;@NICK&gt;` or `&lt;#NAME&gt;` reference at the
/// start of `s`. Returns the replacement and the number of bytes consumed.
fn rewrite_outbound_ref(world: &World, s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix("&lt;")?;
    let sigil = inner.chars().next()?;
    if sigil != '@' && sigil != '#' {
        return None;
    }
    let name_start = &inner[1..];
    let end = name_start.find("&gt;")?;
    let name = &name_start[..end];
    let consumed = "&lt;".len() + 1 + end + "&gt;".len();

    let id = match sigil {
        '@' => world.user_by_nick(name).map(|u| u.id.clone()),
        _ => world.channel_by_name(name).map(|c| c.id.clone()),
    }?;
    Some((format!("<{sigil}{id}>"), consumed))
}

/// Translate upstream message text into IRC text for one recipient.
/// `self_nick` is that recipient's own chosen nick.
pub fn api_to_irc(world: &World, self_nick: &str, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let token_start = &rest[start..];
        match rewrite_inbound_ref(world, self_nick, token_start) {
            Some((replacement, consumed)) => {
                out.push_str(&replacement);
                rest = &token_start[consumed..];
            }
            None => {
                out.push('<');
                rest = &token_start[1..];
            }
        }
    }
    out.push_str(rest);

    unescape(&out)
}

/// Try to rewrite a `<@id>` or `<#id>` reference at the start of `s`.
fn rewrite_inbound_ref(world: &World, self_nick: &str, s: &str) -> Option<(String, usize)> {
    let inner = s.strip_prefix('<')?;
    let sigil = inner.chars().next()?;
    if sigil != '@' && sigil != '#' {
        return None;
    }
    let id_start = &inner[1..];
    let end = id_start.find('>')?;
    // Some payloads carry a `<@id|label>` fallback; the id is before the bar.
    let id = id_start[..end].split('|').next()?;
    let consumed = 1 + 1 + end + 1;

    let name = match sigil {
        '@' => {
            if world.is_self(id) {
                Some(self_nick.to_owned())
            } else {
                world.users.get(id).map(|u| u.nick.clone())
            }
        }
        _ => world.channels.get(id).map(|c| c.name.clone()),
    }?;
    Some((format!("<{sigil}{name}>"), consumed))
}

/// Flatten attachments into display lines: `title text title_link` per
/// attachment, appended to the body on new lines.
pub fn flatten_attachments(body: &str, attachments: &[Attachment]) -> String {
    let mut out = body.to_owned();
    for att in attachments {
        let parts: Vec<&str> = [
            att.title.as_deref(),
            att.text.as_deref(),
            att.title_link.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect();
        if parts.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&parts.join(" "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slack::event::{ChannelSnapshot, UserSnapshot};
    use crate::world::ChannelKind;
    use pretty_assertions::assert_eq;

    fn world() -> World {
        let mut world = World::new();
        world.self_id = Some("U_ME".into());
        world.update_user(&UserSnapshot {
            id: "U_ME".into(),
            name: "me".into(),
            real_name: None,
            presence: None,
            deleted: None,
        });
        world.update_user(&UserSnapshot {
            id: "U_BOB".into(),
            name: "bob".into(),
            real_name: None,
            presence: None,
            deleted: None,
        });
        world.update_channel(
            ChannelKind::Public,
            &ChannelSnapshot {
                id: "C1".into(),
                name: "general".into(),
                topic: None,
                members: None,
                is_member: None,
                is_archived: None,
                is_open: None,
            },
        );
        world
    }

    #[test]
    fn escape_order_is_amp_first() {
        assert_eq!(escape("&<>\""), "&amp;&lt;&gt;&quot;");
        assert_eq!(escape("a & b"), "a &amp; b");
    }

    #[test]
    fn unescape_amp_last() {
        assert_eq!(unescape("&amp;lt;"), "&lt;");
        assert_eq!(unescape("&lt;&gt;&quot;&amp;"), "<>\"&");
    }

    #[test]
    fn outbound_rewrites_known_refs() {
        let world = world();
        assert_eq!(
            irc_to_api(&world, "hello <@bob> & bye"),
            "hello <@U_BOB> &amp; bye"
        );
        assert_eq!(irc_to_api(&world, "see <#general>"), "see <#C1>");
    }

    #[test]
    fn outbound_folds_names() {
        let world = world();
        assert_eq!(irc_to_api(&world, "<@BOB>"), "<@U_BOB>");
    }

    #[test]
    fn outbound_passes_unknown_refs_through() {
        let world = world();
        assert_eq!(irc_to_api(&world, "<@nobody>"), "&lt;@nobody&gt;");
        assert_eq!(irc_to_api(&world, "<#nowhere>"), "&lt;#nowhere&gt;");
    }

    #[test]
    fn inbound_rewrites_ids() {
        let world = world();
        assert_eq!(
            api_to_irc(&world, "alice", "hello <@U_BOB> &amp; bye"),
            "hello <@bob> & bye"
        );
        assert_eq!(api_to_irc(&world, "alice", "see <#C1>"), "see <#general>");
    }

    #[test]
    fn inbound_substitutes_recipient_nick_for_self() {
        let world = world();
        assert_eq!(api_to_irc(&world, "alice", "<@U_ME>"), "<@alice>");
    }

    #[test]
    fn inbound_leaves_unknown_ids() {
        let world = world();
        assert_eq!(api_to_irc(&world, "alice", "<@U_GHOST>"), "<@U_GHOST>");
        assert_eq!(api_to_irc(&world, "alice", "a < b"), "a < b");
    }

    #[test]
    fn inbound_handles_labelled_refs() {
        let world = world();
        assert_eq!(api_to_irc(&world, "alice", "<@U_BOB|bobby>"), "<@bob>");
    }

    #[test]
    fn roundtrip_known_refs() {
        // What one client sends, another receives unchanged.
        let world = world();
        let sent = "ping <@bob> in <#general> & \"out\"";
        let wire = irc_to_api(&world, sent);
        let received = api_to_irc(&world, "alice", &wire);
        assert_eq!(received, sent);
    }

    #[test]
    fn attachments_flatten_onto_new_lines() {
        let atts = vec![
            Attachment {
                title: Some("A title".into()),
                text: Some("a text".into()),
                title_link: Some("https://example.test/a".into()),
            },
            Attachment {
                title: None,
                text: Some("just text".into()),
                title_link: None,
            },
        ];
        assert_eq!(
            flatten_attachments("body", &atts),
            "body\nA title a text https://example.test/a\njust text"
        );
        assert_eq!(flatten_attachments("", &atts[1..]), "just text");
    }
}
