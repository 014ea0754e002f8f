use once_cell::sync::Lazy;
use regex::Regex;

use crate::viber::InboundMessage;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid html tag regex"));
static LINE_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>|</p>").expect("valid line break regex"));
static MX_REPLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<mx-reply>.*?</mx-reply>").expect("valid mx-reply regex"));

pub(crate) const VIBER_PREFIX: &str = "[Viber]";

pub(crate) fn format_viber_text(sender_name: &str, text: &str) -> String {
    format!("{VIBER_PREFIX} {sender_name}: {text}")
}

pub(crate) fn format_location(lat: f64, lon: f64) -> String {
    format!("[Location] {lat}, {lon}")
}

/// Parses `geo:lat,lon[,alt][;params]` as sent in `m.location` events.
pub(crate) fn parse_geo_uri(uri: &str) -> Option<(f64, f64)> {
    let coords = uri.strip_prefix("geo:")?.split(';').next()?;
    let mut parts = coords.split(',');
    let lat: f64 = parts.next()?.trim().parse().ok()?;
    let lon: f64 = parts.next()?.trim().parse().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some((lat, lon))
}

pub(crate) fn format_contact(name: &str, phone: &str) -> String {
    format!("[Contact] {name} {phone}").trim_end().to_string()
}

pub(crate) fn portal_room_name(message: &InboundMessage) -> String {
    if message.is_group {
        format!("Viber Group: {}", message.chat_id)
    } else {
        format!("Viber: {}", message.sender.display_name())
    }
}

pub(crate) fn portal_topic(chat_id: &str) -> String {
    format!("Viber chat: {chat_id}")
}

/// Drops the `> ` quote block Matrix clients prepend to replies.
pub(crate) fn strip_reply_fallback(body: &str) -> &str {
    if !body.starts_with("> ") {
        return body;
    }
    match body.find("\n\n") {
        Some(idx) => &body[idx + 2..],
        None => body,
    }
}

/// Reduces Matrix HTML to the plain markup Viber renders.
pub(crate) fn strip_html(html: &str) -> String {
    let text = MX_REPLY.replace_all(html, "");
    let text = LINE_BREAK.replace_all(&text, "\n");
    let text = text
        .replace("<b>", "*")
        .replace("</b>", "*")
        .replace("<strong>", "*")
        .replace("</strong>", "*")
        .replace("<i>", "_")
        .replace("</i>", "_")
        .replace("<em>", "_")
        .replace("</em>", "_")
        .replace("<code>", "`")
        .replace("</code>", "`");
    let text = HTML_TAG.replace_all(&text, "");
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

/// Text sent to Viber for a Matrix `m.room.message` content.
pub(crate) fn render_for_viber(
    msgtype: &str,
    body: &str,
    format: Option<&str>,
    formatted_body: Option<&str>,
) -> String {
    match msgtype {
        "m.text" | "m.notice" | "m.emote" => {
            let text = match (format, formatted_body) {
                (Some("org.matrix.custom.html"), Some(html)) if !html.trim().is_empty() => {
                    strip_html(html)
                }
                _ => strip_reply_fallback(body).trim().to_string(),
            };
            if msgtype == "m.emote" {
                format!("* {text}")
            } else {
                text
            }
        }
        "m.image" => format!("[Image: {body}]"),
        "m.video" => format!("[Video: {body}]"),
        "m.file" => format!("[File: {body}]"),
        "m.audio" => format!("[Audio: {body}]"),
        "m.location" => format!("[Location: {body}]"),
        other => format!("[{other}]"),
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::viber::MessageContent;
    use crate::viber::payload::ViberUserInfo;

    fn inbound(chat_id: &str, is_group: bool) -> InboundMessage {
        InboundMessage {
            message_token: None,
            sender: ViberUserInfo {
                id: "u1".to_string(),
                name: "Alice".to_string(),
                avatar: None,
                language: None,
                country: None,
            },
            chat_id: chat_id.to_string(),
            is_group,
            timestamp: None,
            content: MessageContent::Text {
                text: "hi".to_string(),
            },
        }
    }

    #[test]
    fn viber_text_prefix() {
        assert_eq!(format_viber_text("Alice", "hi"), "[Viber] Alice: hi");
        assert_eq!(format_location(50.5, 6.25), "[Location] 50.5, 6.25");
        assert_eq!(format_contact("Bob", "+1555"), "[Contact] Bob +1555");
        assert_eq!(format_contact("Bob", ""), "[Contact] Bob");
    }

    #[test]
    fn portal_names() {
        assert_eq!(portal_room_name(&inbound("u1", false)), "Viber: Alice");
        assert_eq!(portal_room_name(&inbound("c1", true)), "Viber Group: c1");
        assert_eq!(portal_topic("c1"), "Viber chat: c1");
    }

    #[test]
    fn reply_fallback_is_removed() {
        assert_eq!(
            strip_reply_fallback("> <@bob:example.org> earlier\n> more\n\nmy answer"),
            "my answer"
        );
        assert_eq!(strip_reply_fallback("plain"), "plain");
        assert_eq!(strip_reply_fallback("> quote only"), "> quote only");
    }

    #[test]
    fn html_is_flattened() {
        assert_eq!(
            strip_html("<mx-reply><blockquote>old</blockquote></mx-reply><p><b>bold</b> &amp; <em>soft</em></p><br/>next"),
            "*bold* & _soft_\n\nnext"
        );
        assert_eq!(strip_html("<a href=\"https://x\">link</a>"), "link");
    }

    #[test_case("geo:51.5008,0.1247", Some((51.5008, 0.1247)))]
    #[test_case("geo:-33.86,151.2;u=35", Some((-33.86, 151.2)))]
    #[test_case("geo:10,20,300", Some((10.0, 20.0)))]
    #[test_case("geo:91,0", None)]
    #[test_case("geo:abc,1", None)]
    #[test_case("geo:1", None)]
    #[test_case("51.5,0.12", None)]
    fn geo_uris(uri: &str, expected: Option<(f64, f64)>) {
        assert_eq!(parse_geo_uri(uri), expected);
    }

    #[test_case("m.text", "hello", "hello")]
    #[test_case("m.notice", "notice", "notice")]
    #[test_case("m.emote", "waves", "* waves")]
    #[test_case("m.image", "cat.png", "[Image: cat.png]")]
    #[test_case("m.video", "clip.mp4", "[Video: clip.mp4]")]
    #[test_case("m.file", "doc.pdf", "[File: doc.pdf]")]
    #[test_case("m.audio", "voice.ogg", "[Audio: voice.ogg]")]
    #[test_case("m.location", "Home", "[Location: Home]")]
    #[test_case("m.poll", "vote", "[m.poll]")]
    fn viber_rendering(msgtype: &str, body: &str, expected: &str) {
        assert_eq!(render_for_viber(msgtype, body, None, None), expected);
    }

    #[test]
    fn formatted_body_wins_for_html() {
        assert_eq!(
            render_for_viber(
                "m.text",
                "**hi**",
                Some("org.matrix.custom.html"),
                Some("<strong>hi</strong>")
            ),
            "*hi*"
        );
    }
}
