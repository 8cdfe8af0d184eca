// The message model shared by every subsystem: a format tag, an opaque
// string body, and a topic extracted from the body when the format allows.
//
// Publishers frame each message as `FORMAT:<FMT>|<BODY>`. Parsing a frame
// never fails: a frame that is malformed, names an unknown format, or whose
// body does not validate under its declared format is downgraded to a RAW
// frame whose body is the original buffer byte-for-byte. Topic extraction
// is a partial function per format that falls back to "default".

use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel topic: a subscription to `all` matches every message, and a
/// store scan for `all` returns every record.
pub const TOPIC_ALL: &str = "all";

/// Topic recorded when extraction fails or the format carries no topic.
pub const DEFAULT_TOPIC: &str = "default";

/// Upper bound on a single publisher read; one frame per read.
pub const MAX_FRAME: usize = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Format {
    Json,
    Xml,
    Raw,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "JSON",
            Format::Xml => "XML",
            Format::Raw => "RAW",
        }
    }

    /// Case-insensitive, so publishers may send `FORMAT:json`.
    pub fn parse(s: &str) -> Option<Format> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Some(Format::Json),
            "XML" => Some(Format::Xml),
            "RAW" => Some(Format::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable message record. `id` is assigned by the store and is
/// monotonic per node; records are never mutated or deleted.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub topic: String,
    pub format: Format,
    pub body: String,
    pub timestamp: String,
}

impl Message {
    /// The line-framed wire form sent to subscribers.
    pub fn wire_line(&self) -> String {
        format!("FORMAT:{}|{}\n", self.format, self.body)
    }
}

/// A parsed (and already validated-or-downgraded) publisher frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub format: Format,
    pub body: String,
}

pub fn parse_frame(raw: &str) -> Frame {
    match split_frame(raw) {
        Some((format, body)) if validate_format(format, body) => Frame {
            format,
            body: body.to_owned(),
        },
        _ => Frame {
            format: Format::Raw,
            body: raw.to_owned(),
        },
    }
}

fn split_frame(raw: &str) -> Option<(Format, &str)> {
    let bar = memchr::memchr(b'|', raw.as_bytes())?;
    let head = &raw[..bar];
    let body = &raw[bar + 1..];
    let fmt = head.strip_prefix("FORMAT:")?;
    Some((Format::parse(fmt)?, body))
}

/// True iff `body` is well-formed under `format`. RAW accepts anything.
pub fn validate_format(format: Format, body: &str) -> bool {
    match format {
        Format::Json => serde_json::from_str::<serde_json::Value>(body).is_ok(),
        Format::Xml => xml_well_formed(body),
        Format::Raw => true,
    }
}

// quick-xml is a pull parser and happily yields events for fragments that
// a DOM parser would reject, so well-formedness here means: events parse,
// exactly balanced element depth, at least one element, and no stray text
// outside the root.
fn xml_well_formed(body: &str) -> bool {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.trim_text(true);
    let mut depth = 0_usize;
    let mut seen_root = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => {
                depth += 1;
                seen_root = true;
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Ok(Event::Empty(_)) => seen_root = true,
            Ok(Event::Text(text)) => {
                if depth == 0 && !text.iter().all(|b| b.is_ascii_whitespace()) {
                    return false;
                }
            }
            Ok(Event::CData(_)) => {
                if depth == 0 {
                    return false;
                }
            }
            Ok(Event::Eof) => return seen_root && depth == 0,
            Ok(_) => {} // declarations, comments, processing instructions
            Err(_) => return false,
        }
    }
}

/// Extract the routing topic from a message body: the `Topic` field of a
/// JSON object, or the text of the root's direct `<Topic>` child. Any
/// failure (unparseable body, missing or empty topic, RAW format) yields
/// `"default"`.
pub fn extract_topic(format: Format, body: &str) -> String {
    let topic = match format {
        Format::Json => json_topic(body),
        Format::Xml => xml_topic(body),
        Format::Raw => None,
    };
    match topic {
        Some(t) if !t.is_empty() => t,
        _ => DEFAULT_TOPIC.to_owned(),
    }
}

fn json_topic(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("Topic")?.as_str().map(str::to_owned)
}

fn xml_topic(body: &str) -> Option<String> {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.trim_text(true);
    let mut depth = 0_usize;
    let mut in_topic = false;
    let mut topic = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                // Only a direct child of the root counts, as in a DOM
                // root.find("Topic").
                if depth == 1 && start.name().as_ref() == b"Topic" {
                    in_topic = true;
                }
                depth += 1;
            }
            Ok(Event::End(_)) => {
                depth = depth.checked_sub(1)?;
                if in_topic {
                    return topic;
                }
            }
            Ok(Event::Text(text)) => {
                if in_topic && topic.is_none() {
                    topic = text.unescape().ok().map(|t| t.into_owned());
                }
            }
            Ok(Event::Eof) => return topic,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

/// Ingest timestamps are ISO-8601 with microsecond precision.
pub fn now_iso8601() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
