//! PIDF (RFC 3863) encoding and decoding
//!
//! Documents carry one tuple with the basic open/closed status and an optional
//! note, plus a `dm:person` element with an RPID activity and a CIPID display
//! name when there is something to say. All user text goes through the XML
//! writer's escaping.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PIDF_CONTENT_TYPE: &str = "application/pidf+xml";

const NS_PIDF: &str = "urn:ietf:params:xml:ns:pidf";
const NS_DATA_MODEL: &str = "urn:ietf:params:xml:ns:pidf:data-model";
const NS_RPID: &str = "urn:ietf:params:xml:ns:pidf:rpid";
const NS_CIPID: &str = "urn:ietf:params:xml:ns:pidf:cipid";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PidfError {
    #[error("failed to write presence document: {0}")]
    Write(String),

    #[error("malformed presence document: {0}")]
    Xml(String),

    #[error("not a presence document: root element is <{0}>")]
    UnexpectedRoot(String),

    #[error("presence document has no basic status")]
    MissingBasic,

    #[error("unknown basic status '{0}'")]
    InvalidBasic(String),
}

/// Availability published and observed for an identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresenceStatus {
    Open,
    ClosedBusy,
    ClosedDnd,
    ClosedAway,
    ClosedOffline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Open => "open",
            PresenceStatus::ClosedBusy => "closed-busy",
            PresenceStatus::ClosedDnd => "closed-dnd",
            PresenceStatus::ClosedAway => "closed-away",
            PresenceStatus::ClosedOffline => "closed-offline",
        }
    }

    fn is_open(self) -> bool {
        self == PresenceStatus::Open
    }

    /// RPID activity element, without prefix
    fn activity(self) -> Option<&'static str> {
        match self {
            PresenceStatus::ClosedBusy => Some("busy"),
            PresenceStatus::ClosedDnd => Some("do-not-disturb"),
            PresenceStatus::ClosedAway => Some("away"),
            PresenceStatus::Open | PresenceStatus::ClosedOffline => None,
        }
    }

    fn from_parts(open: bool, activity: Option<&str>) -> Self {
        if open {
            return PresenceStatus::Open;
        }
        match activity {
            Some("busy" | "on-the-phone" | "in-meeting" | "meeting") => PresenceStatus::ClosedBusy,
            Some("do-not-disturb") => PresenceStatus::ClosedDnd,
            Some("away" | "vacation" | "sleeping" | "steering") => PresenceStatus::ClosedAway,
            _ => PresenceStatus::ClosedOffline,
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = PidfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PresenceStatus::Open),
            "closed-busy" => Ok(PresenceStatus::ClosedBusy),
            "closed-dnd" => Ok(PresenceStatus::ClosedDnd),
            "closed-away" => Ok(PresenceStatus::ClosedAway),
            "closed-offline" => Ok(PresenceStatus::ClosedOffline),
            other => Err(PidfError::InvalidBasic(other.to_string())),
        }
    }
}

/// Decoded (or to-be-encoded) presence document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDocument {
    pub entity: String,
    pub status: PresenceStatus,
    pub note: Option<String>,
    pub display_name: Option<String>,
}

impl PresenceDocument {
    pub fn new(entity: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            entity: entity.into(),
            status,
            note: None,
            display_name: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn write(writer: &mut XmlWriter, event: Event<'_>) -> Result<(), PidfError> {
    writer
        .write_event(event)
        .map_err(|e| PidfError::Write(e.to_string()))
}

fn write_text_element(writer: &mut XmlWriter, name: &str, text: &str) -> Result<(), PidfError> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

/// Serialize a presence document
pub fn encode(document: &PresenceDocument) -> Result<String, PidfError> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("presence");
    root.push_attribute(("xmlns", NS_PIDF));
    root.push_attribute(("xmlns:dm", NS_DATA_MODEL));
    root.push_attribute(("xmlns:rpid", NS_RPID));
    root.push_attribute(("xmlns:c", NS_CIPID));
    root.push_attribute(("entity", document.entity.as_str()));
    write(&mut writer, Event::Start(root))?;

    let mut tuple = BytesStart::new("tuple");
    tuple.push_attribute(("id", "t1"));
    write(&mut writer, Event::Start(tuple))?;
    write(&mut writer, Event::Start(BytesStart::new("status")))?;
    let basic = if document.status.is_open() { "open" } else { "closed" };
    write_text_element(&mut writer, "basic", basic)?;
    write(&mut writer, Event::End(BytesEnd::new("status")))?;
    if let Some(note) = &document.note {
        write_text_element(&mut writer, "note", note)?;
    }
    write(&mut writer, Event::End(BytesEnd::new("tuple")))?;

    let activity = document.status.activity();
    if activity.is_some() || document.display_name.is_some() {
        let mut person = BytesStart::new("dm:person");
        person.push_attribute(("id", "p1"));
        write(&mut writer, Event::Start(person))?;
        if let Some(activity) = activity {
            write(&mut writer, Event::Start(BytesStart::new("rpid:activities")))?;
            write(&mut writer, Event::Empty(BytesStart::new(format!("rpid:{}", activity))))?;
            write(&mut writer, Event::End(BytesEnd::new("rpid:activities")))?;
        }
        if let Some(display_name) = &document.display_name {
            write_text_element(&mut writer, "c:display-name", display_name)?;
        }
        write(&mut writer, Event::End(BytesEnd::new("dm:person")))?;
    }

    write(&mut writer, Event::End(BytesEnd::new("presence")))?;

    String::from_utf8(writer.into_inner().into_inner()).map_err(|e| PidfError::Write(e.to_string()))
}

#[derive(Clone, Copy, PartialEq)]
enum TextTarget {
    None,
    Basic,
    Note,
    DisplayName,
}

/// Parse a presence document. Namespace prefixes are ignored; elements are
/// matched by local name.
pub fn decode(xml: &str) -> Result<PresenceDocument, PidfError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut entity: Option<String> = None;
    let mut basic: Option<String> = None;
    let mut note: Option<String> = None;
    let mut display_name: Option<String> = None;
    let mut activity: Option<String> = None;
    let mut in_activities = false;
    let mut target = TextTarget::None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                let name = local.as_ref();
                if entity.is_none() {
                    if name != b"presence" {
                        return Err(PidfError::UnexpectedRoot(
                            String::from_utf8_lossy(name).to_string(),
                        ));
                    }
                    let mut found = String::new();
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"entity" {
                            found = attr
                                .unescape_value()
                                .map_err(|err| PidfError::Xml(err.to_string()))?
                                .to_string();
                        }
                    }
                    entity = Some(found);
                } else {
                    target = match name {
                        b"basic" if basic.is_none() => TextTarget::Basic,
                        b"note" if note.is_none() => TextTarget::Note,
                        b"display-name" if display_name.is_none() => TextTarget::DisplayName,
                        _ => TextTarget::None,
                    };
                    if name == b"activities" {
                        in_activities = true;
                    } else if in_activities && activity.is_none() {
                        activity = Some(String::from_utf8_lossy(name).to_string());
                    }
                }
            }
            Ok(Event::Empty(ref e)) => {
                let local = e.local_name();
                if in_activities && activity.is_none() {
                    activity = Some(String::from_utf8_lossy(local.as_ref()).to_string());
                }
            }
            Ok(Event::Text(ref e)) => {
                if target != TextTarget::None {
                    let text = e
                        .unescape()
                        .map_err(|err| PidfError::Xml(err.to_string()))?
                        .to_string();
                    match target {
                        TextTarget::Basic => basic = Some(text),
                        TextTarget::Note => note = Some(text),
                        TextTarget::DisplayName => display_name = Some(text),
                        TextTarget::None => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                target = TextTarget::None;
                if e.local_name().as_ref() == b"activities" {
                    in_activities = false;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(PidfError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let entity = entity.ok_or_else(|| PidfError::Xml("empty document".to_string()))?;
    let open = match basic.as_deref().map(str::trim) {
        Some("open") => true,
        Some("closed") => false,
        Some(other) => return Err(PidfError::InvalidBasic(other.to_string())),
        None => return Err(PidfError::MissingBasic),
    };

    Ok(PresenceDocument {
        entity,
        status: PresenceStatus::from_parts(open, activity.as_deref()),
        note,
        display_name,
    })
}
