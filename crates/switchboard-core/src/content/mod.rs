//! Message content variants and their constructors.
//!
//! `MessageContent` is a closed set. Every constructor runs the structural
//! validator for its variant, so values built here are always safe to hand
//! to a transformer.

use serde::{Deserialize, Serialize};

use crate::validation::{ValidationError, is_valid_url, limits};

/// Normalized message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text with formatting ranges.
    Text(TextContent),
    /// Media referenced by URI.
    Media(MediaContent),
    /// A geographic location.
    Location(LocationContent),
    /// A shared contact card.
    Contact(ContactContent),
    /// Buttons, lists, or a user's selection.
    Interactive(InteractiveContent),
}

impl MessageContent {
    /// Variant name ("text", "media", ...).
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        match self {
            Self::Text(_) => ContentKind::Text,
            Self::Media(_) => ContentKind::Media,
            Self::Location(_) => ContentKind::Location,
            Self::Contact(_) => ContentKind::Contact,
            Self::Interactive(_) => ContentKind::Interactive,
        }
    }

    /// Best-effort plain-text rendering, used for fallbacks and previews.
    #[must_use]
    pub fn fallback_text(&self) -> String {
        match self {
            Self::Text(text) => text.text.clone(),
            Self::Media(media) => {
                let label = media
                    .caption
                    .clone()
                    .or_else(|| media.filename.clone())
                    .unwrap_or_else(|| media.media_type.as_str().to_string());
                format!("{label}\n{}", media.url)
            }
            Self::Location(location) => location.fallback_text(),
            Self::Contact(contact) => contact.fallback_text(),
            Self::Interactive(interactive) => interactive.fallback_text(),
        }
    }
}

/// Discriminator of a [`MessageContent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Text.
    Text,
    /// Media.
    Media,
    /// Location.
    Location,
    /// Contact.
    Contact,
    /// Interactive.
    Interactive,
}

impl ContentKind {
    /// String form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Media => "media",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::Interactive => "interactive",
        }
    }
}

/// Text body with formatting ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    /// Plain text, without markup.
    pub text: String,
    /// Formatting ranges over `text`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formatting: Vec<TextFormat>,
}

/// One formatting range. Offsets count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFormat {
    /// Format kind.
    #[serde(flatten)]
    pub kind: FormatKind,
    /// Start offset in chars.
    pub offset: usize,
    /// Length in chars.
    pub length: usize,
}

impl TextFormat {
    /// Create a new range.
    #[must_use]
    pub const fn new(kind: FormatKind, offset: usize, length: usize) -> Self {
        Self {
            kind,
            offset,
            length,
        }
    }

    /// Exclusive end offset.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Kind of formatting range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatKind {
    /// Bold.
    Bold,
    /// Italic.
    Italic,
    /// Strikethrough.
    Strikethrough,
    /// Inline code.
    Code,
    /// Preformatted block.
    Pre,
    /// Spoiler.
    Spoiler,
    /// Hyperlink.
    Link {
        /// Target URL.
        url: String,
    },
    /// User mention.
    Mention {
        /// Mentioned platform user ID.
        #[serde(rename = "userId")]
        user_id: String,
    },
}

/// Media category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Image.
    Image,
    /// Video.
    Video,
    /// Audio file.
    Audio,
    /// Voice note.
    Voice,
    /// Document.
    Document,
    /// Sticker.
    Sticker,
}

impl MediaType {
    /// String form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Media referenced by an opaque URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContent {
    /// Media category.
    pub media_type: MediaType,
    /// Platform reference or external URL.
    pub url: String,
    /// Caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    /// Formatting ranges over `caption`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caption_formatting: Vec<TextFormat>,
    /// File name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// MIME type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Duration in seconds (audio/video).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// Pixel dimensions (image/video).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
}

impl MediaContent {
    /// Create media with only the required fields.
    #[must_use]
    pub fn new(media_type: MediaType, url: impl Into<String>) -> Self {
        Self {
            media_type,
            url: url.into(),
            caption: None,
            caption_formatting: Vec::new(),
            filename: None,
            mime_type: None,
            size: None,
            duration: None,
            dimensions: None,
        }
    }

    /// Whether `url` is an external http(s) URL rather than a platform reference.
    #[must_use]
    pub fn is_external_url(&self) -> bool {
        is_valid_url(&self.url)
    }
}

/// A geographic location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationContent {
    /// Latitude in degrees, -90..=90.
    pub latitude: f64,
    /// Longitude in degrees, -180..=180.
    pub longitude: f64,
    /// Place name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Street address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl LocationContent {
    /// Map link for platforms without a native location type.
    #[must_use]
    pub fn map_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={},{}",
            self.latitude, self.longitude
        )
    }

    /// Text rendering: name, address, map link.
    #[must_use]
    pub fn fallback_text(&self) -> String {
        let mut lines = Vec::new();
        if let Some(name) = &self.name {
            lines.push(format!("📍 {name}"));
        } else {
            lines.push("📍 Location".to_string());
        }
        if let Some(address) = &self.address {
            lines.push(address.clone());
        }
        lines.push(self.map_url());
        lines.join("\n")
    }
}

/// A phone number on a contact card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactPhone {
    /// The number.
    pub number: String,
    /// Label ("mobile", "work", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A shared contact card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactContent {
    /// Display name.
    pub name: String,
    /// Phone numbers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phone_numbers: Vec<ContactPhone>,
    /// Email addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    /// Organization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

impl ContactContent {
    /// Text rendering of the card.
    #[must_use]
    pub fn fallback_text(&self) -> String {
        let mut lines = vec![format!("👤 {}", self.name)];
        if let Some(org) = &self.organization {
            lines.push(org.clone());
        }
        lines.extend(self.phone_numbers.iter().map(|p| match &p.label {
            Some(label) => format!("{label}: {}", p.number),
            None => p.number.clone(),
        }));
        lines.extend(self.emails.iter().cloned());
        lines.join("\n")
    }
}

/// Style of an interactive message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractiveType {
    /// Reply buttons.
    Buttons,
    /// Sectioned list.
    List,
    /// Lightweight quick replies.
    QuickReply,
}

/// A reply button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Stable button ID.
    pub id: String,
    /// Visible label.
    pub title: String,
    /// Opaque payload returned on click.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Button {
    /// Create a button without payload.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            payload: None,
        }
    }
}

/// One row of a list section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    /// Row ID.
    pub id: String,
    /// Row title.
    pub title: String,
    /// Row description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A section of a list message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    /// Section title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Rows.
    pub rows: Vec<ListRow>,
}

/// A user's selection of a button or list row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractiveReply {
    /// Selected button/row ID.
    pub id: String,
    /// Selected title.
    pub title: String,
    /// Payload echoed by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Buttons, lists, or an inbound selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveContent {
    /// Style.
    pub interactive_type: InteractiveType,
    /// Body text.
    pub body: String,
    /// Header text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    /// Footer text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    /// Buttons (buttons/quick reply).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
    /// Sections (list).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<ListSection>,
    /// Label of the button that opens a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_button: Option<String>,
    /// Inbound selection, if this message is a user's answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<InteractiveReply>,
}

impl InteractiveContent {
    /// Text rendering with numbered options.
    #[must_use]
    pub fn fallback_text(&self) -> String {
        if let Some(reply) = &self.reply {
            return reply.title.clone();
        }
        let mut lines = Vec::new();
        if let Some(header) = &self.header {
            lines.push(header.clone());
        }
        lines.push(self.body.clone());
        let options: Vec<&str> = if self.buttons.is_empty() {
            self.sections
                .iter()
                .flat_map(|s| s.rows.iter().map(|r| r.title.as_str()))
                .collect()
        } else {
            self.buttons.iter().map(|b| b.title.as_str()).collect()
        };
        for (i, option) in options.iter().enumerate() {
            lines.push(format!("{}. {option}", i + 1));
        }
        if let Some(footer) = &self.footer {
            lines.push(footer.clone());
        }
        lines.join("\n")
    }

    /// Every selectable option as `(id, title)`.
    #[must_use]
    pub fn options(&self) -> Vec<(&str, &str)> {
        if self.buttons.is_empty() {
            self.sections
                .iter()
                .flat_map(|s| s.rows.iter().map(|r| (r.id.as_str(), r.title.as_str())))
                .collect()
        } else {
            self.buttons
                .iter()
                .map(|b| (b.id.as_str(), b.title.as_str()))
                .collect()
        }
    }
}

/// Create text content.
///
/// # Errors
///
/// Returns error if the text is empty or a formatting range is out of bounds.
pub fn create_text_content(
    text: impl Into<String>,
    formatting: Vec<TextFormat>,
) -> Result<MessageContent, ValidationError> {
    let content = MessageContent::Text(TextContent {
        text: text.into(),
        formatting,
    });
    validate_content(&content)?;
    Ok(content)
}

/// Create media content.
///
/// When `mime_type` is absent it is inferred from `filename` or the URL path.
///
/// # Errors
///
/// Returns error if the URL is empty.
pub fn create_media_content(
    media_type: MediaType,
    url: impl Into<String>,
    caption: Option<String>,
    filename: Option<String>,
) -> Result<MessageContent, ValidationError> {
    let url = url.into();
    let mime_type = filename
        .as_deref()
        .and_then(crate::validation::mime_from_filename)
        .or_else(|| crate::validation::mime_from_filename(&url));
    let content = MessageContent::Media(MediaContent {
        caption,
        filename,
        mime_type,
        ..MediaContent::new(media_type, url)
    });
    validate_content(&content)?;
    Ok(content)
}

/// Create location content.
///
/// # Errors
///
/// Returns error if latitude is outside -90..=90 or longitude outside -180..=180.
pub fn create_location_content(
    latitude: f64,
    longitude: f64,
    name: Option<String>,
    address: Option<String>,
) -> Result<MessageContent, ValidationError> {
    let content = MessageContent::Location(LocationContent {
        latitude,
        longitude,
        name,
        address,
    });
    validate_content(&content)?;
    Ok(content)
}

/// Create contact content.
///
/// # Errors
///
/// Returns error if the name is blank.
pub fn create_contact_content(
    name: impl Into<String>,
    phone_numbers: Vec<ContactPhone>,
    emails: Vec<String>,
    organization: Option<String>,
) -> Result<MessageContent, ValidationError> {
    let content = MessageContent::Contact(ContactContent {
        name: name.into(),
        phone_numbers,
        emails,
        organization,
    });
    validate_content(&content)?;
    Ok(content)
}

/// Create a reply-buttons message.
///
/// # Errors
///
/// Returns error if the body is blank or there are no buttons.
pub fn create_buttons_content(
    body: impl Into<String>,
    buttons: Vec<Button>,
) -> Result<MessageContent, ValidationError> {
    let content = MessageContent::Interactive(InteractiveContent {
        interactive_type: InteractiveType::Buttons,
        body: body.into(),
        header: None,
        footer: None,
        buttons,
        sections: Vec::new(),
        list_button: None,
        reply: None,
    });
    validate_content(&content)?;
    Ok(content)
}

/// Create a list message.
///
/// # Errors
///
/// Returns error if the body is blank or the list has no rows.
pub fn create_list_content(
    body: impl Into<String>,
    list_button: impl Into<String>,
    sections: Vec<ListSection>,
) -> Result<MessageContent, ValidationError> {
    let content = MessageContent::Interactive(InteractiveContent {
        interactive_type: InteractiveType::List,
        body: body.into(),
        header: None,
        footer: None,
        buttons: Vec::new(),
        sections,
        list_button: Some(list_button.into()),
        reply: None,
    });
    validate_content(&content)?;
    Ok(content)
}

/// Structural validation of a content value.
///
/// # Errors
///
/// Returns `ValidationError::InvalidContent` describing the first violated rule.
pub fn validate_content(content: &MessageContent) -> Result<(), ValidationError> {
    match content {
        MessageContent::Text(text) => {
            if text.text.is_empty() {
                return Err(invalid("text must not be empty"));
            }
            if text.text.len() > limits::MAX_MESSAGE_LENGTH {
                return Err(ValidationError::TooLong {
                    max: limits::MAX_MESSAGE_LENGTH,
                    actual: text.text.len(),
                });
            }
            check_ranges(&text.text, &text.formatting)?;
        }
        MessageContent::Media(media) => {
            if media.url.trim().is_empty() {
                return Err(invalid("media url must not be empty"));
            }
            check_ranges(media.caption.as_deref().unwrap_or_default(), &media.caption_formatting)?;
            if let Some(size) = media.size {
                if size > limits::MAX_ATTACHMENT_SIZE as u64 {
                    return Err(ValidationError::TooLong {
                        max: limits::MAX_ATTACHMENT_SIZE,
                        actual: usize::try_from(size).unwrap_or(usize::MAX),
                    });
                }
            }
        }
        MessageContent::Location(location) => {
            if !location.latitude.is_finite() || !(-90.0..=90.0).contains(&location.latitude) {
                return Err(invalid(format!(
                    "latitude {} outside -90..90",
                    location.latitude
                )));
            }
            if !location.longitude.is_finite()
                || !(-180.0..=180.0).contains(&location.longitude)
            {
                return Err(invalid(format!(
                    "longitude {} outside -180..180",
                    location.longitude
                )));
            }
        }
        MessageContent::Contact(contact) => {
            if contact.name.trim().is_empty() {
                return Err(invalid("contact name must not be empty"));
            }
        }
        MessageContent::Interactive(interactive) => {
            if interactive.reply.is_some() {
                return Ok(());
            }
            if interactive.body.trim().is_empty() {
                return Err(invalid("interactive body must not be empty"));
            }
            match interactive.interactive_type {
                InteractiveType::Buttons | InteractiveType::QuickReply => {
                    if interactive.buttons.is_empty() {
                        return Err(invalid("interactive message needs at least one button"));
                    }
                }
                InteractiveType::List => {
                    if interactive.sections.iter().all(|s| s.rows.is_empty()) {
                        return Err(invalid("list message needs at least one row"));
                    }
                }
            }
        }
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidContent(reason.into())
}

fn check_ranges(text: &str, formatting: &[TextFormat]) -> Result<(), ValidationError> {
    let char_len = text.chars().count();
    for range in formatting {
        if range.length == 0 || range.end() > char_len {
            return Err(invalid(format!(
                "formatting range {}..{} outside text of length {char_len}",
                range.offset,
                range.end()
            )));
        }
    }
    Ok(())
}
