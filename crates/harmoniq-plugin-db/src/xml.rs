//! Markup form of a descriptor collection.
//!
//! A document has a single `PLUGINS` root with one `PLUGIN` child per
//! description, every field stored as an attribute. Readers are lenient:
//! children that do not describe a plugin are dropped and the remaining ones
//! are still returned.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::PluginDescription;

const ROOT_TAG: &str = "PLUGINS";
const PLUGIN_TAG: &str = "PLUGIN";

/// Document sent back when there is nothing to report.
pub const EMPTY_DOCUMENT: &str = "<PLUGINS/>";

#[derive(Debug, Error)]
pub enum DescriptorXmlError {
    #[error("malformed descriptor document: {0}")]
    Parse(String),
    #[error("descriptor document has no root element")]
    MissingRoot,
    #[error("failed to write descriptor document: {0}")]
    Write(String),
    #[error("descriptor document is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub fn descriptors_to_xml(
    descriptions: &[PluginDescription],
) -> Result<String, DescriptorXmlError> {
    let mut writer = Writer::new(Vec::new());
    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    write(&mut writer, Event::Start(BytesStart::new(ROOT_TAG)))?;
    for description in descriptions {
        write(&mut writer, Event::Empty(plugin_element(description)))?;
    }
    write(&mut writer, Event::End(BytesEnd::new(ROOT_TAG)))?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), DescriptorXmlError> {
    writer
        .write_event(event)
        .map_err(|err| DescriptorXmlError::Write(err.to_string()))
}

fn plugin_element(description: &PluginDescription) -> BytesStart<'static> {
    let mut element = BytesStart::new(PLUGIN_TAG);
    element.push_attribute(("name", description.name.as_str()));
    element.push_attribute(("descriptiveName", description.descriptive_name.as_str()));
    element.push_attribute(("format", description.format.as_str()));
    element.push_attribute(("category", description.category.as_str()));
    element.push_attribute(("manufacturer", description.manufacturer.as_str()));
    element.push_attribute(("version", description.version.as_str()));
    element.push_attribute(("file", description.file_or_identifier.as_str()));
    element.push_attribute(("uniqueId", description.unique_id.as_str()));
    element.push_attribute(("isInstrument", bool_attr(description.is_instrument)));
    element.push_attribute(("hasEditor", bool_attr(description.has_editor)));
    element.push_attribute(("numInputs", description.num_inputs.to_string().as_str()));
    element.push_attribute(("numOutputs", description.num_outputs.to_string().as_str()));
    element
}

fn bool_attr(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Parses every well-formed `PLUGIN` child of the document root.
///
/// Only a document that cannot be read at all is an error; malformed children
/// are skipped.
pub fn descriptors_from_xml(text: &str) -> Result<Vec<PluginDescription>, DescriptorXmlError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut saw_root = false;
    let mut descriptions = Vec::new();
    loop {
        let event = reader
            .read_event()
            .map_err(|err| DescriptorXmlError::Parse(err.to_string()))?;
        match event {
            Event::Start(element) => {
                if depth == 0 {
                    saw_root = true;
                } else if depth == 1 {
                    collect(&element, &mut descriptions);
                }
                depth += 1;
            }
            Event::Empty(element) => {
                if depth == 0 {
                    saw_root = true;
                } else if depth == 1 {
                    collect(&element, &mut descriptions);
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(DescriptorXmlError::MissingRoot);
    }
    Ok(descriptions)
}

fn collect(element: &BytesStart<'_>, descriptions: &mut Vec<PluginDescription>) {
    match description_from_element(element) {
        Some(description) => descriptions.push(description),
        None => log::debug!(
            "skipping malformed descriptor element <{}>",
            String::from_utf8_lossy(element.name().as_ref())
        ),
    }
}

fn description_from_element(element: &BytesStart<'_>) -> Option<PluginDescription> {
    if element.name().as_ref() != PLUGIN_TAG.as_bytes() {
        return None;
    }

    let mut description = PluginDescription::default();
    let mut has_name = false;
    let mut has_format = false;
    let mut has_file = false;
    let mut has_descriptive_name = false;

    for attribute in element.attributes() {
        let attribute = attribute.ok()?;
        let value = attribute.unescape_value().ok()?.into_owned();
        match attribute.key.as_ref() {
            b"name" => {
                has_name = !value.is_empty();
                description.name = value;
            }
            b"descriptiveName" => {
                has_descriptive_name = !value.is_empty();
                description.descriptive_name = value;
            }
            b"format" => {
                has_format = !value.is_empty();
                description.format = value;
            }
            b"file" => {
                has_file = !value.is_empty();
                description.file_or_identifier = value;
            }
            b"category" => description.category = value,
            b"manufacturer" => description.manufacturer = value,
            b"version" => description.version = value,
            b"uniqueId" => description.unique_id = value,
            b"isInstrument" => description.is_instrument = parse_bool(&value)?,
            b"hasEditor" => description.has_editor = parse_bool(&value)?,
            b"numInputs" => description.num_inputs = value.parse().ok()?,
            b"numOutputs" => description.num_outputs = value.parse().ok()?,
            _ => {}
        }
    }

    if !(has_name && has_format && has_file) {
        return None;
    }
    if !has_descriptive_name {
        description.descriptive_name = description.name.clone();
    }
    Some(description)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}
