//! Wire codecs for letters and messages
//!
//! Three representations are supported. The bit-efficient form is the
//! default between cooperating transport services and is handled by
//! postcard. The string form is generated for payloads handed to foreign
//! proxies and for error descriptions. The XML form carries whole envelopes
//! to foreign proxy peers.

use super::envelope::{Envelope, Letter, Representation};
use super::message::{AclMessage, AgentId};
use crate::error::{Error, Result};

/// Serialize a whole letter in the given representation.
pub fn encode_letter(letter: &Letter, representation: Representation) -> Result<Vec<u8>> {
    match representation {
        Representation::Bitefficient => postcard::to_allocvec(letter)
            .map_err(|err| Error::InvalidArgument(format!("letter encoding failed: {}", err))),
        Representation::Xml => xml::write_letter(letter),
        Representation::StringRep => Err(Error::InvalidArgument(
            "the string representation covers messages, not envelopes".to_string(),
        )),
    }
}

/// Parse a letter from its wire form.
pub fn decode_letter(data: &[u8], representation: Representation) -> Result<Letter> {
    match representation {
        Representation::Bitefficient => postcard::from_bytes(data)
            .map_err(|err| Error::InvalidArgument(format!("letter decoding failed: {}", err))),
        Representation::Xml => xml::read_letter(data),
        Representation::StringRep => Err(Error::InvalidArgument(
            "the string representation covers messages, not envelopes".to_string(),
        )),
    }
}

/// Serialize a message for use as letter payload.
pub fn encode_message(message: &AclMessage, representation: Representation) -> Result<Vec<u8>> {
    match representation {
        Representation::Bitefficient => postcard::to_allocvec(message)
            .map_err(|err| Error::InvalidArgument(format!("message encoding failed: {}", err))),
        Representation::StringRep => Ok(message_to_string(message).into_bytes()),
        Representation::Xml => Err(Error::InvalidArgument(
            "xml message payloads are not supported".to_string(),
        )),
    }
}

/// Parse a message from letter payload bytes.
pub fn decode_message(data: &[u8], representation: Representation) -> Result<AclMessage> {
    match representation {
        Representation::Bitefficient => postcard::from_bytes(data)
            .map_err(|err| Error::InvalidArgument(format!("message decoding failed: {}", err))),
        other => Err(Error::InvalidArgument(format!(
            "no message parser for representation '{}'",
            other.as_str()
        ))),
    }
}

/// Render a message in the FIPA string (s-expression) form. Empty optional
/// slots are omitted.
pub fn message_to_string(message: &AclMessage) -> String {
    let mut out = String::new();
    out.push('(');
    out.push_str(message.performative.as_str());
    out.push_str("\n :sender ");
    push_agent(&mut out, &message.sender);
    if !message.receivers.is_empty() {
        out.push_str("\n :receiver (set");
        for receiver in &message.receivers {
            out.push(' ');
            push_agent(&mut out, receiver);
        }
        out.push(')');
    }
    if !message.reply_to.is_empty() {
        out.push_str("\n :reply-to (set");
        for agent in &message.reply_to {
            out.push(' ');
            push_agent(&mut out, agent);
        }
        out.push(')');
    }
    if !message.content.is_empty() {
        out.push_str("\n :content \"");
        for ch in message.content.chars() {
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                other => out.push(other),
            }
        }
        out.push('"');
    }
    push_slot(&mut out, "language", &message.language);
    push_slot(&mut out, "encoding", &message.encoding);
    push_slot(&mut out, "ontology", &message.ontology);
    push_slot(&mut out, "protocol", &message.protocol);
    push_slot(&mut out, "conversation-id", &message.conversation_id);
    push_slot(&mut out, "reply-with", &message.reply_with);
    push_slot(&mut out, "in-reply-to", &message.in_reply_to);
    out.push_str("\n)");
    out
}

fn push_slot(out: &mut String, slot: &str, value: &str) {
    if !value.is_empty() {
        out.push_str("\n :");
        out.push_str(slot);
        out.push(' ');
        out.push_str(value);
    }
}

fn push_agent(out: &mut String, agent: &AgentId) {
    out.push_str("(agent-identifier :name ");
    out.push_str(&agent.name);
    if !agent.addresses.is_empty() {
        out.push_str(" :addresses (sequence");
        for address in &agent.addresses {
            out.push(' ');
            out.push_str(address);
        }
        out.push(')');
    }
    out.push(')');
}

mod xml {
    //! XML envelope form for foreign proxy peers. The payload must be valid
    //! UTF-8 in this representation; the proxy path always carries
    //! string-form message payloads.

    use super::{AgentId, Envelope, Error, Letter, Representation, Result};
    use crate::acl::envelope::BaseEnvelope;
    use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
    use quick_xml::{Reader, Writer};

    fn write_err(err: impl std::fmt::Display) -> Error {
        Error::InvalidArgument(format!("xml envelope write failed: {}", err))
    }

    fn read_err(err: impl std::fmt::Display) -> Error {
        Error::InvalidArgument(format!("xml envelope parse failed: {}", err))
    }

    pub fn write_letter(letter: &Letter) -> Result<Vec<u8>> {
        let payload = std::str::from_utf8(letter.payload()).map_err(|_| {
            Error::InvalidArgument("xml envelopes require utf-8 payloads".to_string())
        })?;

        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(write_err)?;
        start(&mut writer, "envelope")?;

        start(&mut writer, "base")?;
        let base = letter.base_envelope();
        if let Some(from) = &base.from {
            start(&mut writer, "from")?;
            agent(&mut writer, from)?;
            end(&mut writer, "from")?;
        }
        agent_list(&mut writer, "to", &base.to)?;
        agent_list(&mut writer, "intended-receiver", &base.intended_receivers)?;
        if let Some(representation) = base.acl_representation {
            text_element(&mut writer, "acl-representation", representation.as_str())?;
        }
        if let Some(length) = base.payload_length {
            text_element(&mut writer, "payload-length", &length.to_string())?;
        }
        end(&mut writer, "base")?;

        for extra in letter.extra_envelopes() {
            start(&mut writer, "extra")?;
            if let Some(from) = &extra.from {
                start(&mut writer, "from")?;
                agent(&mut writer, from)?;
                end(&mut writer, "from")?;
            }
            if let Some(to) = &extra.to {
                agent_list(&mut writer, "to", to)?;
            }
            if let Some(receivers) = &extra.intended_receivers {
                agent_list(&mut writer, "intended-receiver", receivers)?;
            }
            if let Some(representation) = extra.acl_representation {
                text_element(&mut writer, "acl-representation", representation.as_str())?;
            }
            if let Some(length) = extra.payload_length {
                text_element(&mut writer, "payload-length", &length.to_string())?;
            }
            end(&mut writer, "extra")?;
        }

        agent_list(&mut writer, "received", letter.delivery_path())?;
        text_element(&mut writer, "payload", payload)?;

        end(&mut writer, "envelope")?;
        Ok(writer.into_inner())
    }

    fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
        writer
            .write_event(Event::Start(BytesStart::new(name)))
            .map_err(write_err)
    }

    fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
        writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(write_err)
    }

    fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
        start(writer, name)?;
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(write_err)?;
        end(writer, name)
    }

    fn agent(writer: &mut Writer<Vec<u8>>, agent: &AgentId) -> Result<()> {
        start(writer, "agent-identifier")?;
        text_element(writer, "name", &agent.name)?;
        for address in &agent.addresses {
            text_element(writer, "url", address)?;
        }
        end(writer, "agent-identifier")
    }

    fn agent_list(writer: &mut Writer<Vec<u8>>, wrapper: &str, agents: &[AgentId]) -> Result<()> {
        start(writer, wrapper)?;
        for entry in agents {
            agent(writer, entry)?;
        }
        end(writer, wrapper)
    }

    pub fn read_letter(data: &[u8]) -> Result<Letter> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::InvalidArgument("xml envelope is not utf-8".to_string()))?;
        let mut reader = Reader::from_str(text);

        let mut base = BaseEnvelope::default();
        let mut extras: Vec<Envelope> = Vec::new();
        let mut delivery_path: Vec<AgentId> = Vec::new();
        let mut payload: Vec<u8> = Vec::new();

        loop {
            match reader.read_event().map_err(read_err)? {
                Event::Start(element) => match element.name().as_ref() {
                    b"envelope" => {}
                    b"base" => {
                        let params = read_params(&mut reader, b"base")?;
                        base = BaseEnvelope {
                            from: params.from,
                            to: params.to.unwrap_or_default(),
                            intended_receivers: params.intended_receivers.unwrap_or_default(),
                            acl_representation: params.acl_representation,
                            payload_length: params.payload_length,
                        };
                    }
                    b"extra" => {
                        let params = read_params(&mut reader, b"extra")?;
                        extras.push(Envelope {
                            from: params.from,
                            to: params.to,
                            intended_receivers: params.intended_receivers,
                            acl_representation: params.acl_representation,
                            payload_length: params.payload_length,
                        });
                    }
                    b"received" => {
                        delivery_path = read_agent_list(&mut reader, b"received")?;
                    }
                    b"payload" => {
                        let text = reader.read_text(element.name()).map_err(read_err)?;
                        payload = text.into_owned().into_bytes();
                    }
                    other => {
                        return Err(read_err(format!(
                            "unexpected element '{}'",
                            String::from_utf8_lossy(other)
                        )));
                    }
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let mut letter = Letter::default();
        letter.replace_base(base);
        for extra in extras {
            letter.add_extra_envelope(extra);
        }
        for agent in delivery_path {
            letter.stamp(agent);
        }
        letter.set_payload(payload);
        Ok(letter)
    }

    /// Accumulator for the shared children of `base` and `extra` elements.
    #[derive(Default)]
    struct Params {
        from: Option<AgentId>,
        to: Option<Vec<AgentId>>,
        intended_receivers: Option<Vec<AgentId>>,
        acl_representation: Option<Representation>,
        payload_length: Option<usize>,
    }

    fn read_params(reader: &mut Reader<&[u8]>, wrapper: &[u8]) -> Result<Params> {
        let mut params = Params::default();
        loop {
            match reader.read_event().map_err(read_err)? {
                Event::Start(element) => match element.name().as_ref() {
                    b"from" => {
                        params.from = read_agent_list(reader, b"from")?.into_iter().next();
                    }
                    b"to" => {
                        params.to = Some(read_agent_list(reader, b"to")?);
                    }
                    b"intended-receiver" => {
                        params.intended_receivers =
                            Some(read_agent_list(reader, b"intended-receiver")?);
                    }
                    b"acl-representation" => {
                        let text = reader.read_text(element.name()).map_err(read_err)?;
                        params.acl_representation = Some(Representation::from_str_name(&text)?);
                    }
                    b"payload-length" => {
                        let text = reader.read_text(element.name()).map_err(read_err)?;
                        params.payload_length = Some(text.trim().parse().map_err(read_err)?);
                    }
                    other => {
                        return Err(read_err(format!(
                            "unexpected envelope parameter '{}'",
                            String::from_utf8_lossy(other)
                        )));
                    }
                },
                Event::End(element) if element.name().as_ref() == wrapper => break,
                Event::Eof => return Err(read_err("truncated envelope")),
                _ => {}
            }
        }
        Ok(params)
    }

    fn read_agent_list(reader: &mut Reader<&[u8]>, wrapper: &[u8]) -> Result<Vec<AgentId>> {
        let mut agents = Vec::new();
        loop {
            match reader.read_event().map_err(read_err)? {
                Event::Start(element) if element.name().as_ref() == b"agent-identifier" => {
                    agents.push(read_agent(reader)?);
                }
                Event::End(element) if element.name().as_ref() == wrapper => break,
                Event::Eof => return Err(read_err("truncated agent list")),
                _ => {}
            }
        }
        Ok(agents)
    }

    fn read_agent(reader: &mut Reader<&[u8]>) -> Result<AgentId> {
        let mut agent = AgentId::default();
        loop {
            match reader.read_event().map_err(read_err)? {
                Event::Start(element) => match element.name().as_ref() {
                    b"name" => {
                        agent.name = reader
                            .read_text(element.name())
                            .map_err(read_err)?
                            .into_owned();
                    }
                    b"url" => {
                        let url = reader.read_text(element.name()).map_err(read_err)?;
                        agent.addresses.push(url.into_owned());
                    }
                    other => {
                        return Err(read_err(format!(
                            "unexpected agent field '{}'",
                            String::from_utf8_lossy(other)
                        )));
                    }
                },
                Event::End(element) if element.name().as_ref() == b"agent-identifier" => break,
                Event::Eof => return Err(read_err("truncated agent identifier")),
                _ => {}
            }
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::message::Performative;

    fn sample_letter() -> Letter {
        let mut message = AclMessage::new(Performative::Request);
        message.sender = AgentId::with_addresses("alpha", vec!["tcp://10.0.0.1:7000".to_string()]);
        message.add_receiver(AgentId::new("beta"));
        message.content = "do the thing".to_string();
        message.ontology = "task-ontology".to_string();
        message.conversation_id = "conv-7".to_string();
        Letter::new(message, Representation::Bitefficient).unwrap()
    }

    #[test]
    fn bitefficient_letter_round_trip() {
        let mut letter = sample_letter();
        letter.stamp(AgentId::new("mts-0"));
        let data = encode_letter(&letter, Representation::Bitefficient).unwrap();
        let decoded = decode_letter(&data, Representation::Bitefficient).unwrap();
        assert_eq!(decoded, letter);
    }

    #[test]
    fn xml_letter_round_trip() {
        let mut letter = sample_letter();
        letter.stamp(AgentId::new("mts-0"));
        let content = message_to_string(&letter.message().unwrap());
        letter.add_extra_envelope(Envelope {
            acl_representation: Some(Representation::StringRep),
            payload_length: Some(content.len()),
            ..Envelope::default()
        });
        letter.set_payload(content.clone().into_bytes());

        let data = encode_letter(&letter, Representation::Xml).unwrap();
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.starts_with("<?xml"));

        let decoded = decode_letter(&data, Representation::Xml).unwrap();
        assert_eq!(decoded.payload(), content.as_bytes());
        let extra = decoded.extra_envelopes().last().unwrap();
        assert_eq!(extra.acl_representation, Some(Representation::StringRep));
        assert_eq!(extra.payload_length, Some(content.len()));
        assert_eq!(decoded.delivery_path_string(), "mts-0");
        assert_eq!(
            decoded.base_envelope().from,
            Some(AgentId::new("alpha"))
        );
    }

    #[test]
    fn string_rep_contains_slots() {
        let letter = sample_letter();
        let text = message_to_string(&letter.message().unwrap());
        assert!(text.starts_with("(request"));
        assert!(text.contains(":sender (agent-identifier :name alpha"));
        assert!(text.contains(":receiver (set (agent-identifier :name beta))"));
        assert!(text.contains(":content \"do the thing\""));
        assert!(text.contains(":ontology task-ontology"));
        assert!(text.ends_with(")"));
    }

    #[test]
    fn string_rep_escapes_quotes() {
        let mut message = AclMessage::new(Performative::Inform);
        message.sender = AgentId::new("a");
        message.content = "say \"hi\"".to_string();
        let text = message_to_string(&message);
        assert!(text.contains(":content \"say \\\"hi\\\"\""));
    }
}
