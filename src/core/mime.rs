use mail_parser::{Address, Message, MessageParser, PartType};

use crate::core::models::Representation;

/// Escape the characters notification servers treat as markup.
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Pick what an external viewer gets for a parsed message.
///
/// Strategy:
/// 1. If the message has an HTML body part and `allow_html`, use it verbatim
/// 2. Otherwise synthesize a header block and append the plain text body
///
/// Returns None when the bytes are not a parseable message.
pub fn render_for_viewer(raw: &[u8], allow_html: bool) -> Option<(Representation, String)> {
    let message = MessageParser::default().parse(raw)?;

    if allow_html {
        if let Some(html) = html_part(&message) {
            return Some((Representation::Html, html));
        }
    }

    Some((Representation::Text, text_with_headers(&message)))
}

/// The first real `text/html` body part. mail-parser lists text parts in
/// `html_body` when there is no HTML, so check the part type.
fn html_part(message: &Message<'_>) -> Option<String> {
    message
        .html_body
        .iter()
        .filter_map(|&id| message.part(id))
        .find_map(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        })
}

/// `From`/`To`/`Delivered-To`/`Cc`/`Bcc`/`Subject`, blank line, body text.
fn text_with_headers(message: &Message<'_>) -> String {
    let to = address_list(message.to());
    let cc = address_list(message.cc());
    let bcc = address_list(message.bcc());

    let mut out = String::new();
    out.push_str(&format!("From: {}\n", address_list(message.from()).join(", ")));
    out.push_str(&format!("To: {}\n", to.join(", ")));

    if let Some(delivered_to) = delivered_to(message) {
        let already_addressed = [message.to(), message.cc(), message.bcc()]
            .into_iter()
            .flatten()
            .flat_map(|addr| addr.iter())
            .filter_map(|a| a.address())
            .any(|a| a.eq_ignore_ascii_case(&delivered_to));
        if !already_addressed {
            out.push_str(&format!("Delivered-To: {}\n", delivered_to));
        }
    }
    if !cc.is_empty() {
        out.push_str(&format!("Cc: {}\n", cc.join(", ")));
    }
    if !bcc.is_empty() {
        out.push_str(&format!("Bcc: {}\n", bcc.join(", ")));
    }
    if let Some(subject) = message.subject() {
        out.push_str(&format!("Subject: {}\n", subject));
    }

    out.push('\n');
    if let Some(body) = message.body_text(0) {
        out.push_str(&body);
    }
    out
}

fn delivered_to(message: &Message<'_>) -> Option<String> {
    let raw = message.header_raw("Delivered-To")?;
    let addr = raw.trim().trim_start_matches('<').trim_end_matches('>').trim();
    (!addr.is_empty()).then(|| addr.to_string())
}

fn address_list(addr: Option<&Address<'_>>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    addr.iter()
        .filter_map(|a| match (a.name(), a.address()) {
            (Some(name), Some(address)) => Some(format!("{name} <{address}>")),
            (None, Some(address)) => Some(address.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        })
        .collect()
}
