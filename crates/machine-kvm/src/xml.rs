//! Minimal XML writer and reader for hypervisor descriptors.
//!
//! The writer escapes every attribute value and text node, so machine names
//! and paths can't inject markup into a descriptor. The reader builds a small
//! element tree and accepts what libvirt emits back: either quote style,
//! self-closing tags, comments, processing instructions, a doctype, CDATA and
//! the predefined and numeric entities.

use crate::error::{DriverError, Result};

const INDENT: &str = "  ";

/// Indenting XML writer.
#[derive(Debug, Default)]
pub struct XmlWriter {
    buf: String,
    open: Vec<&'static str>,
}

impl XmlWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_line(&mut self) {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        for _ in 0..self.open.len() {
            self.buf.push_str(INDENT);
        }
    }

    fn tag(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.buf.push('<');
        self.buf.push_str(name);
        for (key, value) in attrs {
            self.buf.push(' ');
            self.buf.push_str(key);
            self.buf.push_str("='");
            self.buf.push_str(&escape(value));
            self.buf.push('\'');
        }
    }

    /// Open an element; it stays open until the matching [`close`](Self::close).
    pub fn open(&mut self, name: &'static str, attrs: &[(&str, &str)]) -> &mut Self {
        self.start_line();
        self.tag(name, attrs);
        self.buf.push('>');
        self.open.push(name);
        self
    }

    /// Close the innermost open element.
    pub fn close(&mut self) -> &mut Self {
        if let Some(name) = self.open.pop() {
            self.start_line();
            self.buf.push_str("</");
            self.buf.push_str(name);
            self.buf.push('>');
        }
        self
    }

    /// Write a self-closing element.
    pub fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) -> &mut Self {
        self.start_line();
        self.tag(name, attrs);
        self.buf.push_str("/>");
        self
    }

    /// Write an element holding only text.
    pub fn text(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> &mut Self {
        self.start_line();
        self.tag(name, attrs);
        self.buf.push('>');
        self.buf.push_str(&escape(text));
        self.buf.push_str("</");
        self.buf.push_str(name);
        self.buf.push('>');
        self
    }

    /// Close anything still open and return the document.
    pub fn finish(mut self) -> String {
        while !self.open.is_empty() {
            self.close();
        }
        self.buf
    }
}

/// Escape a string for use in text or a quoted attribute value.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let semi = tail
            .find(';')
            .ok_or_else(|| malformed("unterminated entity reference"))?;
        let entity = &tail[..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "apos" => Some('\''),
            "quot" => Some('"'),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
            }
        };
        let c = decoded.ok_or_else(|| malformed(&format!("unknown entity &{entity};")))?;
        out.push(c);
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn malformed(msg: &str) -> DriverError {
    DriverError::Descriptor(msg.to_string())
}

/// A parsed XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    text: String,
}

impl Element {
    /// Attribute value by name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All child elements with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text content with surrounding whitespace removed.
    pub fn text(&self) -> &str {
        self.text.trim()
    }
}

/// Parse a document into its root element.
///
/// # Errors
/// Returns [`DriverError::Descriptor`] if the document is not well formed.
pub fn parse(doc: &str) -> Result<Element> {
    let mut parser = Parser { src: doc, pos: 0 };
    parser.skip_prolog()?;
    if !parser.at("<") {
        return Err(malformed("expected a root element"));
    }
    let root = parser.element()?;
    parser.skip_prolog()?;
    if parser.pos < parser.src.len() {
        return Err(malformed("unexpected content after the root element"));
    }
    Ok(root)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at(&self, prefix: &str) -> bool {
        self.rest().starts_with(prefix)
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<()> {
        let end = self
            .rest()
            .find(terminator)
            .ok_or_else(|| malformed(&format!("missing '{terminator}'")))?;
        self.pos += end + terminator.len();
        Ok(())
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.rest().starts_with(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(malformed(&format!("expected '{c}' at offset {}", self.pos)))
        }
    }

    fn skip_prolog(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            if self.at("<?") {
                self.skip_past("?>")?;
            } else if self.at("<!--") {
                self.skip_past("-->")?;
            } else if self.at("<!") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> Result<String> {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(malformed(&format!("expected a name at offset {}", self.pos)));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn element(&mut self) -> Result<Element> {
        self.expect('<')?;
        let mut element = Element {
            name: self.name()?,
            ..Default::default()
        };

        loop {
            self.skip_ws();
            if self.at("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if self.at(">") {
                self.pos += 1;
                break;
            }
            let key = self.name()?;
            self.skip_ws();
            self.expect('=')?;
            self.skip_ws();
            let quote = match self.rest().chars().next() {
                Some(q @ ('\'' | '"')) => q,
                _ => return Err(malformed(&format!("unquoted value for attribute {key}"))),
            };
            self.pos += 1;
            let end = self
                .rest()
                .find(quote)
                .ok_or_else(|| malformed(&format!("unterminated value for attribute {key}")))?;
            let value = unescape(&self.rest()[..end])?;
            self.pos += end + 1;
            element.attrs.push((key, value));
        }

        loop {
            if self.pos >= self.src.len() {
                return Err(malformed(&format!("element <{}> is never closed", element.name)));
            }
            if self.at("</") {
                self.pos += 2;
                let name = self.name()?;
                self.skip_ws();
                self.expect('>')?;
                if name != element.name {
                    return Err(malformed(&format!(
                        "expected </{}>, found </{name}>",
                        element.name
                    )));
                }
                return Ok(element);
            } else if self.at("<!--") {
                self.skip_past("-->")?;
            } else if self.at("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let end = self
                    .rest()
                    .find("]]>")
                    .ok_or_else(|| malformed("unterminated CDATA section"))?;
                element.text.push_str(&self.rest()[..end]);
                self.pos += end + 3;
            } else if self.at("<?") {
                self.skip_past("?>")?;
            } else if self.at("<") {
                let child = self.element()?;
                element.children.push(child);
            } else {
                let end = self.rest().find('<').unwrap_or(self.rest().len());
                element.text.push_str(&unescape(&self.rest()[..end])?);
                self.pos += end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_layout() {
        let mut w = XmlWriter::new();
        w.open("network", &[]);
        w.text("name", &[], "net0");
        w.empty("bridge", &[("stp", "on")]);
        let doc = w.finish();
        assert_eq!(
            doc,
            "<network>\n  <name>net0</name>\n  <bridge stp='on'/>\n</network>"
        );
    }

    #[test]
    fn test_writer_escapes_values() {
        let mut w = XmlWriter::new();
        w.empty("source", &[("file", "/tmp/a'b<c>&d")]);
        w.text("name", &[], "x</name><evil/>");
        let doc = w.finish();
        assert!(doc.contains("file='/tmp/a&apos;b&lt;c&gt;&amp;d'"));
        assert!(doc.contains("<name>x&lt;/name&gt;&lt;evil/&gt;</name>"));
    }

    #[test]
    fn test_parse_libvirt_style_document() {
        let doc = r#"<?xml version="1.0"?>
<!-- generated -->
<domain type="kvm" id='7'>
  <name>dev</name>
  <devices>
    <interface type='network'>
      <mac address="52:54:00:aa:bb:cc"/>
      <source network='default' bridge='virbr0'/>
    </interface>
  </devices>
</domain>
"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "domain");
        assert_eq!(root.attr("type"), Some("kvm"));
        assert_eq!(root.attr("id"), Some("7"));
        assert_eq!(root.child("name").unwrap().text(), "dev");
        let iface = root.child("devices").unwrap().child("interface").unwrap();
        assert_eq!(iface.child("mac").unwrap().attr("address"), Some("52:54:00:aa:bb:cc"));
        assert_eq!(iface.child("source").unwrap().attr("bridge"), Some("virbr0"));
    }

    #[test]
    fn test_parse_unescapes_entities_and_cdata() {
        let root = parse("<a v='x&amp;y&#65;&#x42;'>1 &lt; 2<![CDATA[<raw>]]></a>").unwrap();
        assert_eq!(root.attr("v"), Some("x&yAB"));
        assert_eq!(root.text(), "1 < 2<raw>");
    }

    #[test]
    fn test_writer_output_parses_back() {
        let mut w = XmlWriter::new();
        w.open("disk", &[("type", "file")]);
        w.empty("source", &[("file", "/srv/it's here.img")]);
        let root = parse(&w.finish()).unwrap();
        assert_eq!(
            root.child("source").unwrap().attr("file"),
            Some("/srv/it's here.img")
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse("").is_err());
        assert!(parse("<a><b></a>").is_err());
        assert!(parse("<a>").is_err());
        assert!(parse("<a x=1/>").is_err());
        assert!(parse("<a x='&bogus;'/>").is_err());
        assert!(parse("<a/><b/>").is_err());
    }

    #[test]
    fn test_children_named_preserves_order() {
        let root = parse("<d><i n='0'/><x/><i n='1'/></d>").unwrap();
        let order: Vec<_> = root.children_named("i").filter_map(|e| e.attr("n")).collect();
        assert_eq!(order, vec!["0", "1"]);
    }
}
