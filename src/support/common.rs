use std::borrow::Cow;
use std::io::{self, Write};

use crate::support::debug::{self, InfoLevel};

pub trait LineBreakUtil {
    fn append_line_break(&mut self);
}

impl LineBreakUtil for String {
    fn append_line_break(&mut self) {
        self.push('\r');
        self.push('\n');
    }
}

impl LineBreakUtil for Vec<u8> {
    fn append_line_break(&mut self) {
        self.extend_from_slice(b"\r\n");
    }
}

pub(crate) fn write_to_buff<W: Write + ?Sized>(buffer: &mut W, content: &[u8]) -> io::Result<()> {
    buffer.write_all(content).map_err(|err| {
        debug::print(
            &format!("An error has taken place when writing the response to the stream: {}", err),
            InfoLevel::Warning,
        );
        err
    })
}

pub(crate) fn flush_buffer<W: Write + ?Sized>(buffer: &mut W) -> io::Result<()> {
    buffer.flush().map_err(|err| {
        debug::print(
            &format!("An error has taken place when flushing the response to the stream: {}", err),
            InfoLevel::Warning,
        );
        err
    })
}

/// Percent-decode one URL component; `+` becomes a space when `form` is set. Undecodable input is
/// returned untouched.
pub(crate) fn decode_component(raw: &str, form: bool) -> String {
    let source: Cow<str> = if form && raw.contains('+') {
        Cow::Owned(raw.replace('+', " "))
    } else {
        Cow::Borrowed(raw)
    };

    match urlencoding::decode(&source) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => source.into_owned(),
    }
}

/// Parse `a=1&b=2&a=3` into ordered pairs.
pub(crate) fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.find('=') {
            Some(pos) => (
                decode_component(&pair[..pos], true),
                decode_component(&pair[pos + 1..], true),
            ),
            None => (decode_component(pair, true), String::new()),
        })
        .collect()
}

/// Escape text for inclusion in generated HTML.
pub(crate) fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }

    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_keep_order_and_decode() {
        let pairs = parse_query("a=1&b=hello+world&a=%2Fx&flag&&");
        assert_eq!(
            pairs,
            vec![
                ("a".to_owned(), "1".to_owned()),
                ("b".to_owned(), "hello world".to_owned()),
                ("a".to_owned(), "/x".to_owned()),
                ("flag".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn path_decoding_keeps_plus() {
        assert_eq!(decode_component("/a+b%20c", false), "/a+b c");
        assert_eq!(decode_component("%zz", false), "%zz");
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(html_escape("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }
}
