//! Text exposition format parser.
//!
//! Each sample line is `name[{label="value",...}] value [timestamp_ms]`.
//! `# HELP` / `# TYPE` and other comment lines carry no samples and are
//! skipped. A single malformed line fails the whole payload.

use crate::{Error, Label, Labels, Result, Timestamp, METRIC_NAME_LABEL};

/// One sample as exposed by a target
#[derive(Debug, Clone, PartialEq)]
pub struct ExposedSample {
    /// Includes `__name__`
    pub labels: Labels,
    pub value: f64,
    /// Explicit timestamp, if the target supplied one
    pub timestamp: Option<Timestamp>,
}

/// Parse a whole exposition payload
pub fn parse(body: &str) -> Result<Vec<ExposedSample>> {
    let mut samples = Vec::new();
    for (lineno, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line == "# EOF" {
            break;
        }
        if line.starts_with('#') {
            continue;
        }
        let sample = parse_line(line)
            .map_err(|msg| Error::Scrape(format!("line {}: {}: {:?}", lineno + 1, msg, line)))?;
        samples.push(sample);
    }
    Ok(samples)
}

fn parse_line(line: &str) -> std::result::Result<ExposedSample, String> {
    let mut cursor = Cursor {
        chars: line.char_indices().peekable(),
        src: line,
    };

    let name = cursor.name().ok_or("missing metric name")?;
    let mut labels = vec![Label::new(METRIC_NAME_LABEL, name)];

    cursor.skip_spaces();
    if cursor.eat('{') {
        loop {
            cursor.skip_spaces();
            if cursor.eat('}') {
                break;
            }
            let label = cursor.name().ok_or("expected label name")?;
            cursor.skip_spaces();
            if !cursor.eat('=') {
                return Err(format!("expected '=' after label {:?}", label));
            }
            cursor.skip_spaces();
            let value = cursor.quoted()?;
            if labels.iter().any(|l| l.name == label) {
                return Err(format!("duplicate label {:?}", label));
            }
            labels.push(Label::new(label, value));
            cursor.skip_spaces();
            if cursor.eat(',') {
                continue;
            }
            if cursor.eat('}') {
                break;
            }
            return Err("expected ',' or '}' in label set".into());
        }
    }

    let rest = cursor.rest();
    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or("missing value")
        .and_then(|v| parse_value(v).ok_or("invalid value"))?;
    let timestamp = match fields.next() {
        Some(ts) => Some(ts.parse::<Timestamp>().map_err(|_| format!("invalid timestamp {:?}", ts))?),
        None => None,
    };
    if fields.next().is_some() {
        return Err("unexpected trailing data".into());
    }

    Ok(ExposedSample {
        labels: Labels::new(labels),
        value,
        timestamp,
    })
}

fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> Cursor<'a> {
    fn skip_spaces(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn eat(&mut self, want: char) -> bool {
        if matches!(self.chars.peek(), Some((_, c)) if *c == want) {
            self.chars.next();
            return true;
        }
        false
    }

    fn name(&mut self) -> Option<String> {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.peek() {
            let ok = c.is_ascii_alphabetic() || *c == '_' || *c == ':' || (!out.is_empty() && c.is_ascii_digit());
            if !ok {
                break;
            }
            out.push(*c);
            self.chars.next();
        }
        (!out.is_empty()).then_some(out)
    }

    fn quoted(&mut self) -> std::result::Result<String, String> {
        if !self.eat('"') {
            return Err("expected quoted label value".into());
        }
        let mut out = String::new();
        loop {
            match self.chars.next() {
                None => return Err("unterminated label value".into()),
                Some((_, '"')) => return Ok(out),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, '"')) => out.push('"'),
                    Some((_, other)) => return Err(format!("invalid escape \\{} in label value", other)),
                    None => return Err("unterminated label value".into()),
                },
                Some((_, c)) => out.push(c),
            }
        }
    }

    fn rest(&mut self) -> &'a str {
        match self.chars.peek() {
            Some((i, _)) => &self.src[*i..],
            None => "",
        }
    }
}
