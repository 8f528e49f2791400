//! Annotation and label templating.
//!
//! Supports `{{ $labels.<name> }}`, `{{ $value }}` and simple pipelines
//! through `humanize`, `humanizePercentage`, `humanizeDuration`, `title`,
//! `toUpper`, `toLower` and `printf "<fmt>"`. Functions are written either
//! as a prefix (`humanize $value`) or after a pipe (`$value | humanize`).

use crate::{Error, Labels, Result};

/// Data available to a template
pub struct TemplateData<'a> {
    pub labels: &'a Labels,
    pub value: f64,
}

enum Arg {
    Str(String),
    Num(f64),
}

impl Arg {
    fn into_string(self) -> String {
        match self {
            Arg::Str(s) => s,
            Arg::Num(v) => format_value(v),
        }
    }

    fn as_number(&self) -> Result<f64> {
        match self {
            Arg::Num(v) => Ok(*v),
            Arg::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("cannot convert {:?} to a number", s))),
        }
    }
}

/// Expand every `{{ ... }}` action in `text`
pub fn expand(text: &str, data: &TemplateData) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| Error::Config(format!("unclosed action in template {:?}", text)))?;
        out.push_str(&eval_action(after[..end].trim(), data)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Expand, substituting the error text on failure
pub fn expand_lossy(text: &str, data: &TemplateData) -> String {
    expand(text, data).unwrap_or_else(|e| format!("<error expanding template: {}>", e))
}

/// Check that a template parses, using placeholder data
pub fn validate(text: &str) -> Result<()> {
    let labels = Labels::empty();
    expand(
        text,
        &TemplateData {
            labels: &labels,
            value: 0.0,
        },
    )
    .map(|_| ())
}

fn eval_action(action: &str, data: &TemplateData) -> Result<String> {
    let mut stages = action.split('|').map(str::trim);
    let first = stages.next().unwrap_or_default();

    let words = split_words(first)?;
    let mut value = match words.as_slice() {
        [] => return Err(Error::Config("empty template action".into())),
        [single] => operand(single, data)?,
        [func, args @ ..] => {
            let mut args = args.iter().map(|a| operand(a, data)).collect::<Result<Vec<_>>>()?;
            let input = args.pop().ok_or_else(|| Error::Config(format!("missing argument to {}", func)))?;
            call(func, &args, input)?
        }
    };

    for stage in stages {
        let words = split_words(stage)?;
        let (func, args) = words
            .split_first()
            .ok_or_else(|| Error::Config("empty pipeline stage".into()))?;
        let args = args.iter().map(|a| operand(a, data)).collect::<Result<Vec<_>>>()?;
        value = call(func, &args, value)?;
    }
    Ok(value.into_string())
}

fn operand(word: &str, data: &TemplateData) -> Result<Arg> {
    if word == "$value" {
        return Ok(Arg::Num(data.value));
    }
    if let Some(name) = word.strip_prefix("$labels.") {
        return Ok(Arg::Str(data.labels.get(name).unwrap_or_default().to_string()));
    }
    if let Some(quoted) = word.strip_prefix('"').and_then(|w| w.strip_suffix('"')) {
        return Ok(Arg::Str(quoted.to_string()));
    }
    if let Ok(v) = word.parse::<f64>() {
        return Ok(Arg::Num(v));
    }
    Err(Error::Config(format!("unknown template operand {:?}", word)))
}

fn call(func: &str, args: &[Arg], input: Arg) -> Result<Arg> {
    let out = match (func, args) {
        ("humanize", []) => humanize(input.as_number()?),
        ("humanizePercentage", []) => format!("{}%", format_sig(input.as_number()? * 100.0)),
        ("humanizeDuration", []) => humanize_duration(input.as_number()?),
        ("toUpper", []) => input.into_string().to_uppercase(),
        ("toLower", []) => input.into_string().to_lowercase(),
        ("title", []) => title(&input.into_string()),
        ("printf", [Arg::Str(fmt)]) => printf(fmt, input)?,
        _ => return Err(Error::Config(format!("unknown template function {:?}", func))),
    };
    Ok(Arg::Str(out))
}

fn split_words(s: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut word = String::new();
        if c == '"' {
            word.push(c);
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => word.push(ch),
                    None => return Err(Error::Config("unterminated string in template".into())),
                }
            }
            word.push('"');
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                word.push(ch);
                chars.next();
            }
        }
        words.push(word);
    }
    Ok(words)
}

/// Only `%s`, `%d`, `%f` and `%.Nf` verbs are supported
fn printf(fmt: &str, input: Arg) -> Result<String> {
    let Some(pos) = fmt.find('%') else {
        return Ok(fmt.to_string());
    };
    let (head, verb) = fmt.split_at(pos);
    let verb = &verb[1..];
    let (rendered, consumed) = if let Some(rest) = verb.strip_prefix('s') {
        (input.into_string(), verb.len() - rest.len())
    } else if verb.starts_with('d') {
        (format!("{}", input.as_number()?.trunc() as i64), 1)
    } else if verb.starts_with('f') {
        (format!("{:.6}", input.as_number()?), 1)
    } else if let Some(precision) = verb.strip_prefix('.') {
        let digits: String = precision.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !precision[digits.len()..].starts_with('f') {
            return Err(Error::Config(format!("unsupported printf verb in {:?}", fmt)));
        }
        let p: usize = digits.parse().unwrap_or(0);
        (format!("{:.*}", p, input.as_number()?), 1 + digits.len() + 1)
    } else {
        return Err(Error::Config(format!("unsupported printf verb in {:?}", fmt)));
    };
    Ok(format!("{}{}{}", head, rendered, &verb[consumed..]))
}

fn title(s: &str) -> String {
    s.split(' ')
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a sample value the way the query API does
pub fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        format!("{}", v)
    }
}

/// Four significant digits, trailing zeros removed
fn format_sig(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format_value(v);
    }
    let magnitude = v.abs().log10().floor() as i32;
    if !(-5..15).contains(&magnitude) {
        return format!("{:.3e}", v);
    }
    let decimals = (3 - magnitude).max(0) as usize;
    let s = format!("{:.*}", decimals, v);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// SI-prefixed value, e.g. `1.235k`
pub fn humanize(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format_sig(v);
    }
    const LARGE: [&str; 6] = ["k", "M", "G", "T", "P", "E"];
    const SMALL: [&str; 6] = ["m", "u", "n", "p", "f", "a"];

    let mut scaled = v;
    if v.abs() >= 1.0 {
        let mut prefix = "";
        for p in LARGE {
            if scaled.abs() < 1000.0 {
                break;
            }
            scaled /= 1000.0;
            prefix = p;
        }
        return format!("{}{}", format_sig(scaled), prefix);
    }
    let mut prefix = "";
    for p in SMALL {
        if scaled.abs() >= 1.0 {
            break;
        }
        scaled *= 1000.0;
        prefix = p;
    }
    format!("{}{}", format_sig(scaled), prefix)
}

/// Seconds as `1d 2h 3m 4s`; sub-second values as ms / us
pub fn humanize_duration(secs: f64) -> String {
    if !secs.is_finite() {
        return format_value(secs);
    }
    let sign = if secs < 0.0 { "-" } else { "" };
    let secs = secs.abs();
    if secs < 1.0 {
        if secs == 0.0 {
            return "0s".into();
        }
        if secs >= 1e-3 {
            return format!("{}{}ms", sign, format_sig(secs * 1e3));
        }
        return format!("{}{}us", sign, format_sig(secs * 1e6));
    }

    let whole = secs.trunc() as u64;
    let (days, hours, minutes, seconds) = (whole / 86_400, whole / 3600 % 24, whole / 60 % 60, whole % 60);
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{}s", seconds));
    }
    format!("{}{}", sign, parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(text: &str, value: f64) -> String {
        let labels = Labels::from_pairs(&[("instance", "host-1:9100"), ("job", "node")]);
        expand(text, &TemplateData { labels: &labels, value }).unwrap()
    }

    #[test]
    fn test_labels_and_value() {
        assert_eq!(
            render("{{ $labels.instance }} of {{$labels.job}} is at {{ $value }}", 0.5),
            "host-1:9100 of node is at 0.5"
        );
        assert_eq!(render("missing: [{{ $labels.nope }}]", 0.0), "missing: []");
        assert_eq!(render("no actions", 1.0), "no actions");
    }

    #[test]
    fn test_pipelines() {
        assert_eq!(render("{{ $value | humanize }}", 1234.0), "1.234k");
        assert_eq!(render("{{ humanize $value }}", 0.0015), "1.5m");
        assert_eq!(render("{{ $value | humanizePercentage }}", 0.256), "25.6%");
        assert_eq!(render("{{ $value | humanizeDuration }}", 93784.0), "1d 2h 3m 4s");
        assert_eq!(render("{{ $labels.job | toUpper }}", 0.0), "NODE");
        assert_eq!(render("{{ printf \"%.2f\" $value }}", 3.14159), "3.14");
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize(0.0), "0");
        assert_eq!(humanize(999.0), "999");
        assert_eq!(humanize(1_500_000.0), "1.5M");
        assert_eq!(humanize_duration(0.25), "250ms");
        assert_eq!(humanize_duration(60.0), "1m");
    }

    #[test]
    fn test_errors() {
        assert!(validate("{{ $value").is_err());
        assert!(validate("{{ bogus $value }}").is_err());
        assert!(validate("{{ }}").is_err());
        assert!(validate("{{ $value | humanize }}").is_ok());

        let labels = Labels::empty();
        let out = expand_lossy("{{ nope }}", &TemplateData { labels: &labels, value: 1.0 });
        assert!(out.starts_with("<error expanding template"));
    }
}
