use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tally_protocol::{AccessError, Getter, resolve};

#[derive(Clone, Debug, Eq, PartialEq)]
enum Segment {
    Literal(String),
    /// Index into the distinct tokens of the template.
    Placeholder(usize),
}

/// A metric name with placeholders for event data.
///
/// Placeholders are paths enclosed in angle brackets, for example `http.<route>.time` or
/// `app.<user.id>.<action>`. Every placeholder is replaced with the stringified value that the
/// path resolves to on the event. `<>` and a `<` without a matching `>` are literal text.
///
/// Characters that would break the statsd line format (`:`, `|`, `@`, `#`, whitespace and control
/// characters) are replaced with `_` in substituted values, so a city of `New York` in
/// `visits.<city>` becomes the bucket `visits.New_York`. Literal text of the template is kept as
/// written. Substituted values are never scanned for placeholders again.
///
/// # Example
///
/// ```
/// use tally_dispatch::Template;
/// use tally_protocol::JsonEvent;
///
/// let template = Template::parse("http.<route>.time");
/// let event = JsonEvent::new("request.completed", serde_json::json!({"route": "checkout"}));
/// assert_eq!(template.expand(&event).unwrap(), "http.checkout.time");
///
/// let template = Template::parse("visits.<city>");
/// let event = JsonEvent::new("page.viewed", serde_json::json!({"city": "New York"}));
/// assert_eq!(template.expand(&event).unwrap(), "visits.New_York");
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
    tokens: Vec<String>,
}

impl Template {
    /// Parses a template string.
    ///
    /// Parsing never fails: anything that is not a well-formed placeholder is literal text.
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut tokens: Vec<String> = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(start) = rest.find('<') {
            let (before, after) = rest.split_at(start);
            literal.push_str(before);

            let token = &after[1..];
            let Some(end) = token.find('>') else {
                literal.push_str(after);
                rest = "";
                break;
            };

            if end == 0 {
                // `<>` is not a placeholder, only the `<` is consumed here.
                literal.push('<');
                rest = token;
                continue;
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let token = &token[..end];
            let index = match tokens.iter().position(|t| t == token) {
                Some(index) => index,
                None => {
                    tokens.push(token.to_owned());
                    tokens.len() - 1
                }
            };

            segments.push(Segment::Placeholder(index));
            rest = &after[end + 2..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            source: source.to_owned(),
            segments,
            tokens,
        }
    }

    /// Returns the template string as it was parsed.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the distinct placeholder paths in order of their first occurrence.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    /// Returns `true` if the template contains no placeholders.
    pub fn is_literal(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Substitutes all placeholders with values read from `getter`.
    ///
    /// Each distinct placeholder is resolved exactly once. The first placeholder that cannot be
    /// resolved fails the expansion.
    pub fn expand<G>(&self, getter: &G) -> Result<String, AccessError>
    where
        G: Getter + ?Sized,
    {
        if self.is_literal() {
            return Ok(self.source.clone());
        }

        let values = self
            .tokens
            .iter()
            .map(|token| resolve(getter, token).map(|value| sanitize(&value.to_string())))
            .collect::<Result<Vec<_>, _>>()?;

        let mut expanded = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => expanded.push_str(literal),
                Segment::Placeholder(index) => expanded.push_str(&values[*index]),
            }
        }

        Ok(expanded)
    }
}

/// Parses `template` and expands it against `getter`.
///
/// See [`Template`] for the placeholder syntax.
pub fn expand<G>(getter: &G, template: &str) -> Result<String, AccessError>
where
    G: Getter + ?Sized,
{
    Template::parse(template).expand(getter)
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            ':' | '|' | '@' | '#' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect()
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Serialize for Template {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Template {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Ok(Self::parse(&source))
    }
}
