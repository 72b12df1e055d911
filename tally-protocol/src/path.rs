use crate::traits::Getter;
use crate::value::Val;

/// Error returned from [`resolve`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AccessError {
    /// The path is empty or contains an empty component.
    #[error("invalid path '{path}'")]
    InvalidPath {
        /// The offending path.
        path: String,
    },

    /// No field, nested structure, or accessor resolves the path.
    #[error("no field or accessor resolves '{path}'")]
    Missing {
        /// The path that could not be resolved.
        path: String,
    },
}

/// Splits a path into its components.
///
/// Components are separated by `.`. A bracketed component such as `[0]` or `[key]` starts a new
/// component and may be followed directly by another bracket or a `.`. Within components, `\.`,
/// `\[` and `\\` escape the special characters.
///
/// # Example
///
/// ```
/// let components = tally_protocol::split_path("items[0].unit\\.price").unwrap();
/// assert_eq!(components, ["items", "0", "unit.price"]);
/// ```
pub fn split_path(path: &str) -> Result<Vec<String>, AccessError> {
    let invalid = || AccessError::InvalidPath {
        path: path.to_owned(),
    };

    let mut components = Vec::new();
    let mut current = String::new();
    // Set after a closing bracket, which may only be followed by `.`, `[` or the end.
    let mut closed = false;
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    components.push(std::mem::take(&mut current));
                } else if !closed {
                    return Err(invalid());
                }
                closed = false;
            }
            '[' => {
                if !current.is_empty() {
                    components.push(std::mem::take(&mut current));
                }

                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some('\\') => key.push(chars.next().ok_or_else(invalid)?),
                        Some(c) => key.push(c),
                        None => return Err(invalid()),
                    }
                }

                if key.is_empty() {
                    return Err(invalid());
                }

                components.push(key);
                closed = true;
            }
            _ if closed => return Err(invalid()),
            '\\' => current.push(chars.next().ok_or_else(invalid)?),
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        components.push(current);
    } else if !closed {
        return Err(invalid());
    }

    Ok(components)
}

/// Joins components back into a dotted path, escaping dots and backslashes.
fn join_path(components: &[String]) -> String {
    let mut joined = String::new();

    for (index, component) in components.iter().enumerate() {
        if index > 0 {
            joined.push('.');
        }

        for c in component.chars() {
            if matches!(c, '.' | '\\') {
                joined.push('\\');
            }
            joined.push(c);
        }
    }

    joined
}

/// Returns the accessor-style alternative of a field name.
///
/// Accessor names map to field names and vice versa:
///
///  - `getFooBar` → `foo_bar`
///  - `get_foo` → `foo`
///  - `foo_bar` → `getFooBar`
///
/// # Example
///
/// ```
/// use tally_protocol::getter_alias;
///
/// assert_eq!(getter_alias("getTiming").as_deref(), Some("timing"));
/// assert_eq!(getter_alias("route").as_deref(), Some("getRoute"));
/// ```
pub fn getter_alias(name: &str) -> Option<String> {
    if let Some(field) = name.strip_prefix("get_") {
        return (!field.is_empty()).then(|| field.to_owned());
    }

    if let Some(field) = name.strip_prefix("get")
        && field.starts_with(|c: char| c.is_ascii_uppercase())
    {
        return Some(to_snake_case(field));
    }

    if name.is_empty() || !name.starts_with(|c: char| c.is_alphabetic()) {
        return None;
    }

    Some(format!("get{}", to_upper_camel_case(name)))
}

fn to_snake_case(name: &str) -> String {
    let mut snake = String::with_capacity(name.len() + 4);
    let mut previous_upper = true;

    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if !previous_upper {
                snake.push('_');
            }
            snake.push(c.to_ascii_lowercase());
            previous_upper = true;
        } else {
            snake.push(c);
            previous_upper = false;
        }
    }

    snake
}

fn to_upper_camel_case(name: &str) -> String {
    let mut camel = String::with_capacity(name.len());
    let mut upper_next = true;

    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            camel.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            camel.push(c);
        }
    }

    camel
}

fn get_value_or_alias<'a, G>(getter: &'a G, components: &[String]) -> Option<Val<'a>>
where
    G: Getter + ?Sized,
{
    if let Some(value) = getter.get_value(&join_path(components)) {
        return Some(value);
    }

    let (last, parents) = components.split_last()?;
    let mut aliased = parents.to_vec();
    aliased.push(getter_alias(last)?);
    getter.get_value(&join_path(&aliased))
}

fn get_child_or_alias<'a, G>(getter: &'a G, name: &str) -> Option<&'a dyn Getter>
where
    G: Getter + ?Sized,
{
    getter
        .get_child(name)
        .or_else(|| getter.get_child(&getter_alias(name)?))
}

fn lookup<'a, G>(getter: &'a G, components: &[String]) -> Option<Val<'a>>
where
    G: Getter + ?Sized,
{
    if let Some(value) = get_value_or_alias(getter, components) {
        return Some(value);
    }

    let (first, rest) = components.split_first()?;
    if rest.is_empty() {
        return None;
    }

    if let Some(child) = get_child_or_alias(getter, first)
        && let Some(value) = lookup(child, rest)
    {
        return Some(value);
    }

    let (index, rest) = rest.split_first()?;
    if rest.is_empty() {
        return None;
    }

    let index = index.parse::<usize>().ok()?;
    let mut items = getter
        .get_iter(first)
        .or_else(|| getter.get_iter(&getter_alias(first)?))?;

    lookup(items.nth(index)?, rest)
}

/// Resolves a path against a [`Getter`].
///
/// The path is split with [`split_path`] and resolved in this order:
///
///  1. the full path is passed to [`Getter::get_value`], then the same path with the
///     [`getter_alias`] of its last component;
///  2. the first component is looked up as a nested structure with [`Getter::get_child`] (or its
///     alias) and the remainder is resolved against the child;
///  3. if the next component is numeric, the first component is looked up as a collection with
///     [`Getter::get_iter`] and the remainder is resolved against the indexed element.
///
/// # Example
///
/// ```
/// use tally_protocol::{Getter, Val, resolve};
///
/// struct Request {
///     route: String,
///     timing: u64,
/// }
///
/// impl Getter for Request {
///     fn get_value(&self, path: &str) -> Option<Val<'_>> {
///         match path {
///             "route" => Some(self.route.as_str().into()),
///             "timing" => Some(self.timing.into()),
///             _ => None,
///         }
///     }
/// }
///
/// let request = Request { route: "checkout".to_owned(), timing: 120 };
///
/// assert_eq!(resolve(&request, "route"), Ok(Val::String("checkout")));
/// assert_eq!(resolve(&request, "getTiming"), Ok(Val::U64(120)));
/// assert!(resolve(&request, "status").is_err());
/// ```
pub fn resolve<'a, G>(getter: &'a G, path: &str) -> Result<Val<'a>, AccessError>
where
    G: Getter + ?Sized,
{
    let components = split_path(path)?;

    lookup(getter, &components).ok_or_else(|| AccessError::Missing {
        path: path.to_owned(),
    })
}
