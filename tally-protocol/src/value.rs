use std::fmt;

/// A borrowed scalar value read out of an event.
#[derive(Debug, Clone, Copy)]
pub enum Val<'a> {
    /// A boolean value.
    Bool(bool),
    /// A signed integer value.
    I64(i64),
    /// An unsigned integer value.
    U64(u64),
    /// A floating point value.
    F64(f64),
    /// A string value.
    String(&'a str),
}

impl<'a> Val<'a> {
    /// Represents the value as `i64` if possible. Returns `None` otherwise.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(*value),
            Self::U64(value) => (*value).try_into().ok(),
            _ => None,
        }
    }

    /// Represents the value as `f64` if possible. Returns `None` otherwise.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::I64(value) => Some(*value as f64),
            Self::U64(value) => Some(*value as f64),
            Self::F64(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the string if this value is a string, otherwise `None`.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    /// Interprets the value as a number.
    ///
    /// In addition to [`as_f64`](Self::as_f64), this parses strings containing a number. Booleans
    /// and non-finite floats are not numbers.
    pub fn to_number(&self) -> Option<f64> {
        let number = match self {
            Self::String(value) => value.trim().parse().ok()?,
            _ => self.as_f64()?,
        };

        number.is_finite().then_some(number)
    }

    /// Returns a short description of the value's type for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::I64(_) | Self::U64(_) => "integer",
            Self::F64(_) => "float",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for Val<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => fmt::Display::fmt(value, f),
            Self::I64(value) => fmt::Display::fmt(value, f),
            Self::U64(value) => fmt::Display::fmt(value, f),
            Self::F64(value) => fmt::Display::fmt(value, f),
            Self::String(value) => fmt::Display::fmt(value, f),
        }
    }
}

impl From<bool> for Val<'_> {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Val<'_> {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<i32> for Val<'_> {
    fn from(value: i32) -> Self {
        Self::I64(value.into())
    }
}

impl From<u64> for Val<'_> {
    fn from(value: u64) -> Self {
        Self::U64(value)
    }
}

impl From<u32> for Val<'_> {
    fn from(value: u32) -> Self {
        Self::U64(value.into())
    }
}

impl From<f64> for Val<'_> {
    fn from(value: f64) -> Self {
        Self::F64(value)
    }
}

impl<'a> From<&'a str> for Val<'a> {
    fn from(value: &'a str) -> Self {
        Self::String(value)
    }
}

impl<'a, T> From<&'a T> for Val<'a>
where
    Val<'a>: From<T>,
    T: Copy,
{
    fn from(value: &'a T) -> Self {
        (*value).into()
    }
}

impl PartialEq for Val<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(l0), Self::Bool(r0)) => l0 == r0,
            (Self::I64(l0), Self::I64(r0)) => l0 == r0,
            (Self::I64(l0), Self::U64(r0)) => Ok(*l0) == (*r0).try_into(),
            (Self::U64(l0), Self::U64(r0)) => l0 == r0,
            (Self::U64(l0), Self::I64(r0)) => Ok(*l0) == (*r0).try_into(),
            (Self::F64(l0), Self::F64(r0)) => l0 == r0,
            (Self::String(l0), Self::String(r0)) => l0 == r0,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Val::I64(-3).to_string(), "-3");
        assert_eq!(Val::U64(42).to_string(), "42");
        assert_eq!(Val::F64(1.5).to_string(), "1.5");
        assert_eq!(Val::Bool(true).to_string(), "true");
        assert_eq!(Val::String("login").to_string(), "login");
    }

    #[test]
    fn test_to_number() {
        assert_eq!(Val::U64(120).to_number(), Some(120.0));
        assert_eq!(Val::String(" 2.5 ").to_number(), Some(2.5));
        assert_eq!(Val::String("fast").to_number(), None);
        assert_eq!(Val::F64(f64::NAN).to_number(), None);
        assert_eq!(Val::Bool(true).to_number(), None);
    }

    #[test]
    fn test_kind() {
        assert_eq!(Val::Bool(false).kind(), "boolean");
        assert_eq!(Val::U64(1).kind(), "integer");
        assert_eq!(Val::F64(1.5).kind(), "float");
        assert_eq!(Val::String("a").kind(), "string");
    }

    #[test]
    fn test_mixed_integer_equality() {
        assert_eq!(Val::I64(5), Val::U64(5));
        assert_ne!(Val::I64(-1), Val::U64(u64::MAX));
        assert_ne!(Val::I64(1), Val::String("1"));
    }
}
