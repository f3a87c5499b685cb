use std::cmp::Ordering;
use std::fmt::Display;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CastError {
    #[error("Cannot interpret {value:?} as {to}")]
    Invalid { value: String, to: ValueKind },

    #[error("Cannot cast {from} to {to}")]
    Unsupported { from: ValueKind, to: ValueKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    Octets,
    Uint32,
    Bool,
    Ipv4Addr,
    Ipv6Addr,
    Ipv4Prefix,
    Ipv6Prefix,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Octets => "octets",
            Self::Uint32 => "uint32",
            Self::Bool => "bool",
            Self::Ipv4Addr => "ipaddr",
            Self::Ipv6Addr => "ipv6addr",
            Self::Ipv4Prefix => "ipv4prefix",
            Self::Ipv6Prefix => "ipv6prefix",
        };
        write!(f, "{name}")
    }
}

impl ValueKind {
    /// Parse a cast name as written in unlang, e.g. `<ipaddr>10.0.0.1`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "octets" => Some(Self::Octets),
            "integer" | "uint32" => Some(Self::Uint32),
            "bool" => Some(Self::Bool),
            "ipaddr" | "ipv4addr" => Some(Self::Ipv4Addr),
            "ipv6addr" => Some(Self::Ipv6Addr),
            "ipv4prefix" => Some(Self::Ipv4Prefix),
            "ipv6prefix" => Some(Self::Ipv6Prefix),
            _ => None,
        }
    }
}

/// A typed attribute value threaded through the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Octets(Vec<u8>),
    Uint32(u32),
    Bool(bool),
    Ipv4Addr(Ipv4Addr),
    Ipv6Addr(Ipv6Addr),
    Ipv4Prefix(Ipv4Network),
    Ipv6Prefix(Ipv6Network),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::String(_) => ValueKind::String,
            Self::Octets(_) => ValueKind::Octets,
            Self::Uint32(_) => ValueKind::Uint32,
            Self::Bool(_) => ValueKind::Bool,
            Self::Ipv4Addr(_) => ValueKind::Ipv4Addr,
            Self::Ipv6Addr(_) => ValueKind::Ipv6Addr,
            Self::Ipv4Prefix(_) => ValueKind::Ipv4Prefix,
            Self::Ipv6Prefix(_) => ValueKind::Ipv6Prefix,
        }
    }

    /// Cast to another kind, parsing strings where the target demands it.
    pub fn cast(&self, to: ValueKind) -> Result<Value, CastError> {
        if self.kind() == to {
            return Ok(self.clone());
        }

        let invalid = |value: &dyn Display| CastError::Invalid {
            value: value.to_string(),
            to,
        };

        match (self, to) {
            (Self::String(s), ValueKind::Octets) => Ok(Self::Octets(s.clone().into_bytes())),
            (Self::Octets(o), ValueKind::String) => match String::from_utf8(o.clone()) {
                Ok(s) => Ok(Self::String(s)),
                Err(_) => Err(CastError::Unsupported {
                    from: ValueKind::Octets,
                    to,
                }),
            },
            (Self::String(s), ValueKind::Uint32) => {
                s.parse().map(Self::Uint32).map_err(|_| invalid(s))
            }
            (Self::String(s), ValueKind::Bool) => match s.as_str() {
                "yes" | "true" | "1" => Ok(Self::Bool(true)),
                "no" | "false" | "0" => Ok(Self::Bool(false)),
                _ => Err(invalid(s)),
            },
            (Self::String(s), ValueKind::Ipv4Addr) => {
                s.parse().map(Self::Ipv4Addr).map_err(|_| invalid(s))
            }
            (Self::String(s), ValueKind::Ipv6Addr) => {
                s.parse().map(Self::Ipv6Addr).map_err(|_| invalid(s))
            }
            (Self::String(s), ValueKind::Ipv4Prefix) => {
                s.parse().map(Self::Ipv4Prefix).map_err(|_| invalid(s))
            }
            (Self::String(s), ValueKind::Ipv6Prefix) => {
                s.parse().map(Self::Ipv6Prefix).map_err(|_| invalid(s))
            }
            (Self::Uint32(n), ValueKind::String) => Ok(Self::String(n.to_string())),
            (Self::Uint32(n), ValueKind::Bool) => Ok(Self::Bool(*n != 0)),
            (Self::Bool(b), ValueKind::Uint32) => Ok(Self::Uint32(*b as u32)),
            (Self::Ipv4Addr(a), ValueKind::String) => Ok(Self::String(a.to_string())),
            (Self::Ipv6Addr(a), ValueKind::String) => Ok(Self::String(a.to_string())),
            (Self::Ipv4Addr(a), ValueKind::Ipv4Prefix) => Ok(Self::Ipv4Prefix(
                Ipv4Network::new(*a, 32).expect("/32 is always valid"),
            )),
            (Self::Ipv6Addr(a), ValueKind::Ipv6Prefix) => Ok(Self::Ipv6Prefix(
                Ipv6Network::new(*a, 128).expect("/128 is always valid"),
            )),
            (from, to) => Err(CastError::Unsupported {
                from: from.kind(),
                to,
            }),
        }
    }

    /// Ordering used by the comparison operators. Values of different kinds
    /// are compared after casting the right-hand side to the left's kind;
    /// by the time we get here both sides have the same kind.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Octets(a), Self::Octets(b)) => Some(a.cmp(b)),
            (Self::Uint32(a), Self::Uint32(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Ipv4Addr(a), Self::Ipv4Addr(b)) => Some(a.cmp(b)),
            (Self::Ipv6Addr(a), Self::Ipv6Addr(b)) => Some(a.cmp(b)),
            (Self::Ipv4Prefix(a), Self::Ipv4Prefix(b)) => {
                Some(a.ip().cmp(&b.ip()).then(a.prefix().cmp(&b.prefix())))
            }
            (Self::Ipv6Prefix(a), Self::Ipv6Prefix(b)) => {
                Some(a.ip().cmp(&b.ip()).then(a.prefix().cmp(&b.prefix())))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            Self::Octets(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::String(s) => !s.is_empty(),
            Self::Octets(o) => !o.is_empty(),
            Self::Uint32(n) => *n != 0,
            Self::Bool(b) => *b,
            _ => true,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Octets(o) => {
                write!(f, "0x")?;
                for b in o {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Self::Uint32(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{}", if *b { "yes" } else { "no" }),
            Self::Ipv4Addr(a) => write!(f, "{a}"),
            Self::Ipv6Addr(a) => write!(f, "{a}"),
            Self::Ipv4Prefix(p) => write!(f, "{p}"),
            Self::Ipv6Prefix(p) => write!(f, "{p}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Uint32(n)
    }
}

impl From<Ipv4Addr> for Value {
    fn from(a: Ipv4Addr) -> Self {
        Self::Ipv4Addr(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_to_ipaddr_cast() {
        let v = Value::from("10.0.0.1").cast(ValueKind::Ipv4Addr).unwrap();
        assert_eq!(v, Value::Ipv4Addr(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn bad_cast_reports_value() {
        let err = Value::from("not-an-ip")
            .cast(ValueKind::Ipv4Addr)
            .unwrap_err();
        assert!(matches!(err, CastError::Invalid { .. }));
    }

    #[test]
    fn compare_same_kind() {
        assert_eq!(
            Value::from("abc").compare(&Value::from("abd")),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Uint32(2).compare(&Value::Uint32(2)),
            Some(Ordering::Equal)
        );
    }
}
