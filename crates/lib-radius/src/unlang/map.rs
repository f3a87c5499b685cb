use thiserror::Error;
use tracing::trace;

use crate::request::Request;
use crate::types::Value;
use crate::unlang::{AttrIndex, AttrPath, Dictionary, Template, TemplateError};

#[derive(Debug, Error)]
pub enum MapError {
    #[error("Unknown operator '{0}' in map entry")]
    UnknownOp(String),

    #[error("Map entry for '{0}' requires a value")]
    MissingValue(String),

    #[error("Left side of a map entry must be an attribute reference, got '{0}'")]
    BadLhs(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Operators an `update` block supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    /// `=`: set only when no pair with that name exists yet.
    SetIfMissing,
    /// `:=`: replace every existing pair with the one value.
    Assign,
    /// `+=`: append another pair.
    Add,
    /// `==`: filter, keep only pairs equal to the value.
    Filter,
    /// `!*`: unary wildcard delete of all pairs with the name.
    DeleteAll,
}

impl MapOp {
    pub fn from_str(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::SetIfMissing),
            ":=" => Some(Self::Assign),
            "+=" => Some(Self::Add),
            "==" => Some(Self::Filter),
            "!*" => Some(Self::DeleteAll),
            _ => None,
        }
    }
}

/// One `LHS op RHS` line of an `update` block (or the inner list of a
/// `map` block).
#[derive(Debug, Clone)]
pub struct AttrMap {
    pub lhs: AttrPath,
    pub op: MapOp,
    pub rhs: Option<Template>,
}

impl AttrMap {
    pub fn parse(attr: &str, op: &str, value: Option<&str>) -> Result<Self, MapError> {
        let op = MapOp::from_str(op).ok_or_else(|| MapError::UnknownOp(op.to_string()))?;

        let lhs = attr
            .strip_prefix('&')
            .ok_or_else(|| MapError::BadLhs(attr.to_string()))?;
        let lhs = AttrPath::parse(lhs)?;

        let rhs = match op {
            MapOp::DeleteAll => None,
            _ => {
                let raw = value.ok_or_else(|| MapError::MissingValue(attr.to_string()))?;
                Some(Template::parse(raw)?)
            }
        };

        Ok(Self { lhs, op, rhs })
    }

    /// Pass-2: fix up the value template and cast literal right-hand sides
    /// to the left-hand attribute's type.
    pub fn fixup(&mut self, dict: &Dictionary) -> Result<(), MapError> {
        if dict.lookup(&self.lhs.name).is_none() {
            return Err(MapError::Template(TemplateError::UnknownAttr(
                self.lhs.name.clone(),
            )));
        }

        if let Some(rhs) = &mut self.rhs {
            rhs.fixup(dict)?;
            if let Some(kind) = dict.kind_of(&self.lhs.name) {
                rhs.cast_in_place(kind)?;
            }
        }
        Ok(())
    }

    /// Apply against request state. Returns whether anything changed.
    pub fn apply(&self, request: &mut Request) -> bool {
        let value = match &self.rhs {
            Some(template) => template.evaluate(request),
            None => None,
        };

        let list = request.list_mut(self.lhs.list);
        let name = &self.lhs.name;

        match self.op {
            MapOp::SetIfMissing => {
                if list.contains(name) {
                    false
                } else if let Some(value) = value {
                    list.push(name.clone(), value);
                    true
                } else {
                    false
                }
            }
            MapOp::Assign => match value {
                Some(value) => {
                    list.replace(name, value);
                    true
                }
                None => false,
            },
            MapOp::Add => match value {
                Some(value) => {
                    list.push(name.clone(), value);
                    true
                }
                None => false,
            },
            MapOp::Filter => match value {
                Some(value) => list.filter(name, &value) > 0,
                None => false,
            },
            MapOp::DeleteAll => {
                let removed = match self.lhs.index {
                    AttrIndex::Nth(_) | AttrIndex::First | AttrIndex::All => {
                        list.remove_all(name)
                    }
                };
                trace!(attr = %name, removed, "wildcard delete");
                removed > 0
            }
        }
    }
}

/// Apply an `update` block's maps in order. Any change makes the whole
/// block count as changed.
pub fn apply_maps(maps: &[AttrMap], request: &mut Request) -> bool {
    let mut changed = false;
    for map in maps {
        changed |= map.apply(request);
    }
    changed
}

/// Template values that describe a dynamic-client definition; see the
/// dynamic-client define section contract.
pub const CLIENT_IP_ATTR: &str = "FreeRADIUS-Client-IP-Address";
pub const CLIENT_SECRET_ATTR: &str = "FreeRADIUS-Client-Secret";
pub const CLIENT_SHORTNAME_ATTR: &str = "FreeRADIUS-Client-Shortname";

#[cfg(test)]
mod tests {
    use super::*;

    fn map(attr: &str, op: &str, value: Option<&str>) -> AttrMap {
        let mut parsed = AttrMap::parse(attr, op, value).unwrap();
        parsed.fixup(&Dictionary::core()).unwrap();
        parsed
    }

    #[test]
    fn set_if_missing_only_sets_once() {
        let mut request = Request::new();
        let m = map("&User-Name", "=", Some("\"alice\""));

        assert!(m.apply(&mut request));
        assert!(!m.apply(&mut request));
        assert_eq!(request.packet.get_all("User-Name").count(), 1);
    }

    #[test]
    fn assign_replaces_all() {
        let mut request = Request::new();
        request.packet.push("Reply-Message", Value::from("a"));
        request.packet.push("Reply-Message", Value::from("b"));

        let m = map("&Reply-Message", ":=", Some("\"only\""));
        assert!(m.apply(&mut request));
        let values: Vec<_> = request.packet.get_all("Reply-Message").collect();
        assert_eq!(values, vec![&Value::from("only")]);
    }

    #[test]
    fn add_appends() {
        let mut request = Request::new();
        let m = map("&reply:Reply-Message", "+=", Some("\"one\""));
        m.apply(&mut request);
        m.apply(&mut request);
        assert_eq!(request.reply.get_all("Reply-Message").count(), 2);
    }

    #[test]
    fn delete_all_is_unary() {
        let mut request = Request::new();
        request.packet.push("Class", Value::from("x"));
        request.packet.push("Class", Value::from("y"));

        let m = map("&Class", "!*", None);
        assert!(m.apply(&mut request));
        assert!(!request.packet.contains("Class"));
    }

    #[test]
    fn literal_rhs_cast_to_lhs_type() {
        let mut request = Request::new();
        let m = map("&Framed-IP-Address", ":=", Some("10.0.0.1"));
        m.apply(&mut request);
        assert_eq!(
            request.packet.get("Framed-IP-Address"),
            Some(&Value::Ipv4Addr([10, 0, 0, 1].into()))
        );
    }

    #[test]
    fn unknown_attr_is_fatal() {
        let mut parsed = AttrMap::parse("&Nope-Attr", ":=", Some("x")).unwrap();
        assert!(parsed.fixup(&Dictionary::core()).is_err());
    }

    #[test]
    fn unknown_op_is_fatal() {
        assert!(matches!(
            AttrMap::parse("&User-Name", "~=", Some("x")),
            Err(MapError::UnknownOp(_))
        ));
    }
}
