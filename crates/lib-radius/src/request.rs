use std::time::Instant;

use crate::types::{PacketAddress, PacketCode, Value};

/// One attribute pair. The dictionary is external; pairs are keyed by
/// attribute name, compared case-insensitively as on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub name: String,
    pub value: Value,
}

impl Pair {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// An ordered list of pairs, as carried by a request, reply or the control
/// and session-state lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairList(Vec<Pair>);

impl PairList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pair> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pair> {
        self.0.iter_mut()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|pair| pair.name.eq_ignore_ascii_case(name))
            .map(|pair| &pair.value)
    }

    pub fn get_nth(&self, name: &str, index: usize) -> Option<&Value> {
        self.0
            .iter()
            .filter(|pair| pair.name.eq_ignore_ascii_case(name))
            .nth(index)
            .map(|pair| &pair.value)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> {
        self.0
            .iter()
            .filter(move |pair| pair.name.eq_ignore_ascii_case(name))
            .map(|pair| &pair.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.0.push(Pair::new(name, value));
    }

    /// Replace the first matching pair, or append.
    pub fn set(&mut self, name: &str, value: Value) {
        match self
            .0
            .iter_mut()
            .find(|pair| pair.name.eq_ignore_ascii_case(name))
        {
            Some(pair) => pair.value = value,
            None => self.push(name.to_string(), value),
        }
    }

    /// Replace every matching pair with a single one.
    pub fn replace(&mut self, name: &str, value: Value) {
        self.remove_all(name);
        self.push(name.to_string(), value);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self
            .0
            .iter()
            .position(|pair| pair.name.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.0.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|pair| !pair.name.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    /// Keep only matching pairs whose value equals `value`; used by the
    /// `==` filter operator.
    pub fn filter(&mut self, name: &str, value: &Value) -> usize {
        let before = self.0.len();
        self.0
            .retain(|pair| !pair.name.eq_ignore_ascii_case(name) || &pair.value == value);
        before - self.0.len()
    }
}

/// Which pair list an attribute reference names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ListRef {
    #[default]
    Request,
    Control,
    Reply,
    SessionState,
}

impl ListRef {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "request" => Some(Self::Request),
            "control" => Some(Self::Control),
            "reply" => Some(Self::Reply),
            "session-state" => Some(Self::SessionState),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Control => "control",
            Self::Reply => "reply",
            Self::SessionState => "session-state",
        }
    }
}

/// Per-request state threaded through the interpreter and the reply path.
#[derive(Debug)]
pub struct Request {
    pub packet: PairList,
    pub control: PairList,
    pub reply: PairList,
    pub session_state: PairList,

    pub address: Option<PacketAddress>,
    pub recv_time: Instant,

    /// Chosen by the worker from the section's final return code; `Handled`
    /// sections set it themselves.
    pub reply_code: Option<PacketCode>,

    foreach: Vec<Value>,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            packet: PairList::new(),
            control: PairList::new(),
            reply: PairList::new(),
            session_state: PairList::new(),
            address: None,
            recv_time: Instant::now(),
            reply_code: None,
            foreach: Vec::new(),
        }
    }

    pub fn with_address(address: PacketAddress, recv_time: Instant) -> Self {
        Self {
            address: Some(address),
            recv_time,
            ..Self::new()
        }
    }

    pub fn list(&self, list: ListRef) -> &PairList {
        match list {
            ListRef::Request => &self.packet,
            ListRef::Control => &self.control,
            ListRef::Reply => &self.reply,
            ListRef::SessionState => &self.session_state,
        }
    }

    pub fn list_mut(&mut self, list: ListRef) -> &mut PairList {
        match list {
            ListRef::Request => &mut self.packet,
            ListRef::Control => &mut self.control,
            ListRef::Reply => &mut self.reply,
            ListRef::SessionState => &mut self.session_state,
        }
    }

    pub fn foreach_depth(&self) -> usize {
        self.foreach.len()
    }

    pub fn push_foreach(&mut self, value: Value) {
        self.foreach.push(value);
    }

    pub fn set_foreach(&mut self, value: Value) {
        if let Some(slot) = self.foreach.last_mut() {
            *slot = value;
        }
    }

    pub fn pop_foreach(&mut self) {
        self.foreach.pop();
    }

    /// Attributes synthesized from packet metadata rather than carried as
    /// pairs. These are compared via callback, never by direct pair value.
    pub fn virtual_attr(&self, name: &str) -> Option<Value> {
        let address = self.address.as_ref()?;

        if name.eq_ignore_ascii_case("Packet-Src-IP-Address") {
            return match address.src.ip() {
                std::net::IpAddr::V4(ip) => Some(Value::Ipv4Addr(ip)),
                std::net::IpAddr::V6(ip) => Some(Value::Ipv6Addr(ip)),
            };
        }
        if name.eq_ignore_ascii_case("Packet-Dst-IP-Address") {
            return match address.dst.ip() {
                std::net::IpAddr::V4(ip) => Some(Value::Ipv4Addr(ip)),
                std::net::IpAddr::V6(ip) => Some(Value::Ipv6Addr(ip)),
            };
        }
        if name.eq_ignore_ascii_case("Packet-Src-Port") {
            return Some(Value::Uint32(address.src.port() as u32));
        }
        if name.eq_ignore_ascii_case("Packet-Dst-Port") {
            return Some(Value::Uint32(address.dst.port() as u32));
        }
        if name.eq_ignore_ascii_case("Packet-Type") {
            return Some(Value::Uint32(address.code as u32));
        }

        None
    }

    /// Equality via the virtual attribute's callback. This replaces
    /// direct pair comparison for attributes that have no pairs to
    /// compare; other operators are rejected at compile time.
    pub fn compare_virtual(&self, name: &str, value: &Value) -> bool {
        let Some(actual) = self.virtual_attr(name) else {
            return false;
        };
        let Ok(value) = value.cast(actual.kind()) else {
            return false;
        };
        actual
            .compare(&value)
            .map(|ordering| ordering.is_eq())
            .unwrap_or(false)
    }

    /// Resolve `Foreach-Variable-N`, counting inside-out as nested loops
    /// stack up.
    pub fn foreach_attr(&self, name: &str) -> Option<Value> {
        let n: usize = name
            .strip_prefix("Foreach-Variable-")
            .or_else(|| name.strip_prefix("foreach-variable-"))?
            .parse()
            .ok()?;

        let depth = self.foreach.len();
        if n >= depth {
            return None;
        }
        self.foreach.get(depth - 1 - n).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn pair_list_ops() {
        let mut list = PairList::new();
        list.push("User-Name", Value::from("alice"));
        list.push("Reply-Message", Value::from("a"));
        list.push("Reply-Message", Value::from("b"));

        assert_eq!(list.get("user-name"), Some(&Value::from("alice")));
        assert_eq!(list.get_all("Reply-Message").count(), 2);
        assert_eq!(list.get_nth("Reply-Message", 1), Some(&Value::from("b")));

        list.set("User-Name", Value::from("bob"));
        assert_eq!(list.get("User-Name"), Some(&Value::from("bob")));
        assert_eq!(list.len(), 3);

        list.replace("Reply-Message", Value::from("only"));
        assert_eq!(list.get_all("Reply-Message").count(), 1);

        assert_eq!(list.remove_all("User-Name"), 1);
        assert!(!list.contains("User-Name"));
    }

    #[test]
    fn filter_keeps_matches() {
        let mut list = PairList::new();
        list.push("Class", Value::from("keep"));
        list.push("Class", Value::from("drop"));
        list.push("Other", Value::from("x"));

        assert_eq!(list.filter("Class", &Value::from("keep")), 1);
        assert_eq!(list.get_all("Class").count(), 1);
        assert!(list.contains("Other"));
    }

    #[test]
    fn virtual_attrs_come_from_address() {
        let address = PacketAddress::new(
            SocketAddr::from(([198, 51, 100, 42], 1000)),
            SocketAddr::from(([203, 0, 113, 1], 1812)),
            PacketCode::AccessRequest,
            7,
        );
        let request = Request::with_address(address, Instant::now());

        assert_eq!(
            request.virtual_attr("Packet-Src-IP-Address"),
            Some(Value::Ipv4Addr([198, 51, 100, 42].into()))
        );
        assert_eq!(
            request.virtual_attr("packet-src-port"),
            Some(Value::Uint32(1000))
        );
        assert_eq!(request.virtual_attr("User-Name"), None);
    }

    #[test]
    fn foreach_variables_count_inside_out() {
        let mut request = Request::new();
        request.push_foreach(Value::from("outer"));
        request.push_foreach(Value::from("inner"));

        assert_eq!(
            request.foreach_attr("Foreach-Variable-0"),
            Some(Value::from("inner"))
        );
        assert_eq!(
            request.foreach_attr("Foreach-Variable-1"),
            Some(Value::from("outer"))
        );
        assert_eq!(request.foreach_attr("Foreach-Variable-2"), None);
    }
}
