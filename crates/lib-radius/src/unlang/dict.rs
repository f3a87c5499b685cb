use std::collections::HashMap;

use crate::types::ValueKind;

/// What the compiler needs to know about an attribute: its value kind, and
/// whether it is virtual (synthesized from packet metadata and compared via
/// callback) or carried encrypted on the wire.
#[derive(Debug, Clone, Copy)]
pub struct AttrDef {
    pub kind: ValueKind,
    pub is_virtual: bool,
    pub encrypted: bool,
}

/// The attribute knowledge the interpreter compiles against. Full
/// dictionary loading is external; this carries the slice of it that
/// pass-2 fixups need: name -> kind, virtual and encrypted flags.
#[derive(Debug, Default)]
pub struct Dictionary {
    attrs: HashMap<String, AttrDef>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attributes the core itself references.
    pub fn core() -> Self {
        let mut dict = Self::new();

        for (name, kind) in [
            ("User-Name", ValueKind::String),
            ("User-Password", ValueKind::String),
            ("NAS-Identifier", ValueKind::String),
            ("NAS-IP-Address", ValueKind::Ipv4Addr),
            ("Framed-IP-Address", ValueKind::Ipv4Addr),
            ("Framed-IPv6-Address", ValueKind::Ipv6Addr),
            ("Calling-Station-Id", ValueKind::String),
            ("Called-Station-Id", ValueKind::String),
            ("Reply-Message", ValueKind::String),
            ("Class", ValueKind::Octets),
            ("State", ValueKind::Octets),
            ("Auth-Type", ValueKind::String),
            ("Acct-Status-Type", ValueKind::Uint32),
            ("Acct-Session-Id", ValueKind::String),
            ("Session-Timeout", ValueKind::Uint32),
            ("Idle-Timeout", ValueKind::Uint32),
            ("FreeRADIUS-Client-IP-Address", ValueKind::Ipv4Addr),
            ("FreeRADIUS-Client-Secret", ValueKind::String),
            ("FreeRADIUS-Client-Shortname", ValueKind::String),
            ("FreeRADIUS-Client-NAS-Type", ValueKind::String),
            ("TLS-Session-Id", ValueKind::Octets),
            ("TLS-Session-Data", ValueKind::Octets),
            ("TLS-Session-Cache-Action", ValueKind::Uint32),
            ("Allow-Session-Resumption", ValueKind::Bool),
        ] {
            dict.register(name, kind);
        }

        dict.register_encrypted("User-Password");
        dict.register_encrypted("Tunnel-Password");

        for name in ["Packet-Src-IP-Address", "Packet-Dst-IP-Address"] {
            dict.register_virtual(name, ValueKind::Ipv4Addr);
        }
        dict.register_virtual("Packet-Type", ValueKind::Uint32);
        dict.register_virtual("Packet-Src-Port", ValueKind::Uint32);
        dict.register_virtual("Packet-Dst-Port", ValueKind::Uint32);

        dict
    }

    pub fn register(&mut self, name: &str, kind: ValueKind) {
        self.attrs.insert(
            name.to_ascii_lowercase(),
            AttrDef {
                kind,
                is_virtual: false,
                encrypted: false,
            },
        );
    }

    pub fn register_virtual(&mut self, name: &str, kind: ValueKind) {
        self.attrs.insert(
            name.to_ascii_lowercase(),
            AttrDef {
                kind,
                is_virtual: true,
                encrypted: false,
            },
        );
    }

    pub fn register_encrypted(&mut self, name: &str) {
        let entry = self
            .attrs
            .entry(name.to_ascii_lowercase())
            .or_insert(AttrDef {
                kind: ValueKind::String,
                is_virtual: false,
                encrypted: true,
            });
        entry.encrypted = true;
    }

    pub fn lookup(&self, name: &str) -> Option<AttrDef> {
        if let Some(def) = self.attrs.get(&name.to_ascii_lowercase()) {
            return Some(*def);
        }

        // Per-iteration loop variables exist for any depth. They are
        // ordinary values bound by the loop, not callback-compared
        // attributes.
        if name.to_ascii_lowercase().starts_with("foreach-variable-") {
            return Some(AttrDef {
                kind: ValueKind::String,
                is_virtual: false,
                encrypted: false,
            });
        }

        None
    }

    pub fn kind_of(&self, name: &str) -> Option<ValueKind> {
        self.lookup(name).map(|def| def.kind)
    }

    pub fn is_encrypted(&self, name: &str) -> bool {
        self.lookup(name).map(|def| def.encrypted).unwrap_or(false)
    }
}
